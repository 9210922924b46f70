//! Startup checks for Smart Compressor
//!
//! Preflight checks run before the daemon accepts work:
//! - ffmpeg is runnable and recent enough
//! - ffprobe is runnable

use crate::config::Config;
use crate::encoders::probe::output_with_deadline;
use log::{info, warn};
use std::path::Path;
use std::process::Command;
use std::time::Duration;
use thiserror::Error;

/// Oldest ffmpeg major version whose encoder options the argument builder relies on.
pub const MIN_FFMPEG_MAJOR: u32 = 4;

/// Time allowed for `-version` to answer.
pub const VERSION_TIMEOUT: Duration = Duration::from_secs(10);

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("ffmpeg not available: {0}")]
    FfmpegUnavailable(String),

    #[error("ffprobe not available: {0}")]
    FfprobeUnavailable(String),

    #[error("FFmpeg version requirement not met: {0}")]
    FfmpegVersion(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parse FFmpeg version string and extract major version number
///
/// Handles various FFmpeg version formats:
/// - Standard: "ffmpeg version 7.1 ..."
/// - N-prefixed: "ffmpeg version n7.1-... ..."
///
/// Git snapshot builds ("N-113000-g...") carry no release number and yield `None`.
pub fn parse_ffmpeg_version(version_output: &str) -> Option<u32> {
    let version_line = version_output
        .lines()
        .find(|line| line.to_lowercase().contains("ffmpeg version"))?;

    let version_part = version_line
        .to_lowercase()
        .split("ffmpeg version")
        .nth(1)?
        .split_whitespace()
        .next()?
        .to_string();

    let version_str = version_part.trim_start_matches('n');
    let major_str = version_str.split(|c| c == '.' || c == '-').next()?;

    major_str.parse().ok()
}

fn run_version(bin: &Path, flag: &str, timeout: Duration) -> Result<String, String> {
    let output = output_with_deadline(Command::new(bin).arg(flag), timeout)
        .map_err(|e| {
            format!(
                "{} {} failed; is it installed and in PATH? Error: {}",
                bin.display(),
                flag,
                e
            )
        })?
        .ok_or_else(|| format!("{} {} did not finish within {:?}", bin.display(), flag, timeout))?;

    if !output.status.success() {
        return Err(format!("{} {} exited with {}", bin.display(), flag, output.status));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Check that ffmpeg runs and is not older than [`MIN_FFMPEG_MAJOR`].
///
/// Returns the parsed major version, or `None` for builds that do not report one.
pub fn check_ffmpeg(bin: &Path) -> Result<Option<u32>, StartupError> {
    let version_output =
        run_version(bin, "-version", VERSION_TIMEOUT).map_err(StartupError::FfmpegUnavailable)?;

    let Some(major) = parse_ffmpeg_version(&version_output) else {
        warn!(
            "Could not parse FFmpeg version from output: {}",
            version_output.lines().next().unwrap_or("(empty)")
        );
        return Ok(None);
    };

    if major < MIN_FFMPEG_MAJOR {
        return Err(StartupError::FfmpegVersion(format!(
            "FFmpeg {}.x or newer required, got: {}",
            MIN_FFMPEG_MAJOR, major
        )));
    }

    info!("Found FFmpeg {} at {}", major, bin.display());
    Ok(Some(major))
}

/// Check that ffprobe runs.
pub fn check_ffprobe(bin: &Path) -> Result<(), StartupError> {
    run_version(bin, "-version", VERSION_TIMEOUT).map_err(StartupError::FfprobeUnavailable)?;
    Ok(())
}

/// Run all startup checks in order
///
/// 1. ffmpeg availability and version
/// 2. ffprobe availability
pub fn run_startup_checks(cfg: &Config) -> Result<(), StartupError> {
    check_ffmpeg(&cfg.encoder.ffmpeg_bin)?;
    check_ffprobe(&cfg.encoder.ffprobe_bin)?;
    Ok(())
}
