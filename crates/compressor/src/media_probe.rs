//! Source metadata probing via ffprobe.
//!
//! Runs `ffprobe -v quiet -print_format json -show_streams -show_format <path>`
//! and reduces the output to what planning needs: frame dimensions, duration,
//! frame rate and whether an audio track exists.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;

/// Error type for probe operations.
#[derive(Debug, Error)]
pub enum MediaProbeError {
    /// ffprobe ran but reported failure.
    #[error("ffprobe failed: {0}")]
    FfprobeFailed(String),

    /// Failed to parse ffprobe JSON output.
    #[error("Failed to parse ffprobe output: {0}")]
    ParseError(String),

    /// The source has no video stream.
    #[error("No video stream found")]
    NoVideoStream,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// What is known about a source file. Every field may be unknown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceMetadata {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub duration_secs: Option<f64>,
    pub frame_rate: Option<f64>,
    /// `None` when the source could not be probed.
    pub has_audio: Option<bool>,
    pub size_bytes: Option<u64>,
    pub video_codec: Option<String>,
}

impl SourceMetadata {
    /// Metadata for a source that could not be probed.
    pub fn unknown() -> Self {
        Self {
            width: None,
            height: None,
            duration_secs: None,
            frame_rate: None,
            has_audio: None,
            size_bytes: None,
            video_codec: None,
        }
    }

    pub fn dimensions(&self) -> Option<(u32, u32)> {
        match (self.width, self.height) {
            (Some(w), Some(h)) if w > 0 && h > 0 => Some((w, h)),
            _ => None,
        }
    }
}

impl Default for SourceMetadata {
    fn default() -> Self {
        Self::unknown()
    }
}

/// Raw ffprobe JSON structures for parsing.
mod ffprobe_json {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub streams: Option<Vec<Stream>>,
        pub format: Option<Format>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Stream {
        pub codec_type: Option<String>,
        pub codec_name: Option<String>,
        pub width: Option<u32>,
        pub height: Option<u32>,
        pub avg_frame_rate: Option<String>,
        pub r_frame_rate: Option<String>,
        pub duration: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Format {
        pub duration: Option<String>,
        pub size: Option<String>,
    }
}

/// Upper bound on a single ffprobe run.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Probe `path` with the given ffprobe binary.
pub async fn probe_source(
    ffprobe_bin: &Path,
    path: &Path,
) -> Result<SourceMetadata, MediaProbeError> {
    let output = Command::new(ffprobe_bin)
        .args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_streams",
            "-show_format",
        ])
        .arg(path)
        .kill_on_drop(true)
        .output();
    let output = tokio::time::timeout(PROBE_TIMEOUT, output)
        .await
        .map_err(|_| {
            MediaProbeError::FfprobeFailed(format!("ffprobe timed out after {:?}", PROBE_TIMEOUT))
        })??;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(MediaProbeError::FfprobeFailed(format!(
            "ffprobe exited with status {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_ffprobe_output(&stdout)
}

/// Parses ffprobe JSON output into [`SourceMetadata`].
pub fn parse_ffprobe_output(json_str: &str) -> Result<SourceMetadata, MediaProbeError> {
    let ffprobe: ffprobe_json::FfprobeOutput =
        serde_json::from_str(json_str).map_err(|e| MediaProbeError::ParseError(e.to_string()))?;

    let streams = ffprobe.streams.unwrap_or_default();
    let video = streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .ok_or(MediaProbeError::NoVideoStream)?;
    let has_audio = streams
        .iter()
        .any(|s| s.codec_type.as_deref() == Some("audio"));

    let frame_rate = video
        .avg_frame_rate
        .as_deref()
        .and_then(parse_frame_rate)
        .or_else(|| video.r_frame_rate.as_deref().and_then(parse_frame_rate));

    let format_duration = ffprobe
        .format
        .as_ref()
        .and_then(|f| f.duration.as_deref())
        .and_then(parse_seconds);
    let duration_secs =
        format_duration.or_else(|| video.duration.as_deref().and_then(parse_seconds));

    let size_bytes = ffprobe
        .format
        .as_ref()
        .and_then(|f| f.size.as_deref())
        .and_then(|s| s.parse::<u64>().ok());

    Ok(SourceMetadata {
        width: video.width.filter(|&w| w > 0),
        height: video.height.filter(|&h| h > 0),
        duration_secs,
        frame_rate,
        has_audio: Some(has_audio),
        size_bytes,
        video_codec: video.codec_name.clone(),
    })
}

/// Parse an ffprobe rational such as `30000/1001`. `0/0` yields `None`.
pub fn parse_frame_rate(s: &str) -> Option<f64> {
    let rate = match s.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            if den == 0.0 {
                return None;
            }
            num / den
        }
        None => s.trim().parse().ok()?,
    };
    (rate.is_finite() && rate > 0.0).then_some(rate)
}

fn parse_seconds(s: &str) -> Option<f64> {
    s.trim()
        .parse::<f64>()
        .ok()
        .filter(|d| d.is_finite() && *d >= 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_PROBE: &str = r#"{
        "streams": [
            {
                "codec_type": "video",
                "codec_name": "h264",
                "width": 1920,
                "height": 1080,
                "avg_frame_rate": "30000/1001",
                "r_frame_rate": "30000/1001"
            },
            {
                "codec_type": "audio",
                "codec_name": "aac",
                "channels": 2
            }
        ],
        "format": {
            "duration": "60.060000",
            "size": "52428800"
        }
    }"#;

    #[test]
    fn test_parse_full_probe() {
        let meta = parse_ffprobe_output(SAMPLE_PROBE).unwrap();
        assert_eq!(meta.width, Some(1920));
        assert_eq!(meta.height, Some(1080));
        assert_eq!(meta.dimensions(), Some((1920, 1080)));
        assert!((meta.duration_secs.unwrap() - 60.06).abs() < 1e-9);
        assert!((meta.frame_rate.unwrap() - 29.97).abs() < 0.01);
        assert_eq!(meta.has_audio, Some(true));
        assert_eq!(meta.size_bytes, Some(52_428_800));
        assert_eq!(meta.video_codec.as_deref(), Some("h264"));
    }

    #[test]
    fn test_parse_without_audio_or_duration() {
        let json = r#"{
            "streams": [{"codec_type": "video", "codec_name": "vp9", "width": 640, "height": 360,
                         "avg_frame_rate": "0/0", "r_frame_rate": "25/1"}],
            "format": {}
        }"#;
        let meta = parse_ffprobe_output(json).unwrap();
        assert_eq!(meta.has_audio, Some(false));
        assert_eq!(meta.duration_secs, None);
        assert_eq!(meta.frame_rate, Some(25.0));
    }

    #[test]
    fn test_stream_duration_used_when_format_lacks_it() {
        let json = r#"{
            "streams": [{"codec_type": "video", "width": 320, "height": 240, "duration": "12.5"}],
            "format": {"size": "1000"}
        }"#;
        let meta = parse_ffprobe_output(json).unwrap();
        assert_eq!(meta.duration_secs, Some(12.5));
    }

    #[test]
    fn test_no_video_stream() {
        let json = r#"{"streams": [{"codec_type": "audio"}], "format": {"duration": "5.0"}}"#;
        assert!(matches!(
            parse_ffprobe_output(json),
            Err(MediaProbeError::NoVideoStream)
        ));
    }

    #[test]
    fn test_invalid_json() {
        assert!(matches!(
            parse_ffprobe_output("not json"),
            Err(MediaProbeError::ParseError(_))
        ));
    }

    #[test]
    fn test_parse_frame_rate() {
        assert_eq!(parse_frame_rate("25/1"), Some(25.0));
        assert_eq!(parse_frame_rate("60"), Some(60.0));
        assert_eq!(parse_frame_rate("0/0"), None);
        assert_eq!(parse_frame_rate("abc"), None);
        assert_eq!(parse_frame_rate("-30/1"), None);
    }

    #[test]
    fn test_unknown_metadata() {
        let meta = SourceMetadata::unknown();
        assert_eq!(meta.has_audio, None);
        assert_eq!(meta.dimensions(), None);
        assert_eq!(SourceMetadata::default(), meta);
    }

    #[tokio::test]
    async fn test_probe_missing_binary_is_io_error() {
        let result = probe_source(
            Path::new("/nonexistent/path/to/ffprobe"),
            Path::new("/tmp/input.mp4"),
        )
        .await;
        assert!(matches!(result, Err(MediaProbeError::Io(_))));
    }
}
