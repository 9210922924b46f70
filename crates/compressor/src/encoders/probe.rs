//! Encoder availability probing
//!
//! Answers "can this ffmpeg build use encoder X?" either by reading the list
//! ffmpeg advertises (`ffmpeg -hide_banner -encoders`) or by running a tiny
//! trial encode. Answers are cached per `(encoder, mode)` for the life of the
//! probe; [`EncoderProbe::clear_cache`] forces re-probing.

use crate::encoders::codec::{EncoderFamily, VAAPI_DEVICE, VAAPI_UPLOAD_FILTER};
use crate::encoders::selector::is_hardware_encoder;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::sync::{mpsc, PoisonError, RwLock};
use std::thread;
use std::time::{Duration, Instant};

/// Default time allowed for a single verification encode.
pub const DEFAULT_VERIFY_TIMEOUT: Duration = Duration::from_secs(10);

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// How availability is decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeMode {
    /// Trust the encoder list ffmpeg prints.
    Advertised,
    /// Advertised and a one-frame trial encode succeeds.
    Verify,
}

/// Availability record for one encoder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncoderCapability {
    pub name: String,
    pub hardware: bool,
    /// `None` when the encoder has not been probed yet.
    pub available: Option<bool>,
}

/// Cached encoder availability checks against one ffmpeg binary.
#[derive(Debug)]
pub struct EncoderProbe {
    ffmpeg_bin: PathBuf,
    default_mode: ProbeMode,
    verify_timeout: Duration,
    cache: RwLock<HashMap<(String, ProbeMode), bool>>,
    advertised: RwLock<Option<HashSet<String>>>,
}

impl EncoderProbe {
    pub fn new(ffmpeg_bin: impl Into<PathBuf>, default_mode: ProbeMode) -> Self {
        Self {
            ffmpeg_bin: ffmpeg_bin.into(),
            default_mode,
            verify_timeout: DEFAULT_VERIFY_TIMEOUT,
            cache: RwLock::new(HashMap::new()),
            advertised: RwLock::new(None),
        }
    }

    pub fn with_verify_timeout(mut self, timeout: Duration) -> Self {
        self.verify_timeout = timeout;
        self
    }

    pub fn ffmpeg_bin(&self) -> &Path {
        &self.ffmpeg_bin
    }

    pub fn default_mode(&self) -> ProbeMode {
        self.default_mode
    }

    /// Availability of `name` under the probe's default mode.
    pub fn is_encoder_available(&self, name: &str) -> bool {
        self.is_encoder_available_with(name, self.default_mode)
    }

    /// Availability of `name` under `mode`, probing on first use.
    ///
    /// Concurrent first calls may both probe; they store the same answer.
    pub fn is_encoder_available_with(&self, name: &str, mode: ProbeMode) -> bool {
        let key = (name.to_string(), mode);
        if let Some(&cached) = self
            .cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            return cached;
        }

        let available = match mode {
            ProbeMode::Advertised => self.is_advertised(name),
            ProbeMode::Verify => self.is_advertised(name) && self.run_trial_encode(name),
        };
        debug!("Encoder {} ({:?}): available={}", name, mode, available);

        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, available);
        available
    }

    /// First available encoder in `preferred`, else `fallback`.
    ///
    /// The fallback is returned without probing.
    pub fn best_encoder(&self, preferred: &[&str], fallback: &str) -> String {
        self.best_encoder_with(preferred, fallback, self.default_mode)
    }

    pub fn best_encoder_with(&self, preferred: &[&str], fallback: &str, mode: ProbeMode) -> String {
        preferred
            .iter()
            .find(|name| self.is_encoder_available_with(name, mode))
            .map(|name| name.to_string())
            .unwrap_or_else(|| fallback.to_string())
    }

    /// Capability record from cached knowledge only; never spawns ffmpeg.
    pub fn capability(&self, name: &str) -> EncoderCapability {
        let available = self
            .cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(name.to_string(), self.default_mode))
            .copied();
        EncoderCapability {
            name: name.to_string(),
            hardware: is_hardware_encoder(name),
            available,
        }
    }

    /// Forget every cached answer, including the advertised encoder list.
    pub fn clear_cache(&self) {
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        *self
            .advertised
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
        info!("Encoder capability cache cleared");
    }

    fn is_advertised(&self, name: &str) -> bool {
        if let Some(list) = self
            .advertised
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            return list.contains(name);
        }

        let list = self.load_advertised();
        let found = list.contains(name);
        *self
            .advertised
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(list);
        found
    }

    fn load_advertised(&self) -> HashSet<String> {
        let mut command = Command::new(&self.ffmpeg_bin);
        command.args(["-hide_banner", "-encoders"]);

        match output_with_deadline(&mut command, self.verify_timeout) {
            Ok(Some(output)) if output.status.success() => {
                let list = parse_encoder_list(&String::from_utf8_lossy(&output.stdout));
                info!(
                    "{} advertises {} encoders",
                    self.ffmpeg_bin.display(),
                    list.len()
                );
                list
            }
            Ok(Some(output)) => {
                warn!(
                    "{} -encoders exited with {}; treating every encoder as unavailable",
                    self.ffmpeg_bin.display(),
                    output.status
                );
                HashSet::new()
            }
            Ok(None) => {
                warn!(
                    "{} -encoders did not finish within {:?}; treating every encoder as unavailable",
                    self.ffmpeg_bin.display(),
                    self.verify_timeout
                );
                HashSet::new()
            }
            Err(e) => {
                warn!(
                    "Failed to run {}: {}; treating every encoder as unavailable",
                    self.ffmpeg_bin.display(),
                    e
                );
                HashSet::new()
            }
        }
    }

    /// Encode one black frame with `name` into the null muxer.
    fn run_trial_encode(&self, name: &str) -> bool {
        let mut args: Vec<&str> = vec!["-hide_banner", "-loglevel", "error"];
        let upload = EncoderFamily::of(name).needs_hw_upload();
        if upload {
            args.extend(["-vaapi_device", VAAPI_DEVICE]);
        }
        args.extend(["-f", "lavfi", "-i", "color=c=black:s=256x256:d=0.1", "-frames:v", "1"]);
        if upload {
            args.extend(["-vf", VAAPI_UPLOAD_FILTER]);
        }
        args.extend(["-c:v", name, "-f", "null", "-"]);

        let mut command = Command::new(&self.ffmpeg_bin);
        command.args(&args);

        match output_with_deadline(&mut command, self.verify_timeout) {
            Ok(Some(output)) => output.status.success(),
            Ok(None) => {
                warn!(
                    "Trial encode with {} exceeded {:?}; killed it",
                    name, self.verify_timeout
                );
                false
            }
            Err(e) => {
                warn!("Trial encode with {} could not run: {}", name, e);
                false
            }
        }
    }

    /// Probe with a pre-filled advertised list and no ffmpeg binary behind it.
    #[cfg(test)]
    pub(crate) fn with_advertised<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        let probe = Self::new("/nonexistent/ffmpeg", ProbeMode::Advertised);
        *probe
            .advertised
            .write()
            .unwrap_or_else(PoisonError::into_inner) =
            Some(names.into_iter().map(str::to_string).collect());
        probe
    }
}

/// Run `command` to completion, capturing stdout, unless `timeout` passes
/// first. A child still running at the deadline is killed and `Ok(None)` is
/// returned. Stdin and stderr are discarded.
pub(crate) fn output_with_deadline(
    command: &mut Command,
    timeout: Duration,
) -> io::Result<Option<Output>> {
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()?;

    // Drained on a thread so a chatty child cannot block on a full pipe.
    let stdout = child.stdout.take();
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut stdout) = stdout {
            let _ = stdout.read_to_end(&mut buf);
        }
        let _ = tx.send(buf);
    });

    let deadline = Instant::now() + timeout;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) if Instant::now() >= deadline => {
                let _ = child.kill();
                let _ = child.wait();
                return Ok(None);
            }
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(e) => {
                let _ = child.kill();
                return Err(e);
            }
        }
    };

    // A grandchild may still hold the pipe open; don't wait past the deadline for it.
    let remaining = deadline
        .saturating_duration_since(Instant::now())
        .max(POLL_INTERVAL);
    let stdout = rx.recv_timeout(remaining).unwrap_or_default();
    Ok(Some(Output {
        status,
        stdout,
        stderr: Vec::new(),
    }))
}

/// Extract encoder names from `ffmpeg -encoders` output.
///
/// Rows look like ` V....D libx264  libx264 H.264 / AVC ...`: a six-character
/// capability column followed by the encoder name. Legend rows
/// (` V..... = Video`) are skipped.
pub fn parse_encoder_list(output: &str) -> HashSet<String> {
    output
        .lines()
        .filter_map(|line| {
            let mut tokens = line.split_whitespace();
            let flags = tokens.next()?;
            let name = tokens.next()?;
            let is_flag_column =
                flags.len() == 6 && flags.chars().all(|c| "VASFXBD.".contains(c));
            (is_flag_column && name != "=").then(|| name.to_string())
        })
        .collect()
}
