//! FFmpeg progress parsing
//!
//! ffmpeg rewrites one stats line on stderr, e.g.
//! `frame=  240 fps= 60 q=28.0 size=    1024kB time=00:00:08.00 bitrate=1048.6kbits/s speed=2.01x`.
//! [`ProgressParser`] keeps the latest `time`, `speed` and `bitrate` seen in a
//! pass and maps them into that pass's band of the overall percentage.

use serde::Serialize;

/// The slice of the overall 0-100 range one pass occupies.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PassBand {
    pub offset: f64,
    pub span: f64,
    /// Passes still to run after this one, each covering the full media duration.
    pub following_passes: u32,
}

impl PassBand {
    /// Band for a single-pass encode.
    pub fn single() -> Self {
        Self::for_pass(1, 1)
    }

    /// Band for pass `pass` (1-based) of `total` equal passes.
    pub fn for_pass(pass: u32, total: u32) -> Self {
        let total = total.max(1);
        let pass = pass.clamp(1, total);
        let span = 100.0 / f64::from(total);
        Self {
            offset: span * f64::from(pass - 1),
            span,
            following_passes: total - pass,
        }
    }
}

/// Progress as reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub percent: f64,
    pub eta_secs: Option<f64>,
    pub bitrate_kbps: Option<f64>,
}

/// Stateful parser for one encoder pass.
#[derive(Debug, Clone)]
pub struct ProgressParser {
    band: PassBand,
    time_secs: f64,
    speed: Option<f64>,
    bitrate_kbps: Option<f64>,
}

impl ProgressParser {
    pub fn new(band: PassBand) -> Self {
        Self {
            band,
            time_secs: 0.0,
            speed: None,
            bitrate_kbps: None,
        }
    }

    /// Seconds of media processed so far in this pass.
    pub fn time_secs(&self) -> f64 {
        self.time_secs
    }

    pub fn speed(&self) -> Option<f64> {
        self.speed
    }

    /// Consume one diagnostic line. Returns true when the line advanced the
    /// processed time; anything unrecognised is ignored.
    pub fn feed(&mut self, line: &str) -> bool {
        if !line.contains("time=") {
            return false;
        }

        let line = line.replace('=', "= ");
        let parts: Vec<&str> = line.split_whitespace().collect();
        let mut advanced = false;

        for (i, part) in parts.iter().enumerate() {
            let Some(value) = parts.get(i + 1) else {
                break;
            };
            match *part {
                "time=" => {
                    if let Some(secs) = parse_timestamp(value) {
                        if secs > self.time_secs {
                            self.time_secs = secs;
                            advanced = true;
                        }
                    }
                }
                "speed=" => {
                    if let Some(speed) = parse_speed(value) {
                        self.speed = Some(speed);
                    }
                }
                "bitrate=" => {
                    if let Some(kbps) = parse_bitrate(value) {
                        self.bitrate_kbps = Some(kbps);
                    }
                }
                _ => {}
            }
        }

        advanced
    }

    /// Overall progress given the media duration of one pass.
    pub fn snapshot(&self, total_secs: f64) -> ProgressSnapshot {
        if !(total_secs.is_finite() && total_secs > 0.0) {
            return ProgressSnapshot {
                percent: self.band.offset,
                eta_secs: None,
                bitrate_kbps: self.bitrate_kbps,
            };
        }

        let pass_percent = (self.time_secs / total_secs * 100.0).min(100.0);
        let percent = (self.band.offset + self.band.span * pass_percent / 100.0).min(100.0);

        let eta_secs = self.speed.filter(|s| *s > 0.0).map(|speed| {
            let remaining = (total_secs - self.time_secs).max(0.0)
                + f64::from(self.band.following_passes) * total_secs;
            remaining / speed
        });

        ProgressSnapshot {
            percent,
            eta_secs,
            bitrate_kbps: self.bitrate_kbps,
        }
    }
}

/// Parse `HH:MM:SS[.frac]` (or plain seconds). Negative and `N/A` values yield `None`.
pub fn parse_timestamp(s: &str) -> Option<f64> {
    if s.starts_with('-') {
        return None;
    }
    let parts: Vec<&str> = s.split(':').collect();
    let secs = match parts.as_slice() {
        [h, m, sec] => {
            let h: f64 = h.parse().ok()?;
            let m: f64 = m.parse().ok()?;
            let sec: f64 = sec.parse().ok()?;
            h * 3600.0 + m * 60.0 + sec
        }
        [m, sec] => {
            let m: f64 = m.parse().ok()?;
            let sec: f64 = sec.parse().ok()?;
            m * 60.0 + sec
        }
        [sec] => sec.parse().ok()?,
        _ => return None,
    };
    (secs.is_finite() && secs >= 0.0).then_some(secs)
}

fn parse_speed(s: &str) -> Option<f64> {
    s.trim_end_matches('x')
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && *v >= 0.0)
}

fn parse_bitrate(s: &str) -> Option<f64> {
    s.trim_end_matches("kbits/s")
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && *v >= 0.0)
}
