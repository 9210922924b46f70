//! Codec strategy table
//!
//! Each supported codec family is described by one [`CodecSpec`] entry: the
//! hardware encoders to try (in preference order), the software fallback, the
//! output container and the fixed audio codec. Video argument construction is
//! keyed by encoder family rather than by type hierarchy.

use crate::request::EncodingMode;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Codec families a request may ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    H264,
    Hevc,
    Av1,
    Vp9,
}

impl Codec {
    /// Every supported codec, in listing order.
    pub const ALL: [Codec; 4] = [Codec::H264, Codec::Hevc, Codec::Av1, Codec::Vp9];

    /// Parse a client-supplied codec identifier.
    ///
    /// Accepts the family name as well as the common software encoder names,
    /// case-insensitively. Returns `None` for anything else.
    pub fn parse(key: &str) -> Option<Codec> {
        match key.trim().to_ascii_lowercase().as_str() {
            "h264" | "avc" | "x264" | "libx264" => Some(Codec::H264),
            "h265" | "hevc" | "x265" | "libx265" => Some(Codec::Hevc),
            "av1" | "libsvtav1" | "svt-av1" | "libaom-av1" => Some(Codec::Av1),
            "vp9" | "libvpx-vp9" => Some(Codec::Vp9),
            _ => None,
        }
    }

    /// Canonical identifier used in job records and listings.
    pub fn key(&self) -> &'static str {
        match self {
            Codec::H264 => "h264",
            Codec::Hevc => "hevc",
            Codec::Av1 => "av1",
            Codec::Vp9 => "vp9",
        }
    }

    /// Strategy table entry for this codec.
    pub fn spec(&self) -> &'static CodecSpec {
        match self {
            Codec::H264 => &CODEC_TABLE[0],
            Codec::Hevc => &CODEC_TABLE[1],
            Codec::Av1 => &CODEC_TABLE[2],
            Codec::Vp9 => &CODEC_TABLE[3],
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// Static description of how one codec family is encoded.
#[derive(Debug, PartialEq, Eq)]
pub struct CodecSpec {
    pub codec: Codec,
    /// Hardware encoders, most preferred first.
    pub hardware_encoders: &'static [&'static str],
    /// Software encoder assumed present whenever ffmpeg itself is.
    pub software_encoder: &'static str,
    /// Output file extension (also the muxer).
    pub container: &'static str,
    pub mime_type: &'static str,
    /// Audio is always encoded in software with a fixed codec per container.
    pub audio_encoder: &'static str,
    /// Constant-quality value for [`EncodingMode::Fast`].
    pub crf_fast: u8,
    /// Constant-quality value for [`EncodingMode::Quality`].
    pub crf_quality: u8,
}

impl CodecSpec {
    pub fn crf_for(&self, mode: EncodingMode) -> u8 {
        match mode {
            EncodingMode::Fast => self.crf_fast,
            EncodingMode::Quality => self.crf_quality,
        }
    }
}

static CODEC_TABLE: [CodecSpec; 4] = [
    CodecSpec {
        codec: Codec::H264,
        hardware_encoders: &[
            "h264_nvenc",
            "h264_qsv",
            "h264_videotoolbox",
            "h264_amf",
            "h264_vaapi",
        ],
        software_encoder: "libx264",
        container: "mp4",
        mime_type: "video/mp4",
        audio_encoder: "aac",
        crf_fast: 28,
        crf_quality: 23,
    },
    CodecSpec {
        codec: Codec::Hevc,
        hardware_encoders: &[
            "hevc_nvenc",
            "hevc_qsv",
            "hevc_videotoolbox",
            "hevc_amf",
            "hevc_vaapi",
        ],
        software_encoder: "libx265",
        container: "mp4",
        mime_type: "video/mp4",
        audio_encoder: "aac",
        crf_fast: 30,
        crf_quality: 26,
    },
    CodecSpec {
        codec: Codec::Av1,
        hardware_encoders: &["av1_nvenc", "av1_qsv", "av1_amf", "av1_vaapi"],
        software_encoder: "libsvtav1",
        container: "mp4",
        mime_type: "video/mp4",
        audio_encoder: "aac",
        crf_fast: 38,
        crf_quality: 32,
    },
    CodecSpec {
        codec: Codec::Vp9,
        hardware_encoders: &["vp9_qsv", "vp9_vaapi"],
        software_encoder: "libvpx-vp9",
        container: "webm",
        mime_type: "video/webm",
        audio_encoder: "libopus",
        crf_fast: 36,
        crf_quality: 31,
    },
];

/// How the video stream's size is controlled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RateControl {
    /// Average bitrate target, used when the request has a size budget.
    TargetBitrate { video_kbps: u32 },
    /// CRF (or the encoder's equivalent constant-quality knob).
    ConstantQuality { crf: u8 },
}

/// Encoder implementation families that share an argument dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderFamily {
    X264,
    X265,
    SvtAv1,
    Vpx,
    Nvenc,
    Qsv,
    VideoToolbox,
    Amf,
    Vaapi,
    Generic,
}

impl EncoderFamily {
    /// Classify an ffmpeg encoder name.
    pub fn of(encoder: &str) -> Self {
        let name = encoder.to_ascii_lowercase();
        if name.contains("nvenc") {
            EncoderFamily::Nvenc
        } else if name.contains("qsv") {
            EncoderFamily::Qsv
        } else if name.contains("videotoolbox") {
            EncoderFamily::VideoToolbox
        } else if name.contains("amf") {
            EncoderFamily::Amf
        } else if name.contains("vaapi") {
            EncoderFamily::Vaapi
        } else if name == "libx264" {
            EncoderFamily::X264
        } else if name == "libx265" {
            EncoderFamily::X265
        } else if name == "libsvtav1" {
            EncoderFamily::SvtAv1
        } else if name.starts_with("libvpx") {
            EncoderFamily::Vpx
        } else {
            EncoderFamily::Generic
        }
    }

    /// Whether ffmpeg can drive this encoder through a stats-file two-pass encode.
    pub fn supports_two_pass(&self) -> bool {
        matches!(self, EncoderFamily::X264 | EncoderFamily::X265 | EncoderFamily::Vpx)
    }

    /// VAAPI encoders only accept frames already uploaded to the device.
    pub fn needs_hw_upload(&self) -> bool {
        *self == EncoderFamily::Vaapi
    }
}

/// Render node used for VAAPI encoders.
pub const VAAPI_DEVICE: &str = "/dev/dri/renderD128";

/// Filter that moves software frames onto the VAAPI device.
pub const VAAPI_UPLOAD_FILTER: &str = "format=nv12,hwupload";

/// Build the video codec arguments for `encoder`.
///
/// Emits `-c:v`, a speed preset chosen by `mode`, and the rate-control flags
/// in the encoder's own dialect.
pub fn build_video_args(
    encoder: &str,
    rate_control: RateControl,
    mode: EncodingMode,
) -> Vec<String> {
    let family = EncoderFamily::of(encoder);
    let fast = mode == EncodingMode::Fast;
    let mut args: Vec<String> = vec!["-c:v".into(), encoder.into()];

    let preset: Option<(&str, &str)> = match family {
        EncoderFamily::X264 | EncoderFamily::X265 => {
            Some(("-preset", if fast { "veryfast" } else { "slow" }))
        }
        EncoderFamily::SvtAv1 => Some(("-preset", if fast { "10" } else { "6" })),
        EncoderFamily::Vpx => Some(("-cpu-used", if fast { "4" } else { "1" })),
        EncoderFamily::Nvenc => Some(("-preset", if fast { "p2" } else { "p6" })),
        EncoderFamily::Qsv => Some(("-preset", if fast { "veryfast" } else { "slower" })),
        EncoderFamily::Amf => Some(("-quality", if fast { "speed" } else { "quality" })),
        EncoderFamily::VideoToolbox | EncoderFamily::Vaapi | EncoderFamily::Generic => None,
    };
    if let Some((flag, value)) = preset {
        args.push(flag.into());
        args.push(value.into());
    }

    if family == EncoderFamily::Vpx {
        args.extend([
            "-deadline".to_string(),
            "good".to_string(),
            "-row-mt".to_string(),
            "1".to_string(),
        ]);
    }

    match rate_control {
        RateControl::TargetBitrate { video_kbps } => {
            match family {
                EncoderFamily::Nvenc => args.extend(["-rc".to_string(), "vbr".to_string()]),
                EncoderFamily::Amf => args.extend(["-rc".to_string(), "vbr_peak".to_string()]),
                EncoderFamily::Vaapi => args.extend(["-rc_mode".to_string(), "VBR".to_string()]),
                _ => {}
            }
            args.push("-b:v".into());
            args.push(format!("{}k", video_kbps));
            // Hardware rate control drifts without a ceiling.
            if !family.supports_two_pass() {
                args.push("-maxrate".into());
                args.push(format!("{}k", video_kbps.saturating_mul(3) / 2));
                args.push("-bufsize".into());
                args.push(format!("{}k", video_kbps.saturating_mul(2)));
            }
        }
        RateControl::ConstantQuality { crf } => match family {
            EncoderFamily::X264
            | EncoderFamily::X265
            | EncoderFamily::SvtAv1
            | EncoderFamily::Generic => {
                args.extend(["-crf".into(), crf.to_string()]);
            }
            EncoderFamily::Vpx => {
                args.extend(["-crf".into(), crf.to_string(), "-b:v".into(), "0".into()]);
            }
            EncoderFamily::Nvenc => {
                args.extend([
                    "-rc".into(),
                    "vbr".into(),
                    "-cq".into(),
                    crf.to_string(),
                    "-b:v".into(),
                    "0".into(),
                ]);
            }
            EncoderFamily::Qsv => {
                args.extend(["-global_quality".into(), crf.to_string()]);
            }
            EncoderFamily::VideoToolbox => {
                // VideoToolbox quality runs 1..=100, higher is better.
                let quality = 100u32.saturating_sub(u32::from(crf) * 2).clamp(1, 100);
                args.extend(["-q:v".into(), quality.to_string()]);
            }
            EncoderFamily::Amf => {
                args.extend([
                    "-rc".into(),
                    "cqp".into(),
                    "-qp_i".into(),
                    crf.to_string(),
                    "-qp_p".into(),
                    crf.to_string(),
                ]);
            }
            EncoderFamily::Vaapi => {
                args.extend(["-rc_mode".into(), "CQP".into(), "-qp".into(), crf.to_string()]);
            }
        },
    }

    if matches!(family, EncoderFamily::X264 | EncoderFamily::X265 | EncoderFamily::Vpx) {
        args.extend(["-pix_fmt".to_string(), "yuv420p".to_string()]);
    }

    args
}

/// Arguments selecting pass `pass` (1 or 2) of a stats-file two-pass encode.
pub fn build_two_pass_args(encoder: &str, pass: u8, passlog: &Path) -> Vec<String> {
    match EncoderFamily::of(encoder) {
        EncoderFamily::X265 => vec![
            "-x265-params".into(),
            format!("pass={}:stats={}", pass, passlog.display()),
        ],
        _ => vec![
            "-pass".into(),
            pass.to_string(),
            "-passlogfile".into(),
            passlog.display().to_string(),
        ],
    }
}
