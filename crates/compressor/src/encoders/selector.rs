//! Encoder selection per codec family

use crate::encoders::codec::Codec;
use crate::encoders::probe::{EncoderCapability, EncoderProbe, ProbeMode};
use serde::Serialize;
use std::sync::Arc;

/// Substrings that mark an ffmpeg encoder as hardware accelerated.
const HARDWARE_ENCODER_MARKERS: &[&str] =
    &["nvenc", "qsv", "videotoolbox", "amf", "vaapi", "v4l2m2m"];

/// Whether `name` is a hardware encoder, judged by name alone.
pub fn is_hardware_encoder(name: &str) -> bool {
    let lower = name.to_lowercase();
    HARDWARE_ENCODER_MARKERS
        .iter()
        .any(|marker| lower.contains(marker))
}

/// Per-codec summary returned by [`EncoderSelector::list_encoders`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EncoderListing {
    pub codec: Codec,
    pub selected_encoder: String,
    pub hardware_accelerated: bool,
    pub software_fallback: String,
    pub verified: bool,
    pub encoders: Vec<EncoderCapability>,
}

/// Picks the encoder to use for a codec: first available hardware encoder,
/// otherwise the codec's software encoder.
#[derive(Debug, Clone)]
pub struct EncoderSelector {
    probe: Arc<EncoderProbe>,
}

impl EncoderSelector {
    pub fn new(probe: Arc<EncoderProbe>) -> Self {
        Self { probe }
    }

    pub fn probe(&self) -> &EncoderProbe {
        &self.probe
    }

    /// Best encoder for `codec` under the probe's default mode.
    pub fn get_best_encoder(&self, codec: Codec) -> String {
        let spec = codec.spec();
        self.probe
            .best_encoder(spec.hardware_encoders, spec.software_encoder)
    }

    /// Selection summary for every codec.
    ///
    /// With `verify` set, hardware encoders must also pass a trial encode.
    pub fn list_encoders(&self, verify: bool) -> Vec<EncoderListing> {
        let mode = if verify {
            ProbeMode::Verify
        } else {
            ProbeMode::Advertised
        };

        Codec::ALL
            .iter()
            .map(|&codec| {
                let spec = codec.spec();
                let encoders: Vec<EncoderCapability> = spec
                    .hardware_encoders
                    .iter()
                    .chain(std::iter::once(&spec.software_encoder))
                    .map(|name| EncoderCapability {
                        name: name.to_string(),
                        hardware: is_hardware_encoder(name),
                        available: Some(self.probe.is_encoder_available_with(name, mode)),
                    })
                    .collect();
                let selected_encoder =
                    self.probe
                        .best_encoder_with(spec.hardware_encoders, spec.software_encoder, mode);

                EncoderListing {
                    codec,
                    hardware_accelerated: is_hardware_encoder(&selected_encoder),
                    selected_encoder,
                    software_fallback: spec.software_encoder.to_string(),
                    verified: verify,
                    encoders,
                }
            })
            .collect()
    }
}
