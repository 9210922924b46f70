//! Compression request model and validation

use crate::encoders::Codec;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Highest output frame rate a request may ask for.
pub const MAX_TARGET_FPS: f64 = 240.0;

/// Speed/quality trade-off selected by the client's quality flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncodingMode {
    #[default]
    Fast,
    Quality,
}

impl EncodingMode {
    pub fn from_quality_flag(quality: bool) -> Self {
        if quality {
            EncodingMode::Quality
        } else {
            EncodingMode::Fast
        }
    }
}

/// A kept time range of the source, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub start: f64,
    pub end: f64,
}

impl Segment {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    pub fn span(&self) -> f64 {
        self.end - self.start
    }
}

/// Crop rectangle in source pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CropRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl CropRect {
    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        u64::from(self.x) + u64::from(self.width) <= u64::from(width)
            && u64::from(self.y) + u64::from(self.height) <= u64::from(height)
    }
}

/// What the client asked for.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CompressionRequest {
    /// Codec identifier as supplied, e.g. `h264` or `libvpx-vp9`.
    pub codec: String,
    /// Output size as a percentage of the (cropped) source, 1..=100.
    #[serde(default)]
    pub scale_percent: Option<u32>,
    #[serde(default)]
    pub target_fps: Option<f64>,
    /// Output size budget in megabytes (1 MB = 8192 kilobits).
    #[serde(default)]
    pub target_size_mb: Option<f64>,
    #[serde(default)]
    pub mute_audio: bool,
    #[serde(default)]
    pub crop: Option<CropRect>,
    /// Kept ranges, concatenated in order. Empty keeps the whole source.
    #[serde(default)]
    pub segments: Vec<Segment>,
    #[serde(default)]
    pub mode: EncodingMode,
    /// Client-supplied duration, used when the source cannot be probed.
    #[serde(default)]
    pub duration_hint_secs: Option<f64>,
}

impl CompressionRequest {
    pub fn new(codec: impl Into<String>) -> Self {
        Self {
            codec: codec.into(),
            ..Default::default()
        }
    }

    /// Check everything that can be checked without looking at the source.
    ///
    /// Returns the resolved codec on success.
    pub fn validate(&self) -> Result<Codec, ValidationError> {
        let codec = Codec::parse(&self.codec)
            .ok_or_else(|| ValidationError::UnknownCodec(self.codec.clone()))?;

        if let Some(scale) = self.scale_percent {
            if !(1..=100).contains(&scale) {
                return Err(ValidationError::InvalidScale(scale));
            }
        }

        if let Some(fps) = self.target_fps {
            if !fps.is_finite() || fps <= 0.0 || fps > MAX_TARGET_FPS {
                return Err(ValidationError::InvalidFrameRate(fps));
            }
        }

        if let Some(size) = self.target_size_mb {
            if !size.is_finite() || size <= 0.0 {
                return Err(ValidationError::InvalidTargetSize(size));
            }
        }

        if let Some(hint) = self.duration_hint_secs {
            if !hint.is_finite() || hint < 0.0 {
                return Err(ValidationError::InvalidDurationHint(hint));
            }
        }

        if let Some(crop) = self.crop {
            if crop.width == 0 || crop.height == 0 {
                return Err(ValidationError::EmptyCrop);
            }
        }

        let mut previous_end: Option<f64> = None;
        for (index, segment) in self.segments.iter().enumerate() {
            let well_formed = segment.start.is_finite()
                && segment.end.is_finite()
                && segment.start >= 0.0
                && segment.end > segment.start;
            if !well_formed {
                return Err(ValidationError::InvalidSegment {
                    index,
                    start: segment.start,
                    end: segment.end,
                });
            }
            if let Some(end) = previous_end {
                if segment.start < end {
                    return Err(ValidationError::OverlappingSegments { index });
                }
            }
            previous_end = Some(segment.end);
        }

        Ok(codec)
    }

    /// Total kept duration when segments are present.
    pub fn segments_duration(&self) -> Option<f64> {
        if self.segments.is_empty() {
            None
        } else {
            Some(self.segments.iter().map(Segment::span).sum())
        }
    }
}

/// Reasons a request is rejected before any job exists.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("Unsupported codec: {0}")]
    UnknownCodec(String),

    #[error("Scale must be between 1 and 100 percent, got {0}")]
    InvalidScale(u32),

    #[error("Target frame rate must be in (0, 240], got {0}")]
    InvalidFrameRate(f64),

    #[error("Target size must be positive, got {0} MB")]
    InvalidTargetSize(f64),

    #[error("Duration hint must be non-negative, got {0}")]
    InvalidDurationHint(f64),

    #[error("Segment {index} is invalid ({start}..{end})")]
    InvalidSegment { index: usize, start: f64, end: f64 },

    #[error("Segment {index} overlaps or precedes the previous segment")]
    OverlappingSegments { index: usize },

    #[error("Segment {index} ends at {end}s, beyond the source duration of {duration}s")]
    SegmentBeyondSource { index: usize, end: f64, duration: f64 },

    #[error("Crop area must be non-zero")]
    EmptyCrop,

    #[error("Crop {crop:?} does not fit inside the {width}x{height} source")]
    CropOutOfBounds { crop: CropRect, width: u32, height: u32 },

    #[error("Crop requires known source dimensions")]
    CropWithoutDimensions,

    #[error("Cannot target a file size for a zero-length source")]
    ZeroDuration,

    #[error("Source is {size} bytes, over the {limit} byte limit")]
    SourceTooLarge { size: u64, limit: u64 },

    #[error("Source file not found: {0}")]
    SourceMissing(PathBuf),
}
