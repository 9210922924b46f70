//! Compression planning
//!
//! Turns a validated request plus source metadata into an immutable
//! [`CompressionPlan`]: which encoder to run, how to control its rate, what
//! scale to output at and whether a two-pass encode is worthwhile.
//!
//! The size budget follows the usual container arithmetic: a target of
//! `S` megabytes over `D` seconds allows `S * 1024 * 1024 * 8 * 0.97 / D / 1000`
//! kilobits per second in total, the 3% margin absorbing muxing overhead.

use crate::encoders::{Codec, EncoderFamily, EncoderSelector, RateControl};
use crate::media_probe::SourceMetadata;
use crate::request::{CompressionRequest, CropRect, EncodingMode, Segment, ValidationError};
use log::{debug, warn};
use serde::Serialize;

/// Fraction of the requested size actually budgeted for the streams.
pub const SIZE_SAFETY_FACTOR: f64 = 0.97;

/// Audio bitrate reserved whenever the output keeps an audio track.
pub const AUDIO_BITRATE_KBPS: u32 = 128;

/// Frame rate assumed when estimating bits per pixel.
pub const ASSUMED_FPS: f64 = 30.0;

/// Bits per pixel below which the output is downscaled.
pub const BPP_QUALITY_FLOOR: f64 = 0.1;

pub const MIN_SCALE_PERCENT: u32 = 25;

/// Output height the scale search will not go below, for sources at least this tall.
pub const MIN_OUTPUT_HEIGHT: u32 = 480;

/// Lowest video bitrate a plan will request.
pub const MIN_VIDEO_BITRATE_KBPS: u32 = 100;

/// Segment ends may overshoot the probed duration by this much (container rounding).
const SEGMENT_END_TOLERANCE_SECS: f64 = 0.05;

/// Non-fatal observations made while planning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanWarning {
    /// A size target was requested but the duration is unknown; planned as constant quality.
    DurationUnknown,
    /// The size target leaves less than the minimum video bitrate.
    TargetBelowMinimum,
}

/// Bitrate split for a size-targeted plan. `total_kbps == video_kbps + audio_kbps`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BitrateBudget {
    pub total_kbps: u32,
    pub video_kbps: u32,
    pub audio_kbps: u32,
}

impl BitrateBudget {
    fn new(video_kbps: u32, audio_kbps: u32) -> Self {
        Self {
            total_kbps: video_kbps + audio_kbps,
            video_kbps,
            audio_kbps,
        }
    }
}

/// Everything needed to run a job's encoder passes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompressionPlan {
    pub job_id: String,
    pub request: CompressionRequest,
    pub codec: Codec,
    pub encoder: String,
    pub rate_control: RateControl,
    /// Present only for size-targeted plans.
    pub budget: Option<BitrateBudget>,
    pub scale_percent: u32,
    pub two_pass: bool,
    pub crop: Option<CropRect>,
    pub segments: Vec<Segment>,
    pub output_fps: Option<f64>,
    /// `None` drops the audio track.
    pub audio_kbps: Option<u32>,
    pub effective_duration_secs: Option<f64>,
    pub warnings: Vec<PlanWarning>,
}

impl CompressionPlan {
    pub fn mode(&self) -> EncodingMode {
        self.request.mode
    }

    pub fn total_bitrate_kbps(&self) -> Option<u32> {
        self.budget.map(|b| b.total_kbps)
    }

    pub fn video_bitrate_kbps(&self) -> Option<u32> {
        self.budget.map(|b| b.video_kbps)
    }

    pub fn output_extension(&self) -> &'static str {
        self.codec.spec().container
    }

    pub fn mime_type(&self) -> &'static str {
        self.codec.spec().mime_type
    }

    pub fn pass_count(&self) -> u32 {
        if self.two_pass {
            2
        } else {
            1
        }
    }
}

/// Duration the output will cover: kept segments, else the client hint,
/// else the probed source duration.
pub fn effective_duration(request: &CompressionRequest, source: &SourceMetadata) -> Option<f64> {
    request
        .segments_duration()
        .or(request.duration_hint_secs)
        .or(source.duration_secs)
}

/// Total bitrate (kbps) that fits `size_mb` into `duration_secs`.
pub fn target_total_bitrate_kbps(size_mb: f64, duration_secs: f64) -> f64 {
    size_mb * 1024.0 * 1024.0 * 8.0 * SIZE_SAFETY_FACTOR / duration_secs / 1000.0
}

/// Scale percent that keeps bits per pixel at or above the quality floor.
///
/// Returns 100 when the budget already meets the floor (or the frame size is
/// unknown); otherwise shrinks both axes by `sqrt(bpp / floor)`, clamped to
/// `[MIN_SCALE_PERCENT, 100]`.
pub fn calculate_optimal_scale(width: u32, height: u32, video_kbps: f64) -> u32 {
    if width == 0 || height == 0 {
        return 100;
    }
    let pixels_per_second = f64::from(width) * f64::from(height) * ASSUMED_FPS;
    let bpp = video_kbps.max(0.0) * 1000.0 / pixels_per_second;
    if bpp >= BPP_QUALITY_FLOOR {
        return 100;
    }
    let scale = ((bpp / BPP_QUALITY_FLOOR).sqrt() * 100.0).round();
    (scale as u32).clamp(MIN_SCALE_PERCENT, 100)
}

/// Raise `scale` so the output keeps `MIN_OUTPUT_HEIGHT` lines, when the
/// source has that many to begin with.
fn enforce_min_height(scale: u32, height: u32) -> u32 {
    if height < MIN_OUTPUT_HEIGHT {
        return scale;
    }
    let floor = (u64::from(MIN_OUTPUT_HEIGHT) * 100).div_ceil(u64::from(height)) as u32;
    scale.max(floor).min(100)
}

/// Builds plans using the encoder chosen by an [`EncoderSelector`].
#[derive(Debug, Clone)]
pub struct CompressionPlanner {
    selector: EncoderSelector,
}

impl CompressionPlanner {
    pub fn new(selector: EncoderSelector) -> Self {
        Self { selector }
    }

    pub fn selector(&self) -> &EncoderSelector {
        &self.selector
    }

    /// Compute the plan for `request` against `source`.
    ///
    /// Size targets take precedence over the quality flag, which then only
    /// picks the preset speed. An explicit request scale overrides the
    /// computed one.
    pub fn build_plan(
        &self,
        job_id: &str,
        request: &CompressionRequest,
        source: &SourceMetadata,
    ) -> Result<CompressionPlan, ValidationError> {
        let codec = request.validate()?;

        let frame = match request.crop {
            Some(crop) => {
                let (width, height) = source
                    .dimensions()
                    .ok_or(ValidationError::CropWithoutDimensions)?;
                if !crop.fits_within(width, height) {
                    return Err(ValidationError::CropOutOfBounds { crop, width, height });
                }
                Some((crop.width, crop.height))
            }
            None => source.dimensions(),
        };

        if let Some(duration) = source.duration_secs {
            for (index, segment) in request.segments.iter().enumerate() {
                if segment.end > duration + SEGMENT_END_TOLERANCE_SECS {
                    return Err(ValidationError::SegmentBeyondSource {
                        index,
                        end: segment.end,
                        duration,
                    });
                }
            }
        }

        let duration = effective_duration(request, source);
        let encoder = self.selector.get_best_encoder(codec);
        let keep_audio = match source.has_audio {
            _ if request.mute_audio => false,
            Some(present) => present,
            // The unsegmented graph maps audio optionally; trim filters need a real stream.
            None if request.segments.is_empty() => true,
            None => {
                warn!(
                    "Job {}: audio presence unknown; segmented output drops audio",
                    job_id
                );
                false
            }
        };
        let audio_kbps = if keep_audio { AUDIO_BITRATE_KBPS } else { 0 };
        let constant_quality = RateControl::ConstantQuality {
            crf: codec.spec().crf_for(request.mode),
        };

        let mut warnings = Vec::new();
        let (rate_control, budget, computed_scale) = match (request.target_size_mb, duration) {
            (Some(_), Some(d)) if d <= 0.0 => return Err(ValidationError::ZeroDuration),
            (Some(size_mb), Some(d)) => {
                let total = target_total_bitrate_kbps(size_mb, d);
                let video = total - f64::from(audio_kbps);

                if video < f64::from(MIN_VIDEO_BITRATE_KBPS) {
                    warn!(
                        "Job {}: {:.2} MB over {:.1}s leaves {:.0} kbps for video; using the {} kbps minimum",
                        job_id, size_mb, d, video, MIN_VIDEO_BITRATE_KBPS
                    );
                    warnings.push(PlanWarning::TargetBelowMinimum);
                    let budget = BitrateBudget::new(MIN_VIDEO_BITRATE_KBPS, audio_kbps);
                    (
                        RateControl::TargetBitrate {
                            video_kbps: budget.video_kbps,
                        },
                        Some(budget),
                        MIN_SCALE_PERCENT,
                    )
                } else {
                    let video = video.min(f64::from(u32::MAX - audio_kbps));
                    let video_kbps = video.floor() as u32;
                    let scale = match frame {
                        Some((w, h)) => {
                            enforce_min_height(calculate_optimal_scale(w, h, video), h)
                        }
                        None => 100,
                    };
                    let budget = BitrateBudget::new(video_kbps, audio_kbps);
                    (RateControl::TargetBitrate { video_kbps }, Some(budget), scale)
                }
            }
            (Some(_), None) => {
                warn!(
                    "Job {}: size target requested but duration is unknown; encoding at constant quality",
                    job_id
                );
                warnings.push(PlanWarning::DurationUnknown);
                (constant_quality, None, 100)
            }
            (None, _) => (constant_quality, None, 100),
        };

        let scale_percent = request.scale_percent.unwrap_or(computed_scale);
        let two_pass = matches!(rate_control, RateControl::TargetBitrate { .. })
            && EncoderFamily::of(&encoder).supports_two_pass();

        debug!(
            "Job {}: plan codec={} encoder={} rate={:?} scale={}% two_pass={}",
            job_id, codec, encoder, rate_control, scale_percent, two_pass
        );

        Ok(CompressionPlan {
            job_id: job_id.to_string(),
            request: request.clone(),
            codec,
            encoder,
            rate_control,
            budget,
            scale_percent,
            two_pass,
            crop: request.crop,
            segments: request.segments.clone(),
            output_fps: request.target_fps,
            audio_kbps: keep_audio.then_some(AUDIO_BITRATE_KBPS),
            effective_duration_secs: duration,
            warnings,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoders::EncoderProbe;
    use proptest::prelude::*;
    use std::sync::Arc;

    fn planner_with(names: &[&str]) -> CompressionPlanner {
        let probe = EncoderProbe::with_advertised(names.iter().copied());
        CompressionPlanner::new(EncoderSelector::new(Arc::new(probe)))
    }

    fn software_planner() -> CompressionPlanner {
        planner_with(&["libx264", "libx265", "libsvtav1", "libvpx-vp9"])
    }

    fn create_test_source(width: u32, height: u32, duration: f64) -> SourceMetadata {
        SourceMetadata {
            width: Some(width),
            height: Some(height),
            duration_secs: Some(duration),
            frame_rate: Some(30.0),
            has_audio: Some(true),
            size_bytes: Some(100 * 1024 * 1024),
            video_codec: Some("h264".to_string()),
        }
    }

    fn sized_request(codec: &str, size_mb: f64) -> CompressionRequest {
        CompressionRequest {
            target_size_mb: Some(size_mb),
            ..CompressionRequest::new(codec)
        }
    }

    // **Feature: smart-compressor, Property: Bitrate Monotone In Duration**
    //
    // *For any* positive size and durations D1 < D2, the total bitrate for D1
    // is strictly greater than for D2.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_total_bitrate_decreases_with_duration(
            size_mb in 0.5f64..4096.0,
            d1 in 0.5f64..10_000.0,
            extra in 0.5f64..10_000.0,
        ) {
            let d2 = d1 + extra;
            prop_assert!(
                target_total_bitrate_kbps(size_mb, d1) > target_total_bitrate_kbps(size_mb, d2)
            );
        }
    }

    // **Feature: smart-compressor, Property: Video Bitrate Budget**
    //
    // *For any* size-targeted plan, video bitrate is non-negative, equals
    // total minus audio, and equals total when audio is muted.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_video_bitrate_budget(
            size_mb in 0.1f64..500.0,
            duration in 1.0f64..7200.0,
            mute in any::<bool>(),
        ) {
            let planner = software_planner();
            let request = CompressionRequest {
                mute_audio: mute,
                ..sized_request("h264", size_mb)
            };
            let plan = planner
                .build_plan("job", &request, &create_test_source(1920, 1080, duration))
                .unwrap();
            let budget = plan.budget.unwrap();

            prop_assert_eq!(budget.total_kbps, budget.video_kbps + budget.audio_kbps);
            prop_assert!(budget.video_kbps >= MIN_VIDEO_BITRATE_KBPS);
            if mute {
                prop_assert_eq!(budget.audio_kbps, 0);
                prop_assert_eq!(budget.total_kbps, budget.video_kbps);
                prop_assert_eq!(plan.audio_kbps, None);
            } else {
                prop_assert_eq!(budget.audio_kbps, AUDIO_BITRATE_KBPS);
            }
        }
    }

    // **Feature: smart-compressor, Property: Optimal Scale Bounds**
    //
    // *For any* frame and bitrate the computed scale lies in [25, 100], and is
    // exactly 100 once bits per pixel reaches the floor.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_optimal_scale_bounds(
            width in 1u32..8000,
            height in 1u32..5000,
            video_kbps in 0.0f64..200_000.0,
        ) {
            let scale = calculate_optimal_scale(width, height, video_kbps);
            prop_assert!((MIN_SCALE_PERCENT..=100).contains(&scale));

            let bpp = video_kbps * 1000.0 / (f64::from(width) * f64::from(height) * ASSUMED_FPS);
            if bpp >= BPP_QUALITY_FLOOR {
                prop_assert_eq!(scale, 100);
            }
        }

        #[test]
        fn prop_scale_at_floor_is_full(
            width in 16u32..4000,
            height in 16u32..4000,
        ) {
            let pixels_per_second = f64::from(width) * f64::from(height) * ASSUMED_FPS;
            let floor_kbps = BPP_QUALITY_FLOOR * pixels_per_second / 1000.0;
            prop_assert_eq!(calculate_optimal_scale(width, height, floor_kbps * 1.0001), 100);
        }
    }

    #[test]
    fn test_ten_megabytes_one_minute_1080p() {
        let planner = software_planner();
        let source = create_test_source(1920, 1080, 60.0);
        let plan = planner
            .build_plan("job-1", &sized_request("h264", 10.0), &source)
            .unwrap();

        let budget = plan.budget.unwrap();
        assert!((1340..=1360).contains(&budget.total_kbps), "total {}", budget.total_kbps);
        assert_eq!(budget.audio_kbps, 128);
        assert_eq!(budget.video_kbps, budget.total_kbps - 128);
        assert!((1215..=1235).contains(&budget.video_kbps), "video {}", budget.video_kbps);
        // bpp ~0.0197 -> sqrt(0.197) ~ 44%, lifted to the 480-line floor.
        assert_eq!(plan.scale_percent, 45);
        assert_eq!(plan.encoder, "libx264");
        assert!(plan.two_pass);
        assert!(plan.warnings.is_empty());
        assert_eq!(
            plan.rate_control,
            RateControl::TargetBitrate {
                video_kbps: budget.video_kbps
            }
        );
    }

    #[test]
    fn test_no_target_size_is_constant_quality() {
        let planner = software_planner();
        let fast = planner
            .build_plan("a", &CompressionRequest::new("h264"), &create_test_source(1280, 720, 30.0))
            .unwrap();
        assert_eq!(fast.rate_control, RateControl::ConstantQuality { crf: 28 });
        assert_eq!(fast.budget, None);
        assert_eq!(fast.scale_percent, 100);
        assert!(!fast.two_pass);

        let quality_request = CompressionRequest {
            mode: EncodingMode::Quality,
            ..CompressionRequest::new("h264")
        };
        let quality = planner
            .build_plan("b", &quality_request, &create_test_source(1280, 720, 30.0))
            .unwrap();
        assert_eq!(quality.rate_control, RateControl::ConstantQuality { crf: 23 });
    }

    #[test]
    fn test_target_size_wins_over_quality_flag() {
        let planner = software_planner();
        let request = CompressionRequest {
            mode: EncodingMode::Quality,
            ..sized_request("h264", 20.0)
        };
        let plan = planner
            .build_plan("job", &request, &create_test_source(1280, 720, 60.0))
            .unwrap();
        assert!(matches!(plan.rate_control, RateControl::TargetBitrate { .. }));
        assert_eq!(plan.mode(), EncodingMode::Quality);
    }

    #[test]
    fn test_unknown_duration_degrades_to_constant_quality() {
        let planner = software_planner();
        let source = SourceMetadata {
            duration_secs: None,
            ..create_test_source(1920, 1080, 0.0)
        };
        let plan = planner
            .build_plan("job", &sized_request("h264", 10.0), &source)
            .unwrap();
        assert_eq!(plan.warnings, vec![PlanWarning::DurationUnknown]);
        assert!(matches!(plan.rate_control, RateControl::ConstantQuality { .. }));
        assert_eq!(plan.budget, None);
        assert!(!plan.two_pass);
    }

    #[test]
    fn test_zero_duration_with_size_rejected() {
        let planner = software_planner();
        let source = create_test_source(1920, 1080, 0.0);
        let result = planner.build_plan("job", &sized_request("h264", 10.0), &source);
        assert_eq!(result, Err(ValidationError::ZeroDuration));

        // Without a size target a zero duration is harmless.
        let plan = planner.build_plan("job", &CompressionRequest::new("h264"), &source);
        assert!(plan.is_ok());
    }

    #[test]
    fn test_target_below_minimum_clamps() {
        let planner = software_planner();
        let plan = planner
            .build_plan("job", &sized_request("h264", 1.0), &create_test_source(1920, 1080, 600.0))
            .unwrap();
        let budget = plan.budget.unwrap();
        assert_eq!(plan.warnings, vec![PlanWarning::TargetBelowMinimum]);
        assert_eq!(budget.video_kbps, MIN_VIDEO_BITRATE_KBPS);
        assert_eq!(budget.total_kbps, MIN_VIDEO_BITRATE_KBPS + AUDIO_BITRATE_KBPS);
        assert_eq!(plan.scale_percent, MIN_SCALE_PERCENT);
    }

    #[test]
    fn test_huge_target_short_duration_saturates() {
        let planner = software_planner();
        let request = CompressionRequest {
            duration_hint_secs: Some(0.01),
            ..sized_request("h264", 10_000.0)
        };
        let source = SourceMetadata {
            duration_secs: None,
            ..create_test_source(1920, 1080, 0.0)
        };
        let plan = planner.build_plan("job", &request, &source).unwrap();

        let budget = plan.budget.unwrap();
        assert_eq!(budget.total_kbps, u32::MAX);
        assert_eq!(budget.total_kbps, budget.video_kbps + budget.audio_kbps);
        assert_eq!(budget.audio_kbps, AUDIO_BITRATE_KBPS);
        assert_eq!(plan.scale_percent, 100);

        let segmented = CompressionRequest {
            segments: vec![Segment::new(0.0, 0.001)],
            ..sized_request("h264", 4096.0)
        };
        let plan = planner
            .build_plan("job", &segmented, &create_test_source(1920, 1080, 60.0))
            .unwrap();
        let budget = plan.budget.unwrap();
        assert_eq!(budget.total_kbps, budget.video_kbps + budget.audio_kbps);
    }

    #[test]
    fn test_unknown_audio_kept_only_without_segments() {
        let planner = software_planner();
        let whole = CompressionRequest {
            duration_hint_secs: Some(60.0),
            ..sized_request("h264", 10.0)
        };
        let plan = planner
            .build_plan("job", &whole, &SourceMetadata::unknown())
            .unwrap();
        assert_eq!(plan.audio_kbps, Some(AUDIO_BITRATE_KBPS));

        let segmented = CompressionRequest {
            segments: vec![Segment::new(0.0, 10.0), Segment::new(20.0, 30.0)],
            ..sized_request("h264", 10.0)
        };
        let plan = planner
            .build_plan("job", &segmented, &SourceMetadata::unknown())
            .unwrap();
        assert_eq!(plan.audio_kbps, None);
        let budget = plan.budget.unwrap();
        assert_eq!(budget.audio_kbps, 0);
        assert_eq!(budget.total_kbps, budget.video_kbps);
    }

    #[test]
    fn test_muted_or_silent_sources_drop_audio() {
        let planner = software_planner();
        let silent = SourceMetadata {
            has_audio: Some(false),
            ..create_test_source(1280, 720, 60.0)
        };
        let plan = planner
            .build_plan("job", &sized_request("h264", 10.0), &silent)
            .unwrap();
        assert_eq!(plan.audio_kbps, None);
        let budget = plan.budget.unwrap();
        assert_eq!(budget.audio_kbps, 0);
        assert_eq!(budget.total_kbps, budget.video_kbps);
    }

    #[test]
    fn test_segments_define_duration() {
        let planner = software_planner();
        let request = CompressionRequest {
            segments: vec![Segment::new(0.0, 10.0), Segment::new(20.0, 30.0)],
            ..sized_request("h264", 10.0)
        };
        let plan = planner
            .build_plan("job", &request, &create_test_source(1920, 1080, 120.0))
            .unwrap();
        assert_eq!(plan.effective_duration_secs, Some(20.0));

        let full = planner
            .build_plan("job", &sized_request("h264", 10.0), &create_test_source(1920, 1080, 120.0))
            .unwrap();
        assert!(plan.total_bitrate_kbps() > full.total_bitrate_kbps());
    }

    #[test]
    fn test_segment_beyond_source_rejected() {
        let planner = software_planner();
        let request = CompressionRequest {
            segments: vec![Segment::new(50.0, 70.0)],
            ..CompressionRequest::new("h264")
        };
        let result = planner.build_plan("job", &request, &create_test_source(1920, 1080, 60.0));
        assert!(matches!(result, Err(ValidationError::SegmentBeyondSource { index: 0, .. })));
    }

    #[test]
    fn test_duration_hint_precedes_probe() {
        let planner = software_planner();
        let request = CompressionRequest {
            duration_hint_secs: Some(30.0),
            ..sized_request("h264", 10.0)
        };
        let source = SourceMetadata {
            duration_secs: None,
            ..create_test_source(1920, 1080, 0.0)
        };
        let plan = planner.build_plan("job", &request, &source).unwrap();
        assert_eq!(plan.effective_duration_secs, Some(30.0));
        assert!(plan.warnings.is_empty());
    }

    #[test]
    fn test_crop_validation_and_dimensions() {
        let planner = software_planner();
        let source = create_test_source(1920, 1080, 60.0);

        let outside = CompressionRequest {
            crop: Some(CropRect { x: 1000, y: 0, width: 1000, height: 500 }),
            ..CompressionRequest::new("h264")
        };
        assert!(matches!(
            planner.build_plan("job", &outside, &source),
            Err(ValidationError::CropOutOfBounds { .. })
        ));

        let unknown_dims = SourceMetadata::unknown();
        let cropped = CompressionRequest {
            crop: Some(CropRect { x: 0, y: 0, width: 640, height: 360 }),
            ..sized_request("h264", 10.0)
        };
        assert_eq!(
            planner.build_plan("job", &cropped, &unknown_dims),
            Err(ValidationError::CropWithoutDimensions)
        );

        // A 640x360 crop is below the height floor, so only the bpp rule applies.
        let plan = planner.build_plan("job", &cropped, &source).unwrap();
        let video = f64::from(plan.video_bitrate_kbps().unwrap());
        assert_eq!(plan.scale_percent, calculate_optimal_scale(640, 360, video));
        assert_eq!(plan.crop, cropped.crop);
    }

    #[test]
    fn test_explicit_scale_overrides() {
        let planner = software_planner();
        let request = CompressionRequest {
            scale_percent: Some(80),
            ..sized_request("h264", 10.0)
        };
        let plan = planner
            .build_plan("job", &request, &create_test_source(1920, 1080, 60.0))
            .unwrap();
        assert_eq!(plan.scale_percent, 80);
    }

    #[test]
    fn test_hardware_encoder_is_single_pass() {
        let planner = planner_with(&["h264_nvenc", "libx264"]);
        let plan = planner
            .build_plan("job", &sized_request("h264", 10.0), &create_test_source(1920, 1080, 60.0))
            .unwrap();
        assert_eq!(plan.encoder, "h264_nvenc");
        assert!(!plan.two_pass);
    }

    #[test]
    fn test_av1_sized_plan_is_single_pass() {
        let plan = software_planner()
            .build_plan("job", &sized_request("av1", 10.0), &create_test_source(1920, 1080, 60.0))
            .unwrap();
        assert_eq!(plan.encoder, "libsvtav1");
        assert!(!plan.two_pass);
        assert_eq!(plan.output_extension(), "mp4");
    }

    #[test]
    fn test_vp9_plan_container() {
        let plan = software_planner()
            .build_plan("job", &sized_request("vp9", 10.0), &create_test_source(1280, 720, 60.0))
            .unwrap();
        assert_eq!(plan.encoder, "libvpx-vp9");
        assert!(plan.two_pass);
        assert_eq!(plan.output_extension(), "webm");
        assert_eq!(plan.mime_type(), "video/webm");
    }

    #[test]
    fn test_min_height_only_for_tall_sources() {
        assert_eq!(enforce_min_height(30, 1080), 45);
        assert_eq!(enforce_min_height(60, 1080), 60);
        assert_eq!(enforce_min_height(30, 360), 30);
        assert_eq!(enforce_min_height(30, 480), 100);
    }

    #[test]
    fn test_invalid_request_rejected_before_planning() {
        let result = software_planner().build_plan(
            "job",
            &CompressionRequest::new("realvideo"),
            &create_test_source(1920, 1080, 60.0),
        );
        assert!(matches!(result, Err(ValidationError::UnknownCodec(_))));
    }
}
