//! FFmpeg argument construction
//!
//! Builds the full argument list for one pass of a [`CompressionPlan`]:
//! input, filter graph (trim/concat, crop, scale, frame rate), stream maps,
//! video codec flags from the codec table, two-pass flags and audio.

use crate::encoders::codec::{VAAPI_DEVICE, VAAPI_UPLOAD_FILTER};
use crate::encoders::{build_two_pass_args, build_video_args, EncoderFamily};
use crate::planner::CompressionPlan;
use crate::progress::PassBand;
use std::path::Path;

/// Which pass of the plan the arguments are for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassKind {
    Single,
    /// Analysis pass writing the stats file; output goes to the null muxer.
    First,
    Second,
}

impl PassKind {
    /// Passes to run for `plan`, in order.
    pub fn sequence(plan: &CompressionPlan) -> &'static [PassKind] {
        if plan.two_pass {
            &[PassKind::First, PassKind::Second]
        } else {
            &[PassKind::Single]
        }
    }

    /// 1-based pass number and the total pass count.
    pub fn position(&self) -> (u32, u32) {
        match self {
            PassKind::Single => (1, 1),
            PassKind::First => (1, 2),
            PassKind::Second => (2, 2),
        }
    }

    pub fn band(&self) -> PassBand {
        let (pass, total) = self.position();
        PassBand::for_pass(pass, total)
    }
}

/// Files a pass reads and writes.
#[derive(Debug, Clone, Copy)]
pub struct PassTarget<'a> {
    pub input: &'a Path,
    pub output: &'a Path,
    /// Stats file prefix shared by both passes of a two-pass encode.
    pub passlog: &'a Path,
}

/// Null sink path for the analysis pass.
pub fn null_sink() -> &'static str {
    if cfg!(windows) {
        "NUL"
    } else {
        "/dev/null"
    }
}

/// Video filters applied after any trimming: crop, scale, frame rate and,
/// for VAAPI, the device upload.
fn video_filter_chain(plan: &CompressionPlan) -> Vec<String> {
    let mut filters = Vec::new();

    if let Some(crop) = plan.crop {
        filters.push(format!(
            "crop={}:{}:{}:{}",
            crop.width, crop.height, crop.x, crop.y
        ));
    }

    // Even dimensions keep 4:2:0 encoders happy after cropping or scaling.
    if plan.scale_percent < 100 {
        filters.push(format!(
            "scale=trunc(iw*{}/200)*2:trunc(ih*{}/200)*2",
            plan.scale_percent, plan.scale_percent
        ));
    } else if plan.crop.is_some() {
        filters.push("scale=trunc(iw/2)*2:trunc(ih/2)*2".to_string());
    }

    if let Some(fps) = plan.output_fps {
        filters.push(format!("fps={}", fps));
    }

    if EncoderFamily::of(&plan.encoder).needs_hw_upload() {
        filters.push(VAAPI_UPLOAD_FILTER.to_string());
    }

    filters
}

/// Filter and mapping arguments. Segmented plans get a trim/concat
/// `-filter_complex`; otherwise a plain `-vf` when any filter applies.
fn filter_args(plan: &CompressionPlan, include_audio: bool) -> Vec<String> {
    let chain = video_filter_chain(plan);

    if plan.segments.is_empty() {
        let mut args = Vec::new();
        if !chain.is_empty() {
            args.push("-vf".to_string());
            args.push(chain.join(","));
        }
        args.push("-map".to_string());
        args.push("0:v:0".to_string());
        if include_audio {
            args.push("-map".to_string());
            args.push("0:a:0?".to_string());
        }
        return args;
    }

    let mut graph = Vec::new();
    let mut concat_inputs = String::new();
    for (i, segment) in plan.segments.iter().enumerate() {
        graph.push(format!(
            "[0:v]trim=start={:.3}:end={:.3},setpts=PTS-STARTPTS[v{}]",
            segment.start, segment.end, i
        ));
        concat_inputs.push_str(&format!("[v{}]", i));
        if include_audio {
            graph.push(format!(
                "[0:a]atrim=start={:.3}:end={:.3},asetpts=PTS-STARTPTS[a{}]",
                segment.start, segment.end, i
            ));
            concat_inputs.push_str(&format!("[a{}]", i));
        }
    }

    let count = plan.segments.len();
    let audio_outputs = if include_audio { 1 } else { 0 };
    let audio_label = if include_audio { "[acat]" } else { "" };
    if chain.is_empty() {
        graph.push(format!(
            "{}concat=n={}:v=1:a={}[vout]{}",
            concat_inputs, count, audio_outputs, audio_label
        ));
    } else {
        graph.push(format!(
            "{}concat=n={}:v=1:a={}[vcat]{}",
            concat_inputs, count, audio_outputs, audio_label
        ));
        graph.push(format!("[vcat]{}[vout]", chain.join(",")));
    }

    let mut args = vec![
        "-filter_complex".to_string(),
        graph.join(";"),
        "-map".to_string(),
        "[vout]".to_string(),
    ];
    if include_audio {
        args.push("-map".to_string());
        args.push("[acat]".to_string());
    }
    args
}

/// Full argument list (excluding the program) for `pass` of `plan`.
pub fn build_pass_args(
    plan: &CompressionPlan,
    target: &PassTarget<'_>,
    pass: PassKind,
) -> Vec<String> {
    let include_audio = plan.audio_kbps.is_some() && pass != PassKind::First;
    let mut args: Vec<String> = vec!["-hide_banner".into(), "-nostdin".into(), "-y".into()];

    if EncoderFamily::of(&plan.encoder).needs_hw_upload() {
        args.push("-vaapi_device".into());
        args.push(VAAPI_DEVICE.into());
    }

    args.push("-i".into());
    args.push(target.input.display().to_string());

    args.extend(filter_args(plan, include_audio));
    args.extend(build_video_args(&plan.encoder, plan.rate_control, plan.mode()));

    match pass {
        PassKind::Single => {}
        PassKind::First => args.extend(build_two_pass_args(&plan.encoder, 1, target.passlog)),
        PassKind::Second => args.extend(build_two_pass_args(&plan.encoder, 2, target.passlog)),
    }

    match plan.audio_kbps {
        Some(kbps) if include_audio => {
            args.push("-c:a".into());
            args.push(plan.codec.spec().audio_encoder.into());
            args.push("-b:a".into());
            args.push(format!("{}k", kbps));
        }
        _ => args.push("-an".into()),
    }

    args.push("-stats".into());

    if pass == PassKind::First {
        args.extend(["-f".to_string(), "null".to_string(), null_sink().to_string()]);
    } else {
        if plan.output_extension() == "mp4" {
            args.push("-movflags".into());
            args.push("+faststart".into());
        }
        args.push(target.output.display().to_string());
    }

    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoders::{Codec, EncoderProbe, EncoderSelector, RateControl};
    use crate::media_probe::SourceMetadata;
    use crate::planner::{BitrateBudget, CompressionPlanner};
    use crate::request::{CompressionRequest, CropRect, Segment};
    use std::path::PathBuf;
    use std::sync::Arc;

    fn create_test_plan(encoder: &str, codec: Codec) -> CompressionPlan {
        CompressionPlan {
            job_id: "job".to_string(),
            request: CompressionRequest::new(codec.key()),
            codec,
            encoder: encoder.to_string(),
            rate_control: RateControl::ConstantQuality { crf: 28 },
            budget: None,
            scale_percent: 100,
            two_pass: false,
            crop: None,
            segments: Vec::new(),
            output_fps: None,
            audio_kbps: Some(128),
            effective_duration_secs: Some(60.0),
            warnings: Vec::new(),
        }
    }

    fn two_pass_plan() -> CompressionPlan {
        CompressionPlan {
            rate_control: RateControl::TargetBitrate { video_kbps: 1228 },
            budget: Some(BitrateBudget {
                total_kbps: 1356,
                video_kbps: 1228,
                audio_kbps: 128,
            }),
            scale_percent: 45,
            two_pass: true,
            ..create_test_plan("libx264", Codec::H264)
        }
    }

    fn value_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .map(String::as_str)
    }

    fn target<'a>(input: &'a Path, output: &'a Path, passlog: &'a Path) -> PassTarget<'a> {
        PassTarget { input, output, passlog }
    }

    #[test]
    fn test_single_pass_args() {
        let plan = create_test_plan("libx264", Codec::H264);
        let (input, output, log) = (
            PathBuf::from("/in/source.mov"),
            PathBuf::from("/out/job.mp4"),
            PathBuf::from("/out/job/passlog"),
        );
        let args = build_pass_args(&plan, &target(&input, &output, &log), PassKind::Single);

        assert_eq!(value_after(&args, "-i"), Some("/in/source.mov"));
        assert_eq!(value_after(&args, "-c:v"), Some("libx264"));
        assert_eq!(value_after(&args, "-crf"), Some("28"));
        assert_eq!(value_after(&args, "-c:a"), Some("aac"));
        assert_eq!(value_after(&args, "-b:a"), Some("128k"));
        assert_eq!(value_after(&args, "-movflags"), Some("+faststart"));
        assert_eq!(args.last().map(String::as_str), Some("/out/job.mp4"));
        assert!(!args.iter().any(|a| a == "-vf"));
        assert!(!args.iter().any(|a| a == "-pass"));
    }

    #[test]
    fn test_first_pass_goes_to_null_without_audio() {
        let plan = two_pass_plan();
        let (input, output, log) = (
            PathBuf::from("/in/a.mp4"),
            PathBuf::from("/out/a.mp4"),
            PathBuf::from("/work/passlog"),
        );
        let args = build_pass_args(&plan, &target(&input, &output, &log), PassKind::First);

        assert_eq!(value_after(&args, "-pass"), Some("1"));
        assert_eq!(value_after(&args, "-passlogfile"), Some("/work/passlog"));
        assert!(args.iter().any(|a| a == "-an"));
        assert!(!args.iter().any(|a| a == "-c:a"));
        assert_eq!(value_after(&args, "-f"), Some("null"));
        assert_eq!(args.last().map(String::as_str), Some(null_sink()));
        assert!(!args.iter().any(|a| a == "/out/a.mp4"));
    }

    #[test]
    fn test_second_pass_writes_output() {
        let plan = two_pass_plan();
        let (input, output, log) = (
            PathBuf::from("/in/a.mp4"),
            PathBuf::from("/out/a.mp4"),
            PathBuf::from("/work/passlog"),
        );
        let args = build_pass_args(&plan, &target(&input, &output, &log), PassKind::Second);

        assert_eq!(value_after(&args, "-pass"), Some("2"));
        assert_eq!(value_after(&args, "-b:v"), Some("1228k"));
        assert_eq!(value_after(&args, "-c:a"), Some("aac"));
        assert_eq!(
            value_after(&args, "-vf"),
            Some("scale=trunc(iw*45/200)*2:trunc(ih*45/200)*2")
        );
        assert_eq!(args.last().map(String::as_str), Some("/out/a.mp4"));
    }

    #[test]
    fn test_crop_precedes_scale_and_fps() {
        let plan = CompressionPlan {
            crop: Some(CropRect { x: 10, y: 20, width: 640, height: 360 }),
            scale_percent: 50,
            output_fps: Some(24.0),
            ..create_test_plan("libx264", Codec::H264)
        };
        let chain = video_filter_chain(&plan);
        assert_eq!(
            chain,
            vec![
                "crop=640:360:10:20".to_string(),
                "scale=trunc(iw*50/200)*2:trunc(ih*50/200)*2".to_string(),
                "fps=24".to_string(),
            ]
        );
    }

    #[test]
    fn test_segments_build_concat_graph() {
        let plan = CompressionPlan {
            segments: vec![Segment::new(0.0, 5.0), Segment::new(10.0, 12.5)],
            ..create_test_plan("libx264", Codec::H264)
        };
        let args = filter_args(&plan, true);

        let graph = value_after(&args, "-filter_complex").unwrap();
        assert!(graph.contains("[0:v]trim=start=0.000:end=5.000,setpts=PTS-STARTPTS[v0]"));
        assert!(graph.contains("[0:a]atrim=start=10.000:end=12.500,asetpts=PTS-STARTPTS[a1]"));
        assert!(graph.contains("[v0][a0][v1][a1]concat=n=2:v=1:a=1[vout][acat]"));
        assert_eq!(
            args.iter().filter(|a| *a == "-map").count(),
            2,
            "video and audio outputs are both mapped"
        );
    }

    #[test]
    fn test_segments_without_audio_and_with_filters() {
        let plan = CompressionPlan {
            segments: vec![Segment::new(1.0, 2.0)],
            scale_percent: 50,
            ..create_test_plan("libx264", Codec::H264)
        };
        let args = filter_args(&plan, false);
        let graph = value_after(&args, "-filter_complex").unwrap();
        assert!(graph.contains("[v0]concat=n=1:v=1:a=0[vcat]"));
        assert!(graph.ends_with("[vcat]scale=trunc(iw*50/200)*2:trunc(ih*50/200)*2[vout]"));
        assert!(!graph.contains("atrim"));
        assert!(!args.iter().any(|a| a == "[acat]"));
    }

    #[test]
    fn test_segmented_plan_from_unknown_metadata_has_no_audio_labels() {
        let probe = EncoderProbe::with_advertised(["libx264"]);
        let planner = CompressionPlanner::new(EncoderSelector::new(Arc::new(probe)));
        let request = CompressionRequest {
            segments: vec![Segment::new(0.0, 4.0), Segment::new(8.0, 9.5)],
            ..CompressionRequest::new("h264")
        };
        let plan = planner
            .build_plan("job", &request, &SourceMetadata::unknown())
            .unwrap();

        let (input, output, log) = (
            PathBuf::from("in.mov"),
            PathBuf::from("out.mp4"),
            PathBuf::from("log"),
        );
        let args = build_pass_args(&plan, &target(&input, &output, &log), PassKind::Single);
        let graph = value_after(&args, "-filter_complex").unwrap();
        assert!(!graph.contains("[0:a]"), "{}", graph);
        assert!(graph.contains("concat=n=2:v=1:a=0[vout]"));
        assert!(!args.iter().any(|a| a == "[acat]"));
        assert!(args.iter().any(|a| a == "-an"));
    }

    #[test]
    fn test_muted_plan_drops_audio() {
        let plan = CompressionPlan {
            audio_kbps: None,
            ..create_test_plan("libvpx-vp9", Codec::Vp9)
        };
        let (input, output, log) = (
            PathBuf::from("in.mkv"),
            PathBuf::from("out.webm"),
            PathBuf::from("log"),
        );
        let args = build_pass_args(&plan, &target(&input, &output, &log), PassKind::Single);
        assert!(args.iter().any(|a| a == "-an"));
        assert!(!args.iter().any(|a| a == "0:a:0?"));
        assert!(!args.iter().any(|a| a == "-movflags"));
    }

    #[test]
    fn test_vp9_uses_opus() {
        let plan = create_test_plan("libvpx-vp9", Codec::Vp9);
        let (input, output, log) = (
            PathBuf::from("in.mkv"),
            PathBuf::from("out.webm"),
            PathBuf::from("log"),
        );
        let args = build_pass_args(&plan, &target(&input, &output, &log), PassKind::Single);
        assert_eq!(value_after(&args, "-c:a"), Some("libopus"));
    }

    #[test]
    fn test_vaapi_uploads_frames() {
        let plan = create_test_plan("h264_vaapi", Codec::H264);
        let (input, output, log) = (
            PathBuf::from("in.mp4"),
            PathBuf::from("out.mp4"),
            PathBuf::from("log"),
        );
        let args = build_pass_args(&plan, &target(&input, &output, &log), PassKind::Single);
        assert_eq!(value_after(&args, "-vaapi_device"), Some(VAAPI_DEVICE));
        assert_eq!(value_after(&args, "-vf"), Some(VAAPI_UPLOAD_FILTER));
    }

    #[test]
    fn test_pass_sequence() {
        assert_eq!(PassKind::sequence(&two_pass_plan()), &[PassKind::First, PassKind::Second]);
        assert_eq!(
            PassKind::sequence(&create_test_plan("libx264", Codec::H264)),
            &[PassKind::Single]
        );
        assert_eq!(PassKind::Second.band(), PassBand::for_pass(2, 2));
    }
}
