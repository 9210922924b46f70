//! Smart Compressor
//!
//! Video compression orchestration: plans a compression from a client
//! request, picks the best ffmpeg encoder on the host, queues the job and
//! supervises the ffmpeg passes that produce the output.

pub mod daemon;
pub mod encode;
pub mod encoders;
pub mod jobs;
pub mod media_probe;
pub mod orchestrator;
pub mod planner;
pub mod progress;
pub mod request;
pub mod startup;
pub mod status_server;

pub use daemon::{load_config, Daemon, DaemonError};
pub use encode::{build_pass_args, EncoderRunner, PassKind, PassOutcome, PassTarget, RunnerError};
pub use encoders::{
    Codec, CodecSpec, EncoderCapability, EncoderListing, EncoderProbe, EncoderSelector, ProbeMode,
    RateControl,
};
pub use jobs::{CompressionJob, JobStatus, JobStore, JobStoreError, NewJob, QueueStats};
pub use media_probe::{probe_source, MediaProbeError, SourceMetadata};
pub use orchestrator::{
    CancelOutcome, CompressionOrchestrator, DownloadError, OutputFile, SourceFile, SubmitError,
};
pub use planner::{CompressionPlan, CompressionPlanner, PlanWarning};
pub use progress::{ProgressParser, ProgressSnapshot};
pub use request::{CompressionRequest, CropRect, EncodingMode, Segment, ValidationError};
pub use smart_compressor_config as config;
pub use smart_compressor_config::Config;
pub use startup::{
    check_ffmpeg, check_ffprobe, parse_ffmpeg_version, run_startup_checks, StartupError,
};
pub use status_server::{create_router, run_status_server, AppState, ServerError};
