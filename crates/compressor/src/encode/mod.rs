//! Encoding modules for Smart Compressor

pub mod args;
pub mod runner;

pub use args::{build_pass_args, null_sink, PassKind, PassTarget};
pub use runner::{EncoderRunner, PassOutcome, RunnerError};
