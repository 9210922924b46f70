//! CLI entry point for Smart Compressor
//!
//! Parses command line arguments and starts the daemon, or prints the
//! encoder listing and exits.

use clap::Parser;
use log::{error, info, warn};
use smart_compressor::{load_config, Daemon, DaemonError};
use std::path::PathBuf;
use std::process::ExitCode;

/// Smart Compressor - video compression service backed by ffmpeg
#[derive(Parser, Debug)]
#[command(name = "smart-compressor")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file; defaults and environment apply when missing
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Skip startup checks (ffmpeg, ffprobe). For testing only.
    #[arg(long, default_value = "false")]
    skip_checks: bool,

    /// Print the encoder chosen for every codec as JSON and exit
    #[arg(long, default_value = "false")]
    list_encoders: bool,

    /// With --list-encoders, confirm each encoder with a short trial encode
    #[arg(long, default_value = "false", requires = "list_encoders")]
    verify: bool,
}

fn init_daemon(args: &Args) -> Result<Daemon, DaemonError> {
    if args.skip_checks {
        warn!("Skipping startup checks (--skip-checks enabled)");
        let config = load_config(&args.config)?;
        Ok(Daemon::new_without_checks(config))
    } else {
        Daemon::new(&args.config)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let args = Args::parse();
    info!("Config file: {}", args.config.display());

    let daemon = match init_daemon(&args) {
        Ok(daemon) => daemon,
        Err(e) => {
            error!("Failed to initialize daemon: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if args.list_encoders {
        let listing = daemon.orchestrator.list_encoders(args.verify).await;
        return match serde_json::to_string_pretty(&listing) {
            Ok(json) => {
                println!("{}", json);
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!("Failed to render encoder listing: {}", e);
                ExitCode::FAILURE
            }
        };
    }

    info!(
        "Daemon initialized with {} max concurrent jobs; serving on http://{}",
        daemon.config.effective_concurrency(),
        daemon.config.server.bind_addr
    );

    if let Err(e) = daemon.run_with_server().await {
        error!("Daemon error: {}", e);
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
