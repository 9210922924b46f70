//! Daemon startup and main loop for Smart Compressor
//!
//! Wires configuration, the encoder probe, the job store and the
//! orchestrator together, then runs the worker pool, the retention sweeper
//! and the status server.

use crate::config::{Config, ConfigError};
use crate::encoders::{EncoderProbe, EncoderSelector, ProbeMode};
use crate::jobs::JobStore;
use crate::orchestrator::CompressionOrchestrator;
use crate::startup::{run_startup_checks, StartupError};
use crate::status_server::{run_status_server, AppState, ServerError};
use log::{debug, info};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

/// How often finished jobs are checked against the retention window.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Error type for daemon operations
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Startup check failed
    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    /// Server error
    #[error("Server error: {0}")]
    Server(#[from] ServerError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Load `path` if it exists, otherwise fall back to defaults plus environment.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    if path.exists() {
        Config::load(path)
    } else {
        info!(
            "Config file {} not found; using defaults and environment",
            path.display()
        );
        Ok(Config::from_env())
    }
}

/// Daemon state containing all runtime components
pub struct Daemon {
    /// Configuration loaded from file and environment
    pub config: Config,
    pub store: Arc<JobStore>,
    pub orchestrator: Arc<CompressionOrchestrator>,
}

impl Daemon {
    /// Load configuration, run startup checks and build the components.
    pub fn new(config_path: &Path) -> Result<Self, DaemonError> {
        let config = load_config(config_path)?;
        Self::with_config(config)
    }

    /// Run startup checks against an already loaded configuration.
    pub fn with_config(config: Config) -> Result<Self, DaemonError> {
        run_startup_checks(&config)?;
        Ok(Self::new_without_checks(config))
    }

    /// Build the components without touching ffmpeg.
    pub fn new_without_checks(config: Config) -> Self {
        let mode = if config.encoder.verify_encoders {
            ProbeMode::Verify
        } else {
            ProbeMode::Advertised
        };
        let probe = Arc::new(EncoderProbe::new(config.encoder.ffmpeg_bin.clone(), mode));
        let store = Arc::new(JobStore::new());
        let orchestrator = Arc::new(CompressionOrchestrator::from_config(
            &config,
            store.clone(),
            EncoderSelector::new(probe),
        ));

        Self {
            config,
            store,
            orchestrator,
        }
    }

    /// Handler state for the status server.
    pub fn app_state(&self) -> AppState {
        AppState {
            orchestrator: self.orchestrator.clone(),
            ffprobe_bin: self.config.encoder.ffprobe_bin.clone(),
        }
    }

    /// Spawn `max_concurrent_jobs` workers (at least one).
    pub fn start_workers(&self) -> Vec<JoinHandle<()>> {
        (0..self.config.effective_concurrency())
            .map(|worker_id| tokio::spawn(self.orchestrator.clone().run_worker(worker_id)))
            .collect()
    }

    /// Periodically drop finished jobs older than the retention window.
    pub fn start_retention_sweeper(&self) -> JoinHandle<()> {
        let orchestrator = self.orchestrator.clone();
        let retention = Duration::from_secs(self.config.jobs.retention_minutes.saturating_mul(60));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                let removed = orchestrator.sweep_expired(retention).await;
                debug!("Retention sweep removed {} jobs", removed);
            }
        })
    }

    /// Run the daemon with all background tasks
    ///
    /// Returns only when the status server stops.
    pub async fn run_with_server(&self) -> Result<(), DaemonError> {
        tokio::fs::create_dir_all(&self.config.jobs.work_dir).await?;

        let workers = self.start_workers();
        info!(
            "Started {} workers; outputs under {}",
            workers.len(),
            self.config.jobs.work_dir.display()
        );
        let _sweeper = self.start_retention_sweeper();

        run_status_server(self.app_state(), &self.config.server.bind_addr).await?;
        Ok(())
    }
}
