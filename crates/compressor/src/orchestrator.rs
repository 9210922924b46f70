//! Compression orchestrator
//!
//! Owns the lifecycle of every job: validation and planning on submit,
//! queueing, running the encoder passes on a worker, progress reporting,
//! cancellation, output verification and retention cleanup.
//!
//! Each job gets a directory `<work_dir>/<job id>/` holding its output and a
//! `passes/` scratch directory for two-pass stats files.

use crate::config::Config;
use crate::encode::{build_pass_args, EncoderRunner, PassKind, PassTarget, RunnerError};
use crate::encoders::{EncoderListing, EncoderSelector};
use crate::jobs::{
    current_timestamp_ms, new_job_id, CompressionJob, JobStatus, JobStore, JobStoreError, NewJob,
};
use crate::media_probe::SourceMetadata;
use crate::planner::{CompressionPlan, CompressionPlanner};
use crate::progress::ProgressParser;
use crate::request::{CompressionRequest, ValidationError};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

const PASS_DIR: &str = "passes";

/// Error type for job submission
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("Invalid request: {0}")]
    Validation(#[from] ValidationError),

    #[error("Job store rejected the job: {0}")]
    Store(#[from] JobStoreError),

    #[error("Planning task failed: {0}")]
    Planning(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Error type for output downloads
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DownloadError {
    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Job {id} is {status}; output is not available")]
    NotReady { id: String, status: JobStatus },

    #[error("Output file missing: {0}")]
    Missing(PathBuf),
}

/// What a cancel request did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CancelOutcome {
    Cancelled,
    /// The job had already finished; nothing changed.
    AlreadyTerminal { status: JobStatus },
}

/// A source file handed to [`CompressionOrchestrator::submit`].
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub path: PathBuf,
    pub original_filename: String,
    pub metadata: SourceMetadata,
}

/// Reference to a completed job's output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputFile {
    pub path: PathBuf,
    pub filename: String,
    pub mime_type: String,
    pub size_bytes: u64,
}

struct WorkItem {
    plan: CompressionPlan,
    source_path: PathBuf,
    original_filename: String,
}

enum JobFailure {
    Cancelled,
    Failed(String),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// `clip.mov` + `mp4` -> `clip_compressed.mp4`.
pub fn output_filename(original_filename: &str, extension: &str) -> String {
    let stem = Path::new(original_filename)
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .unwrap_or("video");
    format!("{}_compressed.{}", stem, extension)
}

fn describe_pass_failure(pass: PassKind, err: &RunnerError) -> String {
    match pass {
        PassKind::Single => format!("Encoding failed: {}", err),
        PassKind::First | PassKind::Second => {
            let (n, total) = pass.position();
            format!("Pass {} of {} failed: {}", n, total, err)
        }
    }
}

async fn verify_output(path: &Path) -> Result<u64, String> {
    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|e| format!("Output file not found: {}", e))?;
    if metadata.len() == 0 {
        return Err("Output file is empty".to_string());
    }
    Ok(metadata.len())
}

async fn remove_dir_quietly(dir: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(dir).await {
        if e.kind() != io::ErrorKind::NotFound {
            warn!("Failed to remove {}: {}", dir.display(), e);
        }
    }
}

/// Coordinates planning, queueing and encoding of compression jobs.
pub struct CompressionOrchestrator {
    store: Arc<JobStore>,
    planner: CompressionPlanner,
    runner: EncoderRunner,
    work_dir: PathBuf,
    max_source_bytes: Option<u64>,
    pending: Mutex<HashMap<String, WorkItem>>,
    cancellations: Mutex<HashMap<String, CancellationToken>>,
}

impl CompressionOrchestrator {
    pub fn new(
        store: Arc<JobStore>,
        selector: EncoderSelector,
        runner: EncoderRunner,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            planner: CompressionPlanner::new(selector),
            runner,
            work_dir: work_dir.into(),
            max_source_bytes: None,
            pending: Mutex::new(HashMap::new()),
            cancellations: Mutex::new(HashMap::new()),
        }
    }

    /// Orchestrator wired from configuration.
    pub fn from_config(cfg: &Config, store: Arc<JobStore>, selector: EncoderSelector) -> Self {
        Self::new(
            store,
            selector,
            EncoderRunner::from_config(&cfg.encoder),
            cfg.jobs.work_dir.clone(),
        )
        .with_max_source_bytes(cfg.max_upload_bytes())
    }

    /// Reject sources larger than `limit` bytes.
    pub fn with_max_source_bytes(mut self, limit: u64) -> Self {
        self.max_source_bytes = Some(limit);
        self
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    fn job_dir(&self, id: &str) -> PathBuf {
        self.work_dir.join(id)
    }

    fn forget(&self, id: &str) {
        lock(&self.pending).remove(id);
        lock(&self.cancellations).remove(id);
    }

    /// Validate and plan `request`, then queue it. Returns the new job id.
    ///
    /// Nothing is recorded when validation or planning fails.
    pub async fn submit(
        &self,
        request: CompressionRequest,
        source: SourceFile,
    ) -> Result<String, SubmitError> {
        let stat = tokio::fs::metadata(&source.path).await;
        let metadata = match stat {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ValidationError::SourceMissing(source.path).into());
            }
            Err(e) => return Err(e.into()),
        };
        if let Some(limit) = self.max_source_bytes {
            if metadata.len() > limit {
                return Err(ValidationError::SourceTooLarge {
                    size: metadata.len(),
                    limit,
                }
                .into());
            }
        }

        // Selection may probe ffmpeg on first use.
        let planner = self.planner.clone();
        let job_id = new_job_id();
        let plan = {
            let job_id = job_id.clone();
            let source_metadata = source.metadata.clone();
            tokio::task::spawn_blocking(move || {
                planner.build_plan(&job_id, &request, &source_metadata)
            })
            .await
            .map_err(|e| SubmitError::Planning(e.to_string()))??
        };

        for warning in &plan.warnings {
            warn!("Job {}: planned with warning {:?}", job_id, warning);
        }

        info!(
            "Job {} planned: {} -> {} via {} (scale {}%, two-pass {})",
            job_id,
            source.original_filename,
            plan.codec,
            plan.encoder,
            plan.scale_percent,
            plan.two_pass
        );

        // Tracked before the job becomes visible so an early cancel finds its token.
        let new_job = NewJob::from_plan(&plan, &source.original_filename);
        self.track(plan, source.path, source.original_filename);
        if let Err(e) = self.store.create(new_job) {
            self.forget(&job_id);
            return Err(e.into());
        }
        self.enqueue_tracked(&job_id)?;
        Ok(job_id)
    }

    fn track(&self, plan: CompressionPlan, source_path: PathBuf, original_filename: String) {
        let id = plan.job_id.clone();
        lock(&self.cancellations).insert(id.clone(), CancellationToken::new());
        lock(&self.pending).insert(
            id,
            WorkItem {
                plan,
                source_path,
                original_filename,
            },
        );
    }

    /// Queue a created job. A job cancelled before it reached the queue stays
    /// Cancelled and counts as submitted.
    fn enqueue_tracked(&self, id: &str) -> Result<(), JobStoreError> {
        match self.store.enqueue(id) {
            Ok(()) => Ok(()),
            Err(JobStoreError::InvalidTransition {
                from: JobStatus::Cancelled,
                ..
            }) => {
                info!("Job {} was cancelled before it was queued", id);
                Ok(())
            }
            Err(e) => {
                self.forget(id);
                self.store.remove(id);
                Err(e)
            }
        }
    }

    pub fn status(&self, id: &str) -> Option<CompressionJob> {
        self.store.get(id)
    }

    pub fn list_jobs(&self) -> Vec<CompressionJob> {
        self.store.get_all()
    }

    /// Cancel a queued or running job. Cancelling a finished job is a no-op.
    pub fn cancel(&self, id: &str) -> Result<CancelOutcome, JobStoreError> {
        let previous = self.store.update(id, |job| {
            let previous = job.status;
            job.status = JobStatus::Cancelled;
            previous
        });

        match previous {
            Ok(previous) => {
                if let Some(token) = lock(&self.cancellations).get(id) {
                    token.cancel();
                }
                if previous == JobStatus::Queued {
                    self.forget(id);
                }
                info!("Job {} cancelled while {}", id, previous);
                Ok(CancelOutcome::Cancelled)
            }
            Err(JobStoreError::Terminal { status, .. }) => {
                debug!("Cancel of job {} ignored; already {}", id, status);
                Ok(CancelOutcome::AlreadyTerminal { status })
            }
            Err(e) => Err(e),
        }
    }

    /// Output of a Completed job.
    pub fn download(&self, id: &str) -> Result<OutputFile, DownloadError> {
        let job = self
            .store
            .get(id)
            .ok_or_else(|| DownloadError::NotFound(id.to_string()))?;
        if job.status != JobStatus::Completed {
            return Err(DownloadError::NotReady {
                id: id.to_string(),
                status: job.status,
            });
        }

        let (Some(path), Some(filename)) = (job.output_path, job.output_filename) else {
            return Err(DownloadError::Missing(self.job_dir(id)));
        };
        if !path.is_file() {
            return Err(DownloadError::Missing(path));
        }

        Ok(OutputFile {
            path,
            filename,
            mime_type: job.output_mime_type.unwrap_or_default(),
            size_bytes: job.output_size_bytes.unwrap_or(0),
        })
    }

    /// Encoder selection for every codec; `verify` runs trial encodes.
    pub async fn list_encoders(&self, verify: bool) -> Vec<EncoderListing> {
        let selector = self.planner.selector().clone();
        match tokio::task::spawn_blocking(move || selector.list_encoders(verify)).await {
            Ok(listing) => listing,
            Err(e) => {
                error!("Encoder listing task failed: {}", e);
                Vec::new()
            }
        }
    }

    /// Worker loop: take jobs off the queue forever, one at a time.
    ///
    /// Each job runs in its own task so a panic fails that job only.
    pub async fn run_worker(self: Arc<Self>, worker_id: usize) {
        info!("Worker {} started", worker_id);
        loop {
            let id = self.store.next_job().await;
            debug!("Worker {} picked up job {}", worker_id, id);

            let this = Arc::clone(&self);
            let job_id = id.clone();
            let handle = tokio::spawn(async move { this.process_job(&job_id).await });

            if let Err(join_err) = handle.await {
                error!("Job {} task panicked: {}", id, join_err);
                let message = format!("Encoding task panicked: {}", join_err);
                let _ = self.store.update(&id, |job| job.fail(message));
                remove_dir_quietly(&self.job_dir(&id)).await;
                self.forget(&id);
            }
        }
    }

    /// Run every pass of a job that has already been dequeued and record the result.
    pub async fn process_job(&self, id: &str) {
        let item = lock(&self.pending).remove(id);
        let token = lock(&self.cancellations)
            .get(id)
            .cloned()
            .unwrap_or_default();

        let Some(item) = item else {
            error!("Job {} has no compression plan", id);
            let _ = self
                .store
                .update(id, |job| job.fail("No compression plan recorded for job"));
            self.forget(id);
            return;
        };

        let job_dir = self.job_dir(id);
        match self.encode(id, &item, &job_dir, &token).await {
            Ok(output) => {
                let size_bytes = output.size_bytes;
                let completed = self.store.update(id, |job| {
                    job.status = JobStatus::Completed;
                    job.progress = 100.0;
                    job.output_path = Some(output.path);
                    job.output_filename = Some(output.filename);
                    job.output_mime_type = Some(output.mime_type);
                    job.output_size_bytes = Some(output.size_bytes);
                });
                match completed {
                    Ok(()) => info!("Job {} completed ({} bytes)", id, size_bytes),
                    Err(e) => {
                        warn!("Job {} finished encoding but was not completed: {}", id, e);
                        remove_dir_quietly(&job_dir).await;
                    }
                }
            }
            Err(JobFailure::Cancelled) => {
                info!("Job {} stopped after cancellation", id);
                remove_dir_quietly(&job_dir).await;
            }
            Err(JobFailure::Failed(message)) => {
                warn!("Job {} failed: {}", id, message);
                if let Err(e) = self.store.update(id, |job| job.fail(message)) {
                    debug!("Job {} failure not recorded: {}", id, e);
                }
                remove_dir_quietly(&job_dir).await;
            }
        }

        remove_dir_quietly(&job_dir.join(PASS_DIR)).await;
        self.forget(id);
    }

    async fn encode(
        &self,
        id: &str,
        item: &WorkItem,
        job_dir: &Path,
        token: &CancellationToken,
    ) -> Result<OutputFile, JobFailure> {
        let plan = &item.plan;
        let scratch = job_dir.join(PASS_DIR);
        tokio::fs::create_dir_all(&scratch).await.map_err(|e| {
            JobFailure::Failed(format!(
                "Failed to create work directory {}: {}",
                scratch.display(),
                e
            ))
        })?;

        let filename = output_filename(&item.original_filename, plan.output_extension());
        let output_path = job_dir.join(&filename);
        let passlog = scratch.join("passlog");
        let target = PassTarget {
            input: &item.source_path,
            output: &output_path,
            passlog: &passlog,
        };
        let total_secs = plan.effective_duration_secs.unwrap_or(0.0);

        for &pass in PassKind::sequence(plan) {
            let (n, total) = pass.position();
            info!("Job {}: pass {} of {} with {}", id, n, total, plan.encoder);

            let args = build_pass_args(plan, &target, pass);
            let mut parser = ProgressParser::new(pass.band());
            let store = &self.store;
            let result = self
                .runner
                .run_pass(
                    &args,
                    |line| {
                        if parser.feed(line) {
                            let snapshot = parser.snapshot(total_secs);
                            let _ = store.update(id, |job| {
                                job.progress = snapshot.percent;
                                job.eta_secs = snapshot.eta_secs;
                            });
                        }
                    },
                    token,
                )
                .await;

            match result {
                Ok(outcome) => debug!(
                    "Job {}: pass {} of {} finished ({} diagnostic lines)",
                    id, n, total, outcome.lines
                ),
                Err(RunnerError::Cancelled) => return Err(JobFailure::Cancelled),
                Err(e) => return Err(JobFailure::Failed(describe_pass_failure(pass, &e))),
            }
        }

        let size_bytes = verify_output(&output_path)
            .await
            .map_err(JobFailure::Failed)?;

        Ok(OutputFile {
            path: output_path,
            filename,
            mime_type: plan.mime_type().to_string(),
            size_bytes,
        })
    }

    /// Mode of a job's plan while it waits for a worker.
    #[cfg(test)]
    pub(crate) fn pending_mode(&self, id: &str) -> Option<crate::request::EncodingMode> {
        lock(&self.pending).get(id).map(|item| item.plan.mode())
    }

    /// Drop finished jobs older than `retention` along with their files.
    pub async fn sweep_expired(&self, retention: Duration) -> usize {
        let expired = self.store.expired(retention, current_timestamp_ms());
        for job in &expired {
            self.store.remove(&job.id);
            remove_dir_quietly(&self.job_dir(&job.id)).await;
        }
        if !expired.is_empty() {
            info!("Removed {} expired jobs", expired.len());
        }
        expired.len()
    }
}
