//! Job store module holding every compression job and the FIFO queue.
//!
//! All job state lives behind one mutex so a reader never observes a job
//! half-updated or a queue position that disagrees with the queue. Mutation
//! goes through [`JobStore::update`], which enforces the status state machine:
//!
//! ```text
//! Queued -> Processing -> Completed | Failed | Cancelled
//! Queued -> Cancelled
//! ```

use crate::planner::CompressionPlan;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::Notify;
use uuid::Uuid;

/// Status of a compression job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for a worker.
    Queued,
    /// An encoder pass is running.
    Processing,
    /// Output written and verified.
    Completed,
    /// Encoding or verification failed.
    Failed,
    /// Cancelled by the client.
    Cancelled,
}

impl Default for JobStatus {
    fn default() -> Self {
        Self::Queued
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Processing => write!(f, "processing"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match (self, next) {
            (a, b) if *a == b => true,
            (JobStatus::Queued, JobStatus::Processing | JobStatus::Cancelled) => true,
            (
                JobStatus::Processing,
                JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled,
            ) => true,
            _ => false,
        }
    }
}

/// A compression job as reported to clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompressionJob {
    /// Unique job identifier (UUID).
    pub id: String,
    pub original_filename: String,
    pub codec: String,
    pub encoder: String,
    pub scale_percent: u32,
    pub target_size_mb: Option<f64>,
    pub total_bitrate_kbps: Option<u32>,
    pub video_bitrate_kbps: Option<u32>,
    pub two_pass: bool,
    pub source_duration_secs: Option<f64>,
    pub status: JobStatus,
    /// 0-100, never decreasing while Processing.
    pub progress: f64,
    pub eta_secs: Option<f64>,
    /// 1-based position, set only while Queued.
    pub queue_position: Option<usize>,
    /// Set only when Failed.
    pub error_message: Option<String>,
    pub output_path: Option<PathBuf>,
    pub output_filename: Option<String>,
    pub output_mime_type: Option<String>,
    pub output_size_bytes: Option<u64>,
    /// Unix timestamp (milliseconds) when job was created.
    pub created_at: i64,
    /// Unix timestamp (milliseconds) when job was last updated.
    pub updated_at: i64,
    /// Unix timestamp (milliseconds) when the job reached a terminal state.
    pub finished_at: Option<i64>,
}

impl CompressionJob {
    /// Update the job's updated_at timestamp to now.
    pub fn touch(&mut self) {
        self.updated_at = current_timestamp_ms();
    }

    /// Mark the job as failed with a reason.
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.status = JobStatus::Failed;
        self.error_message = Some(reason.into());
        self.eta_secs = None;
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Check if the job is active (queued or processing).
    pub fn is_active(&self) -> bool {
        matches!(self.status, JobStatus::Queued | JobStatus::Processing)
    }
}

/// Fields needed to create a job.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub id: String,
    pub original_filename: String,
    pub codec: String,
    pub encoder: String,
    pub scale_percent: u32,
    pub target_size_mb: Option<f64>,
    pub total_bitrate_kbps: Option<u32>,
    pub video_bitrate_kbps: Option<u32>,
    pub two_pass: bool,
    pub source_duration_secs: Option<f64>,
}

impl NewJob {
    /// Mirror the plan's parameters into a new job record.
    pub fn from_plan(plan: &CompressionPlan, original_filename: &str) -> Self {
        Self {
            id: plan.job_id.clone(),
            original_filename: original_filename.to_string(),
            codec: plan.codec.key().to_string(),
            encoder: plan.encoder.clone(),
            scale_percent: plan.scale_percent,
            target_size_mb: plan.request.target_size_mb,
            total_bitrate_kbps: plan.total_bitrate_kbps(),
            video_bitrate_kbps: plan.video_bitrate_kbps(),
            two_pass: plan.two_pass,
            source_duration_secs: plan.effective_duration_secs,
        }
    }
}

/// Generate a fresh job identifier.
pub fn new_job_id() -> String {
    Uuid::new_v4().to_string()
}

/// Get current timestamp in milliseconds since Unix epoch.
pub fn current_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Error type for job store operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobStoreError {
    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Job {0} already exists")]
    Duplicate(String),

    #[error("Job {id} is {status} and can no longer change")]
    Terminal { id: String, status: JobStatus },

    #[error("Job {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: JobStatus,
        to: JobStatus,
    },
}

/// Job counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queued: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub total: usize,
}

#[derive(Debug, Default)]
struct StoreInner {
    jobs: HashMap<String, CompressionJob>,
    queue: VecDeque<String>,
}

impl StoreInner {
    fn renumber(&mut self) {
        let StoreInner { jobs, queue } = self;
        for (index, id) in queue.iter().enumerate() {
            if let Some(job) = jobs.get_mut(id) {
                job.queue_position = Some(index + 1);
            }
        }
    }

    fn drop_from_queue(&mut self, id: &str) {
        let before = self.queue.len();
        self.queue.retain(|queued| queued != id);
        if self.queue.len() != before {
            self.renumber();
        }
    }
}

/// In-memory store of all jobs plus the pending queue.
#[derive(Debug, Default)]
pub struct JobStore {
    inner: Mutex<StoreInner>,
    notify: Notify,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a new job in state Queued. It is not runnable until enqueued.
    pub fn create(&self, new_job: NewJob) -> Result<CompressionJob, JobStoreError> {
        let mut inner = self.lock();
        if inner.jobs.contains_key(&new_job.id) {
            return Err(JobStoreError::Duplicate(new_job.id));
        }

        let now = current_timestamp_ms();
        let job = CompressionJob {
            id: new_job.id,
            original_filename: new_job.original_filename,
            codec: new_job.codec,
            encoder: new_job.encoder,
            scale_percent: new_job.scale_percent,
            target_size_mb: new_job.target_size_mb,
            total_bitrate_kbps: new_job.total_bitrate_kbps,
            video_bitrate_kbps: new_job.video_bitrate_kbps,
            two_pass: new_job.two_pass,
            source_duration_secs: new_job.source_duration_secs,
            status: JobStatus::Queued,
            progress: 0.0,
            eta_secs: None,
            queue_position: Some(inner.queue.len() + 1),
            error_message: None,
            output_path: None,
            output_filename: None,
            output_mime_type: None,
            output_size_bytes: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        };
        inner.jobs.insert(job.id.clone(), job.clone());
        Ok(job)
    }

    /// Append a Queued job to the tail of the queue and wake one worker.
    pub fn enqueue(&self, id: &str) -> Result<(), JobStoreError> {
        {
            let mut inner = self.lock();
            let job = inner
                .jobs
                .get(id)
                .ok_or_else(|| JobStoreError::NotFound(id.to_string()))?;
            if job.status != JobStatus::Queued {
                return Err(JobStoreError::InvalidTransition {
                    id: id.to_string(),
                    from: job.status,
                    to: JobStatus::Queued,
                });
            }
            if !inner.queue.iter().any(|queued| queued == id) {
                inner.queue.push_back(id.to_string());
            }
            inner.renumber();
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Pop the queue head and move it to Processing with progress 0.
    ///
    /// Entries whose job is gone or no longer Queued are discarded.
    pub fn dequeue(&self) -> Option<String> {
        let mut inner = self.lock();
        while let Some(id) = inner.queue.pop_front() {
            let Some(job) = inner.jobs.get_mut(&id) else {
                continue;
            };
            if job.status != JobStatus::Queued {
                continue;
            }
            job.status = JobStatus::Processing;
            job.progress = 0.0;
            job.eta_secs = None;
            job.queue_position = None;
            job.touch();
            inner.renumber();
            return Some(id);
        }
        None
    }

    /// Wait until a job can be dequeued.
    pub async fn next_job(&self) -> String {
        loop {
            if let Some(id) = self.dequeue() {
                return id;
            }
            self.notify.notified().await;
        }
    }

    /// Apply `mutator` to a job under the store lock.
    ///
    /// Terminal jobs are refused. A mutation that makes an illegal status
    /// transition is rolled back. While Processing, progress never decreases.
    pub fn update<F, R>(&self, id: &str, mutator: F) -> Result<R, JobStoreError>
    where
        F: FnOnce(&mut CompressionJob) -> R,
    {
        let mut inner = self.lock();
        let (result, left_queue) = {
            let job = inner
                .jobs
                .get_mut(id)
                .ok_or_else(|| JobStoreError::NotFound(id.to_string()))?;
            if job.status.is_terminal() {
                return Err(JobStoreError::Terminal {
                    id: id.to_string(),
                    status: job.status,
                });
            }

            let before = job.clone();
            let result = mutator(job);
            // Identity and creation time are not the mutator's to change.
            job.id = before.id.clone();
            job.created_at = before.created_at;

            if !before.status.can_transition_to(job.status) {
                let attempted = job.status;
                *job = before;
                return Err(JobStoreError::InvalidTransition {
                    id: id.to_string(),
                    from: job.status,
                    to: attempted,
                });
            }

            if !job.progress.is_finite() {
                job.progress = before.progress;
            }
            job.progress = job.progress.clamp(0.0, 100.0);
            if before.status == JobStatus::Processing && job.status == JobStatus::Processing {
                job.progress = job.progress.max(before.progress);
            }

            if job.status != JobStatus::Queued {
                job.queue_position = None;
            }
            if job.status != JobStatus::Failed {
                job.error_message = None;
            }
            if job.status.is_terminal() {
                job.eta_secs = None;
                job.finished_at = Some(current_timestamp_ms());
            }
            job.touch();

            let left_queue = before.status == JobStatus::Queued && job.status != JobStatus::Queued;
            (result, left_queue)
        };

        if left_queue {
            inner.drop_from_queue(id);
        }
        Ok(result)
    }

    pub fn get(&self, id: &str) -> Option<CompressionJob> {
        self.lock().jobs.get(id).cloned()
    }

    /// All jobs, oldest first.
    pub fn get_all(&self) -> Vec<CompressionJob> {
        let mut jobs: Vec<CompressionJob> = self.lock().jobs.values().cloned().collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        jobs
    }

    /// Forget a job entirely, dropping it from the queue if present.
    pub fn remove(&self, id: &str) -> Option<CompressionJob> {
        let mut inner = self.lock();
        let job = inner.jobs.remove(id)?;
        inner.drop_from_queue(id);
        Some(job)
    }

    pub fn queue_len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn stats(&self) -> QueueStats {
        let inner = self.lock();
        let mut stats = QueueStats {
            total: inner.jobs.len(),
            ..QueueStats::default()
        };
        for job in inner.jobs.values() {
            match job.status {
                JobStatus::Queued => stats.queued += 1,
                JobStatus::Processing => stats.processing += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }

    /// Terminal jobs that finished more than `retention` before `now_ms`.
    pub fn expired(&self, retention: Duration, now_ms: i64) -> Vec<CompressionJob> {
        let retention_ms = i64::try_from(retention.as_millis()).unwrap_or(i64::MAX);
        self.lock()
            .jobs
            .values()
            .filter(|job| {
                job.finished_at
                    .is_some_and(|finished| now_ms.saturating_sub(finished) > retention_ms)
            })
            .cloned()
            .collect()
    }
}
