//! The storage interface for job records.
//!
//! The scheduler and its workers only ever talk to storage through [`Backend`], so the file per
//! job store shipped in `cmdq-fs` can be swapped for any other durable store.
//!
//! Implementations may assume a single writer per job: only the one scheduler process admits and
//! mutates jobs.
use async_trait::async_trait;
use thiserror::Error;

use crate::job::{Job, JobId, JobStatus};

pub mod memory;
#[doc(hidden)]
pub mod testing;

#[async_trait]
pub trait Backend: Clone + Send + Sync {
    /// All readable jobs ordered by `created_at`, oldest first.
    ///
    /// Ties keep the order in which the backend discovered the records. Records that cannot be
    /// decoded, or that lack an id or a command, are skipped rather than reported as errors.
    async fn list_jobs(&self) -> Result<Vec<Job>, BackendError>;

    async fn load(&self, id: &JobId) -> Result<Option<Job>, BackendError>;

    /// Refreshes `updated_at` and fully rewrites the record.
    async fn save(&self, job: &mut Job) -> Result<(), BackendError>;

    /// Persists a new queued job.
    async fn enqueue(&self, job: Job) -> Result<JobId, BackendError>;

    /// Queued jobs ordered oldest first.
    async fn list_pending(&self) -> Result<Vec<Job>, BackendError> {
        Ok(self
            .list_jobs()
            .await?
            .into_iter()
            .filter(|job| job.status == JobStatus::Queued)
            .collect())
    }
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Error encoding or decoding job record")]
    EncodeDecode(#[from] serde_json::Error),
    #[error("I/O error accessing the job store")]
    Io(#[from] std::io::Error),
    #[error("Job {0} not found")]
    JobNotFound(JobId),
    #[error("Job {0} already exists")]
    DuplicateJob(JobId),
    #[error("Job id {0:?} cannot be stored")]
    InvalidJobId(JobId),
    #[error("Job {0} must be queued and well formed to be enqueued")]
    NotQueued(JobId),
    #[error("System in bad state")]
    BadState,
}

/// Rejects what an enqueue call must never accept, shared by all backends.
pub fn validate_enqueue(job: &Job) -> Result<(), BackendError> {
    if !job.id.is_path_safe() {
        return Err(BackendError::InvalidJobId(job.id.clone()));
    }
    if job.status != JobStatus::Queued || !job.is_well_formed() {
        return Err(BackendError::NotQueued(job.id.clone()));
    }
    Ok(())
}
