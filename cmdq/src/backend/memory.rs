//! Provides an in memory implementation of [`Backend`].
//!
//! Currently this is provided for testing purposes and not designed for use in a production system.
//! Nothing survives a restart, which defeats the recovery pass.
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::Utc;

use crate::job::{Job, JobId};

use super::{validate_enqueue, Backend, BackendError};

/// An in memory implementation of [`Backend`].
///
/// It is provided as a correct (but not optimized) implementation primarily for use in testing
/// circumstances.
///
/// **This is not designed for use in a production systems.**
#[derive(Clone, Default)]
pub struct InMemoryBackend {
    jobs: Arc<RwLock<Vec<Job>>>,
}

impl InMemoryBackend {
    /// Creates a new instance of [`InMemoryBackend`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes a record as is, bypassing enqueue validation.
    ///
    /// Useful for staging records left behind by a previous process, e.g. a job stuck in
    /// `running`.
    pub fn insert_raw(&self, job: Job) -> Result<(), BackendError> {
        let mut jobs = self.jobs.write().map_err(|_| BackendError::BadState)?;
        match jobs.iter_mut().find(|j| j.id == job.id) {
            Some(existing) => *existing = job,
            None => jobs.push(job),
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for InMemoryBackend {
    async fn list_jobs(&self) -> Result<Vec<Job>, BackendError> {
        let mut jobs: Vec<Job> = self
            .jobs
            .read()
            .map_err(|_| BackendError::BadState)?
            .iter()
            .filter(|job| job.is_well_formed())
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.created_at);
        Ok(jobs)
    }

    async fn load(&self, id: &JobId) -> Result<Option<Job>, BackendError> {
        Ok(self
            .jobs
            .read()
            .map_err(|_| BackendError::BadState)?
            .iter()
            .find(|job| &job.id == id)
            .cloned())
    }

    async fn save(&self, job: &mut Job) -> Result<(), BackendError> {
        job.updated_at = Utc::now();
        let mut jobs = self.jobs.write().map_err(|_| BackendError::BadState)?;
        match jobs.iter_mut().find(|j| j.id == job.id) {
            None => jobs.push(job.clone()),
            Some(existing) => *existing = job.clone(),
        }
        Ok(())
    }

    async fn enqueue(&self, mut job: Job) -> Result<JobId, BackendError> {
        validate_enqueue(&job)?;
        job.updated_at = Utc::now();
        let mut jobs = self.jobs.write().map_err(|_| BackendError::BadState)?;
        if jobs.iter().any(|j| j.id == job.id) {
            return Err(BackendError::DuplicateJob(job.id));
        }
        let id = job.id.clone();
        jobs.push(job);
        Ok(id)
    }
}
