use std::{path::PathBuf, time::Duration};

use crate::{backend::Backend, CmdqError};

use super::{Job, JobId};

/// Builds a queued [`Job`] and hands it to a backend.
///
/// This is the enqueue side of the queue: whatever wants a command executed in the background
/// describes it here and the scheduler picks it up on a later tick.
///
/// # Example
///
/// ```
/// # use cmdq::prelude::*;
/// # use std::time::Duration;
/// # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
/// use cmdq::backend::memory::InMemoryBackend;
///
/// let backend = InMemoryBackend::new();
/// let job_id = JobBuilder::new("cargo build --release")
///     .with_workdir("/srv/app")
///     .with_timeout(Duration::from_secs(600))
///     .for_recipient("telegram", "42")
///     .enqueue_to_backend(&backend)
///     .await
///     .unwrap();
///
/// let job = backend.load(&job_id).await.unwrap().unwrap();
/// assert_eq!(job.status, JobStatus::Queued);
/// assert_eq!(job.timeout_ms, Some(600_000));
/// # });
/// ```
pub struct JobBuilder {
    command: String,
    id: Option<JobId>,
    workdir: Option<PathBuf>,
    timeout: Option<Duration>,
    output_file: Option<PathBuf>,
    channel: Option<String>,
    user_id: Option<String>,
    session_id: Option<String>,
}

impl JobBuilder {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            id: None,
            workdir: None,
            timeout: None,
            output_file: None,
            channel: None,
            user_id: None,
            session_id: None,
        }
    }

    /// Use a caller supplied id instead of a generated one.
    pub fn with_id(self, id: impl Into<JobId>) -> Self {
        Self {
            id: Some(id.into()),
            ..self
        }
    }

    pub fn with_workdir(self, workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: Some(workdir.into()),
            ..self
        }
    }

    /// Sub-millisecond precision is dropped. Without a timeout the scheduler default applies.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..self
        }
    }

    pub fn with_output_file(self, output_file: impl Into<PathBuf>) -> Self {
        Self {
            output_file: Some(output_file.into()),
            ..self
        }
    }

    /// Where progress and completion messages are delivered.
    pub fn for_recipient(self, channel: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            channel: Some(channel.into()),
            user_id: Some(user_id.into()),
            ..self
        }
    }

    /// The conversation the completion summary is injected into.
    pub fn in_session(self, session_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            ..self
        }
    }

    pub fn build(self) -> Job {
        let mut job = Job::new(self.command);
        if let Some(id) = self.id {
            job.id = id;
        }
        job.workdir = self.workdir;
        job.timeout_ms = self
            .timeout
            .map(|timeout| u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX).max(1));
        job.output_file = self.output_file;
        job.channel = self.channel;
        job.user_id = self.user_id;
        job.session_id = self.session_id;
        job
    }

    pub async fn enqueue_to_backend<B: Backend>(
        self,
        backend: &B,
    ) -> Result<JobId, CmdqError> {
        let job_id = backend.enqueue(self.build()).await?;
        tracing::debug!(%job_id, "Enqueued job {job_id}");
        Ok(job_id)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use crate::{
        backend::{memory::InMemoryBackend, BackendError},
        job::JobStatus,
    };

    use super::*;

    #[tokio::test]
    async fn enqueue() {
        let backend = InMemoryBackend::new();

        let job_id = JobBuilder::new("sleep 1")
            .with_id("job-fixed")
            .with_timeout(Duration::from_millis(1500))
            .for_recipient("slack", "u-1")
            .in_session("s-1")
            .enqueue_to_backend(&backend)
            .await
            .unwrap();

        assert_eq!(job_id, JobId::from("job-fixed"));
        let job = backend.load(&job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.timeout_ms, Some(1500));
        assert_eq!(job.channel.as_deref(), Some("slack"));
        assert_eq!(job.user_id.as_deref(), Some("u-1"));
        assert_eq!(job.session_id.as_deref(), Some("s-1"));
    }

    #[tokio::test]
    async fn enqueue_duplicate_id_fails() {
        let backend = InMemoryBackend::new();
        JobBuilder::new("true")
            .with_id("job-dup")
            .enqueue_to_backend(&backend)
            .await
            .unwrap();

        assert_matches!(
            JobBuilder::new("true")
                .with_id("job-dup")
                .enqueue_to_backend(&backend)
                .await,
            Err(CmdqError::Backend(BackendError::DuplicateJob(_)))
        );
    }

    #[test]
    fn zero_timeout_is_clamped() {
        let job = JobBuilder::new("true")
            .with_timeout(Duration::from_micros(10))
            .build();
        assert_eq!(job.timeout_ms, Some(1));
    }
}
