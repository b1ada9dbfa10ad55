//! File based storage for cmdq.
//!
//! [`FileBackend`] keeps one JSON descriptor per job in a queue directory, named `<id>.json`.
//! Anything that can write such a file can enqueue a job; the scheduler picks it up on its next
//! tick. [`SpoolOutbox`] is the matching outbound side: one JSON file per message for a delivery
//! process to pick up.
//!
//! ```
//! # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
//! use cmdq::prelude::*;
//! use cmdq_fs::FileBackend;
//!
//! let dir = std::env::temp_dir().join("cmdq-fs-doc");
//! let backend = FileBackend::open(&dir).await.unwrap();
//! let job_id = JobBuilder::new("make test")
//!     .enqueue_to_backend(&backend)
//!     .await
//!     .unwrap();
//! assert!(dir.join(format!("{job_id}.json")).exists());
//! # });
//! ```
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cmdq::{
    backend::{validate_enqueue, Backend, BackendError},
    job::{Job, JobId},
};
use tokio::fs;
use tracing::instrument;

mod atomic;
mod outbox;

pub use outbox::{SpoolOutbox, SpooledMessage};

const DESCRIPTOR_EXTENSION: &str = "json";
const CREATED_AT: &str = "createdAt";

/// A durable [`Backend`] storing each job as `<queue_dir>/<id>.json`.
#[derive(Debug, Clone)]
pub struct FileBackend {
    queue_dir: Arc<PathBuf>,
}

impl FileBackend {
    /// Uses `queue_dir` without touching the file system. A missing directory lists as empty
    /// and is created by the first write.
    pub fn new(queue_dir: impl Into<PathBuf>) -> Self {
        Self {
            queue_dir: Arc::new(queue_dir.into()),
        }
    }

    /// Like [`FileBackend::new`] but creates the directory up front.
    pub async fn open(queue_dir: impl Into<PathBuf>) -> Result<Self, BackendError> {
        let backend = Self::new(queue_dir);
        fs::create_dir_all(backend.queue_dir()).await?;
        Ok(backend)
    }

    pub fn queue_dir(&self) -> &Path {
        &self.queue_dir
    }

    fn descriptor_path(&self, id: &JobId) -> Result<PathBuf, BackendError> {
        if !id.is_path_safe() {
            return Err(BackendError::InvalidJobId(id.clone()));
        }
        Ok(self
            .queue_dir
            .join(format!("{id}.{DESCRIPTOR_EXTENSION}")))
    }

    async fn write(&self, job: &Job) -> Result<(), BackendError> {
        let path = self.descriptor_path(&job.id)?;
        let bytes = serde_json::to_vec_pretty(job)?;
        atomic::write_atomic(&path, &bytes).await?;
        Ok(())
    }

    /// Every `*.json` entry in discovery order, hidden and temp files excluded.
    async fn descriptor_paths(&self) -> Result<Vec<PathBuf>, BackendError> {
        let mut entries = match fs::read_dir(self.queue_dir()).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let hidden = path
                .file_name()
                .and_then(|name| name.to_str())
                .map_or(true, atomic::is_hidden);
            let descriptor = path
                .extension()
                .is_some_and(|extension| extension == DESCRIPTOR_EXTENSION);
            if descriptor && !hidden {
                paths.push(path);
            }
        }
        Ok(paths)
    }
}

/// Decodes a descriptor read from `path`.
///
/// A descriptor written without `createdAt` is dated by the file's modification time, so it keeps
/// its place in the queue across listings.
async fn decode(path: &Path, bytes: &[u8]) -> Result<Job, BackendError> {
    let mut value: serde_json::Value = serde_json::from_slice(bytes)?;
    if let Some(fields) = value.as_object_mut() {
        if fields.get(CREATED_AT).map_or(true, serde_json::Value::is_null) {
            let modified: DateTime<Utc> = fs::metadata(path).await?.modified()?.into();
            fields.insert(CREATED_AT.to_owned(), serde_json::to_value(modified)?);
        }
    }
    Ok(serde_json::from_value(value)?)
}

/// Reads one descriptor for listing, skipping whatever cannot be used.
///
/// A descriptor is only usable when its id names the file it was read from, since every save
/// goes to `<id>.json`.
async fn read_listed(path: &Path) -> Option<Job> {
    let file = path.display();
    let bytes = fs::read(path)
        .await
        .inspect_err(|err| tracing::warn!(?err, "Skipping unreadable job descriptor {file}: {err}"))
        .ok()?;
    let job = decode(path, &bytes)
        .await
        .inspect_err(|err| tracing::warn!(?err, "Skipping malformed job descriptor {file}: {err}"))
        .ok()?;
    if !job.is_well_formed() {
        tracing::warn!("Skipping job descriptor {file} without an id or command");
        return None;
    }
    let stem = path.file_stem().and_then(|stem| stem.to_str());
    if !job.id.is_path_safe() || stem != Some(job.id.as_str()) {
        let job_id = &job.id;
        tracing::warn!(%job_id, "Skipping job descriptor {file}, its id {job_id:?} does not match the file name");
        return None;
    }
    Some(job)
}

#[async_trait]
impl Backend for FileBackend {
    #[instrument(skip(self))]
    async fn list_jobs(&self) -> Result<Vec<Job>, BackendError> {
        let mut jobs = Vec::new();
        for path in self.descriptor_paths().await? {
            if let Some(job) = read_listed(&path).await {
                jobs.push(job);
            }
        }
        jobs.sort_by_key(|job| job.created_at);
        Ok(jobs)
    }

    async fn load(&self, id: &JobId) -> Result<Option<Job>, BackendError> {
        let path = self.descriptor_path(id)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(decode(&path, &bytes).await?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn save(&self, job: &mut Job) -> Result<(), BackendError> {
        job.updated_at = Utc::now();
        self.write(job).await
    }

    #[instrument(skip(self, job), fields(job_id = %job.id))]
    async fn enqueue(&self, mut job: Job) -> Result<JobId, BackendError> {
        validate_enqueue(&job)?;
        let path = self.descriptor_path(&job.id)?;
        if fs::try_exists(&path).await? {
            return Err(BackendError::DuplicateJob(job.id));
        }
        job.updated_at = Utc::now();
        self.write(&job).await?;
        Ok(job.id)
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use assert_matches::assert_matches;
    use cmdq::{
        config::SchedulerConfig,
        job::JobStatus,
        notifier::Notifier,
        recovery::recover,
        scheduler::{Scheduler, TickOutcome},
        testing::{wait_for_completion_notified, RecordingOutbox},
    };

    use super::*;

    /// A backend over a fresh directory that outlives the test body.
    fn scratch_backend() -> FileBackend {
        let dir: &'static tempfile::TempDir = Box::leak(Box::new(tempfile::tempdir().unwrap()));
        FileBackend::new(dir.path().join("queue"))
    }

    cmdq::test_suite!(for: scratch_backend());

    async fn write_raw(backend: &FileBackend, name: &str, content: &str) {
        fs::create_dir_all(backend.queue_dir()).await.unwrap();
        fs::write(backend.queue_dir().join(name), content)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn missing_queue_dir_lists_empty() {
        let backend = scratch_backend();
        assert!(backend.list_jobs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn descriptor_is_a_camel_case_json_file() {
        let backend = scratch_backend();
        let mut job = Job::new("echo hi");
        job.timeout_ms = Some(5000);
        job.user_id = Some("42".to_owned());
        let id = backend.enqueue(job).await.unwrap();

        let content = fs::read(backend.queue_dir().join(format!("{id}.json")))
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&content).unwrap();
        assert_eq!(value["id"], id.as_str());
        assert_eq!(value["command"], "echo hi");
        assert_eq!(value["status"], "queued");
        assert_eq!(value["timeoutMs"], 5000);
        assert_eq!(value["userID"], "42");
        assert!(value["progress"]["deltaBytesSinceReport"].is_number());
    }

    #[tokio::test]
    async fn malformed_descriptors_are_skipped() {
        let backend = scratch_backend();
        let good = backend.enqueue(Job::new("echo ok")).await.unwrap();
        write_raw(&backend, "garbage.json", "{ not json").await;
        write_raw(&backend, "no-command.json", r#"{"id": "no-command"}"#).await;
        write_raw(&backend, "empty.json", r#"{"id": "", "command": "ls"}"#).await;
        write_raw(&backend, "blank.json", r#"{"id": "blank", "command": "  "}"#).await;
        write_raw(&backend, "notes.txt", r#"{"id": "notes", "command": "ls"}"#).await;
        write_raw(&backend, ".job-x.json.tmp-1-1", r#"{"id": "x", "command": "ls"}"#).await;

        let jobs = backend.list_jobs().await.unwrap();

        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, good);
    }

    #[tokio::test]
    async fn descriptor_must_be_named_after_its_id() {
        let backend = scratch_backend();
        write_raw(&backend, "foo.json", r#"{"id": "bar", "command": "echo ran"}"#).await;
        write_raw(
            &backend,
            "escape.json",
            r#"{"id": "../escape", "command": "echo ran"}"#,
        )
        .await;

        assert!(backend.list_jobs().await.unwrap().is_empty());

        let logs = tempfile::tempdir().unwrap();
        let scheduler = Scheduler::new(
            backend.clone(),
            Notifier::new(RecordingOutbox::new()),
            SchedulerConfig::new(logs.path()).with_max_concurrency(1),
        );
        for _ in 0..3 {
            assert_eq!(
                scheduler.tick().await,
                TickOutcome::Ran {
                    reported: 0,
                    admitted: 0
                }
            );
        }
        let mut logs_written = fs::read_dir(logs.path()).await.unwrap();
        assert!(logs_written.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn undated_descriptor_keeps_its_place_in_the_queue() {
        let backend = scratch_backend();
        write_raw(
            &backend,
            "job-old.json",
            r#"{"id": "job-old", "command": "echo old"}"#,
        )
        .await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let newer = backend.enqueue(Job::new("echo new")).await.unwrap();

        let pending = backend.list_pending().await.unwrap();
        let ids: Vec<JobId> = pending.iter().map(|job| job.id.clone()).collect();
        assert_eq!(ids, vec![JobId::from("job-old"), newer]);

        let listed_again = backend.list_jobs().await.unwrap();
        assert_eq!(listed_again[0].created_at, pending[0].created_at);
        let loaded = backend
            .load(&JobId::from("job-old"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.created_at, pending[0].created_at);
    }

    #[tokio::test]
    async fn externally_written_descriptor_is_pending() {
        let backend = scratch_backend();
        write_raw(
            &backend,
            "job-external.json",
            r#"{"id": "job-external", "command": "echo from outside", "status": "queued"}"#,
        )
        .await;

        let pending = backend.list_pending().await.unwrap();

        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, JobId::from("job-external"));
        assert_eq!(pending[0].timeout_ms, None);
    }

    #[tokio::test]
    async fn load_corrupt_descriptor_errors() {
        let backend = scratch_backend();
        write_raw(&backend, "job-bad.json", "{").await;

        assert_matches!(
            backend.load(&JobId::from("job-bad")).await,
            Err(BackendError::EncodeDecode(_))
        );
    }

    #[tokio::test]
    async fn load_rejects_unsafe_id() {
        let backend = scratch_backend();
        assert_matches!(
            backend.load(&JobId::from("../../etc/passwd")).await,
            Err(BackendError::InvalidJobId(_))
        );
    }

    #[tokio::test]
    async fn restart_recovers_a_job_left_running() {
        let backend = scratch_backend();
        let mut job = Job::new("sleep 100");
        job.channel = Some("cli".to_owned());
        job.user_id = Some("tester".to_owned());
        backend.enqueue(job.clone()).await.unwrap();
        job.mark_running(Utc::now()).unwrap();
        backend.save(&mut job).await.unwrap();

        let restarted = FileBackend::new(backend.queue_dir());
        let outbox = RecordingOutbox::new();
        let report = recover(&restarted, &Notifier::new(outbox.clone()))
            .await
            .unwrap();

        assert_eq!(report.orphaned, vec![job.id.clone()]);
        let recovered = restarted.load(&job.id).await.unwrap().unwrap();
        assert_eq!(recovered.status, JobStatus::Failed);
        assert!(recovered.error.is_some());
        assert!(recovered.completion_notified_at.is_some());
        assert_eq!(outbox.messages().len(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn scheduler_runs_a_job_from_the_queue_dir() {
        let backend = scratch_backend();
        let logs = tempfile::tempdir().unwrap();
        let scheduler = Scheduler::new(
            backend.clone(),
            Notifier::new(RecordingOutbox::new()),
            SchedulerConfig::new(logs.path()).with_max_concurrency(1),
        );
        write_raw(
            &backend,
            "job-e2e.json",
            r#"{"id": "job-e2e", "command": "sleep 0.2 && echo done", "timeoutMs": 5000}"#,
        )
        .await;

        scheduler.tick().await;
        let job = wait_for_completion_notified(
            &backend,
            &JobId::from("job-e2e"),
            Duration::from_secs(10),
        )
        .await
        .unwrap();
        scheduler.shutdown().await;

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.exit_code, Some(0));
        assert_eq!(job.output_file, Some(logs.path().join("job-e2e.log")));
        let log = fs::read_to_string(logs.path().join("job-e2e.log"))
            .await
            .unwrap();
        assert!(log.contains("done"));
    }
}
