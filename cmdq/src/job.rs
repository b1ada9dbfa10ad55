//! The job record and its lifecycle.
//!
//! A [`Job`] is the persisted descriptor of one queued shell command. Its [`JobStatus`] only ever
//! moves forward:
//!
//! ```text
//! queued ──▶ running ──▶ completed | failed | timeout
//! ```
//!
//! All status changes go through the `mark_*`/[`Job::finish`] methods which reject illegal
//! transitions with a [`TransitionError`].
use std::{
    fmt::Display,
    path::PathBuf,
    sync::atomic::{AtomicU64, Ordering},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod builder;

const JOB_ID_PREFIX: &str = "job";

static JOB_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Opaque, time-derived identifier of a job.
///
/// Ids are also used as the descriptor file name by file based backends, so generated ids only
/// contain ASCII alphanumerics and dashes.
#[derive(Debug, Eq, PartialEq, Clone, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Generates a new id of the form `job-<unix-ms>-<counter>`.
    pub fn generate() -> Self {
        let now = Utc::now().timestamp_millis();
        let suffix = JOB_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("{JOB_ID_PREFIX}-{now}-{suffix:04}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the id can be used verbatim as a file name.
    pub fn is_path_safe(&self) -> bool {
        !self.0.is_empty()
            && self.0 != "."
            && self.0 != ".."
            && self
                .0
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The lifecycle state of a [`Job`].
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting to be admitted by the scheduler.
    #[default]
    Queued,
    /// A worker owns the job and its process is alive.
    Running,
    /// The command exited with code `0`.
    Completed,
    /// The command exited non-zero, could not be spawned, or was orphaned by a restart.
    Failed,
    /// The command outlived its timeout and was terminated.
    Timeout,
    /// Reserved. Nothing in this crate produces it.
    Cancelled,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        }
    }

    /// Returns true when the job cannot transition any further.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Timeout | Self::Cancelled
        )
    }

    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Running)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Timeout)
        )
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output accounting for a job, embedded in the persisted record.
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Progress {
    pub total_bytes: u64,
    pub total_lines: u64,
    /// Reset to zero after each periodic report.
    pub delta_bytes_since_report: u64,
    /// Reset to zero after each periodic report.
    pub delta_lines_since_report: u64,
    pub reports_sent: u64,
    pub last_report_at: Option<DateTime<Utc>>,
    pub last_output_at: Option<DateTime<Utc>>,
}

/// The persisted descriptor of one shell command.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<PathBuf>,
    /// When absent the scheduler's default timeout applies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub status: JobStatus,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub output_file: Option<PathBuf>,
    #[serde(default)]
    pub completion_notified_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default, rename = "userID")]
    pub user_id: Option<String>,
    #[serde(default, rename = "sessionID")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub progress: Progress,
}

/// How a running job ended, as observed by its worker.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Outcome {
    /// The process exited on its own, with `None` when it was killed by a signal.
    Exited { code: Option<i32> },
    /// The process outlived its timeout of `timeout_ms`.
    TimedOut { timeout_ms: u64 },
    /// The process could not be spawned or awaited.
    Crashed { error: String },
}

#[derive(Debug, Error, Eq, PartialEq)]
pub enum TransitionError {
    #[error("Job {id} cannot move from {from} to {to}")]
    IllegalTransition {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },
    #[error("Job {id} has not finished yet, status: {status}")]
    NotTerminal { id: JobId, status: JobStatus },
    #[error("Job {id} completion was already notified")]
    AlreadyNotified { id: JobId },
}

pub(crate) const ORPHANED_JOB_ERROR: &str = "worker restarted while command was running";

impl Job {
    /// Creates a queued job for `command` with a freshly generated id.
    pub fn new(command: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::generate(),
            command: command.into(),
            workdir: None,
            timeout_ms: None,
            status: JobStatus::Queued,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
            exit_code: None,
            error: None,
            output_file: None,
            completion_notified_at: None,
            channel: None,
            user_id: None,
            session_id: None,
            progress: Progress::default(),
        }
    }

    /// A descriptor is usable when it names both an id and a command.
    pub fn is_well_formed(&self) -> bool {
        !self.id.as_str().trim().is_empty() && !self.command.trim().is_empty()
    }

    pub(crate) fn effective_timeout_ms(&self, default_timeout_ms: u64) -> u64 {
        self.timeout_ms
            .filter(|timeout| *timeout > 0)
            .unwrap_or(default_timeout_ms)
    }

    /// Time from `startedAt` until `finishedAt`, or until now while still running.
    pub fn elapsed(&self) -> chrono::TimeDelta {
        match self.started_at {
            Some(started_at) => self.finished_at.unwrap_or_else(Utc::now) - started_at,
            None => chrono::TimeDelta::zero(),
        }
    }

    fn transition(&mut self, to: JobStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(to) {
            return Err(TransitionError::IllegalTransition {
                id: self.id.clone(),
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    pub fn mark_running(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(JobStatus::Running)?;
        self.started_at = Some(now);
        self.finished_at = None;
        self.exit_code = None;
        self.error = None;
        self.progress.last_report_at = Some(now);
        Ok(())
    }

    /// Moves a running job to its terminal status.
    ///
    /// A timeout takes precedence over whatever exit code the killed process reported.
    pub fn finish(&mut self, outcome: Outcome, now: DateTime<Utc>) -> Result<(), TransitionError> {
        let (status, exit_code, error) = match outcome {
            Outcome::TimedOut { timeout_ms } => (
                JobStatus::Timeout,
                None,
                Some(format!("Timed out after {timeout_ms}ms")),
            ),
            Outcome::Exited { code: Some(0) } => (JobStatus::Completed, Some(0), None),
            Outcome::Exited { code: Some(code) } => (
                JobStatus::Failed,
                Some(code),
                Some(format!("Exited with code {code}")),
            ),
            Outcome::Exited { code: None } => (
                JobStatus::Failed,
                None,
                Some("terminated by signal".to_owned()),
            ),
            Outcome::Crashed { error } => (JobStatus::Failed, None, Some(error)),
        };
        self.transition(status)?;
        self.finished_at = Some(now);
        self.exit_code = exit_code;
        self.error = error;
        Ok(())
    }

    /// Forces a job left `running` by a previous process straight to `failed`.
    ///
    /// The completion is marked as notified in the same step so a crash during the notification
    /// can never produce a second one.
    pub fn mark_orphaned(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if self.completion_notified_at.is_some() {
            return Err(TransitionError::AlreadyNotified {
                id: self.id.clone(),
            });
        }
        self.transition(JobStatus::Failed)?;
        self.error = Some(ORPHANED_JOB_ERROR.to_owned());
        self.exit_code = None;
        self.finished_at = Some(now);
        self.completion_notified_at = Some(now);
        Ok(())
    }

    pub fn mark_completion_notified(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if !self.status.is_terminal() {
            return Err(TransitionError::NotTerminal {
                id: self.id.clone(),
                status: self.status,
            });
        }
        if self.completion_notified_at.is_some() {
            return Err(TransitionError::AlreadyNotified {
                id: self.id.clone(),
            });
        }
        self.completion_notified_at = Some(now);
        Ok(())
    }

    pub(crate) fn recipient(&self) -> Option<(&str, &str)> {
        match (self.channel.as_deref(), self.user_id.as_deref()) {
            (Some(channel), Some(user_id)) if !channel.is_empty() && !user_id.is_empty() => {
                Some((channel, user_id))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use assert_matches::assert_matches;

    impl Job {
        pub(crate) fn raw_job() -> Self {
            Self::new("echo hello")
        }

        pub(crate) fn with_status(self, status: JobStatus) -> Self {
            Self { status, ..self }
        }

        pub(crate) fn with_created_at(self, created_at: DateTime<Utc>) -> Self {
            Self { created_at, ..self }
        }
    }

    #[test]
    fn generated_ids_are_unique_and_path_safe() {
        let a = JobId::generate();
        let b = JobId::generate();
        assert_ne!(a, b);
        assert!(a.is_path_safe());
        assert!(a.as_str().starts_with("job-"));
    }

    #[test]
    fn path_unsafe_ids() {
        assert!(!JobId::from("").is_path_safe());
        assert!(!JobId::from("..").is_path_safe());
        assert!(!JobId::from("../etc/passwd").is_path_safe());
        assert!(!JobId::from("a b").is_path_safe());
    }

    #[test]
    fn status_transitions_are_monotonic() {
        use JobStatus::*;
        assert!(Queued.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));
        assert!(Running.can_transition_to(Timeout));
        assert!(!Running.can_transition_to(Queued));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Queued));
        assert!(!Queued.can_transition_to(Completed));
        assert!(!Running.can_transition_to(Cancelled));
    }

    #[test]
    fn mark_running_twice_is_rejected() {
        let mut job = Job::raw_job();
        job.mark_running(Utc::now()).unwrap();
        assert_matches!(
            job.mark_running(Utc::now()),
            Err(TransitionError::IllegalTransition {
                from: JobStatus::Running,
                to: JobStatus::Running,
                ..
            })
        );
    }

    #[test]
    fn timeout_clears_exit_code() {
        let mut job = Job::raw_job();
        job.mark_running(Utc::now()).unwrap();
        job.finish(Outcome::TimedOut { timeout_ms: 500 }, Utc::now())
            .unwrap();
        assert_eq!(job.status, JobStatus::Timeout);
        assert_eq!(job.exit_code, None);
        assert_eq!(job.error.as_deref(), Some("Timed out after 500ms"));
        assert!(job.finished_at.is_some());
    }

    #[test]
    fn exit_codes_map_to_status() {
        let mut ok = Job::raw_job();
        ok.mark_running(Utc::now()).unwrap();
        ok.finish(Outcome::Exited { code: Some(0) }, Utc::now())
            .unwrap();
        assert_eq!(ok.status, JobStatus::Completed);
        assert_eq!(ok.exit_code, Some(0));
        assert_eq!(ok.error, None);

        let mut bad = Job::raw_job();
        bad.mark_running(Utc::now()).unwrap();
        bad.finish(Outcome::Exited { code: Some(3) }, Utc::now())
            .unwrap();
        assert_eq!(bad.status, JobStatus::Failed);
        assert_eq!(bad.exit_code, Some(3));
    }

    #[test]
    fn finishing_a_queued_job_is_rejected() {
        let mut job = Job::raw_job();
        assert_matches!(
            job.finish(Outcome::Exited { code: Some(0) }, Utc::now()),
            Err(TransitionError::IllegalTransition { .. })
        );
        assert_eq!(job.status, JobStatus::Queued);
    }

    #[test]
    fn completion_notified_only_once_and_only_when_terminal() {
        let mut job = Job::raw_job();
        assert_matches!(
            job.mark_completion_notified(Utc::now()),
            Err(TransitionError::NotTerminal { .. })
        );
        job.mark_running(Utc::now()).unwrap();
        job.finish(Outcome::Exited { code: Some(0) }, Utc::now())
            .unwrap();
        let first = Utc::now();
        job.mark_completion_notified(first).unwrap();
        assert_matches!(
            job.mark_completion_notified(Utc::now()),
            Err(TransitionError::AlreadyNotified { .. })
        );
        assert_eq!(job.completion_notified_at, Some(first));
    }

    #[test]
    fn orphaned_job_is_failed_and_notified() {
        let mut job = Job::raw_job().with_status(JobStatus::Running);
        job.mark_orphaned(Utc::now()).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some(ORPHANED_JOB_ERROR));
        assert!(job.completion_notified_at.is_some());
        assert!(job.finished_at.is_some());
    }

    #[test]
    fn descriptor_uses_camel_case_keys() {
        let mut job = Job::raw_job();
        job.timeout_ms = Some(5000);
        job.user_id = Some("u1".to_owned());
        job.session_id = Some("s1".to_owned());
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["timeoutMs"], 5000);
        assert_eq!(value["userID"], "u1");
        assert_eq!(value["sessionID"], "s1");
        assert_eq!(value["status"], "queued");
        assert!(value["progress"]["totalBytes"].is_number());
        assert!(value.get("completionNotifiedAt").is_some());
    }

    #[test]
    fn minimal_descriptor_decodes_with_defaults() {
        let job: Job =
            serde_json::from_str(r#"{"id": "job-1", "command": "ls", "timeoutMs": 10}"#).unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.timeout_ms, Some(10));
        assert_eq!(job.progress, Progress::default());
        assert!(job.is_well_formed());
        assert_eq!(job.effective_timeout_ms(99), 10);
    }

    #[test]
    fn empty_command_is_malformed() {
        let job: Job = serde_json::from_str(r#"{"id": "job-1", "command": "  "}"#).unwrap();
        assert!(!job.is_well_formed());
        assert_eq!(job.effective_timeout_ms(99), 99);
    }
}
