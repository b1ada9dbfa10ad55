//! Startup reconciliation of jobs left behind by a previous process.
//!
//! Run [`recover`] once, before the scheduler's first tick. A job found `running` cannot still
//! have a worker, since workers only live as long as the process that started them, so it is
//! forced to `failed` and its recipient is told. Terminal jobs whose completion was never
//! notified get that notification now.
use chrono::Utc;
use tracing::instrument;

use crate::{
    backend::{Backend, BackendError},
    job::{Job, JobId, JobStatus},
    notifier::Notifier,
    worker::completion_text,
};

const RECOVERY_PREVIEW_BUDGET: u64 = 2000;

/// What [`recover`] changed.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct RecoveryReport {
    /// Jobs that were `running` and are now `failed`.
    pub orphaned: Vec<JobId>,
    /// Terminal jobs whose missing completion notification was sent.
    pub renotified: Vec<JobId>,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        self.orphaned.is_empty() && self.renotified.is_empty()
    }
}

/// Reconciles persisted state with the fact that no worker is alive.
///
/// Only listing the jobs can fail. Per job failures are logged and the job is skipped.
#[instrument(skip_all)]
pub async fn recover<B: Backend>(
    backend: &B,
    notifier: &Notifier,
) -> Result<RecoveryReport, BackendError> {
    let mut report = RecoveryReport::default();
    for mut job in backend.list_jobs().await? {
        if job.completion_notified_at.is_some() {
            continue;
        }
        let job_id = job.id.clone();
        if job.status == JobStatus::Running {
            if recover_orphan(backend, notifier, &mut job).await {
                report.orphaned.push(job_id);
            }
        } else if job.status.is_terminal() && renotify(backend, notifier, &mut job).await {
            report.renotified.push(job_id);
        }
    }
    if !report.is_empty() {
        tracing::info!(
            orphaned = report.orphaned.len(),
            renotified = report.renotified.len(),
            "Recovered jobs from previous run"
        );
    }
    Ok(report)
}

/// Persists the forced failure before notifying, so a crash in between never notifies twice.
async fn recover_orphan<B: Backend>(backend: &B, notifier: &Notifier, job: &mut Job) -> bool {
    let job_id = job.id.clone();
    if let Err(err) = job.mark_orphaned(Utc::now()) {
        tracing::error!(?err, %job_id, "Failed to recover job {job_id}: {err}");
        return false;
    }
    if let Err(err) = backend.save(job).await {
        tracing::error!(?err, %job_id, "Failed to save recovered job {job_id}: {err}");
        return false;
    }
    tracing::warn!(%job_id, "Job {job_id} was running when the previous worker stopped, marked failed");

    let text = completion_text(job, RECOVERY_PREVIEW_BUDGET).await;
    notifier.deliver(job, &text).await;
    notifier.inject(job, &text).await;
    true
}

async fn renotify<B: Backend>(backend: &B, notifier: &Notifier, job: &mut Job) -> bool {
    let job_id = job.id.clone();
    let text = completion_text(job, RECOVERY_PREVIEW_BUDGET).await;
    notifier.deliver(job, &text).await;
    notifier.inject(job, &text).await;

    if let Err(err) = job.mark_completion_notified(Utc::now()) {
        tracing::error!(?err, %job_id, "Failed to mark job {job_id} as notified: {err}");
        return false;
    }
    if let Err(err) = backend.save(job).await {
        tracing::error!(?err, %job_id, "Failed to save job {job_id}: {err}");
        return false;
    }
    tracing::info!(%job_id, "Sent missing completion notification for job {job_id}");
    true
}
