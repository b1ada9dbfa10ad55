//! The periodic, non-overlapping scheduler tick.
//!
//! Each tick, in order:
//!
//! 1. reaps workers whose job has finished,
//! 2. sends a progress report for every running job whose report interval has elapsed,
//! 3. admits the oldest queued jobs until `max_concurrency` workers are running.
//!
//! Ticks never overlap. A tick that would start while another is still running is skipped, not
//! queued, and reports [`TickOutcome::Skipped`].
//!
//! # Example
//!
//! ```
//! # use cmdq::prelude::*;
//! # use std::time::Duration;
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! use cmdq::backend::memory::InMemoryBackend;
//! use cmdq::notifier::TracingOutbox;
//! use tokio_util::sync::CancellationToken;
//!
//! let backend = InMemoryBackend::new();
//! let logs = std::env::temp_dir().join("cmdq-doc-logs");
//! let scheduler = Scheduler::new(
//!     backend.clone(),
//!     Notifier::new(TracingOutbox),
//!     SchedulerConfig::new(logs).with_max_concurrency(2),
//! );
//!
//! let cancellation_token = CancellationToken::new();
//! let _ticker = scheduler.spawn(cancellation_token.clone());
//!
//! JobBuilder::new("echo hello").enqueue_to_backend(&backend).await.unwrap();
//!
//! cancellation_token.cancel();
//! scheduler.shutdown().await;
//! # });
//! ```
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use tokio::{sync::Mutex, task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::{
    backend::Backend,
    config::SchedulerConfig,
    job::{Job, JobId, JobStatus},
    log_sink,
    notifier::{message, Notifier},
    progress::{mark_reported, report_due, OutputMeter},
    worker::{self, WorkerHandle},
};

const SHUTDOWN_POLL: Duration = Duration::from_millis(10);

/// What a call to [`Scheduler::tick`] did.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TickOutcome {
    /// Another tick was still running, or the scheduler is shutting down.
    Skipped,
    Ran { reported: usize, admitted: usize },
}

/// Admits queued jobs to workers and reports on the running ones.
///
/// Cheap to clone; clones share the same running set.
pub struct Scheduler<B: Backend> {
    inner: Arc<Inner<B>>,
}

impl<B: Backend> Clone for Scheduler<B> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<B> {
    backend: B,
    notifier: Notifier,
    config: Arc<SchedulerConfig>,
    ticking: AtomicBool,
    stopping: AtomicBool,
    workers: Mutex<HashMap<JobId, WorkerHandle>>,
}

/// Clears the ticking flag however the tick ends.
struct TickGuard<'a>(&'a AtomicBool);

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl<B> Scheduler<B>
where
    B: Backend + 'static,
{
    pub fn new(backend: B, notifier: Notifier, config: SchedulerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                backend,
                notifier,
                config: Arc::new(config),
                ticking: AtomicBool::new(false),
                stopping: AtomicBool::new(false),
                workers: Default::default(),
            }),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Ids of the jobs whose worker is still alive.
    pub async fn running_jobs(&self) -> Vec<JobId> {
        let mut ids: Vec<JobId> = self
            .inner
            .workers
            .lock()
            .await
            .iter()
            .filter(|(_, handle)| !handle.is_finished())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Runs one report and admit cycle unless another one is in progress.
    #[instrument(skip(self))]
    pub async fn tick(&self) -> TickOutcome {
        if self.inner.ticking.swap(true, Ordering::SeqCst) {
            tracing::trace!("Tick already in progress, skipping");
            return TickOutcome::Skipped;
        }
        let _guard = TickGuard(&self.inner.ticking);
        if self.inner.stopping.load(Ordering::SeqCst) {
            return TickOutcome::Skipped;
        }

        self.reap().await;
        let reported = self.report_running().await;
        let admitted = self.admit().await;
        if reported + admitted > 0 {
            tracing::debug!(reported, admitted, "Tick complete");
        }
        TickOutcome::Ran { reported, admitted }
    }

    /// Ticks every `tick_interval` until the token is cancelled.
    ///
    /// Each tick runs on its own task, so a slow tick makes the following ones skip rather than
    /// delaying the interval.
    pub fn spawn(&self, cancellation_token: CancellationToken) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(scheduler.config().tick_interval());
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let scheduler = scheduler.clone();
                        tokio::spawn(async move {
                            scheduler.tick().await;
                        });
                    }
                    _ = cancellation_token.cancelled() => {
                        tracing::debug!("Shutting down the scheduler");
                        break;
                    }
                }
            }
        })
    }

    /// Stops admitting jobs and waits for every running worker to finish.
    ///
    /// Running commands are not killed; their timeouts still apply.
    pub async fn shutdown(&self) {
        self.inner.stopping.store(true, Ordering::SeqCst);
        while self.inner.ticking.load(Ordering::SeqCst) {
            tokio::time::sleep(SHUTDOWN_POLL).await;
        }
        let workers: Vec<_> = self.inner.workers.lock().await.drain().collect();
        if !workers.is_empty() {
            tracing::info!("Waiting for {} running jobs to finish", workers.len());
        }
        futures::future::join_all(
            workers
                .into_iter()
                .map(|(job_id, handle)| async move { handle.join(&job_id).await }),
        )
        .await;
    }

    async fn reap(&self) {
        let mut workers = self.inner.workers.lock().await;
        let finished: Vec<JobId> = workers
            .iter()
            .filter(|(_, handle)| handle.is_finished())
            .map(|(id, _)| id.clone())
            .collect();
        for job_id in finished {
            if let Some(handle) = workers.remove(&job_id) {
                handle.join(&job_id).await;
                tracing::trace!(%job_id, "Reaped worker for job {job_id}");
            }
        }
    }

    async fn report_running(&self) -> usize {
        let running: Vec<_> = self
            .inner
            .workers
            .lock()
            .await
            .values()
            .map(|handle| (handle.job.clone(), handle.meter.clone()))
            .collect();

        let now = Utc::now();
        let mut reported = 0;
        for (job, meter) in running {
            if self.report(&job, &meter, now).await {
                reported += 1;
            }
        }
        reported
    }

    /// Sends one progress report if it is due.
    ///
    /// The job lock is held until the report is persisted. Finalization takes the same lock, so a
    /// job's completion message can never be enqueued ahead of its last progress report.
    async fn report(&self, shared: &Mutex<Job>, meter: &OutputMeter, now: DateTime<Utc>) -> bool {
        let config = &self.inner.config;
        let mut job = shared.lock().await;
        if job.status != JobStatus::Running
            || !report_due(&job.progress, config.report_interval(), now)
        {
            return false;
        }
        let report = meter.take_report();
        let job_id = job.id.clone();

        let tail = match &job.output_file {
            Some(path) => log_sink::tail(path, config.tail_bytes())
                .await
                .unwrap_or_else(|err| {
                    tracing::warn!(?err, %job_id, "Failed to read output of job {job_id}: {err}");
                    String::new()
                }),
            None => String::new(),
        };
        let text = message::progress(&job, &report, now, &tail);
        self.inner.notifier.deliver(&job, &text).await;

        mark_reported(&mut job.progress, &meter.snapshot(), now);
        let _ = self.inner.backend.save(&mut job).await.inspect_err(|err| {
            tracing::error!(?err, %job_id, "Failed to save progress of job {job_id}: {err}")
        });
        true
    }

    async fn admit(&self) -> usize {
        let mut workers = self.inner.workers.lock().await;
        let capacity = self.inner.config.max_concurrency();
        if workers.len() >= capacity {
            return 0;
        }

        let pending = match self.inner.backend.list_pending().await {
            Ok(pending) => pending,
            Err(err) => {
                tracing::error!(?err, "Failed to list queued jobs: {err}");
                return 0;
            }
        };

        let mut admitted = 0;
        for job in pending {
            if workers.len() >= capacity {
                break;
            }
            if workers.contains_key(&job.id) {
                continue;
            }
            let job_id = job.id.clone();
            match worker::start(
                self.inner.backend.clone(),
                self.inner.notifier.clone(),
                self.inner.config.clone(),
                job,
            )
            .await
            {
                Ok(handle) => {
                    tracing::info!(%job_id, "Admitted job {job_id}");
                    workers.insert(job_id, handle);
                    admitted += 1;
                }
                Err(err) => {
                    tracing::error!(?err, %job_id, "Failed to start job {job_id}: {err}")
                }
            }
        }
        admitted
    }
}
