//! Runs one job from `running` to a terminal status.
//!
//! A worker is started by the scheduler with [`start`], which records the job as running before
//! anything else happens so a later tick cannot admit it twice. The rest runs on its own task:
//!
//! 1. the started notification,
//! 2. `sh -c <command>` in its own process group, with stdout and stderr pumped into the job's
//!    [`LogSink`] and folded into its [`OutputMeter`],
//! 3. the timeout, escalating from `SIGTERM` to `SIGKILL` after the kill grace,
//! 4. finalization and exactly one completion notification.
//!
//! The job record is shared with the scheduler behind an async mutex. Every save happens while
//! holding it, so the two writers can never persist a stale copy over a newer one.
use std::{
    path::Path,
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use chrono::Utc;
use thiserror::Error;
use tokio::{
    fs::File,
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    process::{Child, Command},
    sync::Mutex,
    task::{JoinHandle, JoinSet},
};
use tracing::{instrument, Instrument};

use crate::{
    backend::{Backend, BackendError},
    config::{SchedulerConfig, MIN_TIMEOUT},
    job::{Job, JobId, Outcome, TransitionError},
    log_sink::{self, LogSink},
    notifier::{message, Notifier},
    progress::OutputMeter,
};

const CHUNK_SIZE: usize = 8 * 1024;
const PUMP_DRAIN: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub(crate) enum WorkerError {
    #[error("Error persisting job")]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Transition(#[from] TransitionError),
}

/// The scheduler's view of a started worker.
pub(crate) struct WorkerHandle {
    pub(crate) job: Arc<Mutex<Job>>,
    pub(crate) meter: Arc<OutputMeter>,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("finished", &self.is_finished())
            .finish_non_exhaustive()
    }
}

impl WorkerHandle {
    pub(crate) fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub(crate) async fn join(self, job_id: &JobId) {
        if let Err(err) = self.task.await {
            tracing::error!(?err, %job_id, "Worker for job {job_id} panicked: {err}");
        }
    }
}

struct Worker<B> {
    job_id: JobId,
    backend: B,
    notifier: Notifier,
    config: Arc<SchedulerConfig>,
    job: Arc<Mutex<Job>>,
    meter: Arc<OutputMeter>,
}

/// Marks `job` running, persists it, writes the log header, and hands the rest to a new task.
///
/// Errors mean the job was not started: its stored record is unchanged and no log was written.
pub(crate) async fn start<B>(
    backend: B,
    notifier: Notifier,
    config: Arc<SchedulerConfig>,
    mut job: Job,
) -> Result<WorkerHandle, WorkerError>
where
    B: Backend + 'static,
{
    let now = Utc::now();
    let output_file = job
        .output_file
        .clone()
        .unwrap_or_else(|| config.default_output_file(&job.id));
    job.output_file = Some(output_file.clone());
    job.mark_running(now)?;
    backend.save(&mut job).await?;
    let sink = LogSink::create(output_file, &job, now).await;

    let job_id = job.id.clone();
    let worker = Worker {
        job_id: job_id.clone(),
        backend,
        notifier,
        config,
        job: Arc::new(Mutex::new(job)),
        meter: Arc::new(OutputMeter::new()),
    };
    let job = worker.job.clone();
    let meter = worker.meter.clone();
    let task = tokio::spawn(worker.run(sink).in_current_span());
    tracing::debug!(%job_id, "Started worker for job {job_id}");

    Ok(WorkerHandle { job, meter, task })
}

impl<B> Worker<B>
where
    B: Backend + 'static,
{
    #[instrument(skip_all, fields(job_id = %self.job_id))]
    async fn run(self, sink: std::io::Result<LogSink>) {
        let outcome = match sink {
            Ok(sink) => {
                self.notify_started().await;
                self.execute(&sink).await
            }
            Err(err) => Outcome::Crashed {
                error: format!("Failed to create output file: {err}"),
            },
        };
        self.finalize(outcome).await;
    }

    async fn notify_started(&self) {
        let job = self.job.lock().await.clone();
        let timeout_ms = job.effective_timeout_ms(self.config.default_timeout_ms());
        self.notifier
            .deliver(&job, &message::started(&job, timeout_ms))
            .await;
    }

    async fn execute(&self, sink: &LogSink) -> Outcome {
        let job_id = &self.job_id;
        let (command, workdir, timeout_ms) = {
            let job = self.job.lock().await;
            (
                job.command.clone(),
                job.workdir.clone(),
                job.effective_timeout_ms(self.config.default_timeout_ms()),
            )
        };

        let mut child = match spawn(&command, workdir.as_deref()) {
            Ok(child) => child,
            Err(err) => {
                tracing::error!(?err, %job_id, "Failed to spawn job {job_id}: {err}");
                return Outcome::Crashed {
                    error: format!("Failed to spawn command: {err}"),
                };
            }
        };

        let mut pumps = JoinSet::new();
        if let Some(stdout) = child.stdout.take() {
            pumps.spawn(pump(stdout, open_log(sink).await, self.meter.clone()).in_current_span());
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.spawn(pump(stderr, open_log(sink).await, self.meter.clone()).in_current_span());
        }

        let timeout = Duration::from_millis(timeout_ms).max(MIN_TIMEOUT);
        let outcome = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => Outcome::Exited {
                code: status.code(),
            },
            Ok(Err(err)) => {
                tracing::error!(?err, %job_id, "Failed to wait for job {job_id}: {err}");
                Outcome::Crashed {
                    error: format!("Failed to wait for command: {err}"),
                }
            }
            Err(_elapsed) => {
                tracing::warn!(%job_id, timeout_ms, "Job {job_id} timed out, terminating");
                terminate(&mut child, self.config.kill_grace(), job_id).await;
                Outcome::TimedOut { timeout_ms }
            }
        };

        let drained = tokio::time::timeout(PUMP_DRAIN, async {
            while pumps.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!(%job_id, "Output of job {job_id} still open after exit, detaching");
            pumps.abort_all();
        }
        outcome
    }

    async fn finalize(&self, outcome: Outcome) {
        let job_id = &self.job_id;
        let job = {
            let mut job = self.job.lock().await;
            self.meter.snapshot().apply(&mut job.progress);
            if let Err(err) = job.finish(outcome, Utc::now()) {
                tracing::error!(?err, %job_id, "Failed to finalize job {job_id}: {err}");
                return;
            }
            self.persist(&mut job).await;
            job.clone()
        };
        tracing::info!(%job_id, status = %job.status, exit_code = ?job.exit_code, "Job {job_id} finished");

        let text = completion_text(&job, self.config.preview_budget()).await;
        self.notifier.deliver(&job, &text).await;
        self.notifier.inject(&job, &text).await;

        let mut job = self.job.lock().await;
        if job
            .mark_completion_notified(Utc::now())
            .inspect_err(|err| {
                tracing::error!(?err, %job_id, "Failed to mark job {job_id} as notified: {err}")
            })
            .is_ok()
        {
            self.persist(&mut job).await;
        }
    }

    async fn persist(&self, job: &mut Job) {
        let job_id = &self.job_id;
        let _ = self.backend.save(job).await.inspect_err(|err| {
            tracing::error!(?err, %job_id, "Failed to save job {job_id}: {err}")
        });
    }
}

/// The completion message of a terminal job, with a preview of its output.
pub(crate) async fn completion_text(job: &Job, preview_budget: u64) -> String {
    let preview = match &job.output_file {
        Some(path) => log_sink::preview(path, preview_budget)
            .await
            .unwrap_or_else(|err| {
                let job_id = &job.id;
                tracing::warn!(?err, %job_id, "Failed to read output of job {job_id}: {err}");
                String::new()
            }),
        None => String::new(),
    };
    message::completion(job, &preview)
}

fn spawn(command: &str, workdir: Option<&Path>) -> std::io::Result<Child> {
    let mut command = shell_command(command);
    if let Some(workdir) = workdir {
        command.current_dir(workdir);
    }
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);
    command.spawn()
}

#[cfg(unix)]
fn shell_command(command: &str) -> Command {
    let mut shell = Command::new("sh");
    shell.arg("-c").arg(command);
    shell
}

#[cfg(not(unix))]
fn shell_command(command: &str) -> Command {
    let mut shell = Command::new("cmd");
    shell.arg("/C").arg(command);
    shell
}

async fn open_log(sink: &LogSink) -> Option<File> {
    sink.open_append()
        .await
        .inspect_err(|err| {
            let path = sink.path().display();
            tracing::error!(?err, "Failed to open {path} for append, output is only counted: {err}")
        })
        .ok()
}

/// Copies one output stream into the log, counting as it goes.
///
/// Reading continues after a failed write so the process never blocks on a full pipe.
async fn pump(mut reader: impl AsyncRead + Unpin, mut file: Option<File>, meter: Arc<OutputMeter>) {
    let mut buffer = vec![0; CHUNK_SIZE];
    loop {
        let read = match reader.read(&mut buffer).await {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) => {
                tracing::warn!(?err, "Failed to read command output: {err}");
                break;
            }
        };
        let chunk = &buffer[..read];
        if let Some(log) = file.as_mut() {
            if let Err(err) = log.write_all(chunk).await {
                tracing::error!(?err, "Failed to append command output: {err}");
                file = None;
            }
        }
        meter.record(chunk);
    }
    if let Some(mut log) = file {
        let _ = log.flush().await;
    }
}

/// Graceful termination, then a forced kill once `grace` has passed.
async fn terminate(child: &mut Child, grace: Duration, job_id: &JobId) {
    let pid = child.id();
    if !signal_process_group(pid, false) {
        let _ = child.start_kill();
    }
    if tokio::time::timeout(grace, child.wait()).await.is_ok() {
        return;
    }
    tracing::warn!(%job_id, "Job {job_id} ignored termination, killing");
    signal_process_group(pid, true);
    let _ = child.start_kill();
    let _ = child.wait().await;
}

#[cfg(unix)]
fn signal_process_group(pid: Option<u32>, force: bool) -> bool {
    use nix::{
        sys::signal::{killpg, Signal},
        unistd::Pid,
    };

    let Some(pid) = pid.and_then(|pid| i32::try_from(pid).ok()) else {
        return false;
    };
    let signal = if force {
        Signal::SIGKILL
    } else {
        Signal::SIGTERM
    };
    killpg(Pid::from_raw(pid), signal)
        .inspect_err(|err| {
            tracing::debug!(?err, pid, "Failed to send {signal:?} to process group {pid}: {err}")
        })
        .is_ok()
}

#[cfg(not(unix))]
fn signal_process_group(_pid: Option<u32>, _force: bool) -> bool {
    false
}

#[cfg(all(test, unix))]
mod tests {
    use assert_matches::assert_matches;

    use crate::{
        backend::memory::InMemoryBackend,
        job::JobStatus,
        testing::{wait_for_completion_notified, RecordingOutbox, ScriptedAgent},
    };

    use super::*;

    struct Fixture {
        backend: InMemoryBackend,
        outbox: RecordingOutbox,
        agent: ScriptedAgent,
        config: Arc<SchedulerConfig>,
        _logs: tempfile::TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let logs = tempfile::tempdir().unwrap();
            let config = SchedulerConfig::new(logs.path()).with_kill_grace(Duration::from_millis(300));
            Self {
                backend: InMemoryBackend::new(),
                outbox: RecordingOutbox::new(),
                agent: ScriptedAgent::replying("noted"),
                config: Arc::new(config),
                _logs: logs,
            }
        }

        fn notifier(&self) -> Notifier {
            Notifier::new(self.outbox.clone()).with_agent(self.agent.clone())
        }

        async fn run(&self, mut job: Job) -> Job {
            job.channel = Some("cli".to_owned());
            job.user_id = Some("tester".to_owned());
            let id = self.backend.enqueue(job.clone()).await.unwrap();
            start(self.backend.clone(), self.notifier(), self.config.clone(), job)
                .await
                .unwrap();
            wait_for_completion_notified(&self.backend, &id, Duration::from_secs(10))
                .await
                .expect("job should finish and notify")
        }
    }

    #[tokio::test]
    async fn completes_and_logs_both_streams() {
        let fixture = Fixture::new();
        let job = fixture.run(Job::new("echo out; echo err >&2")).await;

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.exit_code, Some(0));
        assert_eq!(job.progress.total_lines, 2);
        assert_eq!(job.progress.total_bytes, 8);
        let log = tokio::fs::read_to_string(job.output_file.as_ref().unwrap())
            .await
            .unwrap();
        assert!(log.starts_with(&format!("# job {}\n", job.id)));
        assert!(log.contains("out\n"));
        assert!(log.contains("err\n"));
    }

    #[tokio::test]
    async fn sends_started_then_one_completion() {
        let fixture = Fixture::new();
        let job = fixture.run(Job::new("true")).await;

        let messages = fixture.outbox.messages_containing(job.id.as_str());
        assert_eq!(messages.len(), 2);
        assert!(messages[0].text.contains(&format!("> Job {} started", job.id)));
        assert!(messages[1].text.contains(&format!("> Job {} completed", job.id)));
        assert!(messages[1].text.starts_with("noted"));

        let injected = fixture.agent.injected();
        assert_eq!(injected.len(), 1);
        assert!(injected[0].1.starts_with(&format!("Job {} completed", job.id)));
    }

    #[tokio::test]
    async fn non_zero_exit_fails() {
        let fixture = Fixture::new();
        let job = fixture.run(Job::new("exit 3")).await;

        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.exit_code, Some(3));
        assert_eq!(job.error.as_deref(), Some("Exited with code 3"));
    }

    #[tokio::test]
    async fn killed_by_signal_fails_without_exit_code() {
        let fixture = Fixture::new();
        let job = fixture.run(Job::new("kill -9 $$")).await;

        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.exit_code, None);
        assert_eq!(job.error.as_deref(), Some("terminated by signal"));
    }

    #[tokio::test]
    async fn runs_in_workdir() {
        let fixture = Fixture::new();
        let dir = tempfile::tempdir().unwrap();
        let mut job = Job::new("pwd");
        job.workdir = Some(dir.path().to_path_buf());

        let job = fixture.run(job).await;

        let log = tokio::fs::read_to_string(job.output_file.as_ref().unwrap())
            .await
            .unwrap();
        let expected = dir.path().canonicalize().unwrap();
        assert!(log.contains(expected.to_str().unwrap()));
    }

    #[tokio::test]
    async fn missing_workdir_fails_and_still_notifies() {
        let fixture = Fixture::new();
        let mut job = Job::new("true");
        job.workdir = Some("/definitely/not/here".into());

        let job = fixture.run(job).await;

        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.exit_code, None);
        assert_matches!(job.error.as_deref(), Some(error) if error.starts_with("Failed to spawn command"));
        assert!(job.completion_notified_at.is_some());
        assert_eq!(fixture.outbox.messages_containing("failed").len(), 1);
    }

    #[tokio::test]
    async fn timeout_escalates_to_kill() {
        let fixture = Fixture::new();
        let mut job = Job::new("trap '' TERM; sleep 30");
        job.timeout_ms = Some(200);
        let started = tokio::time::Instant::now();

        let job = fixture.run(job).await;

        assert_eq!(job.status, JobStatus::Timeout);
        assert_eq!(job.exit_code, None);
        assert_eq!(job.error.as_deref(), Some("Timed out after 200ms"));
        // 1000ms floor plus 300ms grace
        assert!(started.elapsed() >= MIN_TIMEOUT);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn background_grandchild_does_not_pin_the_worker() {
        let fixture = Fixture::new();
        let started = tokio::time::Instant::now();

        let job = fixture.run(Job::new("sleep 30 & echo spawned")).await;

        assert_eq!(job.status, JobStatus::Completed);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    /// Accepts enqueues but refuses every save.
    #[derive(Clone, Default)]
    struct ReadOnlyBackend(InMemoryBackend);

    #[async_trait::async_trait]
    impl Backend for ReadOnlyBackend {
        async fn list_jobs(&self) -> Result<Vec<Job>, BackendError> {
            self.0.list_jobs().await
        }

        async fn load(&self, id: &JobId) -> Result<Option<Job>, BackendError> {
            self.0.load(id).await
        }

        async fn save(&self, _job: &mut Job) -> Result<(), BackendError> {
            Err(BackendError::BadState)
        }

        async fn enqueue(&self, job: Job) -> Result<JobId, BackendError> {
            self.0.enqueue(job).await
        }
    }

    #[tokio::test]
    async fn failed_save_leaves_the_job_queued_without_a_log() {
        let fixture = Fixture::new();
        let backend = ReadOnlyBackend::default();
        let job = Job::new("echo never");
        let id = backend.enqueue(job.clone()).await.unwrap();

        let result = start(
            backend.clone(),
            fixture.notifier(),
            fixture.config.clone(),
            job,
        )
        .await;

        assert_matches!(result, Err(WorkerError::Backend(BackendError::BadState)));
        let stored = backend.load(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Queued);
        assert!(!fixture.config.default_output_file(&id).exists());
        assert!(fixture.outbox.messages().is_empty());
    }

    #[tokio::test]
    async fn start_rejects_a_job_that_is_not_queued() {
        let fixture = Fixture::new();
        let job = Job::new("true").with_status(JobStatus::Completed);

        let result = start(
            fixture.backend.clone(),
            fixture.notifier(),
            fixture.config.clone(),
            job,
        )
        .await;

        assert_matches!(result, Err(WorkerError::Transition(_)));
    }
}
