use std::{path::PathBuf, time::Duration};

use anyhow::Context;
use clap::Parser;
use cmdq::{
    config::SchedulerConfig,
    notifier::{Notifier, TracingOutbox},
    recovery::recover,
    scheduler::Scheduler,
};
use cmdq_fs::{FileBackend, SpoolOutbox};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Runs queued shell commands from a queue directory.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Directory holding one `<id>.json` descriptor per job.
    #[arg(long, env = "CMDQ_QUEUE_DIR")]
    queue_dir: PathBuf,

    /// Where job output files are written. Defaults to `<queue-dir>/logs`.
    #[arg(long, env = "CMDQ_LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// Spool outbound messages here instead of only logging them.
    #[arg(long, env = "CMDQ_OUTBOX_DIR")]
    outbox_dir: Option<PathBuf>,

    #[arg(long, env = "CMDQ_MAX_CONCURRENCY", default_value_t = 2)]
    max_concurrency: usize,

    #[arg(long, env = "CMDQ_REPORT_INTERVAL_MS", default_value_t = 60_000)]
    report_interval_ms: u64,

    /// Applies to jobs enqueued without `timeoutMs`.
    #[arg(long, env = "CMDQ_DEFAULT_TIMEOUT_MS", default_value_t = 1_800_000)]
    default_timeout_ms: u64,

    #[arg(long, env = "CMDQ_TICK_INTERVAL_MS", default_value_t = 1000)]
    tick_interval_ms: u64,
}

impl Args {
    fn scheduler_config(&self) -> SchedulerConfig {
        let log_dir = self
            .log_dir
            .clone()
            .unwrap_or_else(|| self.queue_dir.join("logs"));
        SchedulerConfig::new(log_dir)
            .with_max_concurrency(self.max_concurrency)
            .with_report_interval(Duration::from_millis(self.report_interval_ms))
            .with_default_timeout(Duration::from_millis(self.default_timeout_ms))
            .with_tick_interval(Duration::from_millis(self.tick_interval_ms))
    }

    fn notifier(&self) -> Notifier {
        match &self.outbox_dir {
            Some(dir) => Notifier::new(SpoolOutbox::new(dir)),
            None => Notifier::new(TracingOutbox),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let backend = FileBackend::open(&args.queue_dir)
        .await
        .with_context(|| format!("failed to open queue dir {}", args.queue_dir.display()))?;
    let notifier = args.notifier();
    let config = args.scheduler_config();

    let report = recover(&backend, &notifier)
        .await
        .context("failed to recover jobs from the previous run")?;
    if !report.is_empty() {
        tracing::warn!(
            orphaned = ?report.orphaned,
            renotified = ?report.renotified,
            "Recovered jobs left by the previous run"
        );
    }

    tracing::info!(
        queue_dir = %args.queue_dir.display(),
        log_dir = %config.log_dir().display(),
        max_concurrency = config.max_concurrency(),
        "Starting cmdq scheduler"
    );
    let scheduler = Scheduler::new(backend, notifier, config);
    let cancellation_token = CancellationToken::new();
    let ticker = scheduler.spawn(cancellation_token.clone());

    shutdown_signal().await?;
    tracing::info!("Shutdown requested, waiting for running jobs");
    cancellation_token.cancel();
    ticker.await.context("scheduler task failed")?;
    scheduler.shutdown().await;
    tracing::info!("Scheduler stopped");
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("failed to listen for Ctrl-C")?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> anyhow::Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")
}
