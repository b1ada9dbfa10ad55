//! The API for configuring the scheduler.
//!
//! ```
//! # use cmdq::prelude::*;
//! # use std::time::Duration;
//! let config = SchedulerConfig::new("/var/lib/cmdq/logs")
//!     .with_max_concurrency(4)
//!     .with_report_interval(Duration::from_secs(120))
//!     .with_default_timeout(Duration::from_secs(3600));
//! assert_eq!(config.max_concurrency(), 4);
//! ```
use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use crate::job::JobId;

const DEFAULT_MAX_CONCURRENCY: usize = 2;
const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const DEFAULT_KILL_GRACE: Duration = Duration::from_millis(5000);
const DEFAULT_PREVIEW_BUDGET: u64 = 8000;
const DEFAULT_TAIL_BYTES: u64 = 1200;

/// No job is given less than this before it is terminated.
pub const MIN_TIMEOUT: Duration = Duration::from_millis(1000);

/// Configuration for a [`crate::scheduler::Scheduler`] and the workers it starts.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    log_dir: PathBuf,
    max_concurrency: usize,
    tick_interval: Duration,
    report_interval: Duration,
    default_timeout: Duration,
    kill_grace: Duration,
    preview_budget: u64,
    tail_bytes: u64,
}

impl SchedulerConfig {
    /// Construct a config writing job output files into `log_dir`.
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: log_dir.into(),
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            tick_interval: DEFAULT_TICK_INTERVAL,
            report_interval: DEFAULT_REPORT_INTERVAL,
            default_timeout: DEFAULT_TIMEOUT,
            kill_grace: DEFAULT_KILL_GRACE,
            preview_budget: DEFAULT_PREVIEW_BUDGET,
            tail_bytes: DEFAULT_TAIL_BYTES,
        }
    }

    /// The most jobs running at once. Values below one are raised to one.
    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = limit.max(1);
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// How long a running job goes between progress messages.
    pub fn with_report_interval(mut self, interval: Duration) -> Self {
        self.report_interval = interval;
        self
    }

    /// Used for jobs enqueued without a timeout.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Time between the graceful termination signal and the forced kill.
    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    pub fn with_preview_budget(mut self, bytes: u64) -> Self {
        self.preview_budget = bytes;
        self
    }

    pub fn with_tail_bytes(mut self, bytes: u64) -> Self {
        self.tail_bytes = bytes;
        self
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    pub fn tick_interval(&self) -> Duration {
        self.tick_interval
    }

    pub fn report_interval(&self) -> Duration {
        self.report_interval
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub fn kill_grace(&self) -> Duration {
        self.kill_grace
    }

    pub fn preview_budget(&self) -> u64 {
        self.preview_budget
    }

    pub fn tail_bytes(&self) -> u64 {
        self.tail_bytes
    }

    pub(crate) fn default_timeout_ms(&self) -> u64 {
        u64::try_from(self.default_timeout.as_millis()).unwrap_or(u64::MAX)
    }

    /// Where a job without an explicit output file writes its log.
    pub fn default_output_file(&self, id: &JobId) -> PathBuf {
        self.log_dir.join(format!("{id}.log"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = SchedulerConfig::new("/tmp/logs");
        assert_eq!(config.max_concurrency(), 2);
        assert_eq!(config.tick_interval(), Duration::from_secs(1));
        assert_eq!(config.report_interval(), Duration::from_secs(60));
        assert_eq!(config.default_timeout_ms(), 1_800_000);
        assert_eq!(config.kill_grace(), Duration::from_millis(5000));
        assert_eq!(config.preview_budget(), 8000);
        assert_eq!(config.tail_bytes(), 1200);
    }

    #[test]
    fn max_concurrency_is_at_least_one() {
        let config = SchedulerConfig::new("/tmp/logs").with_max_concurrency(0);
        assert_eq!(config.max_concurrency(), 1);
    }

    #[test]
    fn output_file_is_named_after_the_job() {
        let config = SchedulerConfig::new("/tmp/logs");
        assert_eq!(
            config.default_output_file(&JobId::from("job-1-0001")),
            PathBuf::from("/tmp/logs/job-1-0001.log")
        );
    }
}
