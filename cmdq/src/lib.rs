//! A durable, bounded concurrency queue for background shell commands.
//!
//! Jobs are persisted through a [`backend::Backend`], admitted by a periodic
//! [`scheduler::Scheduler`] tick, and each run by a worker that streams the command's output into
//! a per job log, enforces its timeout, and reports progress and completion through a
//! [`notifier::Notifier`]. After a restart, [`recovery::recover`] resolves jobs the previous
//! process left running.
//!
//! ```
//! # use cmdq::prelude::*;
//! # use std::time::Duration;
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! use cmdq::backend::memory::InMemoryBackend;
//! use cmdq::notifier::TracingOutbox;
//!
//! let backend = InMemoryBackend::new();
//! let notifier = Notifier::new(TracingOutbox);
//! recover(&backend, &notifier).await.unwrap();
//!
//! let logs = std::env::temp_dir().join("cmdq-doc-logs");
//! let scheduler = Scheduler::new(backend.clone(), notifier, SchedulerConfig::new(logs));
//! let job_id = JobBuilder::new("echo hello")
//!     .enqueue_to_backend(&backend)
//!     .await
//!     .unwrap();
//!
//! scheduler.tick().await;
//! scheduler.shutdown().await;
//!
//! let job = backend.load(&job_id).await.unwrap().unwrap();
//! assert_eq!(job.status, JobStatus::Completed);
//! # });
//! ```
use thiserror::Error;

pub mod backend;
pub mod config;
pub mod job;
pub mod log_sink;
pub mod notifier;
pub mod prelude;
pub mod progress;
pub mod recovery;
pub mod scheduler;
pub mod testing;
mod worker;

use backend::BackendError;

#[derive(Debug, Error)]
pub enum CmdqError {
    #[error("Error communicating with the backend")]
    Backend(#[from] BackendError),
}
