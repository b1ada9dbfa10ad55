//! The purpose of this module is to alleviate the need to import many of the `[cmdq]` types.
//!
//! ```
//! # #![allow(unused_imports)]
//! use cmdq::prelude::*;
//! ```
pub use crate::backend::{Backend, BackendError};
pub use crate::config::SchedulerConfig;
pub use crate::job::builder::JobBuilder;
pub use crate::job::{Job, JobId, JobStatus};
pub use crate::notifier::{Agent, Delivery, Notifier, Outbox};
pub use crate::recovery::{recover, RecoveryReport};
pub use crate::scheduler::{Scheduler, TickOutcome};
pub use crate::CmdqError;
