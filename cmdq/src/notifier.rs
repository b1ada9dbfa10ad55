//! Delivery of progress and completion messages.
//!
//! The scheduler never talks to chat channels directly. It hands raw event text to a
//! [`Notifier`], which:
//!
//! 1. optionally asks the conversational [`Agent`] for a short comment on the event,
//! 2. assembles the final message (comment first, raw event quoted verbatim below it), and
//! 3. enqueues it on the [`Outbox`] for the job's channel and user.
//!
//! Every step is best-effort. Failures are logged and never propagate into job state. The
//! returned [`Delivery`] records which path was taken so callers and tests can observe a
//! fallback.
use std::{
    fmt::Display,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;

use crate::job::Job;

pub mod message;

/// Text used in place of the agent's comment when none could be obtained.
pub const FEEDBACK_PLACEHOLDER: &str = "(no additional comment)";

const ENRICHMENT_PROMPT: &str =
    "A background command you started has an update. Write one or two short sentences for the user about it.";

static OUTBOX_HANDLE_COUNTER: AtomicU64 = AtomicU64::new(1);

/// The conversational agent collaborator.
#[async_trait]
pub trait Agent: Send + Sync {
    /// One-shot request/response call. No state is assumed to survive between calls.
    async fn ask(&self, channel: &str, user_id: &str, text: &str)
        -> Result<String, CollaboratorError>;

    /// Inserts text into an ongoing session without expecting a reply.
    async fn inject_context(
        &self,
        session_id: Option<&str>,
        text: &str,
    ) -> Result<(), CollaboratorError>;
}

/// The outbound message queue collaborator.
///
/// Delivery is at-least-once and asynchronous; a successful call only means the message was
/// accepted.
#[async_trait]
pub trait Outbox: Send + Sync {
    async fn enqueue(
        &self,
        channel: &str,
        user_id: &str,
        text: &str,
    ) -> Result<OutboxHandle, CollaboratorError>;
}

#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("Collaborator call failed: {0}")]
    Failed(String),
    #[error("I/O error talking to collaborator")]
    Io(#[from] std::io::Error),
    #[error("Error encoding collaborator payload")]
    Encode(#[from] serde_json::Error),
}

/// Opaque receipt returned by [`Outbox::enqueue`].
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct OutboxHandle(String);

impl OutboxHandle {
    /// A time-derived handle for outboxes that do not have their own ids.
    pub fn generate() -> Self {
        let now = Utc::now().timestamp_millis();
        let suffix = OUTBOX_HANDLE_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("msg-{now}-{suffix:04}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for OutboxHandle {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl Display for OutboxHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where the comment in a delivered message came from.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Feedback {
    Agent(String),
    /// No agent configured, no recipient to ask on behalf of, an empty reply, or a failed call.
    Placeholder,
}

/// The observable result of [`Notifier::deliver`].
#[derive(Debug, Clone)]
pub struct Delivery {
    pub feedback: Feedback,
    /// `None` when the job has no recipient or the outbox refused the message.
    pub handle: Option<OutboxHandle>,
    pub message: String,
}

impl Delivery {
    pub fn fell_back(&self) -> bool {
        self.feedback == Feedback::Placeholder
    }

    pub fn enqueued(&self) -> bool {
        self.handle.is_some()
    }
}

/// Composes and delivers notifications for jobs.
#[derive(Clone)]
pub struct Notifier {
    outbox: Arc<dyn Outbox>,
    agent: Option<Arc<dyn Agent>>,
    enrich: bool,
}

impl Notifier {
    pub fn new(outbox: impl Outbox + 'static) -> Self {
        Self {
            outbox: Arc::new(outbox),
            agent: None,
            enrich: true,
        }
    }

    /// Attach the agent used for feedback enrichment and context injection.
    pub fn with_agent(self, agent: impl Agent + 'static) -> Self {
        Self {
            agent: Some(Arc::new(agent)),
            ..self
        }
    }

    /// Keep injecting context into the agent session but stop asking it for comments.
    pub fn without_enrichment(self) -> Self {
        Self {
            enrich: false,
            ..self
        }
    }

    /// Delivers `event` to the job's recipient.
    pub async fn deliver(&self, job: &Job, event: &str) -> Delivery {
        let job_id = &job.id;
        let Some((channel, user_id)) = job.recipient() else {
            tracing::debug!(%job_id, "Job {job_id} has no recipient, skipping delivery");
            return Delivery {
                feedback: Feedback::Placeholder,
                handle: None,
                message: compose(&Feedback::Placeholder, event),
            };
        };

        let feedback = self.feedback(job, channel, user_id, event).await;
        let message = compose(&feedback, event);
        let handle = self
            .outbox
            .enqueue(channel, user_id, &message)
            .await
            .inspect_err(|err| {
                tracing::error!(
                    ?err,
                    %job_id,
                    channel,
                    "Failed to enqueue notification for job {job_id}: {err}"
                )
            })
            .ok();

        Delivery {
            feedback,
            handle,
            message,
        }
    }

    /// Pushes text into the job's originating session, returning whether it was accepted.
    pub async fn inject(&self, job: &Job, text: &str) -> bool {
        let job_id = &job.id;
        let Some(agent) = &self.agent else {
            tracing::debug!(%job_id, "No agent configured, not injecting context for job {job_id}");
            return false;
        };
        agent
            .inject_context(job.session_id.as_deref(), text)
            .await
            .inspect_err(|err| {
                tracing::error!(
                    ?err,
                    %job_id,
                    "Failed to inject context for job {job_id}: {err}"
                )
            })
            .is_ok()
    }

    async fn feedback(&self, job: &Job, channel: &str, user_id: &str, event: &str) -> Feedback {
        let job_id = &job.id;
        let agent = match (&self.agent, self.enrich) {
            (Some(agent), true) => agent,
            _ => return Feedback::Placeholder,
        };
        let prompt = format!("{ENRICHMENT_PROMPT}\n\n{event}");
        match agent.ask(channel, user_id, &prompt).await {
            Ok(reply) if !reply.trim().is_empty() => Feedback::Agent(reply.trim().to_owned()),
            Ok(_) => {
                tracing::warn!(%job_id, "Agent returned an empty comment for job {job_id}");
                Feedback::Placeholder
            }
            Err(err) => {
                tracing::warn!(
                    ?err,
                    %job_id,
                    "Feedback enrichment for job {job_id} failed, using placeholder: {err}"
                );
                Feedback::Placeholder
            }
        }
    }
}

/// Comment first, then the raw event quoted line by line.
fn compose(feedback: &Feedback, event: &str) -> String {
    let comment = match feedback {
        Feedback::Agent(reply) => reply.as_str(),
        Feedback::Placeholder => FEEDBACK_PLACEHOLDER,
    };
    let quoted: Vec<String> = event
        .lines()
        .map(|line| {
            if line.is_empty() {
                ">".to_owned()
            } else {
                format!("> {line}")
            }
        })
        .collect();
    format!("{comment}\n\n{}", quoted.join("\n"))
}

/// An [`Outbox`] that only logs messages.
///
/// Useful when no delivery channel is wired up yet.
#[derive(Debug, Clone, Default)]
pub struct TracingOutbox;

#[async_trait]
impl Outbox for TracingOutbox {
    async fn enqueue(
        &self,
        channel: &str,
        user_id: &str,
        text: &str,
    ) -> Result<OutboxHandle, CollaboratorError> {
        let handle = OutboxHandle::generate();
        tracing::info!(%handle, channel, user_id, "Outbound message:\n{text}");
        Ok(handle)
    }
}
