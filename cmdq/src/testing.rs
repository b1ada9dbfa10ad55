//! Helpers for testing.
//!
//! Test doubles for the [`Outbox`] and [`Agent`] collaborators that record every call, and
//! polling helpers for waiting on jobs that are driven by background workers.
#![allow(unused)]
use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;

use crate::{
    backend::Backend,
    job::{Job, JobId, JobStatus},
    notifier::{Agent, CollaboratorError, Outbox, OutboxHandle},
};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// One message accepted by a [`RecordingOutbox`].
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct OutboundMessage {
    pub channel: String,
    pub user_id: String,
    pub text: String,
    pub handle: OutboxHandle,
}

/// An [`Outbox`] that keeps every message in memory.
///
/// Clones share the same recording, so keep one clone for assertions and hand the other to the
/// [`crate::notifier::Notifier`].
///
/// # Example
///
/// ```
/// # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
/// use cmdq::notifier::Outbox;
/// use cmdq::testing::RecordingOutbox;
///
/// let outbox = RecordingOutbox::new();
/// outbox.enqueue("telegram", "42", "hello").await.unwrap();
///
/// let messages = outbox.messages_for("telegram", "42");
/// assert_eq!(messages.len(), 1);
/// assert_eq!(messages[0].text, "hello");
/// # });
/// ```
#[derive(Debug, Clone, Default)]
pub struct RecordingOutbox {
    messages: Arc<Mutex<Vec<OutboundMessage>>>,
    failing: bool,
}

impl RecordingOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// An outbox that refuses every message.
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    pub fn messages(&self) -> Vec<OutboundMessage> {
        lock(&self.messages).clone()
    }

    pub fn messages_for(&self, channel: &str, user_id: &str) -> Vec<OutboundMessage> {
        lock(&self.messages)
            .iter()
            .filter(|message| message.channel == channel && message.user_id == user_id)
            .cloned()
            .collect()
    }

    /// Messages whose text mentions `needle`, typically a job id.
    pub fn messages_containing(&self, needle: &str) -> Vec<OutboundMessage> {
        lock(&self.messages)
            .iter()
            .filter(|message| message.text.contains(needle))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Outbox for RecordingOutbox {
    async fn enqueue(
        &self,
        channel: &str,
        user_id: &str,
        text: &str,
    ) -> Result<OutboxHandle, CollaboratorError> {
        if self.failing {
            return Err(CollaboratorError::Failed("outbox unavailable".to_owned()));
        }
        let handle = OutboxHandle::generate();
        lock(&self.messages).push(OutboundMessage {
            channel: channel.to_owned(),
            user_id: user_id.to_owned(),
            text: text.to_owned(),
            handle: handle.clone(),
        });
        Ok(handle)
    }
}

/// An [`Agent`] with a fixed reply that records what it was asked and told.
#[derive(Debug, Clone, Default)]
pub struct ScriptedAgent {
    reply: Option<String>,
    asked: Arc<Mutex<Vec<String>>>,
    injected: Arc<Mutex<Vec<(Option<String>, String)>>>,
}

impl ScriptedAgent {
    pub fn replying(reply: impl Into<String>) -> Self {
        Self {
            reply: Some(reply.into()),
            ..Self::default()
        }
    }

    /// An agent whose every call fails.
    pub fn failing() -> Self {
        Self::default()
    }

    /// Prompts passed to [`Agent::ask`], in call order.
    pub fn asked(&self) -> Vec<String> {
        lock(&self.asked).clone()
    }

    /// `(session_id, text)` pairs passed to [`Agent::inject_context`], in call order.
    pub fn injected(&self) -> Vec<(Option<String>, String)> {
        lock(&self.injected).clone()
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    async fn ask(
        &self,
        _channel: &str,
        _user_id: &str,
        text: &str,
    ) -> Result<String, CollaboratorError> {
        lock(&self.asked).push(text.to_owned());
        self.reply
            .clone()
            .ok_or_else(|| CollaboratorError::Failed("agent unavailable".to_owned()))
    }

    async fn inject_context(
        &self,
        session_id: Option<&str>,
        text: &str,
    ) -> Result<(), CollaboratorError> {
        if self.reply.is_none() {
            return Err(CollaboratorError::Failed("agent unavailable".to_owned()));
        }
        lock(&self.injected).push((session_id.map(str::to_owned), text.to_owned()));
        Ok(())
    }
}

/// Polls the backend until the job reaches `status`, returning the job, or `None` on timeout.
pub async fn wait_for_status<B: Backend>(
    backend: &B,
    id: &JobId,
    status: JobStatus,
    timeout: Duration,
) -> Option<Job> {
    wait_for(backend, id, timeout, |job| job.status == status).await
}

/// Polls the backend until the job's completion notification has been recorded.
pub async fn wait_for_completion_notified<B: Backend>(
    backend: &B,
    id: &JobId,
    timeout: Duration,
) -> Option<Job> {
    wait_for(backend, id, timeout, |job| job.completion_notified_at.is_some()).await
}

async fn wait_for<B: Backend>(
    backend: &B,
    id: &JobId,
    timeout: Duration,
    done: impl Fn(&Job) -> bool,
) -> Option<Job> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Ok(Some(job)) = backend.load(id).await {
            if done(&job) {
                return Some(job);
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
