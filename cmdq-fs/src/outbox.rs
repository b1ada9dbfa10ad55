use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cmdq::notifier::{CollaboratorError, Outbox, OutboxHandle};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::atomic;

/// One message waiting in a [`SpoolOutbox`] directory.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpooledMessage {
    pub channel: String,
    #[serde(rename = "userID")]
    pub user_id: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

/// An [`Outbox`] that spools each message to `<dir>/<handle>.json`.
///
/// Whatever delivers the messages owns the directory from there on: it reads the files and
/// deletes them once sent. Nothing here removes a spooled message.
#[derive(Debug, Clone)]
pub struct SpoolOutbox {
    dir: Arc<PathBuf>,
}

impl SpoolOutbox {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Arc::new(dir.into()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Messages currently in the spool, oldest first.
    pub async fn spooled(&self) -> Result<Vec<(OutboxHandle, SpooledMessage)>, CollaboratorError> {
        let mut entries = match fs::read_dir(self.dir()).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut messages = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            if atomic::is_hidden(stem) || path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }
            let message: SpooledMessage = serde_json::from_slice(&fs::read(&path).await?)?;
            messages.push((OutboxHandle::from(stem.to_owned()), message));
        }
        messages.sort_by_key(|(_, message)| message.created_at);
        Ok(messages)
    }
}

#[async_trait]
impl Outbox for SpoolOutbox {
    async fn enqueue(
        &self,
        channel: &str,
        user_id: &str,
        text: &str,
    ) -> Result<OutboxHandle, CollaboratorError> {
        let handle = OutboxHandle::generate();
        let message = SpooledMessage {
            channel: channel.to_owned(),
            user_id: user_id.to_owned(),
            text: text.to_owned(),
            created_at: Utc::now(),
        };
        let path = self.dir.join(format!("{handle}.json"));
        atomic::write_atomic(&path, &serde_json::to_vec_pretty(&message)?).await?;
        tracing::debug!(%handle, channel, user_id, "Spooled message {handle}");
        Ok(handle)
    }
}
