//! Outbound messaging.

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::info;

use crate::error::EngineError;
use crate::invitation::OutboundMessage;

/// Delivers messages to other participants.
#[async_trait]
pub trait Messenger: Send + Sync {
  async fn send_message(&self, message: OutboundMessage) -> Result<(), EngineError>;
}

/// Writes each message as `{dir}/{uuid}.json` for an external transport to
/// pick up.
#[derive(Debug, Clone)]
pub struct FsOutbox {
  dir: PathBuf,
}

impl FsOutbox {
  pub fn new(dir: impl Into<PathBuf>) -> Self {
    Self { dir: dir.into() }
  }

  pub fn dir(&self) -> &PathBuf {
    &self.dir
  }
}

#[async_trait]
impl Messenger for FsOutbox {
  async fn send_message(&self, message: OutboundMessage) -> Result<(), EngineError> {
    let data = serde_json::to_vec_pretty(&message).map_err(|e| EngineError::Messaging(e.to_string()))?;
    tokio::fs::create_dir_all(&self.dir)
      .await
      .map_err(|e| EngineError::Messaging(e.to_string()))?;

    let path = self.dir.join(format!("{}.json", uuid::Uuid::new_v4()));
    tokio::fs::write(&path, data)
      .await
      .map_err(|e| EngineError::Messaging(e.to_string()))?;

    info!(
      path = %path.display(),
      recipients = ?message.recipients,
      subject = %message.subject,
      "message queued"
    );
    Ok(())
  }
}
