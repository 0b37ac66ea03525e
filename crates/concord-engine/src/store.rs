//! Session and invitation persistence.
//!
//! The [`SessionStore`] trait is the persistence boundary of the engine.
//! [`MemorySessionStore`] keeps everything in process (tests, one-shot CLI
//! runs); [`FsSessionStore`] writes one JSON document per record.
//!
//! Session saves are checked against [`Session::revision`]: a save succeeds
//! only when the stored record is the one the caller loaded, so two
//! processes sharing a data directory cannot overwrite each other's newer
//! state.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::warn;

use crate::invitation::InvitationRecord;
use crate::session::Session;

#[derive(Debug, Error)]
pub enum StoreError {
  #[error("session store io error: {0}")]
  Io(#[from] std::io::Error),

  #[error("corrupt session record: {0}")]
  Json(#[from] serde_json::Error),

  #[error("session {session_id} changed concurrently (stored revision {found}, expected {expected})")]
  Conflict {
    session_id: String,
    expected: u64,
    found: u64,
  },

  #[error("timed out waiting for lock {}", .0.display())]
  Locked(PathBuf),
}

/// Refuse a save unless `session` descends from the stored revision.
fn check_revision(stored: Option<u64>, session: &Session) -> Result<(), StoreError> {
  match stored {
    Some(found) if found + 1 != session.revision => Err(StoreError::Conflict {
      session_id: session.session_id.clone(),
      expected: session.revision.saturating_sub(1),
      found,
    }),
    _ => Ok(()),
  }
}

#[async_trait]
pub trait SessionStore: Send + Sync {
  async fn load_session(&self, session_id: &str) -> Result<Option<Session>, StoreError>;

  /// Save `session`, whose `revision` must be one above the stored record's.
  /// Returns [`StoreError::Conflict`] otherwise.
  async fn save_session(&self, session: &Session) -> Result<(), StoreError>;

  async fn list_sessions(&self) -> Result<Vec<Session>, StoreError>;

  async fn load_invitation(&self, session_id: &str) -> Result<Option<InvitationRecord>, StoreError>;

  async fn save_invitation(&self, record: &InvitationRecord) -> Result<(), StoreError>;

  async fn list_invitations(&self) -> Result<Vec<InvitationRecord>, StoreError>;
}

/// A session store that lives in memory.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
  sessions: RwLock<HashMap<String, Session>>,
  invitations: RwLock<HashMap<String, InvitationRecord>>,
}

impl MemorySessionStore {
  pub fn new() -> Self {
    Self::default()
  }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
  async fn load_session(&self, session_id: &str) -> Result<Option<Session>, StoreError> {
    Ok(self.sessions.read().await.get(session_id).cloned())
  }

  async fn save_session(&self, session: &Session) -> Result<(), StoreError> {
    let mut sessions = self.sessions.write().await;
    check_revision(sessions.get(&session.session_id).map(|s| s.revision), session)?;
    sessions.insert(session.session_id.clone(), session.clone());
    Ok(())
  }

  async fn list_sessions(&self) -> Result<Vec<Session>, StoreError> {
    let mut sessions: Vec<Session> = self.sessions.read().await.values().cloned().collect();
    sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    Ok(sessions)
  }

  async fn load_invitation(&self, session_id: &str) -> Result<Option<InvitationRecord>, StoreError> {
    Ok(self.invitations.read().await.get(session_id).cloned())
  }

  async fn save_invitation(&self, record: &InvitationRecord) -> Result<(), StoreError> {
    self
      .invitations
      .write()
      .await
      .insert(record.invitation.session_id.clone(), record.clone());
    Ok(())
  }

  async fn list_invitations(&self) -> Result<Vec<InvitationRecord>, StoreError> {
    let mut records: Vec<InvitationRecord> =
      self.invitations.read().await.values().cloned().collect();
    records.sort_by(|a, b| a.received_at.cmp(&b.received_at));
    Ok(records)
  }
}

/// Stores records as `{root}/sessions/{id}.json` and
/// `{root}/invitations/{id}.json`.
#[derive(Debug, Clone)]
pub struct FsSessionStore {
  root: PathBuf,
}

impl FsSessionStore {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self { root: root.into() }
  }

  /// Ids are percent-encoded into a single path segment, so distinct ids
  /// never share a file.
  fn record_path(&self, kind: &str, id: &str) -> PathBuf {
    let mut name = String::with_capacity(id.len());
    for byte in id.bytes() {
      if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.') {
        name.push(byte as char);
      } else {
        name.push_str(&format!("%{byte:02X}"));
      }
    }
    self.root.join(kind).join(format!("{name}.json"))
  }

  async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    match tokio::fs::read(path).await {
      Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
      Err(e) => Err(e.into()),
    }
  }

  async fn write_json<T: serde::Serialize + Sync>(path: &Path, value: &T) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
      tokio::fs::create_dir_all(parent).await?;
    }
    let data = serde_json::to_vec_pretty(value)?;
    let staging = path.with_extension("json.partial");
    tokio::fs::write(&staging, data).await?;
    tokio::fs::rename(&staging, path).await?;
    Ok(())
  }

  async fn read_all<T: serde::de::DeserializeOwned>(&self, kind: &str) -> Result<Vec<T>, StoreError> {
    let mut entries = match tokio::fs::read_dir(self.root.join(kind)).await {
      Ok(entries) => entries,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
      Err(e) => return Err(e.into()),
    };

    let mut records = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
      let path = entry.path();
      if path.extension().is_some_and(|ext| ext == "json")
        && let Some(record) = Self::read_json(&path).await?
      {
        records.push(record);
      }
    }
    Ok(records)
  }
}

#[derive(serde::Deserialize)]
struct StoredRevision {
  #[serde(default)]
  revision: u64,
}

const LOCK_WAIT: Duration = Duration::from_secs(10);
const LOCK_RETRY: Duration = Duration::from_millis(20);
/// A lock older than this was left behind by a process that died mid-save.
const LOCK_STALE_AFTER: Duration = Duration::from_secs(30);

/// Exclusive `{record}.lock` file held across the read-compare-write of a
/// save. Other processes sharing the directory wait for it.
struct SaveLock {
  path: PathBuf,
}

impl SaveLock {
  async fn acquire(record: &Path) -> Result<Self, StoreError> {
    let path = record.with_extension("json.lock");
    if let Some(parent) = path.parent() {
      tokio::fs::create_dir_all(parent).await?;
    }

    let started = Instant::now();
    loop {
      let attempt = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
        .await;
      match attempt {
        Ok(_) => return Ok(Self { path }),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
          if Self::is_stale(&path).await {
            warn!(path = %path.display(), "removing stale session lock");
            let _ = tokio::fs::remove_file(&path).await;
            continue;
          }
          if started.elapsed() >= LOCK_WAIT {
            return Err(StoreError::Locked(path));
          }
          tokio::time::sleep(LOCK_RETRY).await;
        }
        Err(e) => return Err(e.into()),
      }
    }
  }

  async fn is_stale(path: &Path) -> bool {
    tokio::fs::metadata(path)
      .await
      .ok()
      .and_then(|meta| meta.modified().ok())
      .and_then(|modified| modified.elapsed().ok())
      .is_some_and(|age| age >= LOCK_STALE_AFTER)
  }
}

impl Drop for SaveLock {
  fn drop(&mut self) {
    let _ = std::fs::remove_file(&self.path);
  }
}

#[async_trait]
impl SessionStore for FsSessionStore {
  async fn load_session(&self, session_id: &str) -> Result<Option<Session>, StoreError> {
    Self::read_json(&self.record_path("sessions", session_id)).await
  }

  async fn save_session(&self, session: &Session) -> Result<(), StoreError> {
    let path = self.record_path("sessions", &session.session_id);
    let _lock = SaveLock::acquire(&path).await?;
    let stored: Option<StoredRevision> = Self::read_json(&path).await?;
    check_revision(stored.map(|r| r.revision), session)?;
    Self::write_json(&path, session).await
  }

  async fn list_sessions(&self) -> Result<Vec<Session>, StoreError> {
    let mut sessions: Vec<Session> = self.read_all("sessions").await?;
    sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    Ok(sessions)
  }

  async fn load_invitation(&self, session_id: &str) -> Result<Option<InvitationRecord>, StoreError> {
    Self::read_json(&self.record_path("invitations", session_id)).await
  }

  async fn save_invitation(&self, record: &InvitationRecord) -> Result<(), StoreError> {
    let path = self.record_path("invitations", &record.invitation.session_id);
    Self::write_json(&path, record).await
  }

  async fn list_invitations(&self) -> Result<Vec<InvitationRecord>, StoreError> {
    let mut records: Vec<InvitationRecord> = self.read_all("invitations").await?;
    records.sort_by(|a, b| a.received_at.cmp(&b.received_at));
    Ok(records)
  }
}
