//! Progress beacons and the coordination event log.
//!
//! Each participant writes, inside its own datasite, one beacon per step it
//! executes (`{coordination.url}/{role}_{step_id}.json`) and appends every
//! transition to `{coordination.url}/log.jsonl`. Other participants read the
//! replicated beacons to learn how far everyone else got.
//!
//! [`read_participant_progress`] and [`read_participant_logs`] read the same
//! files back for every participant, for display.

use std::collections::HashSet;
use std::path::PathBuf;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use concord_datasite::{ALL_FILES, AccessControl, DatasiteUrl, SyncStore};
use concord_flow::AccessKind;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::session::Session;
use crate::status::StepStatus;

pub const LOG_FILE: &str = "log.jsonl";

/// Published status of one step for one participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepBeacon {
  pub step_id: String,
  pub role: String,
  #[serde(default)]
  pub identity: String,
  /// Free-form so beacons from other runners still parse; see
  /// [`StepStatus::normalize`].
  pub status: String,
  pub timestamp: DateTime<Utc>,
}

impl StepBeacon {
  pub fn status(&self) -> StepStatus {
    StepStatus::normalize(&self.status)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogEvent {
  Joined,
  StepStarted,
  StepCompleted,
  StepFailed,
  StepShared,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
  pub timestamp: DateTime<Utc>,
  pub event: LogEvent,
  pub step_id: Option<String>,
  pub role: String,
  pub identity: String,
}

/// A participant's published status for one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantStepStatus {
  pub step_id: String,
  pub status: StepStatus,
  pub timestamp: DateTime<Utc>,
  /// Local replica of the participant's output directory, once the step's
  /// results are published.
  pub output_dir: Option<PathBuf>,
}

/// Every beacon one participant has published for a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantProgress {
  pub identity: String,
  pub role: String,
  pub steps: Vec<ParticipantStepStatus>,
}

pub fn beacon_url(progress: &DatasiteUrl, role: &str, step_id: &str) -> Result<DatasiteUrl, EngineError> {
  Ok(progress.join(&format!("{role}_{step_id}.json"))?)
}

/// Make the local coordination directory readable by `coordination.share_with`.
pub async fn ensure_progress_acl(store: &dyn SyncStore, session: &Session) -> Result<(), EngineError> {
  let dir = session.progress_url(&session.identity)?;
  let readers = session
    .roster
    .resolve_recipients(&session.flow.coordination.share_with, &session.identity);

  let mut wanted = AccessControl::default();
  wanted.grant(ALL_FILES, AccessKind::Admin, [session.identity.as_str()]);
  wanted.grant(ALL_FILES, AccessKind::Read, &readers);

  let mut acl = store.read_acl(&dir).await?.unwrap_or_default();
  if acl.merge(&wanted) {
    store.write_acl(&dir, &acl).await?;
    debug!(session_id = %session.session_id, url = %dir, "coordination permissions written");
  }
  Ok(())
}

pub async fn write_beacon(
  store: &dyn SyncStore,
  session: &Session,
  step_id: &str,
  status: StepStatus,
  now: DateTime<Utc>,
) -> Result<(), EngineError> {
  let dir = session.progress_url(&session.identity)?;
  let beacon = StepBeacon {
    step_id: step_id.to_string(),
    role: session.role.clone(),
    identity: session.identity.clone(),
    status: status.to_string(),
    timestamp: now,
  };
  let data = serde_json::to_vec_pretty(&beacon).map_err(|e| EngineError::PublishFailed {
    step_id: step_id.to_string(),
    message: e.to_string(),
  })?;
  store
    .write(&beacon_url(&dir, &session.role, step_id)?, Bytes::from(data))
    .await?;
  Ok(())
}

pub async fn append_log(
  store: &dyn SyncStore,
  session: &Session,
  event: LogEvent,
  step_id: Option<&str>,
  now: DateTime<Utc>,
) -> Result<(), EngineError> {
  let dir = session.progress_url(&session.identity)?;
  let entry = LogEntry {
    timestamp: now,
    event,
    step_id: step_id.map(str::to_string),
    role: session.role.clone(),
    identity: session.identity.clone(),
  };
  let mut line = serde_json::to_string(&entry).map_err(|e| EngineError::PublishFailed {
    step_id: step_id.unwrap_or_default().to_string(),
    message: e.to_string(),
  })?;
  line.push('\n');
  store.append(&dir.join(LOG_FILE)?, Bytes::from(line)).await?;
  Ok(())
}

/// Read a beacon from the replica. Missing or unreadable beacons are
/// reported as absent.
pub async fn read_beacon(store: &dyn SyncStore, url: &DatasiteUrl) -> Option<StepBeacon> {
  match store.exists(url).await {
    Ok(true) => {}
    Ok(false) => return None,
    Err(e) => {
      warn!(url = %url, error = %e, "failed to check beacon");
      return None;
    }
  }

  let data = match store.read(url).await {
    Ok(data) => data,
    Err(e) => {
      warn!(url = %url, error = %e, "failed to read beacon");
      return None;
    }
  };

  match serde_json::from_slice(&data) {
    Ok(beacon) => Some(beacon),
    Err(e) => {
      // Usually a file caught mid-sync; the next poll picks it up.
      debug!(url = %url, error = %e, "ignoring unparsable beacon");
      None
    }
  }
}

/// Read the beacons of every participant, the local one included. Steps a
/// participant has not reported on are left out.
pub async fn read_participant_progress(store: &dyn SyncStore, session: &Session) -> Vec<ParticipantProgress> {
  let mut progress = Vec::new();
  for participant in session.roster.participants() {
    let dir = match session.progress_url(&participant.email) {
      Ok(dir) => dir,
      Err(e) => {
        warn!(session_id = %session.session_id, member = %participant.email, error = %e, "cannot resolve coordination url");
        continue;
      }
    };

    let mut steps = Vec::new();
    for step in &session.flow.steps {
      if step.is_barrier() || !session.roster.contains(step.targets(), &participant.email) {
        continue;
      }
      let Ok(url) = beacon_url(&dir, &participant.role, &step.id) else {
        continue;
      };
      let Some(beacon) = read_beacon(store, &url).await else {
        continue;
      };

      let status = beacon.status();
      let published = match status {
        StepStatus::Shared => true,
        StepStatus::Completed => !step.shares_output(),
        _ => false,
      };
      let output_dir = if published {
        session
          .step_output_url(step, &participant.email)
          .ok()
          .map(|url| store.local_path(&url))
      } else {
        None
      };

      steps.push(ParticipantStepStatus {
        step_id: step.id.clone(),
        status,
        timestamp: beacon.timestamp,
        output_dir,
      });
    }

    progress.push(ParticipantProgress {
      identity: participant.email.clone(),
      role: participant.role.clone(),
      steps,
    });
  }
  progress
}

/// Merge every participant's `log.jsonl` into one time-ordered list.
/// Duplicate lines and lines that do not parse are skipped.
pub async fn read_participant_logs(store: &dyn SyncStore, session: &Session) -> Vec<LogEntry> {
  let mut seen = HashSet::new();
  let mut entries = Vec::new();

  for participant in session.roster.participants() {
    let Ok(url) = session
      .progress_url(&participant.email)
      .map_err(EngineError::from)
      .and_then(|dir| Ok(dir.join(LOG_FILE)?))
    else {
      continue;
    };
    if !store.exists(&url).await.unwrap_or(false) {
      continue;
    }
    let data = match store.read(&url).await {
      Ok(data) => data,
      Err(e) => {
        warn!(url = %url, error = %e, "failed to read participant log");
        continue;
      }
    };

    for line in String::from_utf8_lossy(&data).lines() {
      if line.trim().is_empty() {
        continue;
      }
      let entry: LogEntry = match serde_json::from_str(line) {
        Ok(entry) => entry,
        Err(e) => {
          debug!(url = %url, error = %e, "skipping unparsable log line");
          continue;
        }
      };
      let key = (
        entry.identity.to_ascii_lowercase(),
        entry.event,
        entry.step_id.clone(),
        entry.timestamp,
      );
      if seen.insert(key) {
        entries.push(entry);
      }
    }
  }

  entries.sort_by(|a, b| {
    a.timestamp
      .cmp(&b.timestamp)
      .then_with(|| a.identity.cmp(&b.identity))
  });
  entries
}
