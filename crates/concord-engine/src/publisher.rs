//! Publishes a completed step's declared artifacts into the local datasite.

use bytes::Bytes;
use concord_datasite::{AccessControl, DatasiteUrl, SyncStore};
use concord_flow::{AccessKind, Share, Step};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::EngineError;
use crate::session::Session;

/// One artifact written by [`publish_step`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedArtifact {
  pub name: String,
  pub url: DatasiteUrl,
  pub digest: String,
  /// False when the destination already held identical content.
  pub changed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishReport {
  pub artifacts: Vec<PublishedArtifact>,
}

impl PublishReport {
  pub fn changed(&self) -> bool {
    self.artifacts.iter().any(|a| a.changed)
  }
}

fn failed(step: &Step, message: impl Into<String>) -> EngineError {
  EngineError::PublishFailed {
    step_id: step.id.clone(),
    message: message.into(),
  }
}

/// Copy every share of `step` to its destination and record its permissions.
///
/// Content is compared by digest so publishing the same output twice writes
/// nothing. Permissions are merged into any existing `syft.pub.yaml`.
pub async fn publish_step(
  store: &dyn SyncStore,
  session: &Session,
  step: &Step,
) -> Result<PublishReport, EngineError> {
  let mut report = PublishReport::default();
  for share in &step.shares {
    report
      .artifacts
      .push(publish_share(store, session, step, share).await?);
  }
  Ok(report)
}

async fn publish_share(
  store: &dyn SyncStore,
  session: &Session,
  step: &Step,
  share: &Share,
) -> Result<PublishedArtifact, EngineError> {
  let source_step = share.source.step(&step.id);
  let source = session
    .steps
    .get(source_step)
    .and_then(|state| state.outputs.get(&share.source.output))
    .ok_or_else(|| failed(step, format!("output '{}' has not been produced", share.source)))?;

  let data = tokio::fs::read(source)
    .await
    .map_err(|e| failed(step, format!("cannot read {}: {e}", source.display())))?;
  let digest = hex::encode(Sha256::digest(&data));

  let url = session
    .share_url(step, &share.url, &session.identity)
    .map_err(|e| failed(step, e.to_string()))?;
  let dir = url
    .parent()
    .ok_or_else(|| failed(step, format!("{url} has no parent directory")))?;
  let file_name = url.file_name().unwrap_or_default().to_string();

  let existing = store
    .digest(&url)
    .await
    .map_err(|e| failed(step, e.to_string()))?;
  let changed = existing.as_deref() != Some(digest.as_str());
  if changed {
    store
      .write(&url, Bytes::from(data))
      .await
      .map_err(|e| failed(step, e.to_string()))?;
  }

  let mut wanted = AccessControl::default();
  wanted.grant(&file_name, AccessKind::Admin, [session.identity.as_str()]);
  for (kind, recipients) in &share.permissions {
    let identities = session
      .roster
      .resolve_recipients(recipients, &session.identity);
    wanted.grant(&file_name, *kind, &identities);
  }

  let mut acl = store
    .read_acl(&dir)
    .await
    .map_err(|e| failed(step, e.to_string()))?
    .unwrap_or_default();
  if acl.merge(&wanted) {
    store
      .write_acl(&dir, &acl)
      .await
      .map_err(|e| failed(step, e.to_string()))?;
    debug!(session_id = %session.session_id, step_id = %step.id, dir = %dir, "share permissions updated");
  }

  info!(
    session_id = %session.session_id,
    step_id = %step.id,
    share = %share.name,
    url = %url,
    changed,
    "artifact published"
  );

  Ok(PublishedArtifact {
    name: share.name.clone(),
    url,
    digest,
    changed,
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::Utc;
  use concord_datasite::FsDatasites;
  use concord_flow::{Flow, Roster};
  use tempfile::TempDir;

  const SUM_FLOW: &str = include_str!("../../../flows/multiparty-sum.yaml");
  const SHARED: &str =
    "client1@sandbox.local/shared/flows/multiparty-sum/run-1/2-share_contribution";

  fn session() -> Session {
    let flow = Flow::from_yaml_str(SUM_FLOW).unwrap();
    let roster = Roster::new(&flow, &[]);
    Session::new("run-1", flow, "d", "client1@sandbox.local", "contributor1", roster, Utc::now())
  }

  fn with_numbers(session: &mut Session, temp: &TempDir, content: &str) {
    let path = temp.path().join("numbers.json");
    std::fs::write(&path, content).unwrap();
    session
      .state_mut("generate")
      .unwrap()
      .outputs
      .insert("numbers".to_string(), path);
  }

  #[tokio::test]
  async fn test_publish_copies_artifact_and_grants_read() {
    let temp = TempDir::new().unwrap();
    let store = FsDatasites::new(temp.path().join("datasites"), "client1@sandbox.local");
    let mut session = session();
    with_numbers(&mut session, &temp, "[1, 2, 3]");

    let (step, _) = session.step("share_contribution").unwrap();
    let report = publish_step(&store, &session, step).await.unwrap();

    assert_eq!(report.artifacts.len(), 1);
    assert!(report.changed());
    let dir = temp.path().join("datasites").join(SHARED);
    assert_eq!(
      std::fs::read_to_string(dir.join("numbers.json")).unwrap(),
      "[1, 2, 3]"
    );

    let acl = store
      .read_acl(&report.artifacts[0].url.parent().unwrap())
      .await
      .unwrap()
      .unwrap();
    assert!(acl.allows("numbers.json", AccessKind::Read, "aggregator@sandbox.local"));
    assert!(acl.allows("numbers.json", AccessKind::Admin, "client1@sandbox.local"));
    assert!(!acl.allows("numbers.json", AccessKind::Read, "client2@sandbox.local"));
  }

  #[tokio::test]
  async fn test_republishing_same_content_is_a_no_op() {
    let temp = TempDir::new().unwrap();
    let store = FsDatasites::new(temp.path().join("datasites"), "client1@sandbox.local");
    let mut session = session();
    with_numbers(&mut session, &temp, "[4]");

    let (step, _) = session.step("share_contribution").unwrap();
    let first = publish_step(&store, &session, step).await.unwrap();
    let second = publish_step(&store, &session, step).await.unwrap();

    assert!(first.changed());
    assert!(!second.changed());
    assert_eq!(first.artifacts[0].digest, second.artifacts[0].digest);
  }

  #[tokio::test]
  async fn test_missing_source_fails() {
    let temp = TempDir::new().unwrap();
    let store = FsDatasites::new(temp.path(), "client1@sandbox.local");
    let session = session();

    let (step, _) = session.step("share_contribution").unwrap();
    let err = publish_step(&store, &session, step).await.unwrap_err();
    assert!(matches!(err, EngineError::PublishFailed { ref step_id, .. } if step_id == "share_contribution"));
    assert!(!temp.path().join(SHARED).exists());
  }

  #[tokio::test]
  async fn test_unwritable_destination_fails() {
    let temp = TempDir::new().unwrap();
    // The store belongs to someone else, so the local datasite is read-only.
    let store = FsDatasites::new(temp.path(), "aggregator@sandbox.local");
    let mut session = session();
    with_numbers(&mut session, &temp, "[1]");

    let (step, _) = session.step("share_contribution").unwrap();
    let err = publish_step(&store, &session, step).await.unwrap_err();
    assert!(err.to_string().contains("owned by client1@sandbox.local"));
  }
}
