//! The boundary to whatever actually runs a step.
//!
//! The engine decides when a step may run and records what it produced; the
//! work itself is delegated to a [`StepExecutor`]. Executors write their
//! files into [`ExecutionRequest::output_dir`] and may name specific outputs
//! in the returned [`ExecutionOutcome`].

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use concord_datasite::{ACL_FILE, DatasiteUrl, SyncStore};
use concord_flow::Step;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::EngineError;
use crate::session::Session;

/// An artifact published by an upstream step and visible in the local replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionInput {
  pub step_id: String,
  pub share: String,
  /// Participant who published the artifact.
  pub member: String,
  pub path: PathBuf,
}

/// Everything an executor needs to run one step for the local participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRequest {
  pub session_id: String,
  pub flow_name: String,
  pub step_id: String,
  pub step_name: String,
  pub role: String,
  pub identity: String,
  /// Local directory the step writes its outputs into.
  pub output_dir: PathBuf,
  pub output_url: DatasiteUrl,
  pub inputs: Vec<ExecutionInput>,
}

impl ExecutionRequest {
  /// Inputs published for one upstream share, in roster order.
  pub fn inputs_for<'a>(&'a self, step_id: &'a str, share: &'a str) -> impl Iterator<Item = &'a ExecutionInput> {
    self
      .inputs
      .iter()
      .filter(move |i| i.step_id == step_id && i.share == share)
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
  /// Named outputs. Files left in the output directory are added under
  /// their file stem.
  #[serde(default)]
  pub outputs: BTreeMap<String, PathBuf>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ExecutionFailure {
  pub message: String,
}

impl ExecutionFailure {
  pub fn new(message: impl Into<String>) -> Self {
    Self {
      message: message.into(),
    }
  }
}

#[async_trait]
pub trait StepExecutor: Send + Sync {
  async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionOutcome, ExecutionFailure>;
}

/// Build the request for running `step` locally.
pub async fn build_request(
  store: &dyn SyncStore,
  session: &Session,
  step: &Step,
) -> Result<ExecutionRequest, EngineError> {
  let output_url = session.step_output_url(step, &session.identity)?;
  let output_dir = store.local_path(&output_url);

  let ancestors = session.flow.graph().ancestors(&step.id);
  let mut upstream: Vec<&Step> = session
    .flow
    .steps
    .iter()
    .filter(|s| ancestors.contains(&s.id) && s.shares_output())
    .collect();
  upstream.sort_by_key(|s| s.number);

  let mut inputs = Vec::new();
  for producer in upstream {
    for member in session.roster.members_of(producer.targets()) {
      for share in &producer.shares {
        let url = session.share_url(producer, &share.url, &member)?;
        if store.exists(&url).await? {
          inputs.push(ExecutionInput {
            step_id: producer.id.clone(),
            share: share.name.clone(),
            member: member.clone(),
            path: store.local_path(&url),
          });
        }
      }
    }
  }

  Ok(ExecutionRequest {
    session_id: session.session_id.clone(),
    flow_name: session.flow.name.clone(),
    step_id: step.id.clone(),
    step_name: step.name.clone(),
    role: session.role.clone(),
    identity: session.identity.clone(),
    output_dir,
    output_url,
    inputs,
  })
}

/// Named outputs and the full file list of a finished step.
pub async fn collect_outputs(
  store: &dyn SyncStore,
  output_url: &DatasiteUrl,
  outcome: ExecutionOutcome,
) -> Result<(BTreeMap<String, PathBuf>, Vec<PathBuf>), EngineError> {
  let mut outputs = BTreeMap::new();
  let mut files = Vec::new();

  for url in store.list(output_url).await? {
    let Some(name) = url.file_name() else {
      continue;
    };
    if name == ACL_FILE || name.starts_with('.') {
      continue;
    }
    let path = store.local_path(&url);
    if !path.is_file() {
      continue;
    }
    if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
      outputs.insert(stem.to_string(), path.clone());
    }
    files.push(path);
  }

  for (name, path) in outcome.outputs {
    if !files.contains(&path) {
      files.push(path.clone());
    }
    outputs.insert(name, path);
  }

  Ok((outputs, files))
}
