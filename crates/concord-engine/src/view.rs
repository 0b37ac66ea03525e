//! Serializable snapshots returned by state queries.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use concord_flow::Strategy;
use serde::{Deserialize, Serialize};

use crate::error::StepError;
use crate::session::Session;
use crate::status::{SessionStatus, StepStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepView {
  pub id: String,
  pub name: String,
  pub description: Option<String>,
  pub number: usize,
  pub status: StepStatus,
  /// Whether the local participant executes this step.
  pub relevant: bool,
  pub targets: Vec<String>,
  /// How the target members execute a run step.
  pub strategy: Option<Strategy>,
  pub target_identities: Vec<String>,
  pub is_barrier: bool,
  pub shares_output: bool,
  pub output_files: Vec<PathBuf>,
  pub error: Option<StepError>,
  pub deadline: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowStateView {
  pub session_id: String,
  pub flow_name: String,
  pub identity: String,
  pub role: String,
  pub status: SessionStatus,
  pub progress: (usize, usize),
  pub progress_text: String,
  pub steps: Vec<StepView>,
}

impl FlowStateView {
  pub fn of(session: &Session) -> Self {
    let progress = session.progress();
    let steps = session
      .flow
      .steps
      .iter()
      .filter_map(|step| {
        let state = session.steps.get(&step.id)?;
        Some(StepView {
          id: step.id.clone(),
          name: step.name.clone(),
          description: step.description.clone(),
          number: step.number,
          status: state.status,
          relevant: state.relevant,
          targets: step.targets().to_vec(),
          strategy: step.run.as_ref().map(|run| run.strategy),
          target_identities: session.roster.members_of(step.targets()),
          is_barrier: step.is_barrier(),
          shares_output: step.shares_output(),
          output_files: state.output_files.clone(),
          error: state.error.clone(),
          deadline: state.deadline,
        })
      })
      .collect();

    Self {
      session_id: session.session_id.clone(),
      flow_name: session.flow.name.clone(),
      identity: session.identity.clone(),
      role: session.role.clone(),
      status: session.status,
      progress: (progress.completed, progress.total),
      progress_text: progress.to_string(),
      steps,
    }
  }

  pub fn step(&self, step_id: &str) -> Option<&StepView> {
    self.steps.iter().find(|s| s.id == step_id)
  }
}
