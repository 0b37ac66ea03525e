use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use concord_datasite::DatasiteUrl;
use concord_flow::{Flow, Roster, Step};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, StepError};
use crate::progress::Progress;
use crate::status::{SessionStatus, StepStatus};
use crate::template::{TemplateContext, TemplateError};

/// Run directory used when the flow declares no `run_path` variable.
const DEFAULT_RUN_PATH: &str = "syft://{datasite.current}/shared/flows/{flow_name}/{run_id}";

/// Local state of one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepState {
  pub status: StepStatus,
  /// Whether the local participant executes this step.
  pub relevant: bool,
  /// Named outputs produced by the executor, as local file paths.
  #[serde(default)]
  pub outputs: BTreeMap<String, PathBuf>,
  #[serde(default)]
  pub output_files: Vec<PathBuf>,
  #[serde(default)]
  pub error: Option<StepError>,
  /// Absolute barrier deadline, fixed when the barrier became reachable.
  #[serde(default)]
  pub deadline: Option<DateTime<Utc>>,
  /// Status last written to this participant's progress beacon.
  #[serde(default)]
  pub beacon: Option<StepStatus>,
  #[serde(default)]
  pub started_at: Option<DateTime<Utc>>,
  #[serde(default)]
  pub completed_at: Option<DateTime<Utc>>,
  #[serde(default)]
  pub shared_at: Option<DateTime<Utc>>,
}

impl StepState {
  pub fn new(relevant: bool) -> Self {
    Self {
      status: StepStatus::NotReady,
      relevant,
      outputs: BTreeMap::new(),
      output_files: Vec::new(),
      error: None,
      deadline: None,
      beacon: None,
      started_at: None,
      completed_at: None,
      shared_at: None,
    }
  }
}

/// One participant's state for one joined flow instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
  pub session_id: String,
  pub flow: Flow,
  /// Digest of the flow document the session was created from.
  pub spec_digest: String,
  pub identity: String,
  pub role: String,
  pub roster: Roster,
  /// Step-independent variables, resolved once at join time.
  pub bindings: BTreeMap<String, String>,
  pub steps: BTreeMap<String, StepState>,
  pub status: SessionStatus,
  #[serde(default)]
  pub completion_notified: bool,
  /// Number of saves this copy descends from. Stores refuse to overwrite a
  /// newer record.
  #[serde(default)]
  pub revision: u64,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

impl Session {
  pub fn new(
    session_id: &str,
    flow: Flow,
    spec_digest: &str,
    identity: &str,
    role: &str,
    roster: Roster,
    now: DateTime<Utc>,
  ) -> Self {
    let steps = flow
      .steps
      .iter()
      .map(|step| {
        let relevant = !step.is_barrier() && roster.contains(step.targets(), identity);
        (step.id.clone(), StepState::new(relevant))
      })
      .collect();

    let mut session = Self {
      session_id: session_id.to_string(),
      flow,
      spec_digest: spec_digest.to_string(),
      identity: identity.to_string(),
      role: role.to_string(),
      roster,
      bindings: BTreeMap::new(),
      steps,
      status: SessionStatus::Active,
      completion_notified: false,
      revision: 0,
      created_at: now,
      updated_at: now,
    };

    // Variables that need a step (such as `step_path`) resolve lazily.
    let ctx = session.template_context();
    session.bindings = session
      .flow
      .vars
      .keys()
      .filter_map(|name| {
        let value = ctx.render(&format!("{{vars.{name}}}")).ok()?;
        Some((name.clone(), value))
      })
      .collect();
    session
  }

  pub fn template_context(&self) -> TemplateContext {
    TemplateContext::new(
      &self.session_id,
      &self.flow.name,
      &self.identity,
      self.roster.datasites().to_vec(),
      self.flow.vars.clone(),
    )
  }

  pub fn step(&self, step_id: &str) -> Result<(&Step, &StepState), EngineError> {
    let step = self.flow.get_step(step_id);
    let state = self.steps.get(step_id);
    match (step, state) {
      (Some(step), Some(state)) => Ok((step, state)),
      _ => Err(self.step_not_found(step_id)),
    }
  }

  pub fn state_mut(&mut self, step_id: &str) -> Result<&mut StepState, EngineError> {
    let not_found = self.step_not_found(step_id);
    self.steps.get_mut(step_id).ok_or(not_found)
  }

  pub fn status_of(&self, step_id: &str) -> StepStatus {
    self
      .steps
      .get(step_id)
      .map(|s| s.status)
      .unwrap_or(StepStatus::NotReady)
  }

  fn step_not_found(&self, step_id: &str) -> EngineError {
    EngineError::StepNotFound {
      session_id: self.session_id.clone(),
      step_id: step_id.to_string(),
    }
  }

  /// Coordination directory in `identity`'s datasite.
  pub fn progress_url(&self, identity: &str) -> Result<DatasiteUrl, TemplateError> {
    self
      .template_context()
      .for_datasite(identity)
      .render_url(&self.flow.coordination.url)
  }

  /// Directory holding a step's outputs in `identity`'s datasite.
  ///
  /// `{vars.step_path}` when the flow declares it, otherwise
  /// `{run_path}/{step.number}-{step.id}`.
  pub fn step_output_url(&self, step: &Step, identity: &str) -> Result<DatasiteUrl, TemplateError> {
    let ctx = self.template_context().for_datasite(identity).with_step(step);
    if self.flow.vars.contains_key("step_path") {
      return ctx.render_url("{vars.step_path}");
    }
    let run_path = if self.flow.vars.contains_key("run_path") {
      "{vars.run_path}"
    } else {
      DEFAULT_RUN_PATH
    };
    ctx.render_url(&format!("{run_path}/{{step.number}}-{{step.id}}"))
  }

  /// Where `identity` publishes the share named `share` of `step`.
  pub fn share_url(
    &self,
    step: &Step,
    url_template: &str,
    identity: &str,
  ) -> Result<DatasiteUrl, TemplateError> {
    self
      .template_context()
      .for_datasite(identity)
      .with_step(step)
      .render_url(url_template)
  }

  pub fn progress(&self) -> Progress {
    Progress::of(self)
  }

  pub fn is_finished(&self) -> bool {
    self.status != SessionStatus::Active
  }
}
