use std::collections::BTreeMap;

use concord_config::{AccessKind, Strategy};
use serde::{Deserialize, Serialize};

use crate::graph::Graph;
use crate::roster::DatasiteToken;

/// Coordination url used when a flow does not declare one.
pub const DEFAULT_COORDINATION_URL: &str =
  "syft://{datasite.current}/shared/flows/{flow_name}/{run_id}/_progress";

/// Target that always resolves to every participant.
pub const ALL_TARGET: &str = "all";

/// A validated flow, ready to back sessions.
///
/// Unlike [`concord_config::FlowDef`], every step has an id, references in
/// `depends_on`, barriers and shares point at real steps, and the
/// dependency relation is acyclic. Templates are kept verbatim and resolved
/// later with session context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flow {
  pub api_version: String,
  pub name: String,
  pub version: String,
  pub vars: BTreeMap<String, String>,
  pub coordination: Coordination,
  pub datasites: Datasites,
  pub roles: Vec<Role>,
  pub steps: Vec<Step>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coordination {
  pub url: String,
  pub share_with: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Datasites {
  pub all: Vec<String>,
  pub groups: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Role {
  pub id: String,
  pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
  pub id: String,
  pub name: String,
  pub description: Option<String>,
  /// 1-based position in the document.
  pub number: usize,
  pub run: Option<Run>,
  pub depends_on: Vec<String>,
  pub barrier: Option<Barrier>,
  pub shares: Vec<Share>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
  pub targets: Vec<String>,
  pub strategy: Strategy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Barrier {
  pub wait_for: String,
  pub targets: Vec<String>,
  pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Share {
  pub name: String,
  pub source: OutputRef,
  pub url: String,
  pub permissions: BTreeMap<AccessKind, Vec<String>>,
}

/// Reference to a named output of a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRef {
  /// `None` refers to the step that declares the share.
  pub step_id: Option<String>,
  pub output: String,
}

impl OutputRef {
  /// Parse `step.<id>.outputs.<name>` or `self.outputs.<name>`.
  pub fn parse(source: &str) -> Option<Self> {
    let parts: Vec<&str> = source.trim().split('.').collect();
    let (step_id, output) = match parts.as_slice() {
      ["step", id, "outputs", name] => (Some(id.to_string()), *name),
      ["self", "outputs", name] => (None, *name),
      _ => return None,
    };
    if output.is_empty() || step_id.as_deref() == Some("") {
      return None;
    }
    Some(Self {
      step_id,
      output: output.to_string(),
    })
  }

  /// The id of the step holding the output, given the declaring step.
  pub fn step<'a>(&'a self, owner: &'a str) -> &'a str {
    self.step_id.as_deref().unwrap_or(owner)
  }
}

impl std::fmt::Display for OutputRef {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match &self.step_id {
      Some(id) => write!(f, "step.{id}.outputs.{}", self.output),
      None => write!(f, "self.outputs.{}", self.output),
    }
  }
}

impl Step {
  pub fn is_barrier(&self) -> bool {
    self.barrier.is_some()
  }

  /// True when completing the step involves publishing artifacts.
  pub fn shares_output(&self) -> bool {
    !self.shares.is_empty()
  }

  /// Targets that execute the step, or the targets a barrier waits on.
  pub fn targets(&self) -> &[String] {
    match (&self.barrier, &self.run) {
      (Some(barrier), _) => &barrier.targets,
      (None, Some(run)) => &run.targets,
      (None, None) => &[],
    }
  }
}

impl Flow {
  /// Build the graph structure for traversal.
  pub fn graph(&self) -> Graph {
    Graph::new(&self.steps)
  }

  /// Get a step by ID.
  pub fn get_step(&self, step_id: &str) -> Option<&Step> {
    self.steps.iter().find(|s| s.id == step_id)
  }

  pub fn has_role(&self, role_id: &str) -> bool {
    self.roles.iter().any(|r| r.id == role_id)
  }

  /// Whether `target` names something a roster can resolve: a group, a
  /// role, `all`, a listed identity, or a `{datasites[..]}` token.
  pub fn is_known_target(&self, target: &str) -> bool {
    if target == ALL_TARGET
      || self.datasites.groups.contains_key(target)
      || self.has_role(target)
      || self.datasites.all.iter().any(|d| d.eq_ignore_ascii_case(target))
    {
      return true;
    }
    match DatasiteToken::parse(target) {
      Some(DatasiteToken::All) => true,
      Some(DatasiteToken::Index(idx)) => idx < self.datasites.all.len(),
      Some(DatasiteToken::Current) | None => false,
    }
  }
}
