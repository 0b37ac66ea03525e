use std::collections::{BTreeMap, HashSet};

use concord_config::{FLOW_KIND, FlowDef, StepDef};

use crate::error::FlowError;
use crate::flow::{
  ALL_TARGET, Barrier, Coordination, DEFAULT_COORDINATION_URL, Datasites, Flow, OutputRef, Role,
  Run, Share, Step,
};
use crate::graph::Graph;
use crate::roster::DatasiteToken;

impl Flow {
  pub fn from_yaml_str(source: &str) -> Result<Self, FlowError> {
    Self::from_def(FlowDef::from_yaml_str(source)?)
  }

  pub fn from_json_value(value: serde_json::Value) -> Result<Self, FlowError> {
    Self::from_def(FlowDef::from_json_value(value)?)
  }

  /// Validate a flow document and lock it into a [`Flow`].
  pub fn from_def(def: FlowDef) -> Result<Self, FlowError> {
    if def.kind != FLOW_KIND {
      return Err(FlowError::UnsupportedKind(def.kind));
    }
    if def.metadata.name.trim().is_empty() {
      return Err(missing("metadata", "name"));
    }

    let spec = def.spec;
    let datasites_def = spec.datasites.unwrap_or_default();
    let Some(all) = datasites_def.all else {
      return Err(missing("spec.datasites", "all"));
    };

    let datasites = Datasites {
      all,
      groups: datasites_def
        .groups
        .into_iter()
        .map(|(name, group)| (name, group.include))
        .collect(),
    };

    let coordination = match spec.coordination {
      Some(c) => Coordination {
        url: c
          .url
          .filter(|u| !u.trim().is_empty())
          .unwrap_or_else(|| DEFAULT_COORDINATION_URL.to_string()),
        share_with: c
          .share_with
          .map(|t| t.to_vec())
          .filter(|t| !t.is_empty())
          .unwrap_or_else(|| vec![ALL_TARGET.to_string()]),
      },
      None => Coordination {
        url: DEFAULT_COORDINATION_URL.to_string(),
        share_with: vec![ALL_TARGET.to_string()],
      },
    };

    let roles = spec
      .roles
      .into_iter()
      .map(|r| Role {
        id: r.id,
        description: r.description,
      })
      .collect();

    let mut seen = HashSet::new();
    let mut steps = Vec::with_capacity(spec.steps.len());
    for (idx, step_def) in spec.steps.into_iter().enumerate() {
      let step = lock_step(idx, step_def)?;
      if !seen.insert(step.id.clone()) {
        return Err(FlowError::DuplicateStep(step.id));
      }
      steps.push(step);
    }

    let flow = Flow {
      api_version: def.api_version,
      name: def.metadata.name,
      version: def.metadata.version,
      vars: spec.vars,
      coordination,
      datasites,
      roles,
      steps,
    };

    flow.check_references()?;
    let graph = flow.graph();
    if let Some(cycle) = graph.find_cycle() {
      return Err(FlowError::Cycle { cycle });
    }
    flow.check_shares(&graph)?;

    Ok(flow)
  }

  fn check_references(&self) -> Result<(), FlowError> {
    let ids: HashSet<&str> = self.steps.iter().map(|s| s.id.as_str()).collect();

    for target in &self.coordination.share_with {
      if !self.is_known_target(target) {
        return Err(FlowError::UnknownGroup {
          step: "coordination".to_string(),
          group: target.clone(),
        });
      }
    }

    for step in &self.steps {
      for dependency in &step.depends_on {
        if !ids.contains(dependency.as_str()) {
          return Err(FlowError::UnknownDependency {
            step: step.id.clone(),
            dependency: dependency.clone(),
          });
        }
      }

      if let Some(barrier) = &step.barrier
        && !ids.contains(barrier.wait_for.as_str())
      {
        return Err(FlowError::UnknownWaitFor {
          step: step.id.clone(),
          wait_for: barrier.wait_for.clone(),
        });
      }

      for target in step.targets() {
        if !self.is_known_target(target) {
          return Err(FlowError::UnknownGroup {
            step: step.id.clone(),
            group: target.clone(),
          });
        }
      }

      for share in &step.shares {
        for recipient in share.permissions.values().flatten() {
          let current = DatasiteToken::parse(recipient) == Some(DatasiteToken::Current);
          if !current && !self.is_known_target(recipient) {
            return Err(FlowError::UnknownRecipient {
              step: step.id.clone(),
              recipient: recipient.clone(),
            });
          }
        }
      }
    }

    Ok(())
  }

  /// A share may only publish outputs of its own step or an upstream one.
  fn check_shares(&self, graph: &Graph) -> Result<(), FlowError> {
    for step in &self.steps {
      if step.shares.is_empty() {
        continue;
      }
      let ancestors = graph.ancestors(&step.id);
      for share in &step.shares {
        let source_step = share.source.step(&step.id);
        if source_step != step.id && !ancestors.contains(source_step) {
          return Err(FlowError::InvalidSource {
            step: step.id.clone(),
            share: share.name.clone(),
            source_ref: share.source.to_string(),
          });
        }
      }
    }
    Ok(())
  }
}

fn lock_step(idx: usize, def: StepDef) -> Result<Step, FlowError> {
  let id = def.id.trim().to_string();
  if id.is_empty() {
    return Err(missing(&format!("spec.steps[{idx}]"), "id"));
  }
  let location = format!("step '{id}'");
  if def.name.trim().is_empty() {
    return Err(missing(&location, "name"));
  }

  let barrier = match def.barrier {
    Some(b) => {
      let targets = b.targets.to_vec();
      if targets.is_empty() {
        return Err(missing(&location, "barrier.targets"));
      }
      let timeout_secs = b
        .timeout
        .map(|t| t.as_secs())
        .transpose()
        .map_err(|source| FlowError::InvalidTimeout {
          step: id.clone(),
          source,
        })?;
      Some(Barrier {
        wait_for: b.wait_for.trim().to_string(),
        targets,
        timeout_secs,
      })
    }
    None => None,
  };

  let run = match def.run {
    Some(r) => {
      let targets = r.targets.to_vec();
      if targets.is_empty() {
        return Err(missing(&location, "run.targets"));
      }
      Some(Run {
        targets,
        strategy: r.strategy,
      })
    }
    None if barrier.is_none() => return Err(missing(&location, "run")),
    None => None,
  };

  let mut shares = Vec::with_capacity(def.share.len());
  for (name, share) in def.share {
    let Some(source) = OutputRef::parse(&share.source) else {
      return Err(FlowError::InvalidSource {
        step: id.clone(),
        share: name,
        source_ref: share.source,
      });
    };
    if share.url.trim().is_empty() {
      return Err(missing(&format!("{location} share '{name}'"), "url"));
    }
    let permissions: BTreeMap<_, _> = share
      .permissions
      .into_iter()
      .map(|(kind, targets)| (kind, targets.to_vec()))
      .collect();
    shares.push(Share {
      name,
      source,
      url: share.url,
      permissions,
    });
  }

  let mut depends_on: Vec<String> = def
    .depends_on
    .into_iter()
    .map(|d| d.trim().to_string())
    .filter(|d| !d.is_empty())
    .collect();
  depends_on.sort();
  depends_on.dedup();

  Ok(Step {
    id,
    name: def.name,
    description: def.description,
    number: idx + 1,
    run,
    depends_on,
    barrier,
    shares,
  })
}

fn missing(location: &str, field: &str) -> FlowError {
  FlowError::MissingField {
    location: location.to_string(),
    field: field.to_string(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const SUM_FLOW: &str = include_str!("../../../flows/multiparty-sum.yaml");

  fn with_steps(steps: &str) -> String {
    format!(
      r#"
apiVersion: v1
kind: Flow
metadata: {{ name: test }}
spec:
  datasites:
    all: [a@x.org, b@x.org]
    groups:
      pair: {{ include: ["{{datasites[*]}}"] }}
  roles:
    - id: first
    - id: second
  steps:
{steps}
"#
    )
  }

  #[test]
  fn test_sum_flow_validates() {
    let flow = Flow::from_yaml_str(SUM_FLOW).unwrap();

    assert_eq!(flow.name, "multiparty-sum");
    assert_eq!(flow.steps.len(), 5);
    assert_eq!(flow.coordination.url, "{vars.run_path}/_progress");
    assert_eq!(flow.coordination.share_with, vec!["all"]);

    let barrier = flow.get_step("contributions_ready").unwrap();
    assert_eq!(barrier.number, 3);
    assert!(barrier.is_barrier());
    assert_eq!(barrier.barrier.as_ref().unwrap().timeout_secs, Some(300));
    assert_eq!(barrier.targets(), &["contributors".to_string()]);

    let share = &flow.get_step("share_contribution").unwrap().shares[0];
    assert_eq!(share.source.step("share_contribution"), "generate");

    let order = flow.graph().topological_order().unwrap();
    assert_eq!(
      order,
      vec![
        "generate",
        "share_contribution",
        "contributions_ready",
        "aggregate",
        "share_result"
      ]
    );
  }

  #[test]
  fn test_default_coordination() {
    let flow = Flow::from_yaml_str(&with_steps(
      "    - { id: a, name: A, run: { targets: pair } }",
    ))
    .unwrap();
    assert_eq!(flow.coordination.url, DEFAULT_COORDINATION_URL);
    assert_eq!(flow.coordination.share_with, vec!["all"]);
  }

  #[test]
  fn test_cycle_is_reported_in_order() {
    let err = Flow::from_yaml_str(&with_steps(
      r#"    - { id: A, name: A, run: { targets: pair }, depends_on: [B] }
    - { id: B, name: B, run: { targets: pair }, depends_on: [A] }"#,
    ))
    .unwrap_err();

    match err {
      FlowError::Cycle { cycle } => assert_eq!(cycle, vec!["A", "B", "A"]),
      other => panic!("expected cycle, got {other}"),
    }
  }

  #[test]
  fn test_duplicate_step() {
    let err = Flow::from_yaml_str(&with_steps(
      r#"    - { id: a, name: A, run: { targets: pair } }
    - { id: a, name: Again, run: { targets: pair } }"#,
    ))
    .unwrap_err();
    assert!(matches!(err, FlowError::DuplicateStep(id) if id == "a"));
  }

  #[test]
  fn test_unknown_dependency() {
    let err = Flow::from_yaml_str(&with_steps(
      "    - { id: a, name: A, run: { targets: pair }, depends_on: [ghost] }",
    ))
    .unwrap_err();
    assert!(matches!(err, FlowError::UnknownDependency { dependency, .. } if dependency == "ghost"));
  }

  #[test]
  fn test_missing_step_fields() {
    let err = Flow::from_yaml_str(&with_steps("    - { name: A, run: { targets: pair } }")).unwrap_err();
    assert_eq!(err.to_string(), "spec.steps[0]: missing required field 'id'");

    let err = Flow::from_yaml_str(&with_steps("    - { id: a, run: { targets: pair } }")).unwrap_err();
    assert_eq!(err.to_string(), "step 'a': missing required field 'name'");

    let err = Flow::from_yaml_str(&with_steps("    - { id: a, name: A }")).unwrap_err();
    assert_eq!(err.to_string(), "step 'a': missing required field 'run'");
  }

  #[test]
  fn test_missing_datasites_all() {
    let err = Flow::from_yaml_str(
      r#"
metadata: { name: test }
spec:
  datasites: { groups: {} }
  steps: []
"#,
    )
    .unwrap_err();
    assert_eq!(
      err.to_string(),
      "spec.datasites: missing required field 'all'"
    );
  }

  #[test]
  fn test_barrier_references() {
    let err = Flow::from_yaml_str(&with_steps(
      r#"    - { id: a, name: A, run: { targets: pair } }
    - { id: wait, name: Wait, barrier: { wait_for: nope, targets: pair } }"#,
    ))
    .unwrap_err();
    assert!(matches!(err, FlowError::UnknownWaitFor { .. }));

    let err = Flow::from_yaml_str(&with_steps(
      r#"    - { id: a, name: A, run: { targets: pair } }
    - { id: wait, name: Wait, barrier: { wait_for: a, targets: strangers } }"#,
    ))
    .unwrap_err();
    assert!(matches!(err, FlowError::UnknownGroup { group, .. } if group == "strangers"));

    let err = Flow::from_yaml_str(&with_steps(
      r#"    - { id: a, name: A, run: { targets: pair } }
    - { id: wait, name: Wait, barrier: { wait_for: a, targets: pair, timeout: soon } }"#,
    ))
    .unwrap_err();
    assert!(matches!(err, FlowError::InvalidTimeout { .. }));
  }

  #[test]
  fn test_share_source_must_be_upstream() {
    let err = Flow::from_yaml_str(&with_steps(
      r#"    - { id: a, name: A, run: { targets: pair } }
    - id: b
      name: B
      run: { targets: pair }
      share:
        out:
          source: step.a.outputs.x
          url: "{vars.step_path}/x.json"
          permissions: { read: [first] }"#,
    ))
    .unwrap_err();
    assert!(matches!(err, FlowError::InvalidSource { .. }));
  }

  #[test]
  fn test_unknown_recipient() {
    let err = Flow::from_yaml_str(&with_steps(
      r#"    - id: a
      name: A
      run: { targets: pair }
      share:
        out:
          source: self.outputs.x
          url: "x.json"
          permissions: { read: [auditors] }"#,
    ))
    .unwrap_err();
    assert!(matches!(err, FlowError::UnknownRecipient { recipient, .. } if recipient == "auditors"));
  }

  #[test]
  fn test_unsupported_kind() {
    let err = Flow::from_yaml_str(
      "kind: Pipeline\nmetadata: { name: x }\nspec: { datasites: { all: [] } }",
    )
    .unwrap_err();
    assert!(matches!(err, FlowError::UnsupportedKind(kind) if kind == "Pipeline"));
  }
}
