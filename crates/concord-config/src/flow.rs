use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::datasites::{CoordinationDef, DatasitesDef, RoleDef};
use crate::error::ConfigError;
use crate::step::StepDef;

/// The only document kind understood by the engine.
pub const FLOW_KIND: &str = "Flow";

/// A complete flow document as authored or received in an invitation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowDef {
  #[serde(rename = "apiVersion", default)]
  pub api_version: String,
  #[serde(default = "default_kind")]
  pub kind: String,
  pub metadata: MetadataDef,
  pub spec: FlowSpecDef,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataDef {
  pub name: String,
  #[serde(default)]
  pub version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowSpecDef {
  /// Named path templates, e.g. `run_path`, `step_path`.
  #[serde(default)]
  pub vars: BTreeMap<String, String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub coordination: Option<CoordinationDef>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub datasites: Option<DatasitesDef>,
  #[serde(default)]
  pub roles: Vec<RoleDef>,
  #[serde(default)]
  pub steps: Vec<StepDef>,
}

fn default_kind() -> String {
  FLOW_KIND.to_string()
}

impl FlowDef {
  pub fn from_yaml_str(source: &str) -> Result<Self, ConfigError> {
    Ok(serde_yaml::from_str(source)?)
  }

  pub fn from_json_value(value: serde_json::Value) -> Result<Self, ConfigError> {
    Ok(serde_json::from_value(value)?)
  }

  /// Encode for embedding in an invitation's metadata.
  pub fn to_json_value(&self) -> Result<serde_json::Value, ConfigError> {
    Ok(serde_json::to_value(self)?)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{AccessKind, Strategy, Targets, TimeoutDef};

  const SUM_FLOW: &str = include_str!("../../../flows/multiparty-sum.yaml");

  #[test]
  fn test_parse_sum_flow() {
    let flow = FlowDef::from_yaml_str(SUM_FLOW).unwrap();

    assert_eq!(flow.kind, "Flow");
    assert_eq!(flow.metadata.name, "multiparty-sum");
    assert_eq!(flow.spec.roles.len(), 3);
    assert_eq!(flow.spec.steps.len(), 5);
    assert!(flow.spec.vars.contains_key("step_path"));

    let datasites = flow.spec.datasites.as_ref().unwrap();
    assert_eq!(datasites.all.as_ref().unwrap().len(), 3);
    assert_eq!(
      datasites.groups["contributors"].include,
      vec!["{datasites[0]}".to_string(), "{datasites[1]}".to_string()]
    );
  }

  #[test]
  fn test_parse_step_shapes() {
    let flow = FlowDef::from_yaml_str(SUM_FLOW).unwrap();
    let steps = &flow.spec.steps;

    let generate = &steps[0];
    let run = generate.run.as_ref().unwrap();
    assert_eq!(run.targets, Targets::One("contributors".into()));
    assert_eq!(run.strategy, Strategy::Parallel);

    let share = &steps[1].share["numbers"];
    assert_eq!(share.source, "step.generate.outputs.numbers");
    assert_eq!(
      share.permissions[&AccessKind::Read].to_vec(),
      vec!["aggregator".to_string()]
    );

    let barrier = steps[2].barrier.as_ref().unwrap();
    assert_eq!(barrier.wait_for, "share_contribution");
    assert_eq!(barrier.timeout, Some(TimeoutDef::Seconds(300)));
    assert!(steps[2].run.is_none());
  }

  #[test]
  fn test_json_round_trip_preserves_document() {
    let flow = FlowDef::from_yaml_str(SUM_FLOW).unwrap();
    let value = flow.to_json_value().unwrap();
    assert_eq!(value["apiVersion"], "syftbox.openmined.org/v1alpha1");

    let decoded = FlowDef::from_json_value(value).unwrap();
    assert_eq!(decoded, flow);
  }

  #[test]
  fn test_missing_step_id_is_left_for_validation() {
    let flow = FlowDef::from_yaml_str(
      r#"
metadata: { name: partial }
spec:
  steps:
    - name: Nameless
"#,
    )
    .unwrap();

    assert_eq!(flow.kind, "Flow");
    assert!(flow.spec.steps[0].id.is_empty());
    assert!(flow.spec.datasites.is_none());
  }

  #[test]
  fn test_malformed_yaml() {
    let err = FlowDef::from_yaml_str("metadata: [").unwrap_err();
    assert!(matches!(err, ConfigError::Yaml(_)));
  }
}
