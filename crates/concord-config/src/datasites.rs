use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::targets::Targets;

/// Where progress beacons are written and who may read them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinationDef {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub url: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub share_with: Option<Targets>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasitesDef {
  /// Every participant identity, in declaration order.
  /// Required by validation; `{datasites[i]}` indexes into this list.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub all: Option<Vec<String>>,
  #[serde(default)]
  pub groups: BTreeMap<String, GroupDef>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupDef {
  /// Identities or tokens such as `{datasites[0]}` / `{datasites[*]}`.
  #[serde(default)]
  pub include: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleDef {
  pub id: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub description: Option<String>,
}
