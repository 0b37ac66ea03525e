use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::targets::Targets;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepDef {
  #[serde(default)]
  pub id: String,
  #[serde(default)]
  pub name: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub description: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub run: Option<RunDef>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub depends_on: Vec<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub barrier: Option<BarrierDef>,
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub share: BTreeMap<String, ShareDef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunDef {
  pub targets: Targets,
  #[serde(default)]
  pub strategy: Strategy,
}

/// How the members of a target group execute a step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
  #[default]
  Parallel,
  Sequential,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BarrierDef {
  pub wait_for: String,
  pub targets: Targets,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub timeout: Option<TimeoutDef>,
}

/// Barrier timeout, either plain seconds or a suffixed duration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TimeoutDef {
  Seconds(u64),
  Text(String),
}

impl TimeoutDef {
  /// Parse into whole seconds. Accepts `300`, `"300"`, `"300s"`, `"5m"`, `"1h"`.
  pub fn as_secs(&self) -> Result<u64, ConfigError> {
    let text = match self {
      TimeoutDef::Seconds(secs) => return Ok(*secs),
      TimeoutDef::Text(text) => text.trim(),
    };

    let invalid = || ConfigError::InvalidTimeout(text.to_string());
    let (digits, scale) = match text.char_indices().last() {
      Some((idx, 's')) => (&text[..idx], 1),
      Some((idx, 'm')) => (&text[..idx], 60),
      Some((idx, 'h')) => (&text[..idx], 3600),
      Some(_) => (text, 1),
      None => return Err(invalid()),
    };

    let value: u64 = digits.trim().parse().map_err(|_| invalid())?;
    value.checked_mul(scale).ok_or_else(invalid)
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShareDef {
  /// `step.<id>.outputs.<name>` or `self.outputs.<name>`.
  pub source: String,
  pub url: String,
  #[serde(default)]
  pub permissions: BTreeMap<AccessKind, Targets>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessKind {
  Read,
  Write,
  Admin,
}
