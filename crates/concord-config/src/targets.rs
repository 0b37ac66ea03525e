use serde::{Deserialize, Serialize};

/// A single target name or a list of them.
///
/// Flow authors write `targets: contributors` as often as
/// `targets: [contributors, aggregator]`, so both shapes are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Targets {
  One(String),
  Many(Vec<String>),
}

impl Targets {
  /// Flatten into a list, dropping blank entries.
  pub fn to_vec(&self) -> Vec<String> {
    let items: Vec<&String> = match self {
      Targets::One(single) => vec![single],
      Targets::Many(many) => many.iter().collect(),
    };
    items
      .into_iter()
      .map(|s| s.trim().to_string())
      .filter(|s| !s.is_empty())
      .collect()
  }

  pub fn is_empty(&self) -> bool {
    self.to_vec().is_empty()
  }
}

impl Default for Targets {
  fn default() -> Self {
    Targets::Many(Vec::new())
  }
}

impl From<&str> for Targets {
  fn from(value: &str) -> Self {
    Targets::One(value.to_string())
  }
}

impl From<Vec<String>> for Targets {
  fn from(value: Vec<String>) -> Self {
    Targets::Many(value)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_single_target() {
    let targets: Targets = serde_json::from_str("\"contributors\"").unwrap();
    assert_eq!(targets.to_vec(), vec!["contributors".to_string()]);
  }

  #[test]
  fn test_target_list_skips_blank_entries() {
    let targets: Targets = serde_json::from_str(r#"["a", " ", "b "]"#).unwrap();
    assert_eq!(targets.to_vec(), vec!["a".to_string(), "b".to_string()]);
  }

  #[test]
  fn test_default_is_empty() {
    assert!(Targets::default().is_empty());
  }
}
