use concord_config::AccessKind;
use serde::{Deserialize, Serialize};

use crate::Error;

/// Name of the permission file the sync layer reads in each directory.
pub const ACL_FILE: &str = "syft.pub.yaml";

/// Pattern matching everything below the directory holding the file.
pub const ALL_FILES: &str = "**";

/// Contents of a `syft.pub.yaml` permission file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessControl {
  #[serde(default)]
  pub rules: Vec<AccessRule>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRule {
  pub pattern: String,
  #[serde(default)]
  pub access: Access,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Access {
  #[serde(default)]
  pub admin: Vec<String>,
  #[serde(default)]
  pub read: Vec<String>,
  #[serde(default)]
  pub write: Vec<String>,
}

impl Access {
  fn list_mut(&mut self, kind: AccessKind) -> &mut Vec<String> {
    match kind {
      AccessKind::Admin => &mut self.admin,
      AccessKind::Read => &mut self.read,
      AccessKind::Write => &mut self.write,
    }
  }

  pub fn list(&self, kind: AccessKind) -> &[String] {
    match kind {
      AccessKind::Admin => &self.admin,
      AccessKind::Read => &self.read,
      AccessKind::Write => &self.write,
    }
  }
}

impl AccessControl {
  pub fn from_yaml(source: &str) -> Result<Self, Error> {
    Ok(serde_yaml::from_str(source)?)
  }

  pub fn to_yaml(&self) -> Result<String, Error> {
    Ok(serde_yaml::to_string(self)?)
  }

  /// Grant `kind` on `pattern` to each identity. Returns whether anything
  /// was added.
  pub fn grant<I, S>(&mut self, pattern: &str, kind: AccessKind, identities: I) -> bool
  where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
  {
    let index = match self.rules.iter().position(|r| r.pattern == pattern) {
      Some(index) => index,
      None => {
        self.rules.push(AccessRule {
          pattern: pattern.to_string(),
          access: Access::default(),
        });
        self.rules.len() - 1
      }
    };

    let list = self.rules[index].access.list_mut(kind);
    let mut changed = false;
    for identity in identities {
      let identity = identity.as_ref();
      if !list.iter().any(|existing| existing.eq_ignore_ascii_case(identity)) {
        list.push(identity.to_string());
        changed = true;
      }
    }
    changed
  }

  /// Union `other` into this file. Returns whether anything was added.
  pub fn merge(&mut self, other: &AccessControl) -> bool {
    let mut changed = false;
    for rule in &other.rules {
      for kind in [AccessKind::Admin, AccessKind::Read, AccessKind::Write] {
        changed |= self.grant(&rule.pattern, kind, rule.access.list(kind));
      }
    }
    changed
  }

  /// Whether `identity` holds `kind` on `pattern`.
  pub fn allows(&self, pattern: &str, kind: AccessKind, identity: &str) -> bool {
    self
      .rules
      .iter()
      .filter(|r| r.pattern == pattern)
      .any(|r| r.access.list(kind).iter().any(|i| i.eq_ignore_ascii_case(identity)))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_grant_is_idempotent() {
    let mut acl = AccessControl::default();
    assert!(acl.grant(ALL_FILES, AccessKind::Read, ["b@x.org"]));
    assert!(!acl.grant(ALL_FILES, AccessKind::Read, ["B@x.org"]));
    assert_eq!(acl.rules.len(), 1);
    assert!(acl.allows(ALL_FILES, AccessKind::Read, "b@x.org"));
    assert!(!acl.allows(ALL_FILES, AccessKind::Write, "b@x.org"));
  }

  #[test]
  fn test_merge_unions_rules() {
    let mut existing = AccessControl::default();
    existing.grant(ALL_FILES, AccessKind::Admin, ["a@x.org"]);

    let mut incoming = AccessControl::default();
    incoming.grant(ALL_FILES, AccessKind::Admin, ["a@x.org"]);
    incoming.grant(ALL_FILES, AccessKind::Read, ["b@x.org", "c@x.org"]);

    assert!(existing.merge(&incoming));
    assert!(!existing.merge(&incoming));
    assert_eq!(existing.rules[0].access.read, vec!["b@x.org", "c@x.org"]);
    assert_eq!(existing.rules[0].access.admin, vec!["a@x.org"]);
  }

  #[test]
  fn test_yaml_shape() {
    let source = r#"
rules:
  - pattern: "**"
    access:
      admin: [a@x.org]
      read: [b@x.org]
"#;
    let acl = AccessControl::from_yaml(source).unwrap();
    assert!(acl.allows("**", AccessKind::Read, "b@x.org"));
    assert!(acl.rules[0].access.write.is_empty());

    let encoded = acl.to_yaml().unwrap();
    assert_eq!(AccessControl::from_yaml(&encoded).unwrap(), acl);
  }
}
