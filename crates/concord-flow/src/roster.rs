use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::flow::{ALL_TARGET, Flow};

/// A participant named in an invitation: an identity bound to a role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
  pub email: String,
  pub role: String,
}

impl Participant {
  pub fn new(email: impl Into<String>, role: impl Into<String>) -> Self {
    Self {
      email: email.into(),
      role: role.into(),
    }
  }

  /// Pair `datasites.all` with `roles` by position.
  pub fn default_assignment(flow: &Flow) -> Vec<Participant> {
    flow
      .datasites
      .all
      .iter()
      .zip(flow.roles.iter())
      .map(|(email, role)| Participant::new(email, &role.id))
      .collect()
  }
}

/// Placeholder tokens that refer to datasites by position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasiteToken {
  /// `{datasites[*]}`
  All,
  /// `{datasites[i]}`
  Index(usize),
  /// `{datasite.current}`
  Current,
}

impl DatasiteToken {
  pub fn parse(token: &str) -> Option<Self> {
    let inner = token.trim().strip_prefix('{')?.strip_suffix('}')?.trim();
    if inner == "datasite.current" {
      return Some(Self::Current);
    }
    let index = inner.strip_prefix("datasites[")?.strip_suffix(']')?.trim();
    if index == "*" {
      return Some(Self::All);
    }
    index.parse().ok().map(Self::Index)
  }
}

/// Role groups of one flow instance resolved to concrete identities.
///
/// Built once per session from the flow's `datasites` block and the
/// invitation's participant list. Every group, every role id and the
/// implicit `all` group map to an ordered, de-duplicated identity list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Roster {
  participants: Vec<Participant>,
  /// `datasites.all` with placeholders swapped for invited identities.
  datasites: Vec<String>,
  groups: BTreeMap<String, Vec<String>>,
}

impl Roster {
  pub fn new(flow: &Flow, participants: &[Participant]) -> Self {
    let participants = if participants.is_empty() {
      Participant::default_assignment(flow)
    } else {
      participants.to_vec()
    };

    // A declared identity that was not invited is replaced by the
    // participant at the same position.
    let datasites: Vec<String> = flow
      .datasites
      .all
      .iter()
      .enumerate()
      .map(|(idx, declared)| {
        if let Some(p) = participants.iter().find(|p| p.email.eq_ignore_ascii_case(declared)) {
          return p.email.clone();
        }
        participants
          .get(idx)
          .map(|p| p.email.clone())
          .unwrap_or_else(|| declared.clone())
      })
      .collect();

    let everyone: Vec<String> = if participants.is_empty() {
      datasites.clone()
    } else {
      participants.iter().map(|p| p.email.clone()).collect()
    };

    let mut roster = Self {
      participants,
      datasites,
      groups: BTreeMap::new(),
    };

    let mut groups = BTreeMap::new();
    for (name, include) in &flow.datasites.groups {
      let mut members = Vec::new();
      for token in include {
        for email in roster.expand_token(token, &everyone) {
          push_unique(&mut members, email);
        }
      }
      groups.insert(name.clone(), members);
    }

    for role in &flow.roles {
      if groups.contains_key(&role.id) {
        continue;
      }
      let members = roster
        .participants
        .iter()
        .filter(|p| p.role == role.id)
        .map(|p| p.email.clone())
        .collect();
      groups.insert(role.id.clone(), members);
    }

    groups.entry(ALL_TARGET.to_string()).or_insert(everyone);
    roster.groups = groups;
    roster
  }

  fn expand_token(&self, token: &str, everyone: &[String]) -> Vec<String> {
    let token = token.trim();
    match DatasiteToken::parse(token) {
      Some(DatasiteToken::All) => return everyone.to_vec(),
      Some(DatasiteToken::Index(idx)) => return self.datasites.get(idx).cloned().into_iter().collect(),
      Some(DatasiteToken::Current) => return Vec::new(),
      None => {}
    }
    if token == ALL_TARGET {
      return everyone.to_vec();
    }
    if token.contains('@') {
      return vec![self.canonical_email(token)];
    }
    // A bare role id inside an include list.
    self
      .participants
      .iter()
      .filter(|p| p.role == token)
      .map(|p| p.email.clone())
      .collect()
  }

  fn canonical_email(&self, email: &str) -> String {
    self
      .participants
      .iter()
      .find(|p| p.email.eq_ignore_ascii_case(email))
      .map(|p| p.email.clone())
      .unwrap_or_else(|| email.to_string())
  }

  pub fn participants(&self) -> &[Participant] {
    &self.participants
  }

  /// `datasites.all` as bound for this flow instance.
  pub fn datasites(&self) -> &[String] {
    &self.datasites
  }

  pub fn role_of(&self, email: &str) -> Option<&str> {
    self
      .participants
      .iter()
      .find(|p| p.email.eq_ignore_ascii_case(email))
      .map(|p| p.role.as_str())
  }

  /// Identities a single target resolves to.
  pub fn members(&self, target: &str) -> Vec<String> {
    match self.groups.get(target.trim()) {
      Some(members) => members.clone(),
      None => self.expand_token(target, self.all_members()),
    }
  }

  /// Union of the members of several targets, in first-seen order.
  pub fn members_of(&self, targets: &[String]) -> Vec<String> {
    let mut members = Vec::new();
    for target in targets {
      for email in self.members(target) {
        push_unique(&mut members, email);
      }
    }
    members
  }

  pub fn contains(&self, targets: &[String], email: &str) -> bool {
    self
      .members_of(targets)
      .iter()
      .any(|m| m.eq_ignore_ascii_case(email))
  }

  /// Resolve permission recipients. `{datasite.current}` maps to
  /// `current`; everything else resolves like a target.
  pub fn resolve_recipients(&self, recipients: &[String], current: &str) -> Vec<String> {
    let mut resolved = Vec::new();
    for recipient in recipients {
      if DatasiteToken::parse(recipient) == Some(DatasiteToken::Current) {
        push_unique(&mut resolved, current.to_string());
        continue;
      }
      for email in self.members(recipient) {
        push_unique(&mut resolved, email);
      }
    }
    resolved
  }

  fn all_members(&self) -> &[String] {
    self
      .groups
      .get(ALL_TARGET)
      .map(|v| v.as_slice())
      .unwrap_or(&[])
  }
}

fn push_unique(list: &mut Vec<String>, email: String) {
  if !list.iter().any(|e| e.eq_ignore_ascii_case(&email)) {
    list.push(email);
  }
}
