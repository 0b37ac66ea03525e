//! Reads what other participants have published.
//!
//! Observation is the only way facts cross participant boundaries: for each
//! step and each remote member expected to execute it, look for that
//! member's progress beacon and for the permission marker the publisher
//! leaves next to shared artifacts.

use std::collections::{HashMap, HashSet};

use concord_datasite::{ACL_FILE, SyncStore};
use concord_flow::Step;
use futures::future::join_all;
use tracing::warn;

use crate::coordination::{beacon_url, read_beacon};
use crate::session::Session;
use crate::status::StepStatus;

/// What one participant has visibly published about one step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fact {
  /// Status from the participant's beacon, if one was found.
  pub status: Option<StepStatus>,
  /// Every share destination of the step carries a permission file.
  pub share_marker: bool,
}

impl Fact {
  /// Whether the fact shows the step finished. Steps that declare shares
  /// must have been shared, others only completed.
  pub fn is_published(&self, requires_share: bool) -> bool {
    if self.share_marker {
      return true;
    }
    match self.status {
      Some(StepStatus::Shared) | Some(StepStatus::Done) => true,
      Some(StepStatus::Completed) => !requires_share,
      _ => false,
    }
  }
}

/// Facts keyed by step id and participant identity.
#[derive(Debug, Clone, Default)]
pub struct Observations {
  facts: HashMap<(String, String), Fact>,
}

impl Observations {
  pub fn insert(&mut self, step_id: &str, identity: &str, fact: Fact) {
    self
      .facts
      .insert((step_id.to_string(), identity.to_ascii_lowercase()), fact);
  }

  pub fn fact(&self, step_id: &str, identity: &str) -> Option<&Fact> {
    self
      .facts
      .get(&(step_id.to_string(), identity.to_ascii_lowercase()))
  }

  pub fn is_published(&self, step_id: &str, identity: &str, requires_share: bool) -> bool {
    self
      .fact(step_id, identity)
      .is_some_and(|f| f.is_published(requires_share))
  }

  pub fn len(&self) -> usize {
    self.facts.len()
  }

  pub fn is_empty(&self) -> bool {
    self.facts.is_empty()
  }
}

/// The (step, member) pairs whose published state the scheduler needs.
fn watched_pairs(session: &Session) -> Vec<(&Step, String)> {
  let mut seen = HashSet::new();
  let mut pairs = Vec::new();

  for step in &session.flow.steps {
    let watched = match &step.barrier {
      Some(barrier) => match session.flow.get_step(&barrier.wait_for) {
        Some(gate) => gate,
        None => continue,
      },
      None => step,
    };

    for member in session.roster.members_of(step.targets()) {
      if member.eq_ignore_ascii_case(&session.identity) {
        continue;
      }
      if seen.insert((watched.id.clone(), member.to_ascii_lowercase())) {
        pairs.push((watched, member));
      }
    }
  }

  pairs
}

async fn observe_one(store: &dyn SyncStore, session: &Session, step: &Step, member: &str) -> Fact {
  let mut fact = Fact::default();

  if let Some(role) = session.roster.role_of(member) {
    match session.progress_url(member) {
      Ok(dir) => {
        if let Ok(url) = beacon_url(&dir, role, &step.id) {
          fact.status = read_beacon(store, &url).await.map(|b| b.status());
        }
      }
      Err(e) => {
        warn!(session_id = %session.session_id, member, error = %e, "cannot resolve coordination url");
      }
    }
  }

  if step.shares_output() {
    let mut all_marked = true;
    for share in &step.shares {
      let marker = session
        .share_url(step, &share.url, member)
        .ok()
        .and_then(|url| url.parent())
        .and_then(|dir| dir.join(ACL_FILE).ok());
      let found = match marker {
        Some(url) => store.exists(&url).await.unwrap_or(false),
        None => false,
      };
      if !found {
        all_marked = false;
        break;
      }
    }
    fact.share_marker = all_marked;
  }

  fact
}

/// Collect facts about every remote member the session depends on.
pub async fn observe(store: &dyn SyncStore, session: &Session) -> Observations {
  let pairs = watched_pairs(session);
  let facts = join_all(
    pairs
      .iter()
      .map(|(step, member)| observe_one(store, session, step, member)),
  )
  .await;

  let mut observations = Observations::default();
  for ((step, member), fact) in pairs.iter().zip(facts) {
    observations.insert(&step.id, member, fact);
  }
  observations
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_fact_requirements() {
    let completed = Fact {
      status: Some(StepStatus::Completed),
      share_marker: false,
    };
    assert!(completed.is_published(false));
    assert!(!completed.is_published(true));

    let marked = Fact {
      status: None,
      share_marker: true,
    };
    assert!(marked.is_published(true));

    assert!(!Fact::default().is_published(false));
  }

  #[test]
  fn test_lookup_ignores_case() {
    let mut obs = Observations::default();
    obs.insert(
      "generate",
      "Client1@Sandbox.local",
      Fact {
        status: Some(StepStatus::Shared),
        share_marker: false,
      },
    );
    assert!(obs.is_published("generate", "client1@sandbox.local", true));
    assert!(!obs.is_published("aggregate", "client1@sandbox.local", false));
  }
}
