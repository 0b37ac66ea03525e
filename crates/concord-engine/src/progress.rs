use std::fmt;

use serde::{Deserialize, Serialize};

use crate::session::Session;

/// Completed steps over declared steps for one session.
///
/// Each declared step counts once, however many participants execute it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
  pub completed: usize,
  pub total: usize,
}

impl Progress {
  pub fn of(session: &Session) -> Self {
    let completed = session
      .flow
      .steps
      .iter()
      .filter(|step| session.status_of(&step.id).is_complete())
      .count();
    Self {
      completed,
      total: session.flow.steps.len(),
    }
  }

  pub fn is_done(&self) -> bool {
    self.completed == self.total
  }
}

impl fmt::Display for Progress {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.is_done() {
      f.write_str("Done")
    } else {
      write!(f, "{}/{} steps complete", self.completed, self.total)
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_text() {
    assert_eq!(Progress { completed: 2, total: 5 }.to_string(), "2/5 steps complete");
    assert_eq!(Progress { completed: 5, total: 5 }.to_string(), "Done");
  }
}
