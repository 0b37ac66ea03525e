use std::fmt;

use serde::{Deserialize, Serialize};

/// Status of one step as seen by the local participant.
///
/// Serialized with the wire names shared by every participant
/// (`NotReady`, `WaitingForInputs`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StepStatus {
  NotReady,
  WaitingForInputs,
  Ready,
  Running,
  Completed,
  Shared,
  Done,
  Failed,
}

impl StepStatus {
  /// Counts towards progress and unblocks dependents.
  pub fn is_complete(self) -> bool {
    matches!(self, Self::Completed | Self::Shared | Self::Done)
  }

  /// Parse a status written by another participant.
  ///
  /// Accepts the wire names case-insensitively plus the spellings other
  /// runners emit (`complete`, `success`, `in_progress`, `error`, ...).
  /// Anything unrecognised is treated as not started.
  pub fn normalize(raw: &str) -> Self {
    match raw.trim().to_ascii_lowercase().as_str() {
      "shared" => Self::Shared,
      "done" => Self::Done,
      "completed" | "complete" | "success" | "succeeded" | "sharing" => Self::Completed,
      "running" | "in_progress" | "in-progress" => Self::Running,
      "ready" => Self::Ready,
      "waitingforinputs" | "waiting_for_inputs" | "waiting-for-inputs" => Self::WaitingForInputs,
      "failed" | "error" => Self::Failed,
      _ => Self::NotReady,
    }
  }

  pub fn as_str(self) -> &'static str {
    match self {
      Self::NotReady => "NotReady",
      Self::WaitingForInputs => "WaitingForInputs",
      Self::Ready => "Ready",
      Self::Running => "Running",
      Self::Completed => "Completed",
      Self::Shared => "Shared",
      Self::Done => "Done",
      Self::Failed => "Failed",
    }
  }
}

impl fmt::Display for StepStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Overall state of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
  #[default]
  Active,
  Completed,
  Failed,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_wire_names() {
    assert_eq!(
      serde_json::to_string(&StepStatus::WaitingForInputs).unwrap(),
      "\"WaitingForInputs\""
    );
    assert_eq!(StepStatus::NotReady.to_string(), "NotReady");
  }

  #[test]
  fn test_normalize() {
    assert_eq!(StepStatus::normalize("Shared"), StepStatus::Shared);
    assert_eq!(StepStatus::normalize(" success "), StepStatus::Completed);
    assert_eq!(StepStatus::normalize("in-progress"), StepStatus::Running);
    assert_eq!(StepStatus::normalize("ERROR"), StepStatus::Failed);
    assert_eq!(StepStatus::normalize("pending"), StepStatus::NotReady);
  }

  #[test]
  fn test_complete_statuses() {
    assert!(StepStatus::Completed.is_complete());
    assert!(StepStatus::Shared.is_complete());
    assert!(StepStatus::Done.is_complete());
    assert!(!StepStatus::Running.is_complete());
    assert!(!StepStatus::Failed.is_complete());
  }
}
