use chrono::{DateTime, Utc};
use concord_flow::FlowError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::status::StepStatus;
use crate::store::StoreError;
use crate::template::TemplateError;

/// Category of a failure recorded against a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepErrorKind {
  BarrierTimeout,
  PublishFailure,
  ExecutionFailure,
}

/// Last failure of a step, kept in its state so it can be queried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepError {
  pub kind: StepErrorKind,
  pub message: String,
  pub at: DateTime<Utc>,
}

impl StepError {
  pub fn new(kind: StepErrorKind, message: impl Into<String>, at: DateTime<Utc>) -> Self {
    Self {
      kind,
      message: message.into(),
      at,
    }
  }
}

/// Errors returned by engine commands.
#[derive(Debug, Error)]
pub enum EngineError {
  /// The flow document was refused.
  #[error(transparent)]
  Flow(#[from] FlowError),

  #[error(transparent)]
  Datasite(#[from] concord_datasite::Error),

  #[error(transparent)]
  Template(#[from] TemplateError),

  #[error(transparent)]
  Store(#[from] StoreError),

  #[error("{identity} is not a participant of session {session_id}")]
  RoleMismatch {
    session_id: String,
    identity: String,
  },

  #[error("message does not carry a flow invitation")]
  NotAnInvitation,

  #[error("no invitation for session {0}")]
  InvitationNotFound(String),

  #[error("session not found: {0}")]
  SessionNotFound(String),

  #[error("session {session_id} already exists with a different flow")]
  SessionConflict { session_id: String },

  #[error("invitation for session {0} was declined")]
  InvitationDeclined(String),

  #[error("session {0} is already joined and cannot be declined")]
  AlreadyJoined(String),

  #[error("step '{step_id}' not found in session {session_id}")]
  StepNotFound { session_id: String, step_id: String },

  #[error("step '{step_id}' is not assigned to this participant")]
  NotLocalStep { step_id: String },

  #[error("step '{step_id}' cannot be run while {status}")]
  StepNotRunnable { step_id: String, status: StepStatus },

  #[error("step '{step_id}' cannot be shared while {status}")]
  StepNotShareable { step_id: String, status: StepStatus },

  #[error("step '{step_id}' is not running ({status})")]
  StepNotRunning { step_id: String, status: StepStatus },

  #[error("step '{0}' declares nothing to share")]
  NothingToShare(String),

  #[error("failed to publish step '{step_id}': {message}")]
  PublishFailed { step_id: String, message: String },

  #[error("step '{step_id}' failed: {message}")]
  ExecutionFailed { step_id: String, message: String },

  #[error("failed to send message: {0}")]
  Messaging(String),

  #[error("engine runner is not running")]
  RunnerClosed,
}
