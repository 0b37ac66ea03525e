//! Flow events and notifiers for observability.
//!
//! Events are emitted as sessions change so consumers can log progress,
//! refresh a UI, or react to completion.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::status::StepStatus;

/// Events emitted by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FlowEvent {
  /// An invitation was imported and awaits a decision.
  InvitationImported {
    session_id: String,
    flow_name: String,
    sender: String,
  },

  /// The local participant joined a session.
  SessionJoined { session_id: String, role: String },

  InvitationDeclined { session_id: String },

  /// The scheduler moved a step to a new status.
  StepStatusChanged {
    session_id: String,
    step_id: String,
    from: StepStatus,
    to: StepStatus,
  },

  StepStarted { session_id: String, step_id: String },

  StepCompleted { session_id: String, step_id: String },

  /// A local step failed to execute or publish.
  StepFailed {
    session_id: String,
    step_id: String,
    error: String,
  },

  /// Every artifact of a step was published.
  StepShared { session_id: String, step_id: String },

  BarrierTimedOut {
    session_id: String,
    step_id: String,
    pending: Vec<String>,
  },

  ProgressChanged {
    session_id: String,
    completed: usize,
    total: usize,
  },

  /// Emitted once per session when every step is complete.
  FlowCompleted { session_id: String },

  FlowFailed { session_id: String },
}

/// Trait for receiving flow events.
///
/// The engine calls `notify` for each event; implementations decide what to
/// do with them.
pub trait FlowNotifier: Send + Sync {
  fn notify(&self, event: FlowEvent);
}

/// Discards all events.
#[derive(Debug, Clone, Default)]
pub struct NoopNotifier;

impl FlowNotifier for NoopNotifier {
  fn notify(&self, _event: FlowEvent) {}
}

/// Sends events to an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
  // Sending must not block while a session lock is held.
  sender: mpsc::UnboundedSender<FlowEvent>,
}

impl ChannelNotifier {
  pub fn new(sender: mpsc::UnboundedSender<FlowEvent>) -> Self {
    Self { sender }
  }
}

impl FlowNotifier for ChannelNotifier {
  fn notify(&self, event: FlowEvent) {
    // The receiver may have been dropped.
    let _ = self.sender.send(event);
  }
}

impl<N: FlowNotifier + ?Sized> FlowNotifier for std::sync::Arc<N> {
  fn notify(&self, event: FlowEvent) {
    (**self).notify(event)
  }
}
