//! Step status derivation.
//!
//! [`schedule`] is a pure function of the session, the latest observations
//! and the current time. It visits steps in dependency order so a status
//! computed earlier in a pass unblocks later steps in the same pass, and
//! returns the changes instead of applying them.
//!
//! Rules per step kind:
//! - Local step (the participant is in `run.targets`): `Running`,
//!   `Completed`, `Shared` and `Failed` are set by commands and kept.
//!   Otherwise `Ready` once every dependency is complete, else
//!   `WaitingForInputs`.
//! - Remote step: `NotReady` until every target member visibly published
//!   it, then `Done`.
//! - Barrier: reachable once its dependencies are complete and, for a
//!   target member, its own gating step is published. The deadline is
//!   fixed at that point. `Completed` when every target member published
//!   the gating step, `Failed` once the deadline passes first.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use concord_flow::{Barrier, Step};

use crate::barrier::{BarrierOutcome, deadline_for, evaluate};
use crate::error::{EngineError, StepError, StepErrorKind};
use crate::observer::Observations;
use crate::session::{Session, StepState};
use crate::status::{SessionStatus, StepStatus};

/// A change to one step's state.
#[derive(Debug, Clone, PartialEq)]
pub struct StepUpdate {
  pub step_id: String,
  pub from: StepStatus,
  pub to: StepStatus,
  pub deadline: Option<DateTime<Utc>>,
  /// Set when the update records a new failure.
  pub error: Option<StepError>,
  /// Barrier members that have not published yet.
  pub pending: Vec<String>,
}

impl StepUpdate {
  pub fn changes_status(&self) -> bool {
    self.from != self.to
  }
}

pub fn schedule(
  session: &Session,
  observations: &Observations,
  now: DateTime<Utc>,
) -> Result<Vec<StepUpdate>, EngineError> {
  let order = session.flow.graph().topological_order()?;
  let mut statuses: HashMap<String, StepStatus> = session
    .steps
    .iter()
    .map(|(id, state)| (id.clone(), state.status))
    .collect();
  let mut updates = Vec::new();

  for step_id in order {
    let (step, state) = session.step(&step_id)?;
    let deps_complete = step
      .depends_on
      .iter()
      .all(|d| statuses.get(d).is_some_and(|s| s.is_complete()));

    let resolution = match &step.barrier {
      Some(barrier) => {
        resolve_barrier(session, barrier, state, deps_complete, &statuses, observations, now)
      }
      None if state.relevant => Resolution::keep(state, local_status(state, deps_complete)),
      None => Resolution::keep(state, remote_status(session, step, state, observations)),
    };

    statuses.insert(step_id.clone(), resolution.status);
    if resolution.status != state.status
      || resolution.deadline != state.deadline
      || resolution.error.is_some()
    {
      updates.push(StepUpdate {
        step_id,
        from: state.status,
        to: resolution.status,
        deadline: resolution.deadline,
        error: resolution.error,
        pending: resolution.pending,
      });
    }
  }

  Ok(updates)
}

/// Apply updates produced by [`schedule`].
pub fn apply(session: &mut Session, updates: &[StepUpdate], now: DateTime<Utc>) -> Result<(), EngineError> {
  for update in updates {
    let state = session.state_mut(&update.step_id)?;
    state.status = update.to;
    state.deadline = update.deadline;
    if let Some(error) = &update.error {
      state.error = Some(error.clone());
    }
    if update.to == StepStatus::Completed && state.completed_at.is_none() {
      state.completed_at = Some(now);
    }
  }
  session.status = session_status(session);
  if !updates.is_empty() {
    session.updated_at = now;
  }
  Ok(())
}

struct Resolution {
  status: StepStatus,
  deadline: Option<DateTime<Utc>>,
  error: Option<StepError>,
  pending: Vec<String>,
}

impl Resolution {
  fn keep(state: &StepState, status: StepStatus) -> Self {
    Self {
      status,
      deadline: state.deadline,
      error: None,
      pending: Vec::new(),
    }
  }
}

fn local_status(state: &StepState, deps_complete: bool) -> StepStatus {
  match state.status {
    StepStatus::Running | StepStatus::Completed | StepStatus::Shared | StepStatus::Failed => {
      state.status
    }
    _ if deps_complete => StepStatus::Ready,
    _ => StepStatus::WaitingForInputs,
  }
}

fn remote_status(
  session: &Session,
  step: &Step,
  state: &StepState,
  observations: &Observations,
) -> StepStatus {
  if state.status == StepStatus::Done {
    return StepStatus::Done;
  }
  let members = session.roster.members_of(step.targets());
  let requires_share = step.shares_output();
  let all_published = members
    .iter()
    .all(|m| observations.is_published(&step.id, m, requires_share));

  if !members.is_empty() && all_published {
    StepStatus::Done
  } else {
    StepStatus::NotReady
  }
}

fn resolve_barrier(
  session: &Session,
  barrier: &Barrier,
  state: &StepState,
  deps_complete: bool,
  statuses: &HashMap<String, StepStatus>,
  observations: &Observations,
  now: DateTime<Utc>,
) -> Resolution {
  if matches!(state.status, StepStatus::Completed | StepStatus::Failed) {
    return Resolution::keep(state, state.status);
  }
  if !deps_complete {
    return Resolution::keep(state, StepStatus::WaitingForInputs);
  }

  let requires_share = session
    .flow
    .get_step(&barrier.wait_for)
    .is_some_and(|gate| gate.shares_output());
  let local_gate = statuses
    .get(&barrier.wait_for)
    .copied()
    .unwrap_or(StepStatus::NotReady);
  let gate_published = match local_gate {
    StepStatus::Shared | StepStatus::Done => true,
    StepStatus::Completed => !requires_share,
    _ => false,
  };

  // A target member reaches the barrier only after its own gating step.
  let members = session.roster.members_of(&barrier.targets);
  let is_member = members
    .iter()
    .any(|m| m.eq_ignore_ascii_case(&session.identity));
  if is_member && !gate_published {
    return Resolution::keep(state, StepStatus::WaitingForInputs);
  }

  let deadline = state.deadline.or_else(|| deadline_for(barrier, now));
  let outcome = evaluate(
    &members,
    |member| {
      if member.eq_ignore_ascii_case(&session.identity) {
        gate_published
      } else {
        observations.is_published(&barrier.wait_for, member, requires_share)
      }
    },
    deadline,
    now,
  );

  match outcome {
    BarrierOutcome::Released => Resolution {
      status: StepStatus::Completed,
      deadline,
      error: None,
      pending: Vec::new(),
    },
    BarrierOutcome::Waiting { pending } => Resolution {
      status: StepStatus::WaitingForInputs,
      deadline,
      error: None,
      pending,
    },
    BarrierOutcome::TimedOut { pending } => {
      let message = format!(
        "timed out after {}s waiting on '{}' from {}",
        barrier.timeout_secs.unwrap_or_default(),
        barrier.wait_for,
        pending.join(", ")
      );
      Resolution {
        status: StepStatus::Failed,
        deadline,
        error: Some(StepError::new(StepErrorKind::BarrierTimeout, message, now)),
        pending,
      }
    }
  }
}

/// Overall status implied by the step states.
pub fn session_status(session: &Session) -> SessionStatus {
  let statuses = || session.flow.steps.iter().map(|s| session.status_of(&s.id));
  if statuses().any(|s| s == StepStatus::Failed) {
    SessionStatus::Failed
  } else if statuses().all(|s| s.is_complete()) {
    SessionStatus::Completed
  } else {
    SessionStatus::Active
  }
}
