//! The flow engine.
//!
//! `FlowEngine` owns the command surface for one local participant. Every
//! command takes the session's mutex, loads the session, applies its change,
//! then re-observes the other participants and recomputes every step status
//! before saving. Step execution runs outside the mutex.
//!
//! Saves are revision checked, so another process holding the same session
//! store cannot be overwritten by a stale copy. A command that loses such a
//! race is replayed from a fresh load. Events are delivered only once the
//! save that produced them succeeded.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use concord_datasite::SyncStore;
use concord_flow::{Flow, Participant, Roster, Step};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, instrument, warn};

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::coordination::{
  LogEntry, LogEvent, ParticipantProgress, append_log, ensure_progress_acl, read_participant_logs,
  read_participant_progress, write_beacon,
};
use crate::error::{EngineError, StepError, StepErrorKind};
use crate::events::{FlowEvent, FlowNotifier, NoopNotifier};
use crate::execution::{
  ExecutionFailure, ExecutionOutcome, ExecutionRequest, StepExecutor, build_request, collect_outputs,
};
use crate::invitation::{
  FlowInvitation, InboundMessage, InvitationRecord, InvitationState, InvitationView,
  MessageMetadata, OutboundMessage,
};
use crate::messaging::Messenger;
use crate::observer::observe;
use crate::progress::Progress;
use crate::publisher::publish_step;
use crate::scheduler::{apply, schedule};
use crate::session::Session;
use crate::status::{SessionStatus, StepStatus};
use crate::store::{SessionStore, StoreError};
use crate::view::FlowStateView;

/// Attempts per command when another writer saved the session first.
const MAX_SAVE_ATTEMPTS: u32 = 5;

/// Error attached to a step whose execution never reported back.
const INTERRUPTED: &str = "execution interrupted";

/// External services the engine talks to.
#[derive(Clone)]
pub struct Collaborators {
  /// Local replica of every participant's datasite.
  pub datasites: Arc<dyn SyncStore>,
  pub sessions: Arc<dyn SessionStore>,
  pub executor: Arc<dyn StepExecutor>,
  pub messenger: Arc<dyn Messenger>,
  pub clock: Arc<dyn Clock>,
}

/// Multiparty flow engine for one local participant.
///
/// Generic over `N: FlowNotifier`. Use `FlowEngine::new()` to discard
/// events, or `FlowEngine::with_notifier()` to observe them.
pub struct FlowEngine<N: FlowNotifier = NoopNotifier> {
  config: EngineConfig,
  collaborators: Collaborators,
  notifier: N,
  locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl FlowEngine<NoopNotifier> {
  pub fn new(config: EngineConfig, collaborators: Collaborators) -> Self {
    Self::with_notifier(config, collaborators, NoopNotifier)
  }
}

impl<N: FlowNotifier> FlowEngine<N> {
  pub fn with_notifier(config: EngineConfig, collaborators: Collaborators, notifier: N) -> Self {
    if !collaborators
      .datasites
      .owner()
      .eq_ignore_ascii_case(&config.identity)
    {
      warn!(
        identity = %config.identity,
        owner = %collaborators.datasites.owner(),
        "datasite store belongs to a different identity; publishing will fail"
      );
    }
    Self {
      config,
      collaborators,
      notifier,
      locks: Mutex::new(HashMap::new()),
    }
  }

  pub fn config(&self) -> &EngineConfig {
    &self.config
  }

  pub fn identity(&self) -> &str {
    &self.config.identity
  }

  pub fn executor(&self) -> Arc<dyn StepExecutor> {
    Arc::clone(&self.collaborators.executor)
  }

  fn store(&self) -> &dyn SyncStore {
    self.collaborators.datasites.as_ref()
  }

  fn now(&self) -> DateTime<Utc> {
    self.collaborators.clock.now()
  }

  async fn lock(&self, session_id: &str) -> OwnedMutexGuard<()> {
    let lock = {
      let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
      Arc::clone(locks.entry(session_id.to_string()).or_default())
    };
    lock.lock_owned().await
  }

  /// Replay `attempt` while its save loses to a newer record.
  async fn retrying<T, F, Fut>(&self, session_id: &str, mut attempt: F) -> Result<T, EngineError>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, EngineError>>,
  {
    let mut attempts = 1;
    loop {
      match attempt().await {
        Err(EngineError::Store(StoreError::Conflict { found, .. }))
          if attempts < MAX_SAVE_ATTEMPTS =>
        {
          debug!(session_id, attempts, stored_revision = found, "session saved elsewhere, replaying");
          attempts += 1;
        }
        result => return result,
      }
    }
  }

  /// Append to the local coordination log. The log is informational, so a
  /// failed append is only reported.
  async fn log(&self, session: &Session, event: LogEvent, step_id: Option<&str>, at: DateTime<Utc>) {
    if let Err(e) = append_log(self.store(), session, event, step_id, at).await {
      warn!(
        session_id = %session.session_id,
        ?event,
        error = %e,
        "failed to append coordination log"
      );
    }
  }

  async fn load(&self, session_id: &str) -> Result<Session, EngineError> {
    self
      .collaborators
      .sessions
      .load_session(session_id)
      .await?
      .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))
  }

  async fn load_invitation(&self, session_id: &str) -> Result<InvitationRecord, EngineError> {
    self
      .collaborators
      .sessions
      .load_invitation(session_id)
      .await?
      .ok_or_else(|| EngineError::InvitationNotFound(session_id.to_string()))
  }

  /// Validate and store an invitation without joining it.
  ///
  /// Importing the same flow for a known session is a no-op. A different flow
  /// under an existing session id is refused.
  #[instrument(skip(self, message), fields(sender = %message.sender))]
  pub async fn import_invitation(&self, message: &InboundMessage) -> Result<InvitationView, EngineError> {
    let invitation = message
      .metadata
      .flow_invitation
      .as_ref()
      .ok_or(EngineError::NotAnInvitation)?;
    invitation.parse_flow()?;
    let digest = invitation.spec_digest();
    let session_id = invitation.session_id.clone();

    let _guard = self.lock(&session_id).await;
    let sessions = &self.collaborators.sessions;

    if let Some(existing) = sessions.load_invitation(&session_id).await? {
      if existing.spec_digest != digest {
        return Err(EngineError::SessionConflict { session_id });
      }
      debug!(session_id = %session_id, "invitation already imported");
      return Ok(InvitationView::from(&existing));
    }

    let state = match sessions.load_session(&session_id).await? {
      Some(session) if session.spec_digest != digest => {
        return Err(EngineError::SessionConflict { session_id });
      }
      Some(_) => InvitationState::Joined,
      None => InvitationState::Pending,
    };

    let record = InvitationRecord {
      invitation: invitation.clone(),
      sender: message.sender.clone(),
      spec_digest: digest,
      state,
      received_at: self.now(),
    };
    sessions.save_invitation(&record).await?;

    info!(session_id = %session_id, flow_name = %invitation.flow_name, "invitation imported");
    self.notifier.notify(FlowEvent::InvitationImported {
      session_id,
      flow_name: invitation.flow_name.clone(),
      sender: message.sender.clone(),
    });
    Ok(InvitationView::from(&record))
  }

  pub async fn invitation(&self, session_id: &str) -> Result<InvitationView, EngineError> {
    Ok(InvitationView::from(&self.load_invitation(session_id).await?))
  }

  pub async fn list_invitations(&self) -> Result<Vec<InvitationView>, EngineError> {
    let records = self.collaborators.sessions.list_invitations().await?;
    Ok(records.iter().map(InvitationView::from).collect())
  }

  /// Join an imported invitation. Joining twice returns the existing session.
  #[instrument(skip(self))]
  pub async fn join(&self, session_id: &str) -> Result<FlowStateView, EngineError> {
    self.retrying(session_id, || self.join_once(session_id)).await
  }

  async fn join_once(&self, session_id: &str) -> Result<FlowStateView, EngineError> {
    let _guard = self.lock(session_id).await;
    let mut record = self.load_invitation(session_id).await?;

    if record.state == InvitationState::Declined {
      return Err(EngineError::InvitationDeclined(session_id.to_string()));
    }

    if let Some(session) = self.collaborators.sessions.load_session(session_id).await? {
      if record.state != InvitationState::Joined {
        record.state = InvitationState::Joined;
        self.collaborators.sessions.save_invitation(&record).await?;
      }
      let before = session.progress();
      let session = self.commit(session, before, Vec::new()).await?;
      return Ok(FlowStateView::of(&session));
    }

    let flow = record.invitation.parse_flow()?;
    let session = self.create_session(
      session_id,
      flow,
      &record.spec_digest,
      &record.invitation.participants,
    )?;
    ensure_progress_acl(self.store(), &session).await?;

    let before = session.progress();
    let joined = FlowEvent::SessionJoined {
      session_id: session_id.to_string(),
      role: session.role.clone(),
    };
    let session = self.commit(session, before, vec![joined]).await?;

    record.state = InvitationState::Joined;
    self.collaborators.sessions.save_invitation(&record).await?;

    self.log(&session, LogEvent::Joined, None, self.now()).await;
    info!(session_id, role = %session.role, "joined session");
    Ok(FlowStateView::of(&session))
  }

  /// Import and join in one step.
  pub async fn accept_invitation(&self, message: &InboundMessage) -> Result<FlowStateView, EngineError> {
    let view = self.import_invitation(message).await?;
    self.join(&view.session_id).await
  }

  /// Decline a pending invitation. Declining twice is a no-op.
  #[instrument(skip(self))]
  pub async fn decline(&self, session_id: &str) -> Result<InvitationView, EngineError> {
    let _guard = self.lock(session_id).await;
    let mut record = self.load_invitation(session_id).await?;

    let joined = record.state == InvitationState::Joined
      || self
        .collaborators
        .sessions
        .load_session(session_id)
        .await?
        .is_some();
    if joined {
      return Err(EngineError::AlreadyJoined(session_id.to_string()));
    }

    if record.state != InvitationState::Declined {
      record.state = InvitationState::Declined;
      self.collaborators.sessions.save_invitation(&record).await?;
      info!(session_id, "invitation declined");
      self.notifier.notify(FlowEvent::InvitationDeclined {
        session_id: session_id.to_string(),
      });
    }
    Ok(InvitationView::from(&record))
  }

  /// Propose a flow: create a session for it, join it locally, and invite
  /// every other participant.
  #[instrument(skip(self, flow_spec, participants))]
  pub async fn send_invitation(
    &self,
    flow_spec: serde_json::Value,
    participants: Vec<Participant>,
  ) -> Result<FlowStateView, EngineError> {
    let flow = Flow::from_json_value(flow_spec.clone())?;
    let participants = if participants.is_empty() {
      Participant::default_assignment(&flow)
    } else {
      participants
    };

    let invitation = FlowInvitation {
      flow_name: flow.name.clone(),
      session_id: uuid::Uuid::new_v4().to_string(),
      participants,
      flow_spec,
    };
    let session_id = invitation.session_id.clone();

    let record = InvitationRecord {
      spec_digest: invitation.spec_digest(),
      invitation: invitation.clone(),
      sender: self.config.identity.clone(),
      state: InvitationState::Pending,
      received_at: self.now(),
    };
    self.collaborators.sessions.save_invitation(&record).await?;
    let view = self.join(&session_id).await?;

    let recipients: Vec<String> = invitation
      .participants
      .iter()
      .map(|p| p.email.clone())
      .filter(|email| !email.eq_ignore_ascii_case(&self.config.identity))
      .fold(Vec::new(), |mut acc, email| {
        if !acc.iter().any(|e: &String| e.eq_ignore_ascii_case(&email)) {
          acc.push(email);
        }
        acc
      });

    if !recipients.is_empty() {
      let message = OutboundMessage {
        recipients,
        subject: format!("Flow invitation: {}", flow.name),
        body: format!(
          "{} invites you to run '{}' (session {}).",
          self.config.identity, flow.name, session_id
        ),
        metadata: MessageMetadata {
          flow_invitation: Some(invitation),
          ..Default::default()
        },
      };
      self.collaborators.messenger.send_message(message).await?;
    }

    info!(session_id = %session_id, flow_name = %flow.name, "invitation sent");
    Ok(view)
  }

  fn create_session(
    &self,
    session_id: &str,
    flow: Flow,
    spec_digest: &str,
    participants: &[Participant],
  ) -> Result<Session, EngineError> {
    let identity = &self.config.identity;
    let roster = Roster::new(&flow, participants);
    let role = roster
      .role_of(identity)
      .filter(|role| flow.has_role(role))
      .map(str::to_string)
      .ok_or_else(|| EngineError::RoleMismatch {
        session_id: session_id.to_string(),
        identity: identity.clone(),
      })?;

    Ok(Session::new(
      session_id,
      flow,
      spec_digest,
      identity,
      &role,
      roster,
      self.now(),
    ))
  }

  /// Re-observe and recompute one session.
  pub async fn refresh(&self, session_id: &str) -> Result<FlowStateView, EngineError> {
    self.retrying(session_id, || self.refresh_once(session_id)).await
  }

  async fn refresh_once(&self, session_id: &str) -> Result<FlowStateView, EngineError> {
    let _guard = self.lock(session_id).await;
    let session = self.load(session_id).await?;
    let before = session.progress();
    let session = self.commit(session, before, Vec::new()).await?;
    Ok(FlowStateView::of(&session))
  }

  pub async fn get_multiparty_flow_state(&self, session_id: &str) -> Result<FlowStateView, EngineError> {
    self.refresh(session_id).await
  }

  pub async fn progress(&self, session_id: &str) -> Result<Progress, EngineError> {
    let view = self.refresh(session_id).await?;
    Ok(Progress {
      completed: view.progress.0,
      total: view.progress.1,
    })
  }

  pub async fn get_step_output_files(
    &self,
    session_id: &str,
    step_id: &str,
  ) -> Result<Vec<PathBuf>, EngineError> {
    let session = self.load(session_id).await?;
    let (_, state) = session.step(step_id)?;
    Ok(state.output_files.clone())
  }

  /// What every participant has published for the steps they run, read from
  /// the local replica.
  pub async fn participant_progress(
    &self,
    session_id: &str,
  ) -> Result<Vec<ParticipantProgress>, EngineError> {
    let session = self.load(session_id).await?;
    Ok(read_participant_progress(self.store(), &session).await)
  }

  /// Every participant's coordination log merged into one timeline.
  pub async fn participant_logs(&self, session_id: &str) -> Result<Vec<LogEntry>, EngineError> {
    let session = self.load(session_id).await?;
    Ok(read_participant_logs(self.store(), &session).await)
  }

  /// Snapshots of every joined session, without recomputing.
  pub async fn sessions(&self) -> Result<Vec<FlowStateView>, EngineError> {
    let sessions = self.collaborators.sessions.list_sessions().await?;
    Ok(sessions.iter().map(FlowStateView::of).collect())
  }

  /// Refresh every active session. Failures are logged per session.
  pub async fn poll_all(&self) -> Result<Vec<FlowStateView>, EngineError> {
    let sessions = self.collaborators.sessions.list_sessions().await?;
    let mut views = Vec::new();
    for session in sessions.iter().filter(|s| !s.is_finished()) {
      match self.refresh(&session.session_id).await {
        Ok(view) => views.push(view),
        Err(e) => {
          warn!(session_id = %session.session_id, error = %e, "failed to refresh session");
        }
      }
    }
    Ok(views)
  }

  /// Mark a ready local step as running and build its execution request.
  ///
  /// If the request cannot be prepared the step stays `Ready` with the
  /// failure attached.
  #[instrument(skip(self))]
  pub async fn begin_step(&self, session_id: &str, step_id: &str) -> Result<ExecutionRequest, EngineError> {
    self
      .retrying(session_id, || self.begin_step_once(session_id, step_id))
      .await
  }

  async fn begin_step_once(&self, session_id: &str, step_id: &str) -> Result<ExecutionRequest, EngineError> {
    let _guard = self.lock(session_id).await;
    let session = self.load(session_id).await?;
    let before = session.progress();
    let mut session = self.commit(session, before, Vec::new()).await?;

    let (step, state) = session.step(step_id)?;
    if !state.relevant {
      return Err(EngineError::NotLocalStep {
        step_id: step_id.to_string(),
      });
    }
    if state.status != StepStatus::Ready {
      return Err(EngineError::StepNotRunnable {
        step_id: step_id.to_string(),
        status: state.status,
      });
    }

    let prepared = async {
      let request = build_request(self.store(), &session, step).await?;
      tokio::fs::create_dir_all(&request.output_dir)
        .await
        .map_err(concord_datasite::Error::from)?;
      Ok::<_, EngineError>(request)
    }
    .await;

    let now = self.now();
    let before = session.progress();
    let request = match prepared {
      Ok(request) => request,
      Err(e) => {
        let message = format!("cannot prepare execution: {e}");
        session.state_mut(step_id)?.error =
          Some(StepError::new(StepErrorKind::ExecutionFailure, message.clone(), now));
        warn!(session_id, step_id, error = %e, "failed to prepare step execution");
        let failed = FlowEvent::StepFailed {
          session_id: session_id.to_string(),
          step_id: step_id.to_string(),
          error: message,
        };
        self.commit(session, before, vec![failed]).await?;
        return Err(e);
      }
    };

    let state = session.state_mut(step_id)?;
    state.status = StepStatus::Running;
    state.started_at = Some(now);
    state.error = None;

    let started = FlowEvent::StepStarted {
      session_id: session_id.to_string(),
      step_id: step_id.to_string(),
    };
    let session = self.commit(session, before, vec![started]).await?;

    self.log(&session, LogEvent::StepStarted, Some(step_id), now).await;
    info!(session_id, step_id, inputs = request.inputs.len(), "step started");
    Ok(request)
  }

  /// Record the result of executing a step started with [`Self::begin_step`].
  ///
  /// A failed execution, or outputs that cannot be recorded, return the step
  /// to `Ready` with the error attached.
  #[instrument(skip(self, result))]
  pub async fn finish_step(
    &self,
    session_id: &str,
    step_id: &str,
    result: Result<ExecutionOutcome, ExecutionFailure>,
  ) -> Result<FlowStateView, EngineError> {
    self
      .retrying(session_id, || self.finish_step_once(session_id, step_id, &result))
      .await
  }

  async fn finish_step_once(
    &self,
    session_id: &str,
    step_id: &str,
    result: &Result<ExecutionOutcome, ExecutionFailure>,
  ) -> Result<FlowStateView, EngineError> {
    let _guard = self.lock(session_id).await;
    let mut session = self.load(session_id).await?;
    let before = session.progress();

    let (step, state) = session.step(step_id)?;
    if state.status != StepStatus::Running {
      return Err(EngineError::StepNotRunning {
        step_id: step_id.to_string(),
        status: state.status,
      });
    }
    let now = self.now();

    let recorded = match result {
      Ok(outcome) => self
        .record_outputs(&session, step, outcome.clone())
        .await
        .map_err(|e| ExecutionFailure::new(format!("cannot record outputs: {e}"))),
      Err(failure) => Err(failure.clone()),
    };

    match recorded {
      Ok((outputs, files)) => {
        let state = session.state_mut(step_id)?;
        state.status = StepStatus::Completed;
        state.completed_at = Some(now);
        state.error = None;
        state.outputs = outputs;
        state.output_files = files;

        let completed = FlowEvent::StepCompleted {
          session_id: session_id.to_string(),
          step_id: step_id.to_string(),
        };
        let session = self.commit(session, before, vec![completed]).await?;

        self.log(&session, LogEvent::StepCompleted, Some(step_id), now).await;
        info!(session_id, step_id, "step completed");
        Ok(FlowStateView::of(&session))
      }
      Err(failure) => {
        self
          .fail_execution(session, before, step_id, &failure.message, now)
          .await?;
        Err(EngineError::ExecutionFailed {
          step_id: step_id.to_string(),
          message: failure.message,
        })
      }
    }
  }

  async fn record_outputs(
    &self,
    session: &Session,
    step: &Step,
    outcome: ExecutionOutcome,
  ) -> Result<(BTreeMap<String, PathBuf>, Vec<PathBuf>), EngineError> {
    let output_url = session.step_output_url(step, &session.identity)?;
    collect_outputs(self.store(), &output_url, outcome).await
  }

  /// Return a running step to `Ready` with `message` attached.
  async fn fail_execution(
    &self,
    mut session: Session,
    before: Progress,
    step_id: &str,
    message: &str,
    now: DateTime<Utc>,
  ) -> Result<Session, EngineError> {
    let state = session.state_mut(step_id)?;
    state.status = StepStatus::Ready;
    state.started_at = None;
    state.error = Some(StepError::new(StepErrorKind::ExecutionFailure, message, now));

    warn!(session_id = %session.session_id, step_id, error = message, "step execution failed");
    let failed = FlowEvent::StepFailed {
      session_id: session.session_id.clone(),
      step_id: step_id.to_string(),
      error: message.to_string(),
    };
    let session = self.commit(session, before, vec![failed]).await?;
    self.log(&session, LogEvent::StepFailed, Some(step_id), now).await;
    Ok(session)
  }

  /// Run a local step to completion with the configured executor.
  pub async fn run_step(&self, session_id: &str, step_id: &str) -> Result<FlowStateView, EngineError> {
    let request = self.begin_step(session_id, step_id).await?;
    let result = self.collaborators.executor.execute(request).await;
    self.finish_step(session_id, step_id, result).await
  }

  /// Abandon an execution that will never report back, such as one whose
  /// process died. The step returns to `Ready` and can be run again.
  #[instrument(skip(self))]
  pub async fn reset_step(&self, session_id: &str, step_id: &str) -> Result<FlowStateView, EngineError> {
    self
      .retrying(session_id, || self.reset_step_once(session_id, step_id))
      .await
  }

  async fn reset_step_once(&self, session_id: &str, step_id: &str) -> Result<FlowStateView, EngineError> {
    let _guard = self.lock(session_id).await;
    let session = self.load(session_id).await?;
    let before = session.progress();

    let (_, state) = session.step(step_id)?;
    if !state.relevant {
      return Err(EngineError::NotLocalStep {
        step_id: step_id.to_string(),
      });
    }
    if state.status != StepStatus::Running {
      return Err(EngineError::StepNotRunning {
        step_id: step_id.to_string(),
        status: state.status,
      });
    }

    let session = self
      .fail_execution(session, before, step_id, INTERRUPTED, self.now())
      .await?;
    info!(session_id, step_id, "step reset");
    Ok(FlowStateView::of(&session))
  }

  /// Publish every artifact a completed local step declares.
  ///
  /// Sharing a step that is already `Shared` is a no-op. A publish failure
  /// leaves the step `Completed` so it can be retried.
  #[instrument(skip(self))]
  pub async fn share_step(&self, session_id: &str, step_id: &str) -> Result<FlowStateView, EngineError> {
    self
      .retrying(session_id, || self.share_step_once(session_id, step_id))
      .await
  }

  async fn share_step_once(&self, session_id: &str, step_id: &str) -> Result<FlowStateView, EngineError> {
    let _guard = self.lock(session_id).await;
    let mut session = self.load(session_id).await?;
    let before = session.progress();

    let (step, state) = session.step(step_id)?;
    if !state.relevant {
      return Err(EngineError::NotLocalStep {
        step_id: step_id.to_string(),
      });
    }
    if !step.shares_output() {
      return Err(EngineError::NothingToShare(step_id.to_string()));
    }
    match state.status {
      StepStatus::Shared => {
        debug!(session_id, step_id, "step already shared");
        let session = self.commit(session, before, Vec::new()).await?;
        return Ok(FlowStateView::of(&session));
      }
      StepStatus::Completed => {}
      status => {
        return Err(EngineError::StepNotShareable {
          step_id: step_id.to_string(),
          status,
        });
      }
    }

    let now = self.now();
    match publish_step(self.store(), &session, step).await {
      Ok(report) => {
        let state = session.state_mut(step_id)?;
        state.status = StepStatus::Shared;
        state.shared_at = Some(now);
        state.error = None;

        let shared = FlowEvent::StepShared {
          session_id: session_id.to_string(),
          step_id: step_id.to_string(),
        };
        let session = self.commit(session, before, vec![shared]).await?;

        self.log(&session, LogEvent::StepShared, Some(step_id), now).await;
        info!(session_id, step_id, artifacts = report.artifacts.len(), "step shared");
        Ok(FlowStateView::of(&session))
      }
      Err(e) => {
        session.state_mut(step_id)?.error =
          Some(StepError::new(StepErrorKind::PublishFailure, e.to_string(), now));
        warn!(session_id, step_id, error = %e, "failed to share step");
        let failed = FlowEvent::StepFailed {
          session_id: session_id.to_string(),
          step_id: step_id.to_string(),
          error: e.to_string(),
        };
        self.commit(session, before, vec![failed]).await?;
        Err(e)
      }
    }
  }

  /// Observe, reschedule, publish beacons, and save. `events` and everything
  /// the recomputation derives are delivered after the save. Callers hold
  /// the session lock.
  async fn commit(
    &self,
    mut session: Session,
    before: Progress,
    mut events: Vec<FlowEvent>,
  ) -> Result<Session, EngineError> {
    let observations = observe(self.store(), &session).await;
    let now = self.now();
    let status_before = session.status;

    let updates = schedule(&session, &observations, now)?;
    apply(&mut session, &updates, now)?;

    for update in &updates {
      if update.changes_status() {
        debug!(
          session_id = %session.session_id,
          step_id = %update.step_id,
          from = %update.from,
          to = %update.to,
          "step status changed"
        );
        events.push(FlowEvent::StepStatusChanged {
          session_id: session.session_id.clone(),
          step_id: update.step_id.clone(),
          from: update.from,
          to: update.to,
        });
      }
      if let Some(error) = &update.error
        && error.kind == StepErrorKind::BarrierTimeout
      {
        warn!(
          session_id = %session.session_id,
          step_id = %update.step_id,
          pending = ?update.pending,
          "barrier timed out"
        );
        events.push(FlowEvent::BarrierTimedOut {
          session_id: session.session_id.clone(),
          step_id: update.step_id.clone(),
          pending: update.pending.clone(),
        });
      }
    }

    self.publish_beacons(&mut session, now).await;

    let after = session.progress();
    if after != before {
      events.push(FlowEvent::ProgressChanged {
        session_id: session.session_id.clone(),
        completed: after.completed,
        total: after.total,
      });
    }

    match session.status {
      SessionStatus::Completed if !session.completion_notified => {
        session.completion_notified = true;
        info!(session_id = %session.session_id, "flow completed");
        events.push(FlowEvent::FlowCompleted {
          session_id: session.session_id.clone(),
        });
      }
      SessionStatus::Failed if status_before != SessionStatus::Failed => {
        warn!(session_id = %session.session_id, "flow failed");
        events.push(FlowEvent::FlowFailed {
          session_id: session.session_id.clone(),
        });
      }
      _ => {}
    }

    session.revision += 1;
    self.collaborators.sessions.save_session(&session).await?;
    for event in events {
      self.notifier.notify(event);
    }
    Ok(session)
  }

  /// Write a beacon for every local step whose published status is stale.
  /// A failed write is retried on the next commit.
  async fn publish_beacons(&self, session: &mut Session, now: DateTime<Utc>) {
    let stale: Vec<(String, StepStatus)> = session
      .steps
      .iter()
      .filter(|(_, state)| {
        state.relevant
          && matches!(
            state.status,
            StepStatus::Running | StepStatus::Completed | StepStatus::Shared
          )
          && state.beacon != Some(state.status)
      })
      .map(|(id, state)| (id.clone(), state.status))
      .collect();

    for (step_id, status) in stale {
      match write_beacon(self.store(), session, &step_id, status, now).await {
        Ok(()) => {
          if let Some(state) = session.steps.get_mut(&step_id) {
            state.beacon = Some(status);
          }
        }
        Err(e) => {
          warn!(session_id = %session.session_id, step_id = %step_id, error = %e, "failed to write beacon");
        }
      }
    }
  }
}
