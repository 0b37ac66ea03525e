//! Three participants running the multiparty sum flow against one shared
//! datasite root, the way a synced replica looks on each machine.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{Duration, Utc};
use concord_config::FlowDef;
use concord_datasite::{DatasiteUrl, FsDatasites, SyncStore};
use concord_engine::{
  ChannelNotifier, Collaborators, EngineConfig, EngineError, ExecutionFailure, ExecutionOutcome,
  ExecutionRequest, FlowEngine, FlowEvent, FlowStateView, FsSessionStore, InboundMessage,
  InvitationState, LogEvent, ManualClock, MemorySessionStore, Messenger, OutboundMessage,
  SessionStatus, SessionStore, StepErrorKind, StepExecutor, StepStatus,
};
use concord_flow::FlowError;
use serde_json::json;
use tempfile::TempDir;
use tokio::sync::{Notify, mpsc, oneshot};

const SUM_FLOW: &str = include_str!("../../../flows/multiparty-sum.yaml");
const CLIENT1: &str = "client1@sandbox.local";
const CLIENT2: &str = "client2@sandbox.local";
const AGGREGATOR: &str = "aggregator@sandbox.local";

/// Contributors write a list of numbers; the aggregator sums every
/// contribution it can see.
struct SumExecutor;

#[async_trait]
impl StepExecutor for SumExecutor {
  async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionOutcome, ExecutionFailure> {
    match request.step_id.as_str() {
      "generate" => {
        let numbers = if request.identity == CLIENT1 { json!([1, 2, 3]) } else { json!([4, 5]) };
        tokio::fs::write(request.output_dir.join("numbers.json"), numbers.to_string())
          .await
          .map_err(failure)?;
      }
      "aggregate" => {
        let mut sum = 0;
        for input in request.inputs_for("share_contribution", "numbers") {
          let data = tokio::fs::read(&input.path).await.map_err(failure)?;
          let numbers: Vec<i64> = serde_json::from_slice(&data).map_err(failure)?;
          sum += numbers.iter().sum::<i64>();
        }
        tokio::fs::write(request.output_dir.join("result.json"), json!({ "sum": sum }).to_string())
          .await
          .map_err(failure)?;
      }
      _ => {}
    }
    Ok(ExecutionOutcome::default())
  }
}

fn failure(e: impl std::fmt::Display) -> ExecutionFailure {
  ExecutionFailure::new(e.to_string())
}

#[derive(Default)]
struct Outbox {
  sent: Mutex<Vec<OutboundMessage>>,
}

impl Outbox {
  fn take(&self) -> Vec<OutboundMessage> {
    std::mem::take(&mut *self.sent.lock().unwrap())
  }
}

#[async_trait]
impl Messenger for Outbox {
  async fn send_message(&self, message: OutboundMessage) -> Result<(), EngineError> {
    self.sent.lock().unwrap().push(message);
    Ok(())
  }
}

struct Participant {
  engine: FlowEngine<ChannelNotifier>,
  events: mpsc::UnboundedReceiver<FlowEvent>,
  outbox: Arc<Outbox>,
}

impl Participant {
  fn drain(&mut self) -> Vec<FlowEvent> {
    let mut events = Vec::new();
    while let Ok(event) = self.events.try_recv() {
      events.push(event);
    }
    events
  }

  async fn progress(&self, session_id: &str) -> String {
    self.engine.refresh(session_id).await.unwrap().progress_text
  }

  async fn run_and_share(&self, session_id: &str, step_id: &str) -> FlowStateView {
    self.engine.run_step(session_id, step_id).await.unwrap();
    self.engine.share_step(session_id, step_id).await.unwrap()
  }
}

fn participant(root: &Path, identity: &str, clock: Arc<ManualClock>) -> Participant {
  let (tx, events) = mpsc::unbounded_channel();
  let outbox = Arc::new(Outbox::default());
  let collaborators = Collaborators {
    datasites: Arc::new(FsDatasites::new(root, identity)),
    sessions: Arc::new(MemorySessionStore::new()),
    executor: Arc::new(SumExecutor),
    messenger: outbox.clone(),
    clock,
  };
  Participant {
    engine: FlowEngine::with_notifier(
      EngineConfig::new(identity),
      collaborators,
      ChannelNotifier::new(tx),
    ),
    events,
    outbox,
  }
}

fn spec() -> serde_json::Value {
  FlowDef::from_yaml_str(SUM_FLOW)
    .unwrap()
    .to_json_value()
    .unwrap()
}

fn delivered(sender: &str, message: &OutboundMessage) -> InboundMessage {
  InboundMessage {
    id: message_id(message),
    sender: sender.to_string(),
    subject: message.subject.clone(),
    body: message.body.clone(),
    metadata: message.metadata.clone(),
  }
}

fn message_id(message: &OutboundMessage) -> String {
  message
    .metadata
    .flow_invitation
    .as_ref()
    .map(|i| format!("msg-{}", i.session_id))
    .unwrap_or_default()
}

struct Network {
  _temp: TempDir,
  root: std::path::PathBuf,
  clock: Arc<ManualClock>,
  client1: Participant,
  client2: Participant,
  aggregator: Participant,
  session_id: String,
}

/// client1 proposes the flow; the others accept the delivered invitation.
async fn network() -> Network {
  let temp = TempDir::new().unwrap();
  let root = temp.path().join("datasites");
  let clock = Arc::new(ManualClock::new(Utc::now()));

  let client1 = participant(&root, CLIENT1, clock.clone());
  let client2 = participant(&root, CLIENT2, clock.clone());
  let aggregator = participant(&root, AGGREGATOR, clock.clone());

  let view = client1.engine.send_invitation(spec(), Vec::new()).await.unwrap();
  let sent = client1.outbox.take();
  assert_eq!(sent.len(), 1);
  let message = delivered(CLIENT1, &sent[0]);

  assert_eq!(client2.engine.accept_invitation(&message).await.unwrap().role, "contributor2");
  assert_eq!(aggregator.engine.accept_invitation(&message).await.unwrap().role, "aggregator");

  Network {
    _temp: temp,
    root,
    clock,
    client1,
    client2,
    aggregator,
    session_id: view.session_id,
  }
}

#[tokio::test]
async fn test_multiparty_sum_progress() {
  let mut net = network().await;
  let sid = net.session_id.clone();

  for p in [&net.client1, &net.client2, &net.aggregator] {
    assert_eq!(p.progress(&sid).await, "0/5 steps complete");
  }

  net.client1.engine.run_step(&sid, "generate").await.unwrap();
  let view = net.client1.run_and_share(&sid, "share_contribution").await;
  assert_eq!(view.progress_text, "2/5 steps complete");
  assert_eq!(
    view.step("contributions_ready").unwrap().status,
    StepStatus::WaitingForInputs
  );

  let state = net.aggregator.engine.refresh(&sid).await.unwrap();
  assert_eq!(state.step("generate").unwrap().status, StepStatus::NotReady);
  assert_eq!(state.step("aggregate").unwrap().status, StepStatus::WaitingForInputs);

  net.client2.engine.run_step(&sid, "generate").await.unwrap();
  let view = net.client2.run_and_share(&sid, "share_contribution").await;
  assert_eq!(view.progress_text, "3/5 steps complete");
  assert_eq!(view.step("contributions_ready").unwrap().status, StepStatus::Completed);
  assert_eq!(net.client1.progress(&sid).await, "3/5 steps complete");

  let state = net.aggregator.engine.refresh(&sid).await.unwrap();
  assert_eq!(state.progress_text, "3/5 steps complete");
  assert_eq!(state.step("share_contribution").unwrap().status, StepStatus::Done);
  assert_eq!(state.step("aggregate").unwrap().status, StepStatus::Ready);

  let state = net.aggregator.engine.run_step(&sid, "aggregate").await.unwrap();
  assert_eq!(state.progress_text, "4/5 steps complete");
  assert_eq!(net.client1.progress(&sid).await, "4/5 steps complete");
  assert_eq!(net.client2.progress(&sid).await, "4/5 steps complete");

  let files = net
    .aggregator
    .engine
    .get_step_output_files(&sid, "aggregate")
    .await
    .unwrap();
  assert_eq!(files.len(), 1);
  let result: serde_json::Value = serde_json::from_slice(&std::fs::read(&files[0]).unwrap()).unwrap();
  assert_eq!(result["sum"], 15);

  let state = net.aggregator.run_and_share(&sid, "share_result").await;
  assert_eq!(state.progress_text, "Done");
  assert_eq!(state.status, SessionStatus::Completed);
  assert_eq!(net.client1.progress(&sid).await, "Done");
  assert_eq!(net.client2.progress(&sid).await, "Done");

  // The published result is visible in the aggregator's datasite.
  let shared = net
    .root
    .join(AGGREGATOR)
    .join(format!("shared/flows/multiparty-sum/{sid}/5-share_result"));
  assert!(shared.join("result.json").exists());
  assert!(shared.join("syft.pub.yaml").exists());

  // Completion is reported once, however often the session is refreshed.
  net.client1.progress(&sid).await;
  let completed = net
    .client1
    .drain()
    .into_iter()
    .filter(|e| matches!(e, FlowEvent::FlowCompleted { .. }))
    .count();
  assert_eq!(completed, 1);
}

#[tokio::test]
async fn test_progress_never_decreases() {
  let net = network().await;
  let sid = net.session_id.clone();
  let mut last = 0;

  let mut check = |view: FlowStateView| {
    assert!(view.progress.0 >= last);
    assert!(view.progress.0 <= view.progress.1);
    last = view.progress.0;
  };

  net.client1.engine.run_step(&sid, "generate").await.unwrap();
  check(net.client1.engine.refresh(&sid).await.unwrap());
  check(net.client1.run_and_share(&sid, "share_contribution").await);
  check(net.client1.engine.refresh(&sid).await.unwrap());
  net.client2.engine.run_step(&sid, "generate").await.unwrap();
  net.client2.run_and_share(&sid, "share_contribution").await;
  check(net.client1.engine.refresh(&sid).await.unwrap());
  check(net.client1.engine.refresh(&sid).await.unwrap());
}

#[tokio::test]
async fn test_barrier_times_out_when_a_contributor_never_shares() {
  let net = network().await;
  let sid = net.session_id.clone();

  net.client1.engine.run_step(&sid, "generate").await.unwrap();
  net.client1.run_and_share(&sid, "share_contribution").await;

  net.clock.advance(Duration::seconds(299));
  let view = net.client1.engine.refresh(&sid).await.unwrap();
  assert_eq!(
    view.step("contributions_ready").unwrap().status,
    StepStatus::WaitingForInputs
  );
  assert_eq!(view.status, SessionStatus::Active);

  net.clock.advance(Duration::seconds(1));
  let view = net.client1.engine.refresh(&sid).await.unwrap();
  let barrier = view.step("contributions_ready").unwrap();
  assert_eq!(barrier.status, StepStatus::Failed);
  let error = barrier.error.as_ref().unwrap();
  assert_eq!(error.kind, StepErrorKind::BarrierTimeout);
  assert!(error.message.contains(CLIENT2));
  assert_eq!(view.status, SessionStatus::Failed);
}

#[tokio::test]
async fn test_cyclic_flow_is_refused_without_a_session() {
  let temp = TempDir::new().unwrap();
  let clock = Arc::new(ManualClock::default());
  let p = participant(temp.path(), CLIENT1, clock);

  let mut spec = spec();
  spec["spec"]["steps"] = json!([
    { "id": "a", "name": "A", "run": { "targets": "all" }, "depends_on": ["b"] },
    { "id": "b", "name": "B", "run": { "targets": "all" }, "depends_on": ["a"] }
  ]);
  let message = InboundMessage {
    id: "m".to_string(),
    sender: CLIENT2.to_string(),
    subject: String::new(),
    body: String::new(),
    metadata: serde_json::from_value(json!({
      "flow_invitation": {
        "flow_name": "multiparty-sum",
        "session_id": "cyclic",
        "participants": [],
        "flow_spec": spec
      }
    }))
    .unwrap(),
  };

  let err = p.engine.accept_invitation(&message).await.unwrap_err();
  assert!(matches!(err, EngineError::Flow(FlowError::Cycle { .. })));
  assert!(err.to_string().contains("a -> b -> a") || err.to_string().contains("b -> a -> b"));
  assert!(p.engine.sessions().await.unwrap().is_empty());
  assert!(p.engine.list_invitations().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_join_is_idempotent_and_cannot_be_declined() {
  let net = network().await;
  let sid = net.session_id.clone();

  let first = net.client2.engine.join(&sid).await.unwrap();
  let second = net.client2.engine.join(&sid).await.unwrap();
  assert_eq!(first.steps, second.steps);
  assert_eq!(net.client2.engine.sessions().await.unwrap().len(), 1);

  let invitation = net.client2.engine.invitation(&sid).await.unwrap();
  assert_eq!(invitation.state, InvitationState::Joined);
  assert!(!invitation.can_decline);
  assert!(matches!(
    net.client2.engine.decline(&sid).await,
    Err(EngineError::AlreadyJoined(_))
  ));
}

#[tokio::test]
async fn test_declined_invitation_cannot_be_joined() {
  let temp = TempDir::new().unwrap();
  let clock = Arc::new(ManualClock::default());
  let proposer = participant(&temp.path().join("a"), CLIENT1, clock.clone());
  let invitee = participant(&temp.path().join("b"), CLIENT2, clock);

  proposer.engine.send_invitation(spec(), Vec::new()).await.unwrap();
  let message = delivered(CLIENT1, &proposer.outbox.take()[0]);

  let view = invitee.engine.import_invitation(&message).await.unwrap();
  assert!(view.can_join);
  let declined = invitee.engine.decline(&view.session_id).await.unwrap();
  assert_eq!(declined.state, InvitationState::Declined);

  assert!(matches!(
    invitee.engine.join(&view.session_id).await,
    Err(EngineError::InvitationDeclined(_))
  ));
}

#[tokio::test]
async fn test_reimport_with_a_different_flow_conflicts() {
  let net = network().await;
  let sid = net.session_id.clone();
  let spec = spec();

  let message = |flow_spec: serde_json::Value| InboundMessage {
    id: "again".to_string(),
    sender: CLIENT1.to_string(),
    subject: String::new(),
    body: String::new(),
    metadata: serde_json::from_value(json!({
      "flow_invitation": {
        "flow_name": "multiparty-sum",
        "session_id": sid,
        "participants": [],
        "flow_spec": flow_spec
      }
    }))
    .unwrap(),
  };

  // Same document: no-op.
  let view = net.client2.engine.import_invitation(&message(spec.clone())).await.unwrap();
  assert!(view.joined);

  let mut changed = spec;
  changed["metadata"]["version"] = json!("0.2.0");
  assert!(matches!(
    net.client2.engine.import_invitation(&message(changed)).await,
    Err(EngineError::SessionConflict { .. })
  ));
}

#[tokio::test]
async fn test_sharing_twice_is_a_no_op() {
  let mut net = network().await;
  let sid = net.session_id.clone();

  net.client1.engine.run_step(&sid, "generate").await.unwrap();
  let first = net.client1.run_and_share(&sid, "share_contribution").await;
  net.client1.drain();

  let second = net
    .client1
    .engine
    .share_step(&sid, "share_contribution")
    .await
    .unwrap();
  assert_eq!(first.progress, second.progress);
  assert!(
    !net
      .client1
      .drain()
      .iter()
      .any(|e| matches!(e, FlowEvent::StepShared { .. }))
  );
}

#[tokio::test]
async fn test_participant_progress_and_logs() {
  let net = network().await;
  let sid = net.session_id.clone();

  net.client1.engine.run_step(&sid, "generate").await.unwrap();
  net.client1.run_and_share(&sid, "share_contribution").await;
  net.client2.engine.run_step(&sid, "generate").await.unwrap();

  let progress = net.aggregator.engine.participant_progress(&sid).await.unwrap();
  assert_eq!(progress.len(), 3);

  let client1 = progress.iter().find(|p| p.identity == CLIENT1).unwrap();
  assert_eq!(client1.role, "contributor1");
  let statuses: Vec<_> = client1.steps.iter().map(|s| (s.step_id.as_str(), s.status)).collect();
  assert_eq!(
    statuses,
    vec![("generate", StepStatus::Completed), ("share_contribution", StepStatus::Shared)]
  );
  let shared = client1.steps[1].output_dir.as_ref().unwrap();
  assert!(shared.join("numbers.json").exists());

  let client2 = progress.iter().find(|p| p.identity == CLIENT2).unwrap();
  assert_eq!(client2.steps.len(), 1);
  assert!(client2.steps[0].output_dir.is_some());

  let aggregator = progress.iter().find(|p| p.identity == AGGREGATOR).unwrap();
  assert!(aggregator.steps.is_empty());

  let logs = net.aggregator.engine.participant_logs(&sid).await.unwrap();
  let joined = logs.iter().filter(|e| e.event == LogEvent::Joined).count();
  assert_eq!(joined, 3);
  let shared = logs
    .iter()
    .filter(|e| e.event == LogEvent::StepShared)
    .map(|e| e.identity.as_str())
    .collect::<Vec<_>>();
  assert_eq!(shared, vec![CLIENT1]);
  assert_eq!(logs.len(), 10);
  assert!(logs.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
}

/// Datasite store whose next `exists` waits for a release once armed, so a
/// refresh can be held after it loaded the session.
struct GatedStore {
  inner: FsDatasites,
  gate: Mutex<Option<oneshot::Receiver<()>>>,
  entered: Arc<Notify>,
}

impl GatedStore {
  fn new(root: &Path, identity: &str) -> Self {
    Self {
      inner: FsDatasites::new(root, identity),
      gate: Mutex::new(None),
      entered: Arc::new(Notify::new()),
    }
  }

  fn arm(&self) -> oneshot::Sender<()> {
    let (release, gate) = oneshot::channel();
    *self.gate.lock().unwrap() = Some(gate);
    release
  }
}

#[async_trait]
impl SyncStore for GatedStore {
  fn owner(&self) -> &str {
    self.inner.owner()
  }

  fn local_path(&self, url: &DatasiteUrl) -> PathBuf {
    self.inner.local_path(url)
  }

  async fn exists(&self, url: &DatasiteUrl) -> Result<bool, concord_datasite::Error> {
    let gate = self.gate.lock().unwrap().take();
    if let Some(gate) = gate {
      self.entered.notify_one();
      let _ = gate.await;
    }
    self.inner.exists(url).await
  }

  async fn list(&self, dir: &DatasiteUrl) -> Result<Vec<DatasiteUrl>, concord_datasite::Error> {
    self.inner.list(dir).await
  }

  async fn read(&self, url: &DatasiteUrl) -> Result<Bytes, concord_datasite::Error> {
    self.inner.read(url).await
  }

  async fn write(&self, url: &DatasiteUrl, data: Bytes) -> Result<(), concord_datasite::Error> {
    self.inner.write(url, data).await
  }

  async fn append(&self, url: &DatasiteUrl, data: Bytes) -> Result<(), concord_datasite::Error> {
    self.inner.append(url, data).await
  }
}

/// An engine as a separate process would build it over shared directories.
fn process(
  datasites: Arc<dyn SyncStore>,
  sessions: &Path,
  identity: &str,
  clock: Arc<ManualClock>,
) -> FlowEngine {
  let sessions: Arc<dyn SessionStore> = Arc::new(FsSessionStore::new(sessions));
  let collaborators = Collaborators {
    datasites,
    sessions,
    executor: Arc::new(SumExecutor),
    messenger: Arc::new(Outbox::default()),
    clock,
  };
  FlowEngine::new(EngineConfig::new(identity), collaborators)
}

#[tokio::test]
async fn test_engines_sharing_a_session_store_keep_each_others_updates() {
  let temp = TempDir::new().unwrap();
  let root = temp.path().join("datasites");
  let sessions = temp.path().join("sessions");
  let clock = Arc::new(ManualClock::new(Utc::now()));

  let gated = Arc::new(GatedStore::new(&root, CLIENT1));
  let watcher = process(gated.clone(), &sessions, CLIENT1, clock.clone());
  let cli = process(Arc::new(FsDatasites::new(&root, CLIENT1)), &sessions, CLIENT1, clock.clone());

  let sid = cli.send_invitation(spec(), Vec::new()).await.unwrap().session_id;

  // The watcher loads the session, then stalls while the other process
  // runs a step and saves.
  let release = gated.arm();
  let watching = tokio::spawn({
    let sid = sid.clone();
    async move { watcher.refresh(&sid).await }
  });
  tokio::time::timeout(std::time::Duration::from_secs(5), gated.entered.notified())
    .await
    .unwrap();
  let view = cli.run_step(&sid, "generate").await.unwrap();
  assert_eq!(view.progress_text, "1/5 steps complete");
  release.send(()).unwrap();

  let watched = watching.await.unwrap().unwrap();
  assert_eq!(watched.step("generate").unwrap().status, StepStatus::Completed);

  // What either process saved survives a restart.
  let restarted = process(Arc::new(FsDatasites::new(&root, CLIENT1)), &sessions, CLIENT1, clock);
  let view = restarted.refresh(&sid).await.unwrap();
  assert_eq!(view.progress_text, "1/5 steps complete");
  assert_eq!(view.step("generate").unwrap().status, StepStatus::Completed);
  let files = restarted.get_step_output_files(&sid, "generate").await.unwrap();
  assert_eq!(files.len(), 1);
  assert!(files[0].ends_with("1-generate/numbers.json"));
}

#[tokio::test]
async fn test_interrupted_execution_is_reset_after_restart() {
  let temp = TempDir::new().unwrap();
  let root = temp.path().join("datasites");
  let sessions = temp.path().join("sessions");
  let clock = Arc::new(ManualClock::new(Utc::now()));

  let first = process(Arc::new(FsDatasites::new(&root, CLIENT1)), &sessions, CLIENT1, clock.clone());
  let sid = first.send_invitation(spec(), Vec::new()).await.unwrap().session_id;
  let request = first.begin_step(&sid, "generate").await.unwrap();
  drop(request);
  drop(first);

  let second = process(Arc::new(FsDatasites::new(&root, CLIENT1)), &sessions, CLIENT1, clock);
  let view = second.refresh(&sid).await.unwrap();
  assert_eq!(view.step("generate").unwrap().status, StepStatus::Running);
  assert!(matches!(
    second.run_step(&sid, "generate").await,
    Err(EngineError::StepNotRunnable {
      status: StepStatus::Running,
      ..
    })
  ));

  let view = second.reset_step(&sid, "generate").await.unwrap();
  let step = view.step("generate").unwrap();
  assert_eq!(step.status, StepStatus::Ready);
  assert_eq!(step.error.as_ref().unwrap().kind, StepErrorKind::ExecutionFailure);

  let view = second.run_step(&sid, "generate").await.unwrap();
  let step = view.step("generate").unwrap();
  assert_eq!(step.status, StepStatus::Completed);
  assert!(step.error.is_none());
}
