//! Concord Flow Engine
//!
//! Runs one participant's side of a multiparty flow. Participants never talk
//! to each other directly: each writes progress beacons and shared artifacts
//! into its own datasite, and learns about the others by reading their
//! replicated datasites.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       EngineRunner                          │
//! │  - owns mpsc command channel, hands out EngineHandle        │
//! │  - poll tick refreshes every active session                 │
//! │  - spawns step execution, receives results as commands      │
//! └─────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        FlowEngine                           │
//! │  - invitations: import, join, decline, send                 │
//! │  - run_step / share_step under a per-session mutex          │
//! │  - observe → schedule → beacons → notify → save             │
//! └─────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │   SyncStore · SessionStore · StepExecutor · Messenger       │
//! │  - replicated datasites, persistence, execution, delivery   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use concord_engine::{Collaborators, EngineConfig, EngineRunner, FlowEngine};
//!
//! let engine = Arc::new(FlowEngine::new(EngineConfig::new("me@example.org"), collaborators));
//! engine.accept_invitation(&message).await?;
//!
//! let runner = EngineRunner::new(engine);
//! let handle = runner.handle();
//! tokio::spawn(runner.start(cancel.clone()));
//!
//! handle.run_step(&session_id, "generate").await?;
//! ```

mod barrier;
mod clock;
mod config;
mod coordination;
mod engine;
mod error;
mod events;
mod execution;
mod invitation;
mod messaging;
mod observer;
mod progress;
mod publisher;
mod runner;
mod scheduler;
mod session;
mod status;
mod store;
mod template;
mod view;

pub use barrier::{BarrierOutcome, deadline_for, evaluate};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{DEFAULT_POLL_INTERVAL, EngineConfig};
pub use coordination::{
  LOG_FILE, LogEntry, LogEvent, ParticipantProgress, ParticipantStepStatus, StepBeacon, beacon_url,
  read_beacon, read_participant_logs, read_participant_progress,
};
pub use engine::{Collaborators, FlowEngine};
pub use error::{EngineError, StepError, StepErrorKind};
pub use events::{ChannelNotifier, FlowEvent, FlowNotifier, NoopNotifier};
pub use execution::{
  ExecutionFailure, ExecutionInput, ExecutionOutcome, ExecutionRequest, StepExecutor,
};
pub use invitation::{
  FlowInvitation, INVITATION_KEY, InboundMessage, InvitationRecord, InvitationState,
  InvitationView, MessageMetadata, OutboundMessage,
};
pub use messaging::{FsOutbox, Messenger};
pub use observer::{Fact, Observations, observe};
pub use progress::Progress;
pub use publisher::{PublishReport, PublishedArtifact, publish_step};
pub use runner::{EngineHandle, EngineRunner};
pub use scheduler::{StepUpdate, schedule, session_status};
pub use session::{Session, StepState};
pub use status::{SessionStatus, StepStatus};
pub use store::{FsSessionStore, MemorySessionStore, SessionStore, StoreError};
pub use template::{StepContext, TemplateContext, TemplateError};
pub use view::{FlowStateView, StepView};
