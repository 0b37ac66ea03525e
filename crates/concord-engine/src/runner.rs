//! Engine runner with channel-based commands.
//!
//! The `EngineRunner` owns an mpsc channel of commands and drains it in one
//! task, interleaved with a poll tick that refreshes every active session.
//! Step execution is spawned; its result comes back through the same
//! channel, so a long-running step never blocks scheduling. An execution
//! that outlives the runner records its result directly on the engine.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::engine::FlowEngine;
use crate::error::EngineError;
use crate::events::FlowNotifier;
use crate::execution::{ExecutionFailure, ExecutionOutcome};
use crate::invitation::{InboundMessage, InvitationView};
use crate::view::FlowStateView;

type Reply<T> = oneshot::Sender<Result<T, EngineError>>;

enum Command {
  Import {
    message: InboundMessage,
    reply: Reply<InvitationView>,
  },
  Join {
    session_id: String,
    reply: Reply<FlowStateView>,
  },
  Decline {
    session_id: String,
    reply: Reply<InvitationView>,
  },
  State {
    session_id: String,
    reply: Reply<FlowStateView>,
  },
  RunStep {
    session_id: String,
    step_id: String,
    reply: Reply<()>,
  },
  ShareStep {
    session_id: String,
    step_id: String,
    reply: Reply<FlowStateView>,
  },
  ExecutionFinished {
    session_id: String,
    step_id: String,
    result: Result<ExecutionOutcome, ExecutionFailure>,
  },
}

/// Cloneable handle for sending commands to a running [`EngineRunner`].
#[derive(Clone)]
pub struct EngineHandle {
  sender: mpsc::Sender<Command>,
}

impl EngineHandle {
  async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T, EngineError> {
    let (reply, response) = oneshot::channel();
    self
      .sender
      .send(build(reply))
      .await
      .map_err(|_| EngineError::RunnerClosed)?;
    response.await.map_err(|_| EngineError::RunnerClosed)?
  }

  pub async fn import_invitation(&self, message: InboundMessage) -> Result<InvitationView, EngineError> {
    self
      .request(|reply| Command::Import { message, reply })
      .await
  }

  pub async fn join(&self, session_id: &str) -> Result<FlowStateView, EngineError> {
    let session_id = session_id.to_string();
    self
      .request(|reply| Command::Join { session_id, reply })
      .await
  }

  pub async fn decline(&self, session_id: &str) -> Result<InvitationView, EngineError> {
    let session_id = session_id.to_string();
    self
      .request(|reply| Command::Decline { session_id, reply })
      .await
  }

  pub async fn state(&self, session_id: &str) -> Result<FlowStateView, EngineError> {
    let session_id = session_id.to_string();
    self
      .request(|reply| Command::State { session_id, reply })
      .await
  }

  /// Start a step. Returns once the step is `Running`; completion is
  /// reported through the session state and the notifier.
  pub async fn run_step(&self, session_id: &str, step_id: &str) -> Result<(), EngineError> {
    let (session_id, step_id) = (session_id.to_string(), step_id.to_string());
    self
      .request(|reply| Command::RunStep {
        session_id,
        step_id,
        reply,
      })
      .await
  }

  pub async fn share_step(&self, session_id: &str, step_id: &str) -> Result<FlowStateView, EngineError> {
    let (session_id, step_id) = (session_id.to_string(), step_id.to_string());
    self
      .request(|reply| Command::ShareStep {
        session_id,
        step_id,
        reply,
      })
      .await
  }
}

/// Drives a [`FlowEngine`]: serves commands and polls on an interval.
pub struct EngineRunner<N: FlowNotifier> {
  sender: mpsc::Sender<Command>,
  receiver: mpsc::Receiver<Command>,
  engine: Arc<FlowEngine<N>>,
}

impl<N: FlowNotifier + 'static> EngineRunner<N> {
  pub fn new(engine: Arc<FlowEngine<N>>) -> Self {
    Self::with_buffer_size(engine, 100)
  }

  pub fn with_buffer_size(engine: Arc<FlowEngine<N>>, buffer_size: usize) -> Self {
    let (sender, receiver) = mpsc::channel(buffer_size);
    Self {
      sender,
      receiver,
      engine,
    }
  }

  pub fn handle(&self) -> EngineHandle {
    EngineHandle {
      sender: self.sender.clone(),
    }
  }

  pub fn engine(&self) -> &FlowEngine<N> {
    &self.engine
  }

  /// Run until the token is cancelled. Results already queued are recorded
  /// before returning; other queued commands are dropped. Executions still
  /// in flight record their own result when they finish.
  pub async fn start(mut self, cancel: CancellationToken) -> Result<(), EngineError> {
    let mut ticker = tokio::time::interval(self.engine.config().poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    info!(
      identity = %self.engine.identity(),
      poll_interval_ms = self.engine.config().poll_interval.as_millis() as u64,
      "starting engine runner"
    );

    loop {
      tokio::select! {
        _ = cancel.cancelled() => {
          info!("engine runner cancelled");
          break;
        }
        _ = ticker.tick() => {
          match self.engine.poll_all().await {
            Ok(views) => debug!(sessions = views.len(), "poll complete"),
            Err(e) => warn!(error = %e, "poll failed"),
          }
        }
        command = self.receiver.recv() => {
          match command {
            Some(command) => self.dispatch(command).await,
            None => break,
          }
        }
      }
    }

    self.receiver.close();
    while let Ok(command) = self.receiver.try_recv() {
      if let Command::ExecutionFinished { .. } = command {
        self.dispatch(command).await;
      }
    }
    Ok(())
  }

  async fn dispatch(&self, command: Command) {
    let engine = &self.engine;
    match command {
      Command::Import { message, reply } => {
        let _ = reply.send(engine.import_invitation(&message).await);
      }
      Command::Join { session_id, reply } => {
        let _ = reply.send(engine.join(&session_id).await);
      }
      Command::Decline { session_id, reply } => {
        let _ = reply.send(engine.decline(&session_id).await);
      }
      Command::State { session_id, reply } => {
        let _ = reply.send(engine.refresh(&session_id).await);
      }
      Command::RunStep {
        session_id,
        step_id,
        reply,
      } => match engine.begin_step(&session_id, &step_id).await {
        Ok(request) => {
          let engine = Arc::clone(engine);
          let sender = self.sender.clone();
          tokio::spawn(async move {
            let result = engine.executor().execute(request).await;
            let finished = Command::ExecutionFinished {
              session_id,
              step_id,
              result,
            };
            if let Err(mpsc::error::SendError(Command::ExecutionFinished {
              session_id,
              step_id,
              result,
            })) = sender.send(finished).await
            {
              debug!(session_id = %session_id, step_id = %step_id, "runner stopped, recording result directly");
              if let Err(e) = engine.finish_step(&session_id, &step_id, result).await {
                error!(session_id = %session_id, step_id = %step_id, error = %e, "step execution failed");
              }
            }
          });
          let _ = reply.send(Ok(()));
        }
        Err(e) => {
          let _ = reply.send(Err(e));
        }
      },
      Command::ShareStep {
        session_id,
        step_id,
        reply,
      } => {
        let _ = reply.send(engine.share_step(&session_id, &step_id).await);
      }
      Command::ExecutionFinished {
        session_id,
        step_id,
        result,
      } => {
        if let Err(e) = engine.finish_step(&session_id, &step_id, result).await {
          error!(session_id = %session_id, step_id = %step_id, error = %e, "step execution failed");
        }
      }
    }
  }
}
