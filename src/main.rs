mod executor;
mod logging;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use concord_config::FlowDef;
use concord_datasite::FsDatasites;
use concord_engine::{
  ChannelNotifier, Collaborators, EngineConfig, EngineRunner, FlowEngine, FlowEvent,
  FlowNotifier, FlowStateView, FsOutbox, FsSessionStore, InboundMessage, NoopNotifier,
  SessionStatus, StepExecutor, SystemClock,
};
use concord_flow::{Flow, Participant};

use crate::executor::{FileCopyExecutor, parse_output};
use crate::logging::{LogFormat, init_tracing, level_for};

/// Concord - run multiparty flows over synced datasites
#[derive(Parser)]
#[command(name = "concord")]
#[command(version, about, long_about = None)]
struct Cli {
  /// Path to the data directory (default: ~/.concord)
  #[arg(long, global = true)]
  data_dir: Option<PathBuf>,

  /// Datasite identity of the local participant
  #[arg(long, global = true, env = "CONCORD_IDENTITY")]
  identity: Option<String>,

  /// How often `watch` re-reads other participants' progress
  #[arg(long, global = true, default_value_t = 2000)]
  poll_interval_ms: u64,

  #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
  log_format: LogFormat,

  /// Increase log verbosity (-v debug, -vv trace)
  #[arg(short, long, global = true, action = clap::ArgAction::Count)]
  verbose: u8,

  #[command(subcommand)]
  command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
  /// Check a flow file and print its steps in execution order
  Validate {
    /// Path to the flow file (YAML or JSON)
    flow_file: PathBuf,
  },

  /// Start a session for a flow and invite the other participants
  Invite {
    /// Path to the flow file (YAML or JSON)
    flow_file: PathBuf,

    /// Role assignment as EMAIL=ROLE; defaults to `datasites.all` in role order
    #[arg(long = "participant", value_parser = parse_participant)]
    participants: Vec<Participant>,
  },

  /// Import and join an invitation message (JSON)
  Accept { message_file: PathBuf },

  /// Decline an imported invitation
  Decline { session_id: String },

  /// Show one session, or every session and pending invitation
  Status { session_id: Option<String> },

  /// Record a step as executed, with its result files
  Run {
    session_id: String,
    step_id: String,

    /// Output as NAME=PATH, copied into the step's output directory
    #[arg(long = "output", value_parser = parse_output)]
    outputs: Vec<(String, PathBuf)>,
  },

  /// Publish a completed step's shared artifacts
  Share { session_id: String, step_id: String },

  /// Return a step left running by an interrupted process to ready
  Reset { session_id: String, step_id: String },

  /// Show the step statuses every participant has published
  Participants { session_id: String },

  /// Print every participant's coordination log as one timeline
  Logs { session_id: String },

  /// Keep polling and print events until interrupted
  Watch {
    /// Stop once this session completes or fails
    session_id: Option<String>,
  },
}

fn parse_participant(raw: &str) -> Result<Participant, String> {
  let (email, role) = raw
    .split_once('=')
    .ok_or_else(|| format!("expected EMAIL=ROLE, got '{raw}'"))?;
  Ok(Participant::new(email.trim(), role.trim()))
}

fn main() -> Result<()> {
  let Cli {
    data_dir,
    identity,
    poll_interval_ms,
    log_format,
    verbose,
    command,
  } = Cli::parse();
  init_tracing(log_format, level_for(verbose));

  let data_dir = match data_dir {
    Some(dir) => dir,
    None => dirs::home_dir()
      .context("could not determine home directory")?
      .join(".concord"),
  };

  let Some(command) = command else {
    println!("concord - use --help to see available commands");
    return Ok(());
  };

  let rt = tokio::runtime::Runtime::new()?;
  rt.block_on(async move {
    if let Commands::Validate { flow_file } = &command {
      return validate(flow_file).await;
    }
    let identity = identity.context("--identity or CONCORD_IDENTITY is required")?;
    let ctx = Workspace {
      data_dir,
      identity,
      poll_interval: Duration::from_millis(poll_interval_ms),
    };
    dispatch(ctx, command).await
  })
}

struct Workspace {
  data_dir: PathBuf,
  identity: String,
  poll_interval: Duration,
}

impl Workspace {
  fn engine<N: FlowNotifier>(&self, executor: Arc<dyn StepExecutor>, notifier: N) -> FlowEngine<N> {
    let collaborators = Collaborators {
      datasites: Arc::new(FsDatasites::new(self.data_dir.join("datasites"), &self.identity)),
      sessions: Arc::new(FsSessionStore::new(&self.data_dir)),
      executor,
      messenger: Arc::new(FsOutbox::new(self.data_dir.join("outbox"))),
      clock: Arc::new(SystemClock),
    };
    let config = EngineConfig::new(&self.identity).with_poll_interval(self.poll_interval);
    FlowEngine::with_notifier(config, collaborators, notifier)
  }
}

async fn read_flow(flow_file: &Path) -> Result<(FlowDef, String)> {
  let content = tokio::fs::read_to_string(flow_file)
    .await
    .with_context(|| format!("failed to read flow file: {}", flow_file.display()))?;
  let def = FlowDef::from_yaml_str(&content)
    .with_context(|| format!("failed to parse flow file: {}", flow_file.display()))?;
  Ok((def, content))
}

async fn validate(flow_file: &Path) -> Result<()> {
  let (_, content) = read_flow(flow_file).await?;
  let flow = Flow::from_yaml_str(&content)
    .with_context(|| format!("invalid flow: {}", flow_file.display()))?;
  let order = flow.graph().topological_order()?;

  eprintln!("Flow {} {} is valid", flow.name, flow.version);
  eprintln!("Entry points: {}", flow.graph().entry_points().join(", "));
  for step_id in order {
    if let Some(step) = flow.get_step(&step_id) {
      let kind = if step.is_barrier() { "barrier" } else { "run" };
      println!("{}. {} ({kind}) -> {}", step.number, step.id, step.targets().join(", "));
    }
  }
  Ok(())
}

async fn dispatch(ctx: Workspace, command: Commands) -> Result<()> {
  let noop: Arc<dyn StepExecutor> = Arc::new(FileCopyExecutor::default());

  match command {
    Commands::Validate { flow_file } => validate(&flow_file).await,
    Commands::Invite {
      flow_file,
      participants,
    } => {
      let (def, _) = read_flow(&flow_file).await?;
      let engine = ctx.engine(noop, NoopNotifier);
      let view = engine
        .send_invitation(def.to_json_value()?, participants)
        .await
        .context("failed to start session")?;
      eprintln!("Started session {} as {}", view.session_id, view.role);
      print_view(&view)
    }
    Commands::Accept { message_file } => {
      let data = tokio::fs::read(&message_file)
        .await
        .with_context(|| format!("failed to read message: {}", message_file.display()))?;
      let message: InboundMessage = serde_json::from_slice(&data)
        .with_context(|| format!("failed to parse message: {}", message_file.display()))?;
      let engine = ctx.engine(noop, NoopNotifier);
      let view = engine.accept_invitation(&message).await?;
      eprintln!("Joined session {} as {}", view.session_id, view.role);
      print_view(&view)
    }
    Commands::Decline { session_id } => {
      let engine = ctx.engine(noop, NoopNotifier);
      let view = engine.decline(&session_id).await?;
      println!("{}", serde_json::to_string_pretty(&view)?);
      Ok(())
    }
    Commands::Status { session_id } => {
      let engine = ctx.engine(noop, NoopNotifier);
      match session_id {
        Some(session_id) => print_view(&engine.get_multiparty_flow_state(&session_id).await?),
        None => {
          let sessions = engine.poll_all().await?;
          let invitations = engine.list_invitations().await?;
          let output = serde_json::json!({
            "sessions": sessions,
            "invitations": invitations,
          });
          println!("{}", serde_json::to_string_pretty(&output)?);
          Ok(())
        }
      }
    }
    Commands::Run {
      session_id,
      step_id,
      outputs,
    } => {
      let engine = ctx.engine(
        Arc::new(FileCopyExecutor::new(outputs)),
        NoopNotifier,
      );
      let view = engine.run_step(&session_id, &step_id).await?;
      eprintln!("Step {step_id} completed: {}", view.progress_text);
      print_view(&view)
    }
    Commands::Share {
      session_id,
      step_id,
    } => {
      let engine = ctx.engine(noop, NoopNotifier);
      let view = engine.share_step(&session_id, &step_id).await?;
      eprintln!("Step {step_id} shared: {}", view.progress_text);
      print_view(&view)
    }
    Commands::Reset {
      session_id,
      step_id,
    } => {
      let engine = ctx.engine(noop, NoopNotifier);
      let view = engine.reset_step(&session_id, &step_id).await?;
      eprintln!("Step {step_id} reset: {}", view.progress_text);
      print_view(&view)
    }
    Commands::Participants { session_id } => {
      let engine = ctx.engine(noop, NoopNotifier);
      let progress = engine.participant_progress(&session_id).await?;
      for participant in &progress {
        eprintln!("{} ({})", participant.identity, participant.role);
        for step in &participant.steps {
          eprintln!("    {:<24} {}", step.step_id, step.status);
        }
      }
      println!("{}", serde_json::to_string_pretty(&progress)?);
      Ok(())
    }
    Commands::Logs { session_id } => {
      let engine = ctx.engine(noop, NoopNotifier);
      for entry in engine.participant_logs(&session_id).await? {
        println!("{}", serde_json::to_string(&entry)?);
      }
      Ok(())
    }
    Commands::Watch { session_id } => watch(&ctx, noop, session_id).await,
  }
}

async fn watch(ctx: &Workspace, executor: Arc<dyn StepExecutor>, session_id: Option<String>) -> Result<()> {
  if let Some(session_id) = &session_id {
    let engine = ctx.engine(Arc::clone(&executor), NoopNotifier);
    if engine.refresh(session_id).await?.status != SessionStatus::Active {
      bail!("session {session_id} has already finished");
    }
  }

  let (tx, mut events) = mpsc::unbounded_channel();
  let engine = Arc::new(ctx.engine(executor, ChannelNotifier::new(tx)));
  let runner = EngineRunner::new(engine);
  let cancel = CancellationToken::new();
  let task = tokio::spawn(runner.start(cancel.clone()));

  info!(identity = %ctx.identity, "watching sessions");
  loop {
    tokio::select! {
      _ = tokio::signal::ctrl_c() => break,
      event = events.recv() => {
        let Some(event) = event else { break };
        println!("{}", serde_json::to_string(&event)?);
        if let Some(wanted) = &session_id
          && let FlowEvent::FlowCompleted { session_id: id } | FlowEvent::FlowFailed { session_id: id } = &event
          && id == wanted
        {
          break;
        }
      }
    }
  }

  cancel.cancel();
  task.await??;
  Ok(())
}

fn print_view(view: &FlowStateView) -> Result<()> {
  for step in &view.steps {
    let marker = if step.relevant { "*" } else { " " };
    eprintln!("{marker} {}. {:<24} {}", step.number, step.id, step.status);
  }
  eprintln!("{}", view.progress_text);
  println!("{}", serde_json::to_string_pretty(view)?);
  Ok(())
}
