//! Tracing setup for the `concord` binary.

use clap::ValueEnum;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
  #[default]
  Text,
  Json,
}

/// Default level for a `-v` count.
pub fn level_for(verbose: u8) -> Level {
  match verbose {
    0 => Level::INFO,
    1 => Level::DEBUG,
    _ => Level::TRACE,
  }
}

/// Install the global subscriber. `RUST_LOG` overrides `level` when set.
/// Logs go to stderr so stdout stays machine-readable.
pub fn init_tracing(format: LogFormat, level: Level) {
  let env_filter =
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

  match format {
    LogFormat::Json => {
      tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false).json())
        .try_init()
        .ok();
    }
    LogFormat::Text => {
      tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .try_init()
        .ok();
    }
  }
}
