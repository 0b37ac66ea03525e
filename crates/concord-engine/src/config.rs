use std::time::Duration;

/// Poll interval used when none is configured.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Configuration for the flow engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
  /// Identity (datasite email) of the local participant.
  pub identity: String,
  /// How often the runner re-observes active sessions.
  pub poll_interval: Duration,
}

impl EngineConfig {
  pub fn new(identity: impl Into<String>) -> Self {
    Self {
      identity: identity.into(),
      poll_interval: DEFAULT_POLL_INTERVAL,
    }
  }

  pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
    self.poll_interval = poll_interval;
    self
  }
}
