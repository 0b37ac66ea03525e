use concord_config::ConfigError;
use thiserror::Error;

/// Reasons a flow document is refused at import time.
#[derive(Debug, Error)]
pub enum FlowError {
  #[error(transparent)]
  Parse(#[from] ConfigError),

  #[error("unsupported document kind '{0}', expected 'Flow'")]
  UnsupportedKind(String),

  #[error("{location}: missing required field '{field}'")]
  MissingField { location: String, field: String },

  #[error("duplicate step id: {0}")]
  DuplicateStep(String),

  #[error("step '{step}' depends on unknown step '{dependency}'")]
  UnknownDependency { step: String, dependency: String },

  #[error("dependency cycle: {}", cycle.join(" -> "))]
  Cycle { cycle: Vec<String> },

  #[error("step '{step}' targets undefined role group '{group}'")]
  UnknownGroup { step: String, group: String },

  #[error("barrier '{step}' waits for unknown step '{wait_for}'")]
  UnknownWaitFor { step: String, wait_for: String },

  #[error("step '{step}' shares '{share}' from invalid source '{source_ref}'")]
  InvalidSource {
    step: String,
    share: String,
    source_ref: String,
  },

  #[error("step '{step}' grants access to unknown recipient '{recipient}'")]
  UnknownRecipient { step: String, recipient: String },

  #[error("barrier '{step}' has invalid timeout: {source}")]
  InvalidTimeout { step: String, source: ConfigError },

  #[error("step not found: {0}")]
  StepNotFound(String),
}
