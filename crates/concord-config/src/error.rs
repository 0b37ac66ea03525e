use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("invalid flow document: {0}")]
  Yaml(#[from] serde_yaml::Error),

  #[error("invalid flow document: {0}")]
  Json(#[from] serde_json::Error),

  #[error("invalid timeout '{0}': expected seconds or a value like 30s, 5m, 1h")]
  InvalidTimeout(String),
}
