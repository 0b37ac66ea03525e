//! Step executor used by `concord run`: the work happened elsewhere, the
//! command only hands its result files to the engine.

use std::path::PathBuf;

use async_trait::async_trait;
use concord_engine::{ExecutionFailure, ExecutionOutcome, ExecutionRequest, StepExecutor};
use tracing::info;

/// Copies the files given with `--output name=path` into the step's output
/// directory.
#[derive(Debug, Clone, Default)]
pub struct FileCopyExecutor {
  outputs: Vec<(String, PathBuf)>,
}

impl FileCopyExecutor {
  pub fn new(outputs: Vec<(String, PathBuf)>) -> Self {
    Self { outputs }
  }
}

#[async_trait]
impl StepExecutor for FileCopyExecutor {
  async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionOutcome, ExecutionFailure> {
    for input in &request.inputs {
      info!(
        step_id = %input.step_id,
        share = %input.share,
        member = %input.member,
        path = %input.path.display(),
        "input available"
      );
    }

    let mut outcome = ExecutionOutcome::default();
    for (name, source) in &self.outputs {
      let file_name = source
        .file_name()
        .ok_or_else(|| ExecutionFailure::new(format!("{} is not a file", source.display())))?;
      let target = request.output_dir.join(file_name);
      tokio::fs::copy(source, &target)
        .await
        .map_err(|e| ExecutionFailure::new(format!("cannot copy {}: {e}", source.display())))?;
      outcome.outputs.insert(name.clone(), target);
    }
    Ok(outcome)
  }
}

/// Parse `name=path`.
pub fn parse_output(raw: &str) -> Result<(String, PathBuf), String> {
  let (name, path) = raw
    .split_once('=')
    .ok_or_else(|| format!("expected NAME=PATH, got '{raw}'"))?;
  if name.trim().is_empty() {
    return Err(format!("missing output name in '{raw}'"));
  }
  Ok((name.trim().to_string(), PathBuf::from(path)))
}
