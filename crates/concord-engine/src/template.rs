//! Path template resolution.
//!
//! Flow documents write placeholders with single braces:
//!
//! ```text
//! run_path:  syft://{datasite.current}/shared/flows/{flow_name}/{run_id}
//! step_path: {vars.run_path}/{step.number}-{step.id}
//! ```
//!
//! Each placeholder is rewritten to a minijinja expression and rendered
//! against the session context. Variables may refer to other variables, so
//! rendering repeats until no placeholder is left.

use std::collections::BTreeMap;

use concord_datasite::DatasiteUrl;
use concord_flow::Step;
use minijinja::{Environment, UndefinedBehavior, Value};
use serde::Serialize;
use thiserror::Error;

const MAX_PASSES: usize = 8;

#[derive(Debug, Error)]
pub enum TemplateError {
  #[error("failed to resolve '{template}': {message}")]
  Render { template: String, message: String },

  #[error("'{template}' does not settle after {} passes", MAX_PASSES)]
  Recursive { template: String },

  #[error("'{template}' resolved to '{resolved}', which is not a datasite url")]
  NotAUrl { template: String, resolved: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct StepContext {
  pub id: String,
  pub number: usize,
  pub name: String,
}

impl From<&Step> for StepContext {
  fn from(step: &Step) -> Self {
    Self {
      id: step.id.clone(),
      number: step.number,
      name: step.name.clone(),
    }
  }
}

#[derive(Debug, Clone, Serialize)]
struct DatasiteContext {
  current: String,
}

/// Values a template may reference.
#[derive(Debug, Clone, Serialize)]
pub struct TemplateContext {
  pub run_id: String,
  pub session_id: String,
  pub flow_name: String,
  datasite: DatasiteContext,
  pub datasites: Vec<String>,
  pub vars: BTreeMap<String, String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub step: Option<StepContext>,
}

impl TemplateContext {
  pub fn new(
    session_id: &str,
    flow_name: &str,
    current: &str,
    datasites: Vec<String>,
    vars: BTreeMap<String, String>,
  ) -> Self {
    Self {
      run_id: session_id.to_string(),
      session_id: session_id.to_string(),
      flow_name: flow_name.to_string(),
      datasite: DatasiteContext {
        current: current.to_string(),
      },
      datasites,
      vars,
      step: None,
    }
  }

  pub fn with_step(mut self, step: &Step) -> Self {
    self.step = Some(StepContext::from(step));
    self
  }

  /// Same context as seen from another participant's datasite.
  pub fn for_datasite(&self, identity: &str) -> Self {
    let mut ctx = self.clone();
    ctx.datasite.current = identity.to_string();
    ctx
  }

  pub fn render(&self, template: &str) -> Result<String, TemplateError> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    let ctx = Value::from_serialize(self);

    let mut current = template.to_string();
    for _ in 0..MAX_PASSES {
      if !has_placeholder(&current) {
        return Ok(current);
      }
      let source = to_jinja(&current);
      current = env
        .render_str(&source, ctx.clone())
        .map_err(|e| TemplateError::Render {
          template: template.to_string(),
          message: e.to_string(),
        })?;
    }

    if has_placeholder(&current) {
      return Err(TemplateError::Recursive {
        template: template.to_string(),
      });
    }
    Ok(current)
  }

  pub fn render_url(&self, template: &str) -> Result<DatasiteUrl, TemplateError> {
    let resolved = self.render(template)?;
    DatasiteUrl::parse(&resolved).map_err(|_| TemplateError::NotAUrl {
      template: template.to_string(),
      resolved,
    })
  }
}

fn has_placeholder(text: &str) -> bool {
  text
    .find('{')
    .is_some_and(|start| text[start..].contains('}'))
}

/// Rewrite `{expr}` placeholders as `{{ expr }}`. Text already written
/// with double braces is left alone.
fn to_jinja(text: &str) -> String {
  let mut out = String::with_capacity(text.len() + 8);
  let mut rest = text;

  while let Some(start) = rest.find('{') {
    out.push_str(&rest[..start]);
    let tail = &rest[start..];

    if tail.starts_with("{{") || tail.starts_with("{%") {
      let close = if tail.starts_with("{{") { "}}" } else { "%}" };
      match tail.find(close) {
        Some(end) => {
          out.push_str(&tail[..end + 2]);
          rest = &tail[end + 2..];
        }
        None => {
          out.push_str(tail);
          rest = "";
        }
      }
      continue;
    }

    match tail.find('}') {
      Some(end) => {
        out.push_str("{{ ");
        out.push_str(tail[1..end].trim());
        out.push_str(" }}");
        rest = &tail[end + 1..];
      }
      None => {
        out.push_str(tail);
        rest = "";
      }
    }
  }

  out.push_str(rest);
  out
}
