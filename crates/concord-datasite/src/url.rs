use std::fmt;

use serde::{Deserialize, Serialize};

use crate::Error;

pub const SCHEME: &str = "syft://";

/// Address of a file or directory inside a participant's datasite.
///
/// Written as `syft://<identity>/<path>`. The path is normalized: empty
/// and `.` segments are dropped, and `..` is rejected so a url can never
/// escape its datasite.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DatasiteUrl {
  identity: String,
  segments: Vec<String>,
}

impl DatasiteUrl {
  pub fn parse(url: &str) -> Result<Self, Error> {
    let invalid = || Error::InvalidUrl(url.to_string());
    let rest = url.trim().strip_prefix(SCHEME).ok_or_else(invalid)?;
    let (identity, path) = rest.split_once('/').unwrap_or((rest, ""));
    if identity.is_empty() || identity.contains(['{', '}']) {
      return Err(invalid());
    }
    let mut parsed = Self {
      identity: identity.to_string(),
      segments: Vec::new(),
    };
    parsed.push_path(path).map_err(|_| invalid())?;
    Ok(parsed)
  }

  /// Root of `identity`'s datasite.
  pub fn root(identity: &str) -> Self {
    Self {
      identity: identity.to_string(),
      segments: Vec::new(),
    }
  }

  fn push_path(&mut self, path: &str) -> Result<(), Error> {
    for segment in path.split(['/', '\\']) {
      match segment {
        "" | "." => continue,
        ".." => return Err(Error::InvalidUrl(path.to_string())),
        other => self.segments.push(other.to_string()),
      }
    }
    Ok(())
  }

  /// Append a relative path.
  pub fn join(&self, path: &str) -> Result<Self, Error> {
    let mut joined = self.clone();
    joined.push_path(path)?;
    Ok(joined)
  }

  pub fn parent(&self) -> Option<Self> {
    let (_, parent) = self.segments.split_last()?;
    Some(Self {
      identity: self.identity.clone(),
      segments: parent.to_vec(),
    })
  }

  pub fn file_name(&self) -> Option<&str> {
    self.segments.last().map(String::as_str)
  }

  pub fn identity(&self) -> &str {
    &self.identity
  }

  pub fn segments(&self) -> &[String] {
    &self.segments
  }

  /// Path relative to the datasite root, `/`-separated.
  pub fn path(&self) -> String {
    self.segments.join("/")
  }

  /// Same relative path inside another participant's datasite.
  pub fn with_identity(&self, identity: &str) -> Self {
    Self {
      identity: identity.to_string(),
      segments: self.segments.clone(),
    }
  }
}

impl fmt::Display for DatasiteUrl {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{SCHEME}{}", self.identity)?;
    for segment in &self.segments {
      write!(f, "/{segment}")?;
    }
    Ok(())
  }
}

impl TryFrom<String> for DatasiteUrl {
  type Error = Error;

  fn try_from(value: String) -> Result<Self, Self::Error> {
    Self::parse(&value)
  }
}

impl From<DatasiteUrl> for String {
  fn from(value: DatasiteUrl) -> Self {
    value.to_string()
  }
}
