//! Concord Datasite
//!
//! This crate provides the storage trait through which the engine observes and
//! publishes artifacts, plus a filesystem implementation over the local
//! replica of every participant's datasite.
//!
//! Participants never talk to each other directly. Each one writes into its
//! own datasite and reads whatever the sync layer has replicated from the
//! others. The [`SyncStore`] trait is that boundary: implementations decide
//! where the replica lives, the engine only deals in [`DatasiteUrl`]s.

mod acl;
mod fs;
mod url;

pub use acl::{ACL_FILE, ALL_FILES, Access, AccessControl, AccessRule};
pub use fs::FsDatasites;
pub use url::{DatasiteUrl, SCHEME};

use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};

/// Error type for datasite storage operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
  /// The requested file was not found in the local replica.
  #[error("not found: {0}")]
  NotFound(String),

  /// Only the owner of a datasite may write into it.
  #[error("cannot write {url}: datasite is owned by {identity}, not {owner}")]
  NotWritable {
    url: String,
    identity: String,
    owner: String,
  },

  #[error("invalid datasite url: {0}")]
  InvalidUrl(String),

  /// An I/O error occurred.
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  #[error("invalid permission file: {0}")]
  Yaml(#[from] serde_yaml::Error),
}

/// Local view of the replicated datasites.
///
/// Reads may target any participant's datasite; writes are only allowed
/// into the datasite of [`SyncStore::owner`].
#[async_trait]
pub trait SyncStore: Send + Sync {
  /// Identity of the local participant.
  fn owner(&self) -> &str;

  /// Filesystem location backing a url, for handing to external tools.
  fn local_path(&self, url: &DatasiteUrl) -> PathBuf;

  async fn exists(&self, url: &DatasiteUrl) -> Result<bool, Error>;

  /// Direct children of a directory. A missing directory has no children.
  async fn list(&self, dir: &DatasiteUrl) -> Result<Vec<DatasiteUrl>, Error>;

  async fn read(&self, url: &DatasiteUrl) -> Result<Bytes, Error>;

  /// Replace a file, creating parent directories as needed.
  async fn write(&self, url: &DatasiteUrl, data: Bytes) -> Result<(), Error>;

  /// Append to a file, creating it if needed.
  async fn append(&self, url: &DatasiteUrl, data: Bytes) -> Result<(), Error>;

  /// SHA-256 of a file's content, or `None` when it does not exist.
  async fn digest(&self, url: &DatasiteUrl) -> Result<Option<String>, Error> {
    if !self.exists(url).await? {
      return Ok(None);
    }
    let data = self.read(url).await?;
    Ok(Some(hex::encode(Sha256::digest(&data))))
  }

  /// Permission file of a directory, if one exists.
  async fn read_acl(&self, dir: &DatasiteUrl) -> Result<Option<AccessControl>, Error> {
    let url = dir.join(ACL_FILE)?;
    if !self.exists(&url).await? {
      return Ok(None);
    }
    let data = self.read(&url).await?;
    let text = String::from_utf8_lossy(&data);
    Ok(Some(AccessControl::from_yaml(&text)?))
  }

  async fn write_acl(&self, dir: &DatasiteUrl, acl: &AccessControl) -> Result<(), Error> {
    let url = dir.join(ACL_FILE)?;
    self.write(&url, Bytes::from(acl.to_yaml()?)).await
  }
}
