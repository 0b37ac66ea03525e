use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::{DatasiteUrl, Error, SyncStore};

/// Datasites replicated under one directory as `{root}/{identity}/{path}`.
#[derive(Debug, Clone)]
pub struct FsDatasites {
  root: PathBuf,
  owner: String,
}

impl FsDatasites {
  pub fn new(root: impl Into<PathBuf>, owner: impl Into<String>) -> Self {
    Self {
      root: root.into(),
      owner: owner.into(),
    }
  }

  pub fn root(&self) -> &PathBuf {
    &self.root
  }

  fn check_writable(&self, url: &DatasiteUrl) -> Result<(), Error> {
    if url.identity().eq_ignore_ascii_case(&self.owner) {
      return Ok(());
    }
    Err(Error::NotWritable {
      url: url.to_string(),
      identity: url.identity().to_string(),
      owner: self.owner.clone(),
    })
  }

  async fn ensure_parent(&self, path: &std::path::Path) -> Result<(), Error> {
    if let Some(parent) = path.parent() {
      tokio::fs::create_dir_all(parent).await?;
    }
    Ok(())
  }
}

#[async_trait]
impl SyncStore for FsDatasites {
  fn owner(&self) -> &str {
    &self.owner
  }

  fn local_path(&self, url: &DatasiteUrl) -> PathBuf {
    let mut path = self.root.join(url.identity());
    for segment in url.segments() {
      path.push(segment);
    }
    path
  }

  async fn exists(&self, url: &DatasiteUrl) -> Result<bool, Error> {
    Ok(tokio::fs::try_exists(self.local_path(url)).await?)
  }

  async fn list(&self, dir: &DatasiteUrl) -> Result<Vec<DatasiteUrl>, Error> {
    let mut entries = match tokio::fs::read_dir(self.local_path(dir)).await {
      Ok(entries) => entries,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
      Err(e) => return Err(e.into()),
    };

    let mut children = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
      let name = entry.file_name();
      let Some(name) = name.to_str() else {
        continue;
      };
      children.push(dir.join(name)?);
    }
    children.sort();
    Ok(children)
  }

  async fn read(&self, url: &DatasiteUrl) -> Result<Bytes, Error> {
    match tokio::fs::read(self.local_path(url)).await {
      Ok(data) => Ok(Bytes::from(data)),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::NotFound(url.to_string())),
      Err(e) => Err(e.into()),
    }
  }

  async fn write(&self, url: &DatasiteUrl, data: Bytes) -> Result<(), Error> {
    self.check_writable(url)?;
    let path = self.local_path(url);
    self.ensure_parent(&path).await?;

    // Write beside the target and rename so the sync layer never sees a
    // partial file.
    let file_name = url.file_name().unwrap_or("data");
    let staging = path.with_file_name(format!(".{file_name}.partial"));
    tokio::fs::write(&staging, &data).await?;
    tokio::fs::rename(&staging, &path).await?;

    debug!(url = %url, bytes = data.len(), "datasite file written");
    Ok(())
  }

  async fn append(&self, url: &DatasiteUrl, data: Bytes) -> Result<(), Error> {
    self.check_writable(url)?;
    let path = self.local_path(url);
    self.ensure_parent(&path).await?;

    let mut file = tokio::fs::OpenOptions::new()
      .create(true)
      .append(true)
      .open(&path)
      .await?;
    file.write_all(&data).await?;
    file.flush().await?;
    Ok(())
  }
}
