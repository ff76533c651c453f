//! Filesystem collaborators for the sender (source files) and receiver (sinks).

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

use crate::error::{Error, Result};

/// A source resolved to something readable by path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedSource {
  pub path: PathBuf,
  /// Set when `path` is a staged copy that must be deleted after use.
  pub temporary: bool,
}

#[async_trait]
pub trait SourceFiles: Send + Sync {
  async fn resolve_to_local_path(&self, uri: &str) -> Result<StagedSource>;
  async fn stat(&self, path: &Path) -> Result<u64>;
  /// Reads up to `len` bytes at `offset`. Shorter only at end of file.
  async fn read_range(&self, path: &Path, offset: u64, len: usize) -> Result<Bytes>;
  async fn delete_temp(&self, path: &Path) -> Result<()>;
}

#[async_trait]
pub trait SinkStorage: Send + Sync {
  type Stream: Send;

  fn temp_path_for(&self, name: &str) -> PathBuf;
  async fn open_append_stream(&self, path: &Path) -> Result<Self::Stream>;
  async fn append(&self, stream: &mut Self::Stream, bytes: &[u8]) -> Result<()>;
  async fn close(&self, stream: Self::Stream) -> Result<()>;
  /// Moves a closed temporary file to its final place and returns that path.
  async fn finalize(&self, temp: &Path, name_hint: &str) -> Result<PathBuf>;
  /// Best-effort removal of a temporary file.
  async fn discard(&self, temp: &Path);
}

/// Reads local files. `-` means standard input, staged to `staging_dir` first.
pub struct LocalSource {
  staging_dir: PathBuf,
}

impl LocalSource {
  pub fn new(staging_dir: impl Into<PathBuf>) -> Self {
    Self {
      staging_dir: staging_dir.into(),
    }
  }

  /// Copies `reader` into a fresh file under the staging directory.
  pub async fn stage<R: AsyncRead + Unpin + Send>(&self, mut reader: R) -> Result<PathBuf> {
    fs::create_dir_all(&self.staging_dir)
      .await
      .map_err(Error::storage("create staging directory"))?;
    let path = self.staging_dir.join(format!("{}.tmp", Uuid::new_v4()));
    let mut file = File::create(&path).await.map_err(Error::storage("create staged file"))?;
    let written = async {
      let copied = tokio::io::copy(&mut reader, &mut file)
        .await
        .map_err(Error::storage("stage source"))?;
      file.flush().await.map_err(Error::storage("flush staged file"))?;
      Ok::<_, Error>(copied)
    }
    .await;
    let copied = match written {
      Ok(copied) => copied,
      Err(err) => {
        drop(file);
        let _ = fs::remove_file(&path).await;
        return Err(err);
      }
    };
    debug!("staged {copied} bytes to {}", path.display());
    Ok(path)
  }
}

#[async_trait]
impl SourceFiles for LocalSource {
  async fn resolve_to_local_path(&self, uri: &str) -> Result<StagedSource> {
    if uri == "-" {
      let path = self.stage(tokio::io::stdin()).await?;
      return Ok(StagedSource { path, temporary: true });
    }
    let path = if uri.starts_with("file://") {
      let url = Url::parse(uri).map_err(|err| Error::Config(format!("{uri}: {err}")))?;
      url
        .to_file_path()
        .map_err(|_| Error::Config(format!("not a local file uri: {uri}")))?
    } else {
      PathBuf::from(uri)
    };
    Ok(StagedSource {
      path,
      temporary: false,
    })
  }

  async fn stat(&self, path: &Path) -> Result<u64> {
    let metadata = fs::metadata(path)
      .await
      .map_err(Error::storage(format!("stat {}", path.display())))?;
    if !metadata.is_file() {
      return Err(Error::Config(format!("{} is not a regular file", path.display())));
    }
    Ok(metadata.len())
  }

  async fn read_range(&self, path: &Path, offset: u64, len: usize) -> Result<Bytes> {
    let mut file = File::open(path)
      .await
      .map_err(Error::storage(format!("open {}", path.display())))?;
    file
      .seek(SeekFrom::Start(offset))
      .await
      .map_err(Error::storage("seek source"))?;
    let mut buffer = BytesMut::zeroed(len);
    let mut filled = 0;
    while filled < len {
      let read = file
        .read(&mut buffer[filled..])
        .await
        .map_err(Error::storage("read source"))?;
      if read == 0 {
        break;
      }
      filled += read;
    }
    buffer.truncate(filled);
    Ok(buffer.freeze())
  }

  async fn delete_temp(&self, path: &Path) -> Result<()> {
    fs::remove_file(path)
      .await
      .map_err(Error::storage(format!("remove {}", path.display())))
  }
}

/// Writes incoming files to `temp_dir`, then moves them into `output_dir`.
pub struct LocalStorage {
  temp_dir: PathBuf,
  output_dir: PathBuf,
}

impl LocalStorage {
  pub fn new(temp_dir: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
    Self {
      temp_dir: temp_dir.into(),
      output_dir: output_dir.into(),
    }
  }

  pub fn output_dir(&self) -> &Path {
    &self.output_dir
  }
}

#[async_trait]
impl SinkStorage for LocalStorage {
  type Stream = File;

  fn temp_path_for(&self, name: &str) -> PathBuf {
    self.temp_dir.join(format!("{}_{name}.part", Uuid::new_v4()))
  }

  async fn open_append_stream(&self, path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
      fs::create_dir_all(parent)
        .await
        .map_err(Error::storage("create temp directory"))?;
    }
    OpenOptions::new()
      .create(true)
      .append(true)
      .open(path)
      .await
      .map_err(Error::storage(format!("open {}", path.display())))
  }

  async fn append(&self, stream: &mut File, bytes: &[u8]) -> Result<()> {
    stream.write_all(bytes).await.map_err(Error::storage("append chunk"))
  }

  async fn close(&self, mut stream: File) -> Result<()> {
    stream.flush().await.map_err(Error::storage("flush"))?;
    stream.sync_all().await.map_err(Error::storage("sync"))
  }

  async fn finalize(&self, temp: &Path, name_hint: &str) -> Result<PathBuf> {
    fs::create_dir_all(&self.output_dir)
      .await
      .map_err(Error::storage("create output directory"))?;
    let dest = self.output_dir.join(name_hint);
    if fs::try_exists(&dest).await.unwrap_or(false) {
      fs::remove_file(&dest)
        .await
        .map_err(Error::storage(format!("replace {}", dest.display())))?;
    }
    if let Err(err) = fs::rename(temp, &dest).await {
      debug!("rename into {} failed ({err}), copying", dest.display());
      fs::copy(temp, &dest)
        .await
        .map_err(Error::storage(format!("copy to {}", dest.display())))?;
      if let Err(err) = fs::remove_file(temp).await {
        warn!("could not remove {}: {err}", temp.display());
      }
    }
    Ok(dest)
  }

  async fn discard(&self, temp: &Path) {
    match fs::remove_file(temp).await {
      Ok(()) => debug!("removed {}", temp.display()),
      Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
      Err(err) => warn!("could not remove {}: {err}", temp.display()),
    }
  }
}
