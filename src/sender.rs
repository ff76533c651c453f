//! Streams one file over an open data channel.
//!
//! Wire order is `file-meta`, raw binary chunks in offset order, then
//! `file-complete`. Before each chunk the sender waits until the channel's
//! buffered amount is at or below the high-water mark.

use std::io;
use std::path::{Path, PathBuf};

use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::TransferConfig;
use crate::error::{Error, Result};
use crate::protocol::DataMessage;
use crate::session::PeerSession;
use crate::storage::SourceFiles;
use crate::transfer::{default_file_name, TransferRecord, TransferStatus};
use crate::transport::{ChannelPayload, DataChannel};

pub struct FileSender<S> {
  source: S,
  config: TransferConfig,
  last: Mutex<Option<TransferRecord>>,
}

/// Deletes a staged copy on drop unless disarmed, covering cancelled sends.
struct StagedCleanup(Option<PathBuf>);

impl StagedCleanup {
  fn disarm(&mut self) {
    self.0 = None;
  }
}

impl Drop for StagedCleanup {
  fn drop(&mut self) {
    let Some(path) = self.0.take() else {
      return;
    };
    match std::fs::remove_file(&path) {
      Ok(()) => debug!("removed staged source {}", path.display()),
      Err(err) if err.kind() == io::ErrorKind::NotFound => {}
      Err(err) => warn!("could not remove staged source {}: {err}", path.display()),
    }
  }
}

impl<S: SourceFiles> FileSender<S> {
  pub fn new(source: S, config: TransferConfig) -> Self {
    Self {
      source,
      config,
      last: Mutex::new(None),
    }
  }

  /// The most recent transfer that got as far as `file-meta`, with its final status.
  pub async fn last_record(&self) -> Option<TransferRecord> {
    self.last.lock().await.clone()
  }

  /// Sends over a linked session, holding its single-sender guard for the duration.
  pub async fn send_over<F>(&self, session: &PeerSession, uri: &str, name: Option<&str>, on_progress: F) -> Result<TransferRecord>
  where
    F: FnMut(u64, u64) + Send,
  {
    let _guard = session.begin_transfer()?;
    self.send(session.channel().as_ref(), uri, name, on_progress).await
  }

  /// Sends `uri` as `name` (default: the source's file name). `on_progress`
  /// gets `(sent, total)` after every chunk.
  pub async fn send<F>(&self, channel: &dyn DataChannel, uri: &str, name: Option<&str>, mut on_progress: F) -> Result<TransferRecord>
  where
    F: FnMut(u64, u64) + Send,
  {
    if !channel.is_open() {
      return Err(Error::ChannelNotReady);
    }
    let staged = self.source.resolve_to_local_path(uri).await?;
    let mut cleanup = StagedCleanup(staged.temporary.then(|| staged.path.clone()));
    let mut record = None;
    let result = self
      .stream(channel, &staged.path, name, &mut record, &mut on_progress)
      .await;
    if staged.temporary {
      match self.source.delete_temp(&staged.path).await {
        Ok(()) => cleanup.disarm(),
        Err(err) => warn!("could not remove staged source {}: {err}", staged.path.display()),
      }
    }
    if let Some(mut record) = record {
      if result.is_err() {
        record.status = TransferStatus::Error;
      }
      *self.last.lock().await = Some(record);
    }
    result
  }

  async fn stream<F>(
    &self,
    channel: &dyn DataChannel,
    path: &Path,
    name: Option<&str>,
    slot: &mut Option<TransferRecord>,
    on_progress: &mut F,
  ) -> Result<TransferRecord>
  where
    F: FnMut(u64, u64) + Send,
  {
    let size = self.source.stat(path).await?;
    let name = name
      .map(str::to_string)
      .or_else(|| path.file_name().and_then(|n| n.to_str()).map(str::to_string))
      .unwrap_or_else(default_file_name);
    let mime = mime_guess::from_path(&name)
      .first()
      .map(|mime| mime.essence_str().to_string());

    let meta = DataMessage::FileMeta {
      name: name.clone(),
      size,
      mime,
    };
    channel
      .send(ChannelPayload::Text(serde_json::to_string(&meta)?))
      .await?;
    info!("sending {name} ({size} bytes)");

    let record = slot.insert(TransferRecord::new(name.clone(), size));
    let chunk_size = self.config.chunk_size.max(1) as u64;
    while record.moved < size {
      let want = chunk_size.min(size - record.moved) as usize;
      let chunk = self.source.read_range(path, record.moved, want).await?;
      if chunk.is_empty() {
        return Err(Error::Io(io::Error::new(
          io::ErrorKind::UnexpectedEof,
          format!("{name} ended at {} of {size} bytes", record.moved),
        )));
      }
      self.wait_for_capacity(channel).await?;
      let len = chunk.len() as u64;
      channel.send(ChannelPayload::Binary(chunk)).await?;
      record.moved += len;
      on_progress(record.moved, size);
    }

    let complete = DataMessage::FileComplete { name: name.clone() };
    self.wait_for_capacity(channel).await?;
    channel
      .send(ChannelPayload::Text(serde_json::to_string(&complete)?))
      .await?;
    self.wait_for_drain(channel).await;
    record.status = TransferStatus::Completed;
    info!("sent {name}");
    Ok(record.clone())
  }

  async fn wait_for_capacity(&self, channel: &dyn DataChannel) -> Result<()> {
    loop {
      if !channel.is_open() {
        return Err(Error::ChannelNotReady);
      }
      let buffered = channel.buffered_amount().await;
      if buffered <= self.config.high_water_mark {
        return Ok(());
      }
      debug!("buffered {buffered} bytes, backing off");
      let _ = timeout(self.config.backoff, channel.buffered_amount_low()).await;
    }
  }

  async fn wait_for_drain(&self, channel: &dyn DataChannel) {
    let drained = timeout(self.config.drain_timeout, async {
      while channel.is_open() && channel.buffered_amount().await > 0 {
        let _ = timeout(self.config.backoff, channel.buffered_amount_low()).await;
      }
    })
    .await;
    if drained.is_err() {
      warn!("channel still buffering after {:?}", self.config.drain_timeout);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::mock::MockChannel;
  use crate::storage::{LocalSource, StagedSource};
  use async_trait::async_trait;
  use bytes::Bytes;
  use std::path::{Path, PathBuf};
  use std::sync::Mutex;

  /// Stages every source into a copy, like a content handle would be.
  struct StagingSource {
    inner: LocalSource,
    dir: PathBuf,
    extra_size: u64,
    deleted: Mutex<Vec<PathBuf>>,
  }

  impl StagingSource {
    fn new(dir: &Path) -> Self {
      Self {
        inner: LocalSource::new(dir),
        dir: dir.to_path_buf(),
        extra_size: 0,
        deleted: Mutex::new(Vec::new()),
      }
    }
  }

  #[async_trait]
  impl SourceFiles for StagingSource {
    async fn resolve_to_local_path(&self, uri: &str) -> Result<StagedSource> {
      let path = self.dir.join("staged.tmp");
      tokio::fs::copy(uri, &path).await?;
      Ok(StagedSource { path, temporary: true })
    }

    async fn stat(&self, path: &Path) -> Result<u64> {
      Ok(self.inner.stat(path).await? + self.extra_size)
    }

    async fn read_range(&self, path: &Path, offset: u64, len: usize) -> Result<Bytes> {
      self.inner.read_range(path, offset, len).await
    }

    async fn delete_temp(&self, path: &Path) -> Result<()> {
      self.deleted.lock().unwrap().push(path.to_path_buf());
      self.inner.delete_temp(path).await
    }
  }

  fn config() -> TransferConfig {
    TransferConfig {
      backoff: std::time::Duration::from_millis(1),
      ..Default::default()
    }
  }

  fn write_source(dir: &Path, name: &str, len: usize) -> PathBuf {
    let path = dir.join(name);
    let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    std::fs::write(&path, data).unwrap();
    path
  }

  fn text(payload: &ChannelPayload) -> DataMessage {
    match payload {
      ChannelPayload::Text(text) => serde_json::from_str(text).unwrap(),
      other => panic!("expected control message, got {other:?}"),
    }
  }

  #[tokio::test]
  async fn sends_meta_chunks_and_complete_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_source(dir.path(), "notes.txt", 40_000);
    let channel = MockChannel::opened();
    let sender = FileSender::new(LocalSource::new(dir.path()), config());

    let mut progress = Vec::new();
    let record = sender
      .send(channel.as_ref(), path.to_str().unwrap(), None, |sent, total| progress.push((sent, total)))
      .await
      .unwrap();

    assert_eq!(record.status, TransferStatus::Completed);
    assert_eq!(record.moved, 40_000);
    assert_eq!(sender.last_record().await, Some(record.clone()));
    assert_eq!(progress, vec![(16_384, 40_000), (32_768, 40_000), (40_000, 40_000)]);

    let sent = channel.sent();
    assert_eq!(sent.len(), 5);
    assert_eq!(
      text(&sent[0]),
      DataMessage::FileMeta {
        name: "notes.txt".to_string(),
        size: 40_000,
        mime: Some("text/plain".to_string()),
      }
    );
    let mut body = Vec::new();
    for payload in &sent[1..4] {
      match payload {
        ChannelPayload::Binary(data) => body.extend_from_slice(data),
        other => panic!("expected chunk, got {other:?}"),
      }
    }
    assert_eq!(body, std::fs::read(&path).unwrap());
    assert_eq!(
      text(&sent[4]),
      DataMessage::FileComplete {
        name: "notes.txt".to_string()
      }
    );
  }

  #[tokio::test]
  async fn buffered_amount_stays_within_one_chunk_of_the_mark() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_source(dir.path(), "big.bin", 512 * 1024);
    let channel = MockChannel::opened();
    channel.set_drain_per_poll(4 * 1024);
    let config = config();
    let limit = config.high_water_mark + config.chunk_size;
    let sender = FileSender::new(LocalSource::new(dir.path()), config);

    sender
      .send(channel.as_ref(), path.to_str().unwrap(), Some("big.bin"), |_, _| {})
      .await
      .unwrap();
    assert!(channel.peak_after_send() > 16 * 1024);
    assert!(channel.peak_after_send() <= limit, "peak {}", channel.peak_after_send());
  }

  #[tokio::test]
  async fn refuses_to_send_before_open() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_source(dir.path(), "a.bin", 10);
    let channel = MockChannel::new();
    let sender = FileSender::new(StagingSource::new(dir.path()), config());

    let err = sender
      .send(channel.as_ref(), path.to_str().unwrap(), None, |_, _| {})
      .await
      .unwrap_err();
    assert!(matches!(err, Error::ChannelNotReady));
    assert!(channel.sent().is_empty());
    assert!(!dir.path().join("staged.tmp").exists());
  }

  #[tokio::test]
  async fn staged_copy_is_removed_after_success() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_source(dir.path(), "photo.jpg", 20_000);
    let channel = MockChannel::opened();
    let sender = FileSender::new(StagingSource::new(dir.path()), config());

    sender
      .send(channel.as_ref(), path.to_str().unwrap(), Some("photo.jpg"), |_, _| {})
      .await
      .unwrap();
    assert_eq!(sender.source.deleted.lock().unwrap().len(), 1);
    assert!(!dir.path().join("staged.tmp").exists());
    assert!(path.exists());
  }

  #[tokio::test]
  async fn staged_copy_is_removed_after_send_failure() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_source(dir.path(), "photo.jpg", 100_000);
    let channel = MockChannel::opened();
    channel.fail_sends_after(3);
    let sender = FileSender::new(StagingSource::new(dir.path()), config());

    let err = sender
      .send(channel.as_ref(), path.to_str().unwrap(), None, |_, _| {})
      .await
      .unwrap_err();
    assert!(matches!(err, Error::Link(_)));
    assert_eq!(channel.sent().len(), 3);
    assert!(!dir.path().join("staged.tmp").exists());

    let record = sender.last_record().await.unwrap();
    assert_eq!(record.status, TransferStatus::Error);
    assert_eq!(record.moved, 2 * 16_384);
  }

  #[tokio::test]
  async fn staged_copy_is_removed_when_the_send_is_cancelled() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_source(dir.path(), "video.mp4", 256 * 1024);
    let channel = MockChannel::opened();
    channel.set_drain_per_poll(0);
    let sender = FileSender::new(StagingSource::new(dir.path()), config());

    let sending = sender.send(channel.as_ref(), path.to_str().unwrap(), None, |_, _| {});
    assert!(timeout(std::time::Duration::from_millis(100), sending).await.is_err());

    assert!(!channel.sent().is_empty());
    assert!(!dir.path().join("staged.tmp").exists());
    assert!(sender.source.deleted.lock().unwrap().is_empty());
    assert!(path.exists());
  }

  #[tokio::test]
  async fn short_source_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_source(dir.path(), "a.bin", 1000);
    let channel = MockChannel::opened();
    let mut source = StagingSource::new(dir.path());
    source.extra_size = 10;
    let sender = FileSender::new(source, config());

    let err = sender
      .send(channel.as_ref(), path.to_str().unwrap(), None, |_, _| {})
      .await
      .unwrap_err();
    match err {
      Error::Io(err) => assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof),
      other => panic!("unexpected error {other}"),
    }
    assert!(!dir.path().join("staged.tmp").exists());
  }
}
