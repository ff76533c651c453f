//! Reassembles files from the inbound data-channel stream.
//!
//! Messages are handled strictly one at a time in arrival order, so a chunk
//! is never written before the `file-meta` that precedes it has opened the
//! temporary file.

use std::path::PathBuf;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::protocol::DataMessage;
use crate::storage::SinkStorage;
use crate::transfer::{sanitize_file_name, TransferRecord, TransferStatus};
use crate::transport::{ChannelEvent, ChannelPayload};

#[derive(Debug)]
pub enum ReceiveEvent {
  Started { name: String, size: u64 },
  Progress { received: u64, size: u64 },
  Completed { path: PathBuf, name: String, size: u64 },
  Failed { name: Option<String>, error: Error },
}

struct ActiveTransfer<T> {
  record: TransferRecord,
  temp: PathBuf,
  stream: T,
}

pub struct FileReceiver<S: SinkStorage> {
  storage: S,
  active: Option<ActiveTransfer<S::Stream>>,
  last: Option<TransferRecord>,
  events: mpsc::UnboundedSender<ReceiveEvent>,
}

impl<S: SinkStorage> FileReceiver<S> {
  pub fn new(storage: S) -> (Self, mpsc::UnboundedReceiver<ReceiveEvent>) {
    let (events, events_rx) = mpsc::unbounded_channel();
    let receiver = Self {
      storage,
      active: None,
      last: None,
      events,
    };
    (receiver, events_rx)
  }

  pub fn is_active(&self) -> bool {
    self.active.is_some()
  }

  pub fn current(&self) -> Option<&TransferRecord> {
    self.active.as_ref().map(|active| &active.record)
  }

  /// The most recently finished transfer, completed or failed.
  pub fn last_record(&self) -> Option<&TransferRecord> {
    self.last.as_ref()
  }

  /// Consumes channel events until the channel closes or the stream ends.
  pub async fn run(&mut self, mut inbound: mpsc::Receiver<ChannelEvent>) {
    while let Some(event) = inbound.recv().await {
      match event {
        ChannelEvent::Message(payload) => self.handle(payload).await,
        ChannelEvent::Closed => break,
      }
    }
    if self.active.is_some() {
      self
        .fail(Error::Link("data channel closed during transfer".to_string()))
        .await;
    }
    debug!("receiver stopped");
  }

  pub async fn handle(&mut self, payload: ChannelPayload) {
    if let Err(err) = self.apply(payload).await {
      self.fail(err).await;
    }
  }

  async fn apply(&mut self, payload: ChannelPayload) -> Result<()> {
    match payload {
      ChannelPayload::Binary(data) => self.write_chunk(&data).await,
      ChannelPayload::Text(text) => {
        let msg: DataMessage = serde_json::from_str(&text)
          .map_err(|err| Error::ProtocolViolation(format!("unreadable control message: {err}")))?;
        match msg {
          DataMessage::FileMeta { name, size, .. } => self.start(&name, size).await,
          DataMessage::FileComplete { .. } => self.complete().await,
        }
      }
    }
  }

  async fn start(&mut self, name: &str, size: u64) -> Result<()> {
    if let Some(active) = &self.active {
      return Err(Error::ProtocolViolation(format!(
        "file-meta for {name} while {} is still being received",
        active.record.name
      )));
    }
    let name = sanitize_file_name(name);
    let temp = self.storage.temp_path_for(&name);
    let stream = self.storage.open_append_stream(&temp).await?;
    info!("receiving {name} ({size} bytes)");
    self.active = Some(ActiveTransfer {
      record: TransferRecord::new(name.clone(), size),
      temp,
      stream,
    });
    self.emit(ReceiveEvent::Started { name, size });
    Ok(())
  }

  async fn write_chunk(&mut self, data: &[u8]) -> Result<()> {
    let Some(active) = self.active.as_mut() else {
      debug!("dropping {} bytes outside of a transfer", data.len());
      return Ok(());
    };
    self.storage.append(&mut active.stream, data).await?;
    active.record.moved += data.len() as u64;
    let (received, size) = (active.record.moved, active.record.size);
    self.emit(ReceiveEvent::Progress { received, size });
    Ok(())
  }

  /// Finalizes the active transfer. Failures are reported here with the record attached.
  async fn complete(&mut self) -> Result<()> {
    let Some(active) = self.active.take() else {
      debug!("file-complete without an active transfer");
      return Ok(());
    };
    let ActiveTransfer {
      mut record,
      temp,
      stream,
    } = active;

    if let Err(err) = self.storage.close(stream).await {
      self.storage.discard(&temp).await;
      self.report_failure(Some(record), err);
      return Ok(());
    }
    if record.moved != record.size {
      self.storage.discard(&temp).await;
      let err = Error::ProtocolViolation(format!(
        "{} declared {} bytes but {} arrived",
        record.name, record.size, record.moved
      ));
      self.report_failure(Some(record), err);
      return Ok(());
    }
    let path = match self.storage.finalize(&temp, &record.name).await {
      Ok(path) => path,
      Err(err) => {
        self.storage.discard(&temp).await;
        self.report_failure(Some(record), err);
        return Ok(());
      }
    };
    record.status = TransferStatus::Completed;
    info!("received {} into {}", record.name, path.display());
    self.emit(ReceiveEvent::Completed {
      path,
      name: record.name.clone(),
      size: record.size,
    });
    self.last = Some(record);
    Ok(())
  }

  async fn fail(&mut self, error: Error) {
    let record = match self.active.take() {
      Some(ActiveTransfer { record, temp, stream }) => {
        let _ = self.storage.close(stream).await;
        self.storage.discard(&temp).await;
        Some(record)
      }
      None => None,
    };
    self.report_failure(record, error);
  }

  fn report_failure(&mut self, record: Option<TransferRecord>, error: Error) {
    let name = record.as_ref().map(|record| record.name.clone());
    warn!("transfer {} failed: {error}", name.as_deref().unwrap_or("-"));
    if let Some(mut record) = record {
      record.status = TransferStatus::Error;
      self.last = Some(record);
    }
    self.emit(ReceiveEvent::Failed { name, error });
  }

  fn emit(&self, event: ReceiveEvent) {
    let _ = self.events.send(event);
  }
}
