use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use peershare::transport::{ChannelEvent, ChannelPayload, ChannelStatus, DataChannel};
use peershare::{Error, Result};
use tokio::sync::{mpsc, Notify};

/// One direction of an ordered, reliable channel held in memory. Bytes count
/// as buffered until the reader side has accepted them.
pub struct PipeChannel {
  tx: Mutex<Option<mpsc::UnboundedSender<ChannelPayload>>>,
  open: AtomicBool,
  buffered: Arc<AtomicUsize>,
  peak: AtomicUsize,
  low: Arc<Notify>,
}

impl PipeChannel {
  pub fn peak_buffered(&self) -> usize {
    self.peak.load(Ordering::SeqCst)
  }
}

/// Returns the writing end and the reader's event stream. `delay` slows the
/// reader down so the writer has to respect flow control.
pub fn pipe(delay: Option<Duration>) -> (Arc<PipeChannel>, mpsc::Receiver<ChannelEvent>) {
  let (tx, mut rx) = mpsc::unbounded_channel::<ChannelPayload>();
  let (event_tx, event_rx) = mpsc::channel(16);
  let buffered = Arc::new(AtomicUsize::new(0));
  let low = Arc::new(Notify::new());

  let forward_buffered = buffered.clone();
  let forward_low = low.clone();
  tokio::spawn(async move {
    while let Some(payload) = rx.recv().await {
      if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
      }
      let len = payload.len();
      if event_tx.send(ChannelEvent::Message(payload)).await.is_err() {
        return;
      }
      forward_buffered.fetch_sub(len, Ordering::SeqCst);
      forward_low.notify_waiters();
    }
    let _ = event_tx.send(ChannelEvent::Closed).await;
  });

  let channel = Arc::new(PipeChannel {
    tx: Mutex::new(Some(tx)),
    open: AtomicBool::new(true),
    buffered,
    peak: AtomicUsize::new(0),
    low,
  });
  (channel, event_rx)
}

#[async_trait]
impl DataChannel for PipeChannel {
  fn status(&self) -> ChannelStatus {
    if self.open.load(Ordering::SeqCst) {
      ChannelStatus::Open
    } else {
      ChannelStatus::Closed
    }
  }

  async fn buffered_amount(&self) -> usize {
    self.buffered.load(Ordering::SeqCst)
  }

  async fn buffered_amount_low(&self) {
    self.low.notified().await;
  }

  async fn send(&self, payload: ChannelPayload) -> Result<()> {
    let tx = self.tx.lock().unwrap().clone();
    let Some(tx) = tx else {
      return Err(Error::ChannelNotReady);
    };
    let len = payload.len();
    let now = self.buffered.fetch_add(len, Ordering::SeqCst) + len;
    self.peak.fetch_max(now, Ordering::SeqCst);
    tx.send(payload).map_err(|_| Error::ChannelNotReady)
  }

  async fn close(&self) -> Result<()> {
    self.open.store(false, Ordering::SeqCst);
    self.tx.lock().unwrap().take();
    Ok(())
  }
}
