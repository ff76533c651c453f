//! In-memory doubles for the transport traits.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

use crate::error::{Error, Result};
use crate::transport::{
  ChannelEvent, ChannelHandle, ChannelPayload, ChannelStatus, DataChannel, LinkEvent, LinkFactory, PeerLink, SdpKind,
};

pub(crate) fn candidate(name: &str) -> RTCIceCandidateInit {
  RTCIceCandidateInit {
    candidate: name.to_string(),
    ..Default::default()
  }
}

pub(crate) struct MockChannel {
  status: watch::Sender<ChannelStatus>,
  inbound: Mutex<Option<mpsc::Sender<ChannelEvent>>>,
  sent: Mutex<Vec<ChannelPayload>>,
  buffered: AtomicUsize,
  /// Bytes the simulated network flushes on each `buffered_amount` poll.
  drain_per_poll: AtomicUsize,
  peak_after_send: AtomicUsize,
  fail_after: Mutex<Option<usize>>,
  close_calls: AtomicUsize,
}

impl MockChannel {
  pub(crate) fn new() -> Arc<Self> {
    let (status, _) = watch::channel(ChannelStatus::Connecting);
    Arc::new(Self {
      status,
      inbound: Mutex::new(None),
      sent: Mutex::new(Vec::new()),
      buffered: AtomicUsize::new(0),
      drain_per_poll: AtomicUsize::new(usize::MAX),
      peak_after_send: AtomicUsize::new(0),
      fail_after: Mutex::new(None),
      close_calls: AtomicUsize::new(0),
    })
  }

  pub(crate) fn opened() -> Arc<Self> {
    let channel = Self::new();
    channel.open();
    channel
  }

  pub(crate) fn handle(self: &Arc<Self>) -> ChannelHandle {
    let (tx, rx) = mpsc::channel(64);
    *self.inbound.lock().unwrap() = Some(tx);
    ChannelHandle {
      channel: self.clone(),
      status: self.status.subscribe(),
      events: rx,
    }
  }

  pub(crate) fn open(&self) {
    self.status.send_replace(ChannelStatus::Open);
  }

  pub(crate) async fn deliver(&self, event: ChannelEvent) {
    let tx = self.inbound.lock().unwrap().clone();
    if let Some(tx) = tx {
      let _ = tx.send(event).await;
    }
  }

  pub(crate) fn set_drain_per_poll(&self, bytes: usize) {
    self.drain_per_poll.store(bytes, Ordering::SeqCst);
  }

  pub(crate) fn fail_sends_after(&self, count: usize) {
    *self.fail_after.lock().unwrap() = Some(count);
  }

  pub(crate) fn sent(&self) -> Vec<ChannelPayload> {
    self.sent.lock().unwrap().clone()
  }

  pub(crate) fn peak_after_send(&self) -> usize {
    self.peak_after_send.load(Ordering::SeqCst)
  }

  pub(crate) fn close_calls(&self) -> usize {
    self.close_calls.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl DataChannel for MockChannel {
  fn status(&self) -> ChannelStatus {
    *self.status.borrow()
  }

  async fn buffered_amount(&self) -> usize {
    let drain = self.drain_per_poll.load(Ordering::SeqCst);
    let current = self.buffered.load(Ordering::SeqCst);
    let remaining = current.saturating_sub(drain);
    self.buffered.store(remaining, Ordering::SeqCst);
    remaining
  }

  async fn buffered_amount_low(&self) {
    tokio::task::yield_now().await;
  }

  async fn send(&self, payload: ChannelPayload) -> Result<()> {
    if !self.is_open() {
      return Err(Error::ChannelNotReady);
    }
    let mut sent = self.sent.lock().unwrap();
    if let Some(limit) = *self.fail_after.lock().unwrap() {
      if sent.len() >= limit {
        return Err(Error::Link("send failed".to_string()));
      }
    }
    let buffered = self.buffered.fetch_add(payload.len(), Ordering::SeqCst) + payload.len();
    self.peak_after_send.fetch_max(buffered, Ordering::SeqCst);
    sent.push(payload);
    Ok(())
  }

  async fn close(&self) -> Result<()> {
    self.close_calls.fetch_add(1, Ordering::SeqCst);
    self.status.send_replace(ChannelStatus::Closed);
    Ok(())
  }
}

#[derive(Default)]
pub(crate) struct MockLink {
  remote: Mutex<Option<(SdpKind, String)>>,
  applied: Mutex<Vec<String>>,
  rejected: Mutex<HashSet<String>>,
  fail_remote: AtomicBool,
  closed: AtomicBool,
  channel: Mutex<Option<Arc<MockChannel>>>,
}

impl MockLink {
  pub(crate) fn new() -> Self {
    Self::default()
  }

  pub(crate) fn applied(&self) -> Vec<String> {
    self.applied.lock().unwrap().clone()
  }

  pub(crate) fn reject_candidate(&self, name: &str) {
    self.rejected.lock().unwrap().insert(name.to_string());
  }

  pub(crate) fn accept_all(&self) {
    self.rejected.lock().unwrap().clear();
  }

  pub(crate) fn fail_remote_description(&self) {
    self.fail_remote.store(true, Ordering::SeqCst);
  }

  pub(crate) fn remote(&self) -> Option<(SdpKind, String)> {
    self.remote.lock().unwrap().clone()
  }

  pub(crate) fn is_closed(&self) -> bool {
    self.closed.load(Ordering::SeqCst)
  }

  pub(crate) fn channel(&self) -> Option<Arc<MockChannel>> {
    self.channel.lock().unwrap().clone()
  }
}

#[async_trait]
impl PeerLink for MockLink {
  async fn open_channel(&self, _label: &str) -> Result<ChannelHandle> {
    let channel = MockChannel::new();
    let handle = channel.handle();
    *self.channel.lock().unwrap() = Some(channel);
    Ok(handle)
  }

  async fn create_offer(&self) -> Result<String> {
    Ok("offer-sdp".to_string())
  }

  async fn create_answer(&self) -> Result<String> {
    Ok("answer-sdp".to_string())
  }

  async fn set_remote_description(&self, kind: SdpKind, sdp: String) -> Result<()> {
    if self.fail_remote.load(Ordering::SeqCst) {
      return Err(Error::Link("bad remote description".to_string()));
    }
    *self.remote.lock().unwrap() = Some((kind, sdp));
    Ok(())
  }

  async fn has_remote_description(&self) -> bool {
    self.remote.lock().unwrap().is_some()
  }

  async fn add_candidate(&self, candidate: RTCIceCandidateInit) -> Result<()> {
    if self.rejected.lock().unwrap().contains(&candidate.candidate) {
      return Err(Error::Link(format!("rejected {}", candidate.candidate)));
    }
    self.applied.lock().unwrap().push(candidate.candidate);
    Ok(())
  }

  async fn close(&self) -> Result<()> {
    self.closed.store(true, Ordering::SeqCst);
    Ok(())
  }
}

#[derive(Default)]
pub(crate) struct MockFactory {
  links: Mutex<Vec<(Arc<MockLink>, mpsc::UnboundedSender<LinkEvent>)>>,
  rejected: Mutex<Vec<String>>,
  fail_remote: AtomicBool,
}

impl MockFactory {
  pub(crate) fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  /// Every link created from now on rejects this candidate.
  pub(crate) fn reject_candidate(&self, name: &str) {
    self.rejected.lock().unwrap().push(name.to_string());
  }

  pub(crate) fn fail_remote_description(&self) {
    self.fail_remote.store(true, Ordering::SeqCst);
  }

  pub(crate) fn created(&self) -> usize {
    self.links.lock().unwrap().len()
  }

  pub(crate) fn link(&self, index: usize) -> Arc<MockLink> {
    self.links.lock().unwrap()[index].0.clone()
  }

  pub(crate) fn emit(&self, index: usize, event: LinkEvent) {
    let tx = self.links.lock().unwrap()[index].1.clone();
    let _ = tx.send(event);
  }

  /// Simulates the remote side opening a data channel on link `index`.
  pub(crate) fn deliver_channel(&self, index: usize) -> Arc<MockChannel> {
    let channel = MockChannel::new();
    self.emit(index, LinkEvent::Channel(channel.handle()));
    channel
  }
}

#[async_trait]
impl LinkFactory for MockFactory {
  async fn create(&self) -> Result<(Arc<dyn PeerLink>, mpsc::UnboundedReceiver<LinkEvent>)> {
    let link = Arc::new(MockLink::new());
    for name in self.rejected.lock().unwrap().iter() {
      link.reject_candidate(name);
    }
    if self.fail_remote.load(Ordering::SeqCst) {
      link.fail_remote_description();
    }
    let (tx, rx) = mpsc::unbounded_channel();
    self.links.lock().unwrap().push((link.clone(), tx));
    let link: Arc<dyn PeerLink> = link;
    Ok((link, rx))
  }
}
