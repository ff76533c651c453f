//! Peer sessions: offer/answer exchange, candidate buffering and data channel binding.
//!
//! All signaling for this process flows through one `SessionManager`. Its
//! registry of sessions and its pending-candidate queue live behind a single
//! lock so that creating a session, applying a remote description and
//! draining queued candidates happen as one step.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

use crate::candidates::CandidateQueue;
use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::protocol::SignalMessage;
use crate::transport::{
  ChannelEvent, ChannelHandle, ChannelPayload, DataChannel, LinkEvent, LinkFactory, PeerLink, SdpKind,
};

pub const CHANNEL_LABEL: &str = "data";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
  Initiator,
  Responder,
}

impl fmt::Display for Role {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Role::Initiator => write!(f, "initiator"),
      Role::Responder => write!(f, "responder"),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
  Idle,
  Negotiating,
  Linked,
  Closed,
}

struct SessionEntry {
  generation: u64,
  role: Role,
  state: SessionState,
  link: Arc<dyn PeerLink>,
  channel: Option<Arc<dyn DataChannel>>,
  /// Fails a pending `connect` early (peer offline, bad answer).
  abort: Option<oneshot::Sender<Error>>,
  pump: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Registry {
  sessions: HashMap<String, SessionEntry>,
  pending: CandidateQueue,
  next_generation: u64,
}

impl Registry {
  fn insert(&mut self, peer: &str, role: Role, link: Arc<dyn PeerLink>) -> u64 {
    self.next_generation += 1;
    let generation = self.next_generation;
    self.sessions.insert(
      peer.to_string(),
      SessionEntry {
        generation,
        role,
        state: SessionState::Idle,
        link,
        channel: None,
        abort: None,
        pump: None,
      },
    );
    generation
  }

  fn current(&mut self, peer: &str, generation: u64) -> Option<&mut SessionEntry> {
    self
      .sessions
      .get_mut(peer)
      .filter(|entry| entry.generation == generation)
  }

  /// Detaches the session but keeps candidates queued for the peer.
  fn take(&mut self, peer: &str, generation: Option<u64>) -> Option<SessionEntry> {
    let matches = match (self.sessions.get(peer), generation) {
      (Some(entry), Some(generation)) => entry.generation == generation,
      (Some(_), None) => true,
      (None, _) => false,
    };
    if !matches {
      return None;
    }
    self.sessions.remove(peer)
  }

  fn remove(&mut self, peer: &str, generation: Option<u64>) -> Option<SessionEntry> {
    let entry = self.take(peer, generation)?;
    let dropped = self.pending.discard(peer);
    if dropped > 0 {
      debug!("discarded {dropped} pending candidates for {peer}");
    }
    Some(entry)
  }
}

struct Inner {
  local_id: String,
  signals: mpsc::UnboundedSender<SignalMessage>,
  factory: Arc<dyn LinkFactory>,
  config: SessionConfig,
  registry: Mutex<Registry>,
  incoming: mpsc::UnboundedSender<PeerSession>,
  relay_closed: AtomicBool,
}

#[derive(Clone)]
pub struct SessionManager {
  inner: Arc<Inner>,
}

impl SessionManager {
  /// `signals` is the outbound queue to the relay. The returned stream yields
  /// sessions opened by remote peers once their data channel is open.
  pub fn new(
    local_id: impl Into<String>,
    signals: mpsc::UnboundedSender<SignalMessage>,
    factory: Arc<dyn LinkFactory>,
    config: SessionConfig,
  ) -> (Self, mpsc::UnboundedReceiver<PeerSession>) {
    let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
    let manager = Self {
      inner: Arc::new(Inner {
        local_id: local_id.into(),
        signals,
        factory,
        config,
        registry: Mutex::new(Registry::default()),
        incoming: incoming_tx,
        relay_closed: AtomicBool::new(false),
      }),
    };
    (manager, incoming_rx)
  }

  pub fn local_id(&self) -> &str {
    &self.inner.local_id
  }

  /// Processes relay messages one at a time until the relay stream ends.
  /// After that, sessions still negotiating fail with `RelayUnavailable`.
  pub async fn run(&self, mut signals: mpsc::UnboundedReceiver<SignalMessage>) {
    while let Some(msg) = signals.recv().await {
      let kind = msg.kind();
      if let Err(err) = self.handle_signal(msg).await {
        warn!("{kind} handling failed: {err}");
      }
    }
    debug!("signaling stream ended for {}", self.inner.local_id);
    self.relay_lost().await;
  }

  pub fn is_relay_closed(&self) -> bool {
    self.inner.relay_closed.load(Ordering::SeqCst)
  }

  async fn relay_lost(&self) {
    self.inner.relay_closed.store(true, Ordering::SeqCst);
    let stranded: Vec<(String, u64)> = {
      let mut registry = self.inner.registry.lock().await;
      let mut stranded = Vec::new();
      for (peer, entry) in registry.sessions.iter_mut() {
        if entry.state == SessionState::Linked {
          continue;
        }
        match entry.abort.take() {
          Some(abort) => {
            let _ = abort.send(relay_gone());
          }
          None => stranded.push((peer.clone(), entry.generation)),
        }
      }
      stranded
    };
    for (peer, generation) in stranded {
      warn!("relay lost while negotiating with {peer}");
      self.close_generation(&peer, generation).await;
    }
  }

  pub async fn handle_signal(&self, msg: SignalMessage) -> Result<()> {
    match msg {
      SignalMessage::Offer { from, to, sdp } => {
        if to != self.inner.local_id {
          debug!("ignoring offer addressed to {to}");
          return Ok(());
        }
        self.accept_offer(&from, sdp).await
      }
      SignalMessage::Answer { from, sdp, .. } => self.apply_answer(&from, sdp).await,
      SignalMessage::Candidate { from, candidate, .. } => self.add_remote_candidate(&from, candidate).await,
      SignalMessage::PeerOffline { to } => {
        self.peer_offline(&to).await;
        Ok(())
      }
      SignalMessage::Register { .. } => Ok(()),
    }
  }

  /// Opens a session to `remote` as initiator. Resolves once the data channel
  /// is open, or fails after the connect timeout with the session torn down.
  pub async fn connect(&self, remote: &str) -> Result<PeerSession> {
    if remote == self.inner.local_id {
      return Err(Error::ProtocolViolation("cannot connect to self".to_string()));
    }
    if self.is_relay_closed() {
      return Err(relay_gone());
    }
    self.close(remote).await;

    let (link, events) = self.inner.factory.create().await?;
    let mut handle = match link.open_channel(CHANNEL_LABEL).await {
      Ok(handle) => handle,
      Err(err) => {
        let _ = link.close().await;
        return Err(err);
      }
    };

    let (abort_tx, abort_rx) = oneshot::channel();
    let generation = {
      let mut registry = self.inner.registry.lock().await;
      let generation = registry.insert(remote, Role::Initiator, link.clone());
      if let Some(entry) = registry.current(remote, generation) {
        entry.channel = Some(handle.channel.clone());
        entry.abort = Some(abort_tx);
        entry.pump = Some(self.spawn_pump(remote, generation, events, None));
      }
      generation
    };
    info!("connecting to {remote}");

    let limit = self.inner.config.connect_timeout;
    let outcome = timeout(limit, self.negotiate_outbound(remote, generation, link, &mut handle, abort_rx)).await;
    let result = match outcome {
      Ok(Ok(())) => self.promote(remote, generation, Role::Initiator, handle).await,
      Ok(Err(err)) => Err(err),
      Err(_) => Err(Error::NegotiationTimeout {
        peer: remote.to_string(),
        after: limit,
      }),
    };
    if let Err(err) = &result {
      warn!("connect to {remote} failed: {err}");
      self.close_generation(remote, generation).await;
    }
    result
  }

  async fn negotiate_outbound(
    &self,
    remote: &str,
    generation: u64,
    link: Arc<dyn PeerLink>,
    handle: &mut ChannelHandle,
    abort: oneshot::Receiver<Error>,
  ) -> Result<()> {
    if let Some(entry) = self.inner.registry.lock().await.current(remote, generation) {
      entry.state = SessionState::Negotiating;
    }
    let sdp = link.create_offer().await?;
    self.signal(SignalMessage::Offer {
      from: self.inner.local_id.clone(),
      to: remote.to_string(),
      sdp,
    })?;

    tokio::select! {
      opened = ChannelHandle::wait_open(&mut handle.status) => opened,
      aborted = abort => Err(aborted.unwrap_or_else(|_| Error::SessionClosed(remote.to_string()))),
    }
  }

  async fn accept_offer(&self, remote: &str, sdp: String) -> Result<()> {
    let previous = self.inner.registry.lock().await.take(remote, None);
    if let Some(previous) = previous {
      info!("new offer from {remote}, replacing existing session");
      Self::release(remote, previous).await;
    }
    let (link, events) = self.inner.factory.create().await?;
    let (channel_tx, channel_rx) = oneshot::channel();

    let generation = {
      let mut registry = self.inner.registry.lock().await;
      let generation = registry.insert(remote, Role::Responder, link.clone());
      let pump = self.spawn_pump(remote, generation, events, Some(channel_tx));
      if let Some(entry) = registry.current(remote, generation) {
        entry.state = SessionState::Negotiating;
        entry.pump = Some(pump);
      }
      if let Err(err) = link.set_remote_description(SdpKind::Offer, sdp).await {
        drop(registry);
        self.close_generation(remote, generation).await;
        return Err(err);
      }
      registry.pending.drain(remote, link.as_ref()).await;
      generation
    };
    info!("accepted offer from {remote}");

    let answered = match link.create_answer().await {
      Ok(sdp) => self.signal(SignalMessage::Answer {
        from: self.inner.local_id.clone(),
        to: remote.to_string(),
        sdp,
      }),
      Err(err) => Err(err),
    };
    if let Err(err) = answered {
      self.close_generation(remote, generation).await;
      return Err(err);
    }

    let manager = self.clone();
    let remote = remote.to_string();
    tokio::spawn(async move {
      manager.await_inbound_channel(remote, generation, channel_rx).await;
    });
    Ok(())
  }

  async fn await_inbound_channel(&self, remote: String, generation: u64, channel: oneshot::Receiver<ChannelHandle>) {
    let limit = self.inner.config.connect_timeout;
    let opened = timeout(limit, async {
      let mut handle = channel
        .await
        .map_err(|_| Error::SessionClosed(remote.clone()))?;
      if let Some(entry) = self.inner.registry.lock().await.current(&remote, generation) {
        entry.channel = Some(handle.channel.clone());
      }
      ChannelHandle::wait_open(&mut handle.status).await?;
      Ok::<_, Error>(handle)
    })
    .await;

    let result = match opened {
      Ok(Ok(handle)) => self.promote(&remote, generation, Role::Responder, handle).await,
      Ok(Err(err)) => Err(err),
      Err(_) => Err(Error::NegotiationTimeout {
        peer: remote.clone(),
        after: limit,
      }),
    };
    match result {
      Ok(session) => {
        if self.inner.incoming.send(session).is_err() {
          debug!("nobody is accepting sessions; closing {remote}");
          self.close_generation(&remote, generation).await;
        }
      }
      Err(err) => {
        warn!("inbound session from {remote} failed: {err}");
        self.close_generation(&remote, generation).await;
      }
    }
  }

  async fn apply_answer(&self, remote: &str, sdp: String) -> Result<()> {
    let mut registry = self.inner.registry.lock().await;
    let Some(entry) = registry.sessions.get(remote) else {
      warn!("answer from {remote} without a pending offer");
      return Ok(());
    };
    if entry.role != Role::Initiator || entry.state != SessionState::Negotiating {
      warn!("unexpected answer from {remote} ({} in {:?})", entry.role, entry.state);
      return Ok(());
    }
    let link = entry.link.clone();
    let generation = entry.generation;

    if let Err(err) = link.set_remote_description(SdpKind::Answer, sdp).await {
      let abort = registry
        .current(remote, generation)
        .and_then(|entry| entry.abort.take());
      drop(registry);
      match abort {
        Some(abort) => {
          let _ = abort.send(err);
        }
        None => self.close_generation(remote, generation).await,
      }
      return Ok(());
    }
    registry.pending.drain(remote, link.as_ref()).await;
    debug!("applied answer from {remote}");
    Ok(())
  }

  async fn add_remote_candidate(&self, remote: &str, candidate: Option<RTCIceCandidateInit>) -> Result<()> {
    let Some(candidate) = candidate else {
      debug!("end of candidates from {remote}");
      return Ok(());
    };

    let mut registry = self.inner.registry.lock().await;
    let link = match registry.sessions.get(remote) {
      Some(entry) => entry.link.clone(),
      None => {
        debug!("no session for {remote}, queueing candidate");
        registry.pending.push(remote, candidate);
        return Ok(());
      }
    };
    if !link.has_remote_description().await {
      debug!("remote description for {remote} not set, queueing candidate");
      registry.pending.push(remote, candidate);
      return Ok(());
    }
    if let Err(err) = link.add_candidate(candidate.clone()).await {
      let err = Error::CandidateApply {
        peer: remote.to_string(),
        reason: err.to_string(),
      };
      warn!("{err}; requeueing");
      registry.pending.push(remote, candidate);
      return Ok(());
    }
    // Earlier failures stay queued; retry them now that the link accepts candidates.
    if registry.pending.has_pending(remote) {
      registry.pending.drain(remote, link.as_ref()).await;
    }
    Ok(())
  }

  async fn peer_offline(&self, remote: &str) {
    let mut registry = self.inner.registry.lock().await;
    let Some(entry) = registry.sessions.get_mut(remote) else {
      debug!("peer-offline for {remote} with no session");
      return;
    };
    if entry.state == SessionState::Linked {
      info!("{remote} left the relay; keeping the direct channel");
      return;
    }
    let generation = entry.generation;
    match entry.abort.take() {
      Some(abort) => {
        let _ = abort.send(Error::PeerOffline(remote.to_string()));
      }
      None => {
        drop(registry);
        info!("{remote} went offline while negotiating");
        self.close_generation(remote, generation).await;
      }
    }
  }

  async fn promote(&self, remote: &str, generation: u64, role: Role, handle: ChannelHandle) -> Result<PeerSession> {
    if !handle.channel.is_open() {
      return Err(Error::ChannelNotReady);
    }
    let mut registry = self.inner.registry.lock().await;
    let entry = registry
      .current(remote, generation)
      .ok_or_else(|| Error::SessionClosed(remote.to_string()))?;
    entry.state = SessionState::Linked;
    entry.abort = None;
    entry.channel = Some(handle.channel.clone());
    info!("linked with {remote} as {role}");
    Ok(PeerSession {
      remote: remote.to_string(),
      role,
      generation,
      channel: handle.channel,
      events: Some(handle.events),
      manager: self.clone(),
      sending: Arc::new(AtomicBool::new(false)),
    })
  }

  fn spawn_pump(
    &self,
    remote: &str,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<LinkEvent>,
    mut channel_tx: Option<oneshot::Sender<ChannelHandle>>,
  ) -> JoinHandle<()> {
    let inner: Weak<Inner> = Arc::downgrade(&self.inner);
    let remote = remote.to_string();
    tokio::spawn(async move {
      while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
          break;
        };
        match event {
          LinkEvent::LocalCandidate(candidate) => {
            let _ = inner.signals.send(SignalMessage::Candidate {
              from: inner.local_id.clone(),
              to: remote.clone(),
              candidate: Some(candidate),
            });
          }
          LinkEvent::Channel(handle) => match channel_tx.take() {
            Some(tx) => {
              let _ = tx.send(handle);
            }
            None => debug!("ignoring extra data channel from {remote}"),
          },
          LinkEvent::Failed => {
            info!("link to {remote} failed");
            SessionManager { inner }.close_generation(&remote, generation).await;
            break;
          }
        }
      }
    })
  }

  fn signal(&self, msg: SignalMessage) -> Result<()> {
    if self.is_relay_closed() {
      return Err(relay_gone());
    }
    self.inner.signals.send(msg).map_err(|_| relay_gone())
  }

  /// Sends on `remote`'s data channel. Fails with `ChannelNotReady` unless the session is linked and open.
  pub async fn send(&self, remote: &str, payload: ChannelPayload) -> Result<()> {
    let channel = {
      let registry = self.inner.registry.lock().await;
      registry
        .sessions
        .get(remote)
        .filter(|entry| entry.state == SessionState::Linked)
        .and_then(|entry| entry.channel.clone())
    };
    match channel {
      Some(channel) if channel.is_open() => channel.send(payload).await,
      _ => Err(Error::ChannelNotReady),
    }
  }

  pub async fn state(&self, remote: &str) -> Option<SessionState> {
    self
      .inner
      .registry
      .lock()
      .await
      .sessions
      .get(remote)
      .map(|entry| entry.state)
  }

  pub async fn pending_candidates(&self, remote: &str) -> usize {
    self.inner.registry.lock().await.pending.len(remote)
  }

  /// Tears down the session with `remote`, if any. Safe to call repeatedly.
  pub async fn close(&self, remote: &str) {
    let entry = self.inner.registry.lock().await.remove(remote, None);
    if let Some(entry) = entry {
      Self::release(remote, entry).await;
    }
  }

  async fn close_generation(&self, remote: &str, generation: u64) {
    let entry = self.inner.registry.lock().await.remove(remote, Some(generation));
    if let Some(entry) = entry {
      Self::release(remote, entry).await;
    }
  }

  pub async fn close_all(&self) {
    let entries: Vec<(String, SessionEntry)> = {
      let mut registry = self.inner.registry.lock().await;
      let peers: Vec<String> = registry.sessions.keys().cloned().collect();
      peers
        .into_iter()
        .filter_map(|peer| registry.remove(&peer, None).map(|entry| (peer, entry)))
        .collect()
    };
    for (peer, entry) in entries {
      Self::release(&peer, entry).await;
    }
  }

  async fn release(remote: &str, mut entry: SessionEntry) {
    entry.state = SessionState::Closed;
    if let Some(channel) = entry.channel.take() {
      if let Err(err) = channel.close().await {
        debug!("closing channel to {remote}: {err}");
      }
    }
    if let Err(err) = entry.link.close().await {
      debug!("closing link to {remote}: {err}");
    }
    if let Some(pump) = entry.pump.take() {
      pump.abort();
    }
    info!("session with {remote} closed");
  }
}

fn relay_gone() -> Error {
  Error::RelayUnavailable("signaling connection closed".to_string())
}

/// A linked session: the data channel is open.
pub struct PeerSession {
  remote: String,
  role: Role,
  generation: u64,
  channel: Arc<dyn DataChannel>,
  events: Option<mpsc::Receiver<ChannelEvent>>,
  manager: SessionManager,
  sending: Arc<AtomicBool>,
}

impl PeerSession {
  pub fn remote_id(&self) -> &str {
    &self.remote
  }

  pub fn role(&self) -> Role {
    self.role
  }

  pub fn channel(&self) -> &Arc<dyn DataChannel> {
    &self.channel
  }

  /// The inbound message stream. Can be taken once.
  pub fn take_events(&mut self) -> Option<mpsc::Receiver<ChannelEvent>> {
    self.events.take()
  }

  pub async fn send(&self, payload: ChannelPayload) -> Result<()> {
    if !self.channel.is_open() {
      return Err(Error::ChannelNotReady);
    }
    self.channel.send(payload).await
  }

  pub async fn send_binary(&self, data: Bytes) -> Result<()> {
    self.send(ChannelPayload::Binary(data)).await
  }

  pub async fn send_message<T: Serialize + Sync>(&self, msg: &T) -> Result<()> {
    let text = serde_json::to_string(msg)?;
    self.send(ChannelPayload::Text(text)).await
  }

  /// Claims the outbound direction for one transfer. Released when the guard drops.
  pub fn begin_transfer(&self) -> Result<TransferGuard> {
    if self.sending.swap(true, Ordering::SeqCst) {
      return Err(Error::ProtocolViolation(format!(
        "a transfer to {} is already in progress",
        self.remote
      )));
    }
    Ok(TransferGuard {
      flag: self.sending.clone(),
    })
  }

  pub async fn close(&self) {
    if let Err(err) = self.channel.close().await {
      debug!("closing channel to {}: {err}", self.remote);
    }
    self.manager.close_generation(&self.remote, self.generation).await;
  }
}

pub struct TransferGuard {
  flag: Arc<AtomicBool>,
}

impl Drop for TransferGuard {
  fn drop(&mut self) {
    self.flag.store(false, Ordering::SeqCst);
  }
}
