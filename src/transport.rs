//! Narrow interfaces over the peer connection and its data channel.
//!
//! `rtc` implements these on top of webrtc-rs. Everything above this module
//! (sessions, sender, receiver) is written against the traits only.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
  Offer,
  Answer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
  Connecting,
  Open,
  Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelPayload {
  Text(String),
  Binary(Bytes),
}

impl ChannelPayload {
  pub fn len(&self) -> usize {
    match self {
      ChannelPayload::Text(text) => text.len(),
      ChannelPayload::Binary(data) => data.len(),
    }
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

/// Inbound data-channel traffic, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
  Message(ChannelPayload),
  Closed,
}

#[async_trait]
pub trait DataChannel: Send + Sync {
  fn status(&self) -> ChannelStatus;

  fn is_open(&self) -> bool {
    self.status() == ChannelStatus::Open
  }

  /// Bytes queued by the channel but not yet handed to the network.
  async fn buffered_amount(&self) -> usize;

  /// Resolves when the channel reports its buffer fell below its low threshold.
  async fn buffered_amount_low(&self);

  async fn send(&self, payload: ChannelPayload) -> Result<()>;

  async fn close(&self) -> Result<()>;
}

/// A data channel together with its status feed and its single inbound stream.
pub struct ChannelHandle {
  pub channel: Arc<dyn DataChannel>,
  pub status: watch::Receiver<ChannelStatus>,
  pub events: mpsc::Receiver<ChannelEvent>,
}

impl ChannelHandle {
  /// Waits until the channel leaves `Connecting`; errors if it closed instead of opening.
  pub async fn wait_open(status: &mut watch::Receiver<ChannelStatus>) -> Result<()> {
    let reached = status
      .wait_for(|status| *status != ChannelStatus::Connecting)
      .await
      .map(|status| *status)
      .unwrap_or(ChannelStatus::Closed);
    match reached {
      ChannelStatus::Open => Ok(()),
      _ => Err(Error::ChannelNotReady),
    }
  }
}

/// Things a peer connection reports on its own schedule.
pub enum LinkEvent {
  LocalCandidate(RTCIceCandidateInit),
  /// A channel opened by the remote side.
  Channel(ChannelHandle),
  Failed,
}

#[async_trait]
pub trait PeerLink: Send + Sync {
  /// Creates a local ordered, reliable data channel. Must precede `create_offer`.
  async fn open_channel(&self, label: &str) -> Result<ChannelHandle>;

  /// Creates an offer, applies it locally and returns its SDP.
  async fn create_offer(&self) -> Result<String>;

  /// Creates an answer, applies it locally and returns its SDP.
  async fn create_answer(&self) -> Result<String>;

  async fn set_remote_description(&self, kind: SdpKind, sdp: String) -> Result<()>;

  async fn has_remote_description(&self) -> bool;

  async fn add_candidate(&self, candidate: RTCIceCandidateInit) -> Result<()>;

  async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait LinkFactory: Send + Sync {
  async fn create(&self) -> Result<(Arc<dyn PeerLink>, mpsc::UnboundedReceiver<LinkEvent>)>;
}
