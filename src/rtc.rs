//! webrtc-rs implementation of the transport traits.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::error::{Error, Result};
use crate::transport::{
  ChannelEvent, ChannelHandle, ChannelPayload, ChannelStatus, DataChannel, LinkEvent, LinkFactory, PeerLink, SdpKind,
};

/// Inbound messages buffered per channel before the SCTP reader is held back.
const CHANNEL_EVENT_BUFFER: usize = 256;
const BUFFERED_LOW_THRESHOLD: usize = 32 * 1024;

pub struct RtcLinkFactory {
  ice_servers: Vec<String>,
}

impl RtcLinkFactory {
  pub fn new(ice_servers: Vec<String>) -> Self {
    Self { ice_servers }
  }
}

#[async_trait]
impl LinkFactory for RtcLinkFactory {
  async fn create(&self) -> Result<(Arc<dyn PeerLink>, mpsc::UnboundedReceiver<LinkEvent>)> {
    let pc = create_peer_connection(&self.ice_servers).await?;
    let (event_tx, event_rx) = mpsc::unbounded_channel();

    let tx = event_tx.clone();
    pc.on_ice_candidate(Box::new(move |candidate| {
      let tx = tx.clone();
      Box::pin(async move {
        if let Some(candidate) = candidate {
          match candidate.to_json() {
            Ok(init) => {
              let _ = tx.send(LinkEvent::LocalCandidate(init));
            }
            Err(err) => warn!("could not serialize local candidate: {err}"),
          }
        }
      })
    }));

    let tx = event_tx.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
      let tx = tx.clone();
      Box::pin(async move {
        debug!("connection state: {state:?}");
        if matches!(state, RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed) {
          let _ = tx.send(LinkEvent::Failed);
        }
      })
    }));

    let tx = event_tx;
    pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
      let tx = tx.clone();
      Box::pin(async move {
        info!("remote data channel '{}'", dc.label());
        let handle = wire_channel(dc).await;
        let _ = tx.send(LinkEvent::Channel(handle));
      })
    }));

    let link: Arc<dyn PeerLink> = Arc::new(RtcLink { pc });
    Ok((link, event_rx))
  }
}

struct RtcLink {
  pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerLink for RtcLink {
  async fn open_channel(&self, label: &str) -> Result<ChannelHandle> {
    let dc = self
      .pc
      .create_data_channel(
        label,
        Some(RTCDataChannelInit {
          ordered: Some(true),
          ..Default::default()
        }),
      )
      .await?;
    Ok(wire_channel(dc).await)
  }

  async fn create_offer(&self) -> Result<String> {
    let offer = self.pc.create_offer(None).await?;
    self.pc.set_local_description(offer).await?;
    let local = self
      .pc
      .local_description()
      .await
      .ok_or_else(|| Error::Link("no local description after offer".to_string()))?;
    Ok(local.sdp)
  }

  async fn create_answer(&self) -> Result<String> {
    let answer = self.pc.create_answer(None).await?;
    self.pc.set_local_description(answer).await?;
    let local = self
      .pc
      .local_description()
      .await
      .ok_or_else(|| Error::Link("no local description after answer".to_string()))?;
    Ok(local.sdp)
  }

  async fn set_remote_description(&self, kind: SdpKind, sdp: String) -> Result<()> {
    let desc = match kind {
      SdpKind::Offer => RTCSessionDescription::offer(sdp)?,
      SdpKind::Answer => RTCSessionDescription::answer(sdp)?,
    };
    self.pc.set_remote_description(desc).await?;
    Ok(())
  }

  async fn has_remote_description(&self) -> bool {
    self.pc.remote_description().await.is_some()
  }

  async fn add_candidate(&self, candidate: RTCIceCandidateInit) -> Result<()> {
    self.pc.add_ice_candidate(candidate).await?;
    Ok(())
  }

  async fn close(&self) -> Result<()> {
    self.pc.close().await?;
    Ok(())
  }
}

async fn create_peer_connection(ice_servers: &[String]) -> Result<Arc<RTCPeerConnection>> {
  let mut media_engine = MediaEngine::default();
  media_engine.register_default_codecs()?;

  let mut registry = Registry::new();
  registry = register_default_interceptors(registry, &mut media_engine)?;

  let api = APIBuilder::new()
    .with_media_engine(media_engine)
    .with_interceptor_registry(registry)
    .build();

  let config = RTCConfiguration {
    ice_servers: ice_servers
      .iter()
      .map(|url| RTCIceServer {
        urls: vec![url.clone()],
        ..Default::default()
      })
      .collect(),
    ..Default::default()
  };

  let pc = api.new_peer_connection(config).await?;
  Ok(Arc::new(pc))
}

fn map_state(state: RTCDataChannelState) -> ChannelStatus {
  match state {
    RTCDataChannelState::Open => ChannelStatus::Open,
    RTCDataChannelState::Closing | RTCDataChannelState::Closed => ChannelStatus::Closed,
    _ => ChannelStatus::Connecting,
  }
}

async fn wire_channel(dc: Arc<RTCDataChannel>) -> ChannelHandle {
  let (status_tx, status_rx) = watch::channel(map_state(dc.ready_state()));
  let status_tx = Arc::new(status_tx);
  let (event_tx, event_rx) = mpsc::channel(CHANNEL_EVENT_BUFFER);
  let low = Arc::new(Notify::new());

  dc.set_buffered_amount_low_threshold(BUFFERED_LOW_THRESHOLD).await;
  let low_signal = low.clone();
  dc.on_buffered_amount_low(Box::new(move || {
    low_signal.notify_waiters();
    Box::pin(async {})
  }))
  .await;

  let open_status = status_tx.clone();
  let label = dc.label().to_string();
  dc.on_open(Box::new(move || {
    debug!("data channel '{label}' open");
    open_status.send_replace(ChannelStatus::Open);
    Box::pin(async {})
  }));

  let close_status = status_tx;
  let close_tx = event_tx.clone();
  let close_low = low.clone();
  dc.on_close(Box::new(move || {
    close_status.send_replace(ChannelStatus::Closed);
    close_low.notify_waiters();
    let tx = close_tx.clone();
    Box::pin(async move {
      let _ = tx.send(ChannelEvent::Closed).await;
    })
  }));

  let label = dc.label().to_string();
  dc.on_error(Box::new(move |err| {
    warn!("data channel '{label}' error: {err}");
    Box::pin(async {})
  }));

  dc.on_message(Box::new(move |msg: DataChannelMessage| {
    let tx = event_tx.clone();
    Box::pin(async move {
      let payload = if msg.is_string {
        ChannelPayload::Text(String::from_utf8_lossy(&msg.data).into_owned())
      } else {
        ChannelPayload::Binary(msg.data)
      };
      let _ = tx.send(ChannelEvent::Message(payload)).await;
    })
  }));

  ChannelHandle {
    channel: Arc::new(RtcChannel { dc, low }),
    status: status_rx,
    events: event_rx,
  }
}

struct RtcChannel {
  dc: Arc<RTCDataChannel>,
  low: Arc<Notify>,
}

#[async_trait]
impl DataChannel for RtcChannel {
  fn status(&self) -> ChannelStatus {
    map_state(self.dc.ready_state())
  }

  async fn buffered_amount(&self) -> usize {
    self.dc.buffered_amount().await
  }

  async fn buffered_amount_low(&self) {
    self.low.notified().await;
  }

  async fn send(&self, payload: ChannelPayload) -> Result<()> {
    if !self.is_open() {
      return Err(Error::ChannelNotReady);
    }
    match payload {
      ChannelPayload::Text(text) => self.dc.send_text(text).await?,
      ChannelPayload::Binary(data) => self.dc.send(&data).await?,
    };
    Ok(())
  }

  async fn close(&self) -> Result<()> {
    if self.dc.ready_state() == RTCDataChannelState::Closed {
      return Ok(());
    }
    self.dc.close().await?;
    Ok(())
  }
}
