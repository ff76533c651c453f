//! Wire messages: relay signaling frames and data-channel control messages.

use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

/// Frames exchanged with the relay. One JSON object per WebSocket text frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SignalMessage {
  #[serde(rename = "register")]
  Register { id: String },
  #[serde(rename = "offer")]
  Offer { from: String, to: String, sdp: String },
  #[serde(rename = "answer")]
  Answer { from: String, to: String, sdp: String },
  /// `candidate: null` marks end-of-candidates.
  #[serde(rename = "candidate")]
  Candidate {
    from: String,
    to: String,
    candidate: Option<RTCIceCandidateInit>,
  },
  #[serde(rename = "peer-offline")]
  PeerOffline { to: String },
}

impl SignalMessage {
  pub fn kind(&self) -> &'static str {
    match self {
      SignalMessage::Register { .. } => "register",
      SignalMessage::Offer { .. } => "offer",
      SignalMessage::Answer { .. } => "answer",
      SignalMessage::Candidate { .. } => "candidate",
      SignalMessage::PeerOffline { .. } => "peer-offline",
    }
  }
}

/// Control messages sent as text over the data channel. File content travels
/// as raw binary messages between `FileMeta` and `FileComplete`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DataMessage {
  #[serde(rename = "file-meta")]
  FileMeta {
    #[serde(default)]
    name: String,
    size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    mime: Option<String>,
  },
  #[serde(rename = "file-complete")]
  FileComplete {
    #[serde(default)]
    name: String,
  },
}
