use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
  #[error("signaling relay unavailable: {0}")]
  RelayUnavailable(String),

  #[error("peer {0} is offline")]
  PeerOffline(String),

  #[error("negotiation with {peer} timed out after {after:?}")]
  NegotiationTimeout { peer: String, after: Duration },

  #[error("could not apply candidate from {peer}: {reason}")]
  CandidateApply { peer: String, reason: String },

  #[error("data channel not open")]
  ChannelNotReady,

  #[error("protocol violation: {0}")]
  ProtocolViolation(String),

  #[error("storage failure ({context}): {source}")]
  Storage {
    context: String,
    #[source]
    source: std::io::Error,
  },

  #[error("session with {0} closed")]
  SessionClosed(String),

  #[error("peer link error: {0}")]
  Link(String),

  #[error("invalid configuration: {0}")]
  Config(String),

  #[error("webrtc error: {0}")]
  Rtc(#[from] webrtc::Error),

  #[error("I/O error: {0}")]
  Io(#[from] std::io::Error),

  #[error("JSON error: {0}")]
  Json(#[from] serde_json::Error),
}

impl Error {
  pub(crate) fn storage(context: impl Into<String>) -> impl FnOnce(std::io::Error) -> Error {
    let context = context.into();
    move |source| Error::Storage { context, source }
  }
}

pub type Result<T> = std::result::Result<T, Error>;
