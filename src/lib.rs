//! Peer-to-peer file sharing over WebRTC data channels, with a small WebSocket signaling relay.

pub mod candidates;
pub mod config;
pub mod error;
pub mod protocol;
pub mod receiver;
pub mod relay;
pub mod rtc;
pub mod sender;
pub mod session;
pub mod signaling;
pub mod storage;
pub mod transfer;
pub mod transport;

#[cfg(test)]
mod mock;

pub use error::{Error, Result};
