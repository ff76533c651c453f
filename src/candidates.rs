//! Per-peer FIFO of remote candidates that arrived before they could be applied.

use std::collections::{HashMap, VecDeque};

use tracing::{debug, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

use crate::transport::PeerLink;

#[derive(Default)]
pub struct CandidateQueue {
  pending: HashMap<String, VecDeque<RTCIceCandidateInit>>,
}

impl CandidateQueue {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn push(&mut self, peer: &str, candidate: RTCIceCandidateInit) {
    self.pending.entry(peer.to_string()).or_default().push_back(candidate);
  }

  pub fn len(&self, peer: &str) -> usize {
    self.pending.get(peer).map_or(0, VecDeque::len)
  }

  pub fn has_pending(&self, peer: &str) -> bool {
    self.len(peer) > 0
  }

  pub fn discard(&mut self, peer: &str) -> usize {
    self.pending.remove(peer).map_or(0, |queue| queue.len())
  }

  /// Applies queued candidates in arrival order. Stops at the first failure,
  /// leaving the failed candidate at the head for the next drain.
  /// Returns how many were applied.
  pub async fn drain(&mut self, peer: &str, link: &dyn PeerLink) -> usize {
    let Some(mut queue) = self.pending.remove(peer) else {
      return 0;
    };
    let mut applied = 0;
    while let Some(candidate) = queue.pop_front() {
      match link.add_candidate(candidate.clone()).await {
        Ok(()) => applied += 1,
        Err(err) => {
          warn!("candidate from {peer} failed during drain, requeueing: {err}");
          queue.push_front(candidate);
          break;
        }
      }
    }
    if !queue.is_empty() {
      self.pending.insert(peer.to_string(), queue);
    }
    debug!("drained {applied} candidates for {peer} ({} left)", self.len(peer));
    applied
  }
}
