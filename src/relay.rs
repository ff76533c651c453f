//! Signaling relay: maps peer ids to live WebSocket connections and forwards
//! negotiation messages between them. Holds no history.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::protocol::SignalMessage;

/// Just enough of a frame to route it. The body is forwarded untouched.
#[derive(Deserialize)]
struct Envelope {
  #[serde(rename = "type")]
  kind: String,
  #[serde(default)]
  id: Option<String>,
  #[serde(default)]
  to: Option<String>,
}

struct PeerSlot {
  conn_id: u64,
  tx: mpsc::UnboundedSender<Message>,
}

#[derive(Default)]
pub struct Relay {
  peers: RwLock<HashMap<String, PeerSlot>>,
  next_conn: AtomicU64,
}

/// What the relay did with one inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routed {
  Registered(String),
  Forwarded { kind: String, to: String },
  Offline(String),
  Dropped,
}

impl Relay {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  pub async fn bind(listen_addr: &str) -> Result<TcpListener> {
    let listener = TcpListener::bind(listen_addr).await?;
    info!("relay listening on {}", listener.local_addr()?);
    Ok(listener)
  }

  /// Accepts connections until the listener fails.
  pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
    loop {
      let (stream, addr) = listener.accept().await?;
      let relay = self.clone();
      tokio::spawn(async move {
        relay.handle_connection(stream, addr).await;
      });
    }
  }

  async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
    let ws_stream = match accept_async(stream).await {
      Ok(ws) => ws,
      Err(err) => {
        debug!("websocket upgrade failed for {addr}: {err}");
        return;
      }
    };
    let conn_id = self.next_conn.fetch_add(1, Ordering::SeqCst) + 1;
    info!("connection {conn_id} from {addr}");

    let (mut ws_write, mut ws_read) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let writer = tokio::spawn(async move {
      while let Some(msg) = rx.recv().await {
        if ws_write.send(msg).await.is_err() {
          break;
        }
      }
      let _ = ws_write.close().await;
    });

    let mut registered: Option<String> = None;
    while let Some(msg) = ws_read.next().await {
      let text = match msg {
        Ok(Message::Text(text)) => text,
        Ok(Message::Binary(data)) => match String::from_utf8(data) {
          Ok(text) => text,
          Err(_) => continue,
        },
        Ok(Message::Close(_)) => break,
        Ok(_) => continue,
        Err(err) => {
          debug!("connection {conn_id} read error: {err}");
          break;
        }
      };
      if let Routed::Registered(id) = self.route(conn_id, &tx, &text).await {
        if let Some(previous) = registered.replace(id.clone()) {
          if previous != id {
            self.unregister(&previous, conn_id).await;
          }
        }
      }
    }

    if let Some(id) = registered {
      self.unregister(&id, conn_id).await;
    }
    drop(tx);
    writer.abort();
    info!("connection {conn_id} closed");
  }

  /// Routes one text frame received on connection `conn_id`.
  pub async fn route(&self, conn_id: u64, reply: &mpsc::UnboundedSender<Message>, text: &str) -> Routed {
    let envelope: Envelope = match serde_json::from_str(text) {
      Ok(envelope) => envelope,
      Err(_) => {
        debug!("dropping malformed frame from connection {conn_id}");
        return Routed::Dropped;
      }
    };

    match envelope.kind.as_str() {
      "register" => {
        let Some(id) = envelope.id.filter(|id| !id.is_empty()) else {
          return Routed::Dropped;
        };
        let previous = self.peers.write().await.insert(
          id.clone(),
          PeerSlot {
            conn_id,
            tx: reply.clone(),
          },
        );
        match previous {
          Some(slot) if slot.conn_id != conn_id => info!("{id} re-registered on connection {conn_id}"),
          _ => info!("{id} registered on connection {conn_id}"),
        }
        Routed::Registered(id)
      }
      "offer" | "answer" | "candidate" => {
        let Some(to) = envelope.to else {
          debug!("dropping {} without a target", envelope.kind);
          return Routed::Dropped;
        };
        if self.forward(&to, text).await {
          debug!("forwarded {} to {to}", envelope.kind);
          return Routed::Forwarded {
            kind: envelope.kind.clone(),
            to,
          };
        }
        info!("{to} is offline");
        let notice = SignalMessage::PeerOffline { to: to.clone() };
        if let Ok(body) = serde_json::to_string(&notice) {
          let _ = reply.send(Message::Text(body));
        }
        Routed::Offline(to)
      }
      other => {
        debug!("ignoring frame of type {other}");
        Routed::Dropped
      }
    }
  }

  async fn forward(&self, to: &str, text: &str) -> bool {
    let stale = {
      let peers = self.peers.read().await;
      let Some(slot) = peers.get(to) else {
        return false;
      };
      match slot.tx.send(Message::Text(text.to_string())) {
        Ok(()) => return true,
        Err(_) => slot.conn_id,
      }
    };
    warn!("connection for {to} is gone, dropping registration");
    self.unregister(to, stale).await;
    false
  }

  /// Removes `id` only if it still belongs to `conn_id`; a newer registration wins.
  pub async fn unregister(&self, id: &str, conn_id: u64) {
    let mut peers = self.peers.write().await;
    if peers.get(id).is_some_and(|slot| slot.conn_id == conn_id) {
      peers.remove(id);
      debug!("{id} unregistered");
    }
  }

  pub async fn is_registered(&self, id: &str) -> bool {
    self.peers.read().await.contains_key(id)
  }

  pub async fn peer_count(&self) -> usize {
    self.peers.read().await.len()
  }
}
