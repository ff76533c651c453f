//! Client side of the relay connection.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};

use crate::config::RelayEndpoint;
use crate::error::{Error, Result};
use crate::protocol::SignalMessage;

pub struct SignalingClient {
  local_id: String,
  outbound: mpsc::UnboundedSender<SignalMessage>,
  writer: JoinHandle<()>,
  reader: JoinHandle<()>,
}

impl SignalingClient {
  /// Connects, registers `local_id`, and returns the client together with the
  /// stream of messages the relay delivers to this peer.
  pub async fn connect(
    endpoint: &RelayEndpoint,
    local_id: &str,
  ) -> Result<(Self, mpsc::UnboundedReceiver<SignalMessage>)> {
    info!("connecting to relay {}", endpoint.url);
    let (ws_stream, _) = connect_async(endpoint.url.as_str())
      .await
      .map_err(|err| Error::RelayUnavailable(format!("{}: {err}", endpoint.url)))?;
    let (mut ws_write, mut ws_read) = ws_stream.split();

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<SignalMessage>();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<SignalMessage>();

    let writer = tokio::spawn(async move {
      while let Some(msg) = outbound_rx.recv().await {
        let text = match serde_json::to_string(&msg) {
          Ok(text) => text,
          Err(err) => {
            warn!("dropping unserializable {} message: {err}", msg.kind());
            continue;
          }
        };
        if let Err(err) = ws_write.send(Message::Text(text)).await {
          warn!("relay write failed: {err}");
          break;
        }
      }
      let _ = ws_write.close().await;
    });

    let reader = tokio::spawn(async move {
      while let Some(msg) = ws_read.next().await {
        let msg = match msg {
          Ok(msg) => msg,
          Err(err) => {
            warn!("relay read failed: {err}");
            break;
          }
        };
        let Message::Text(text) = msg else {
          continue;
        };
        match serde_json::from_str::<SignalMessage>(&text) {
          Ok(parsed) => {
            debug!("relay -> {}", parsed.kind());
            if inbound_tx.send(parsed).is_err() {
              break;
            }
          }
          Err(err) => debug!("ignoring unparseable relay frame: {err}"),
        }
      }
      info!("relay connection closed");
    });

    outbound_tx
      .send(SignalMessage::Register {
        id: local_id.to_string(),
      })
      .map_err(|_| Error::RelayUnavailable("relay writer stopped".to_string()))?;

    let client = Self {
      local_id: local_id.to_string(),
      outbound: outbound_tx,
      writer,
      reader,
    };
    Ok((client, inbound_rx))
  }

  pub fn local_id(&self) -> &str {
    &self.local_id
  }

  /// Outbound queue to the relay, suitable for handing to a `SessionManager`.
  pub fn sender(&self) -> mpsc::UnboundedSender<SignalMessage> {
    self.outbound.clone()
  }

  pub fn shutdown(self) {
    self.reader.abort();
    self.writer.abort();
  }
}
