use std::env;
use std::time::Duration;

use url::Url;

use crate::error::{Error, Result};

pub const DEFAULT_RELAY_HOST: &str = "127.0.0.1";
pub const DEFAULT_RELAY_PORT: u16 = 9000;
pub const RELAY_ENV: &str = "PEERSHARE_RELAY";
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;
pub const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024;

/// Where peers find the signaling relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayEndpoint {
  pub url: Url,
}

impl RelayEndpoint {
  /// Flag value first, then `PEERSHARE_RELAY`, then `ws://127.0.0.1:9000`.
  pub fn resolve(endpoint: Option<&str>) -> Result<Self> {
    let endpoint = endpoint
      .map(|value| value.to_string())
      .or_else(|| env::var(RELAY_ENV).ok())
      .unwrap_or_else(|| format!("{DEFAULT_RELAY_HOST}:{DEFAULT_RELAY_PORT}"));
    Self::parse(&endpoint)
  }

  pub fn parse(endpoint: &str) -> Result<Self> {
    let endpoint = endpoint.trim();
    if endpoint.is_empty() {
      return Err(Error::Config("relay endpoint is empty".to_string()));
    }
    let with_scheme = if endpoint.contains("://") {
      endpoint.to_string()
    } else {
      format!("ws://{endpoint}")
    };
    let mut url = Url::parse(&with_scheme).map_err(|err| Error::Config(format!("{endpoint}: {err}")))?;
    let scheme = match url.scheme() {
      "https" | "wss" => "wss",
      "http" | "ws" => "ws",
      other => return Err(Error::Config(format!("unsupported relay scheme: {other}"))),
    };
    url
      .set_scheme(scheme)
      .map_err(|_| Error::Config("invalid relay scheme".to_string()))?;
    if url.host_str().map_or(true, str::is_empty) {
      return Err(Error::Config(format!("relay endpoint has no host: {endpoint}")));
    }
    if url.port().is_none() && scheme == "ws" {
      url
        .set_port(Some(DEFAULT_RELAY_PORT))
        .map_err(|_| Error::Config("invalid relay port".to_string()))?;
    }
    url.set_query(None);
    url.set_fragment(None);
    Ok(Self { url })
  }
}

/// Listen address for the relay: explicit value, else `0.0.0.0:$PORT`, else port 9000.
pub fn relay_listen_addr(listen: Option<&str>) -> String {
  if let Some(listen) = listen {
    return listen.to_string();
  }
  let port = env::var("PORT")
    .ok()
    .and_then(|value| value.parse::<u16>().ok())
    .unwrap_or(DEFAULT_RELAY_PORT);
  format!("0.0.0.0:{port}")
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
  pub connect_timeout: Duration,
  pub ice_servers: Vec<String>,
}

impl Default for SessionConfig {
  fn default() -> Self {
    Self {
      connect_timeout: Duration::from_secs(30),
      ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
    }
  }
}

#[derive(Debug, Clone)]
pub struct TransferConfig {
  pub chunk_size: usize,
  /// Sender pauses while the channel buffers more than this many bytes.
  pub high_water_mark: usize,
  /// Upper bound on each flow-control wait before re-checking the buffer.
  pub backoff: Duration,
  /// How long to wait for the channel to flush after `file-complete`.
  pub drain_timeout: Duration,
}

impl Default for TransferConfig {
  fn default() -> Self {
    Self {
      chunk_size: DEFAULT_CHUNK_SIZE,
      high_water_mark: DEFAULT_HIGH_WATER_MARK,
      backoff: Duration::from_millis(10),
      drain_timeout: Duration::from_secs(5),
    }
  }
}

/// Six-digit numeric peer ID.
pub fn generate_peer_id() -> Result<String> {
  let mut bytes = [0u8; 4];
  getrandom::getrandom(&mut bytes).map_err(|err| Error::Config(format!("random source unavailable: {err}")))?;
  let value = 100_000 + u32::from_le_bytes(bytes) % 900_000;
  Ok(value.to_string())
}
