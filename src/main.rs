use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use peershare::config::{generate_peer_id, relay_listen_addr, RelayEndpoint, SessionConfig, TransferConfig};
use peershare::receiver::{FileReceiver, ReceiveEvent};
use peershare::relay::Relay;
use peershare::rtc::RtcLinkFactory;
use peershare::sender::FileSender;
use peershare::session::{PeerSession, SessionManager};
use peershare::signaling::SignalingClient;
use peershare::storage::{LocalSource, LocalStorage};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "peershare")]
#[command(about = "Direct peer-to-peer file transfer over WebRTC")]
struct Cli {
  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Run the signaling relay
  Relay {
    #[arg(long, value_name = "ADDR", help = "Listen address (default 0.0.0.0:$PORT or 0.0.0.0:9000)")]
    listen: Option<String>,
  },
  Send {
    #[arg(value_name = "PEER_ID", help = "Receiver's peer ID")]
    peer: String,
    #[arg(value_name = "FILE", help = "File to send, or - for stdin")]
    file: String,
    #[arg(long, value_name = "NAME", help = "Name announced to the receiver")]
    name: Option<String>,
    #[arg(long, value_name = "URL", help = "Signaling relay (default $PEERSHARE_RELAY or ws://127.0.0.1:9000)")]
    relay: Option<String>,
    #[arg(long, value_name = "ID", help = "Own peer ID (default: random six digits)")]
    id: Option<String>,
    #[arg(long, default_value_t = 30, value_name = "SECS", help = "Connection timeout")]
    timeout: u64,
    #[arg(long, value_name = "BYTES", help = "Chunk size")]
    chunk_size: Option<usize>,
  },
  Receive {
    #[arg(long, value_name = "URL", help = "Signaling relay (default $PEERSHARE_RELAY or ws://127.0.0.1:9000)")]
    relay: Option<String>,
    #[arg(long, value_name = "ID", help = "Own peer ID (default: random six digits)")]
    id: Option<String>,
    #[arg(long, default_value = ".", value_name = "DIR", help = "Output directory")]
    output_dir: PathBuf,
    #[arg(long, help = "Keep running after a successful receive")]
    stay_open: bool,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  init_tracing();
  let cli = Cli::parse();

  match cli.command {
    Command::Relay { listen } => run_relay(listen.as_deref()).await,
    Command::Send {
      peer,
      file,
      name,
      relay,
      id,
      timeout,
      chunk_size,
    } => {
      let mut transfer = TransferConfig::default();
      if let Some(chunk_size) = chunk_size {
        if chunk_size == 0 {
          return Err(anyhow!("--chunk-size must be positive"));
        }
        transfer.chunk_size = chunk_size;
      }
      let session = SessionConfig {
        connect_timeout: Duration::from_secs(timeout),
        ..Default::default()
      };
      run_send(&peer, &file, name.as_deref(), relay.as_deref(), id, session, transfer).await
    }
    Command::Receive {
      relay,
      id,
      output_dir,
      stay_open,
    } => run_receive(relay.as_deref(), id, output_dir, stay_open).await,
  }
}

fn init_tracing() {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("peershare=info"));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .init();
}

async fn run_relay(listen: Option<&str>) -> Result<()> {
  let addr = relay_listen_addr(listen);
  let listener = Relay::bind(&addr).await.with_context(|| format!("bind {addr}"))?;
  log_line("[relay] listening", &listener.local_addr()?.to_string());
  tokio::select! {
    served = Relay::new().serve(listener) => served.context("relay accept loop")?,
    _ = tokio::signal::ctrl_c() => log_line("[relay] stopping", "interrupted"),
  }
  Ok(())
}

async fn connect_manager(
  relay: Option<&str>,
  id: Option<String>,
  config: SessionConfig,
) -> Result<(SignalingClient, SessionManager, mpsc::UnboundedReceiver<PeerSession>, tokio::task::JoinHandle<()>)> {
  let endpoint = RelayEndpoint::resolve(relay)?;
  let local_id = match id {
    Some(id) => id,
    None => generate_peer_id()?,
  };
  log_line("[peer] id", &local_id);
  log_line("[ws] connecting", endpoint.url.as_str());
  let (client, inbound) = SignalingClient::connect(&endpoint, &local_id)
    .await
    .context("connect signaling relay")?;

  let factory = Arc::new(RtcLinkFactory::new(config.ice_servers.clone()));
  let (manager, incoming) = SessionManager::new(local_id, client.sender(), factory, config);
  let runner = {
    let manager = manager.clone();
    tokio::spawn(async move { manager.run(inbound).await })
  };
  Ok((client, manager, incoming, runner))
}

async fn run_send(
  peer: &str,
  file: &str,
  name: Option<&str>,
  relay: Option<&str>,
  id: Option<String>,
  session_config: SessionConfig,
  transfer_config: TransferConfig,
) -> Result<()> {
  let (client, manager, incoming, runner) = connect_manager(relay, id, session_config).await?;
  drop(incoming);

  log_line("[peer] connecting", peer);
  let connected = manager.connect(peer).await;
  let session = match connected {
    Ok(session) => session,
    Err(err) => {
      runner.abort();
      client.shutdown();
      return Err(err).with_context(|| format!("connect to {peer}"));
    }
  };
  log_line("[peer] linked", session.remote_id());

  let sender = FileSender::new(LocalSource::new(env::temp_dir().join("peershare")), transfer_config);
  let mut last_step = None;
  let sent = sender
    .send_over(&session, file, name, |done, total| {
      if let Some(step) = progress_step(done, total, &mut last_step) {
        log_line("[send] progress", &format!("{step}% ({done}/{total} bytes)"));
      }
    })
    .await;

  session.close().await;
  manager.close_all().await;
  runner.abort();
  client.shutdown();

  let record = sent.context("send file")?;
  log_line("[send] completed", &format!("{} ({} bytes)", record.name, record.size));
  Ok(())
}

async fn run_receive(relay: Option<&str>, id: Option<String>, output_dir: PathBuf, stay_open: bool) -> Result<()> {
  let (client, manager, mut incoming, mut runner) = connect_manager(relay, id, SessionConfig::default()).await?;
  log_line("[recv] waiting", &format!("files go to {}", output_dir.display()));

  let (done_tx, mut done_rx) = mpsc::unbounded_channel::<PathBuf>();
  let mut outcome = Ok(());
  loop {
    tokio::select! {
      session = incoming.recv() => {
        let Some(session) = session else {
          break;
        };
        log_line("[peer] linked", session.remote_id());
        tokio::spawn(receive_session(session, output_dir.clone(), done_tx.clone()));
      }
      _ = done_rx.recv(), if !stay_open => {
        break;
      }
      _ = &mut runner => {
        log_line("[recv] stopping", "relay connection lost");
        outcome = Err(peershare::Error::RelayUnavailable("relay connection lost".to_string()).into());
        break;
      }
      _ = tokio::signal::ctrl_c() => {
        log_line("[recv] stopping", "interrupted");
        break;
      }
    }
  }

  manager.close_all().await;
  runner.abort();
  client.shutdown();
  outcome
}

async fn receive_session(mut session: PeerSession, output_dir: PathBuf, done_tx: mpsc::UnboundedSender<PathBuf>) {
  let Some(inbound) = session.take_events() else {
    return;
  };
  let remote = session.remote_id().to_string();
  let storage = LocalStorage::new(env::temp_dir().join("peershare"), output_dir);
  let (mut receiver, mut events) = FileReceiver::new(storage);

  let run = async move {
    receiver.run(inbound).await;
  };
  let report = async {
    let mut last_step = None;
    while let Some(event) = events.recv().await {
      match event {
        ReceiveEvent::Started { name, size } => {
          last_step = None;
          log_line("[recv] started", &format!("{name} ({size} bytes) from {remote}"));
        }
        ReceiveEvent::Progress { received, size } => {
          if let Some(step) = progress_step(received, size, &mut last_step) {
            log_line("[recv] progress", &format!("{step}% ({received}/{size} bytes)"));
          }
        }
        ReceiveEvent::Completed { path, .. } => {
          log_line("[recv] completed", &path.display().to_string());
          let _ = done_tx.send(path);
        }
        ReceiveEvent::Failed { name, error } => {
          log_line("[recv] failed", &format!("{}: {error}", name.as_deref().unwrap_or("-")));
        }
      }
    }
  };
  tokio::join!(run, report);
  session.close().await;
}

/// Returns the new 10% step when `done` crosses one.
fn progress_step(done: u64, total: u64, last: &mut Option<u64>) -> Option<u64> {
  let step = if total == 0 { 100 } else { done.saturating_mul(10) / total * 10 };
  if *last == Some(step) {
    return None;
  }
  *last = Some(step);
  Some(step)
}

fn log_line(label: &str, value: &str) {
  let now = chrono::Utc::now().format("%H:%M:%S%.3f");
  println!("[{now}] {label}: {value}");
}
