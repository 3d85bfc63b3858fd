//! Relay node
//!
//! Receives command frames from the paired wearable and forwards them into
//! the host application.

mod channels;
mod config;
mod dispatcher;
mod message;
mod readiness;

use anyhow::{anyhow, Context, Result};
use bluer::rfcomm::{Listener as RfcommListener, SocketAddr as RfcommAddr};
use bluer::Address;
use channels::{ProgramChannel, UnixSocketPipe};
use clap::{Parser, Subcommand};
use config::{RelayConfig, WearLinkConfig};
use dispatcher::RelayDispatcher;
use readiness::HostReadiness;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use unustasis_shared::codec::FrameDecoder;

#[derive(Parser)]
#[command(name = "relay-node")]
#[command(about = "Relay wearable commands to the unustasis host application")]
struct Cli {
    /// JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Listen on the configured wear link
    Listen,
    /// Dispatch a single payload, e.g. `unustasis://lock`
    Send { payload: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => RelayConfig::load(path)?,
        None => RelayConfig::default(),
    };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::from_str(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let dispatcher = Arc::new(build_dispatcher(&config));

    match cli.command {
        Commands::Send { payload } => {
            if let Some(deferred) = dispatcher.dispatch_payload(payload.as_bytes()).await {
                deferred.await.context("deferred service pipe attempt")?;
            }
            Ok(())
        }
        Commands::Listen => listen(&config.wear_link, dispatcher).await,
    }
}

fn build_dispatcher(config: &RelayConfig) -> RelayDispatcher {
    let pipe = Arc::new(UnixSocketPipe::new(&config.pipe_socket));
    let host = Arc::new(ProgramChannel::new(config.host_start.clone()));
    RelayDispatcher::new(
        HostReadiness::new(pipe.clone(), host),
        pipe,
        Arc::new(ProgramChannel::new(config.broadcast.clone())),
        Arc::new(ProgramChannel::new(config.deep_link.clone())),
        config.readiness_delay(),
    )
}

async fn listen(link: &WearLinkConfig, dispatcher: Arc<RelayDispatcher>) -> Result<()> {
    match link {
        WearLinkConfig::Rfcomm { channel } => {
            let listener = RfcommListener::bind(RfcommAddr::new(Address::any(), *channel))
                .await
                .map_err(|e| anyhow!("RFCOMM bind on channel {} failed: {}", channel, e))?;
            info!("[RELAY] Listening on RFCOMM channel {}", channel);
            loop {
                let (stream, peer) = listener
                    .accept()
                    .await
                    .map_err(|e| anyhow!("RFCOMM accept failed: {}", e))?;
                let peer = peer.addr.to_string();
                tokio::spawn(serve(stream, peer, dispatcher.clone()));
            }
        }
        WearLinkConfig::Tcp { address } => {
            let listener = TcpListener::bind(address)
                .await
                .with_context(|| format!("binding {}", address))?;
            info!("[RELAY] Listening on {} (simulation)", address);
            loop {
                let (stream, peer) = listener.accept().await?;
                tokio::spawn(serve(stream, peer.to_string(), dispatcher.clone()));
            }
        }
    }
}

/// Read frames from one wear link connection until it closes
async fn serve<S>(mut stream: S, peer: String, dispatcher: Arc<RelayDispatcher>)
where
    S: AsyncRead + Unpin + Send,
{
    info!("[RELAY] Wearable connected: {}", peer);
    let mut decoder = FrameDecoder::new();
    let mut read_buf = vec![0u8; 4096];

    loop {
        match stream.read(&mut read_buf).await {
            Ok(0) => break,
            Ok(n) => {
                decoder.extend(&read_buf[..n]);
                loop {
                    match decoder.decode_next() {
                        Ok(Some(frame)) => {
                            // Deferred pipe attempts run detached
                            let _ = dispatcher.dispatch_frame(&frame).await;
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!("[RELAY] Bad frame from {}: {}", peer, e);
                            return;
                        }
                    }
                }
                debug!("[RELAY] {} bytes buffered", decoder.buffer_len());
            }
            Err(e) => {
                error!("[RELAY] Read error from {}: {}", peer, e);
                break;
            }
        }
    }
    info!("[RELAY] Wearable disconnected: {}", peer);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::fake::{FakePipe, FakeProgram, Journal};
    use tokio::io::AsyncWriteExt;
    use tokio::time::Duration;
    use unustasis_shared::codec::{encode, WearFrame};

    #[tokio::test]
    async fn test_serve_dispatches_split_frames() {
        let journal = Journal::default();
        let pipe = Arc::new(FakePipe::new(true, journal.clone()));
        let program = Arc::new(FakeProgram::new("broadcast", false, journal.clone()));
        let dispatcher = Arc::new(RelayDispatcher::new(
            HostReadiness::new(pipe.clone(), program.clone()),
            pipe,
            program.clone(),
            program,
            Duration::from_millis(600),
        ));

        let mut wire = encode(&WearFrame::new("/unustasis/command", &b"unlock"[..]))
            .unwrap()
            .to_vec();
        wire.extend_from_slice(&encode(&WearFrame::new("/other", &b"lock"[..])).unwrap());

        let (mut client, server) = tokio::io::duplex(64);
        let task = tokio::spawn(serve(server, "test".into(), dispatcher));
        let (first, rest) = wire.split_at(5);
        client.write_all(first).await.unwrap();
        client.write_all(rest).await.unwrap();
        drop(client);
        task.await.unwrap();

        assert_eq!(
            *journal.lock().unwrap(),
            vec![
                "pipe:unlock".to_string(),
                "broadcast:unustasis://unlock".to_string()
            ]
        );
    }
}
