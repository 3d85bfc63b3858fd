//! Relay dispatcher - forwards wearable commands into the host application
//!
//! Channels are tried independently. The service pipe runs first, now or
//! after one deferred re-check. The background broadcast always runs. The
//! deep link only runs when the broadcast reported a delivery error.

use crate::channels::{BackgroundBroadcast, DeepLinkLauncher, ServicePipe};
use crate::message::{RelayMessage, COMMAND_PATH};
use crate::readiness::HostReadiness;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, warn};
use unustasis_shared::codec::WearFrame;
use unustasis_shared::uri::command_uri;
use unustasis_shared::{now_ms, CommandKind};

pub struct RelayDispatcher {
    readiness: HostReadiness,
    pipe: Arc<dyn ServicePipe>,
    broadcast: Arc<dyn BackgroundBroadcast>,
    deep_link: Arc<dyn DeepLinkLauncher>,
    readiness_delay: Duration,
}

impl RelayDispatcher {
    pub fn new(
        readiness: HostReadiness,
        pipe: Arc<dyn ServicePipe>,
        broadcast: Arc<dyn BackgroundBroadcast>,
        deep_link: Arc<dyn DeepLinkLauncher>,
        readiness_delay: Duration,
    ) -> Self {
        Self {
            readiness,
            pipe,
            broadcast,
            deep_link,
            readiness_delay,
        }
    }

    /// Dispatch a frame from the wear link; other paths are ignored
    pub async fn dispatch_frame(&self, frame: &WearFrame) -> Option<JoinHandle<()>> {
        debug!(
            "[RELAY] Frame path={} size={}",
            frame.path,
            frame.data.len()
        );
        if frame.path != COMMAND_PATH {
            debug!("[RELAY] Ignoring frame for {}", frame.path);
            return None;
        }
        self.dispatch_payload(&frame.data).await
    }

    pub async fn dispatch_payload(&self, payload: &[u8]) -> Option<JoinHandle<()>> {
        match RelayMessage::from_bytes(payload) {
            Ok(message) => self.dispatch(&message).await,
            Err(e) => {
                warn!("[RELAY] Dropping payload: {}", e);
                None
            }
        }
    }

    /// Fire and forget. Returns the deferred service pipe attempt, if one
    /// was scheduled.
    pub async fn dispatch(&self, message: &RelayMessage) -> Option<JoinHandle<()>> {
        if message.command == CommandKind::Ping {
            info!("[RELAY] Ping from wearable");
            return None;
        }
        let command = message.command;
        info!("[RELAY] Dispatching {}", command);

        let ready = self.readiness.ensure_running().await;
        let deferred = self.send_through_pipe(message, ready).await;

        let uri = command_uri(command.token());
        match self.broadcast.broadcast(&uri).await {
            Ok(()) => info!("[RELAY] Broadcast {}", uri),
            Err(e) => {
                error!("[RELAY] Broadcast of {} failed: {}", command, e);
                match self.deep_link.open(&uri).await {
                    Ok(()) => info!("[RELAY] Opened deep link {}", uri),
                    Err(e) => error!("[RELAY] Deep link for {} failed: {}", command, e),
                }
            }
        }

        deferred
    }

    /// `ready` is the listener check already made by the readiness check
    async fn send_through_pipe(
        &self,
        message: &RelayMessage,
        ready: bool,
    ) -> Option<JoinHandle<()>> {
        if ready {
            deliver(self.pipe.as_ref(), message).await;
            return None;
        }

        debug!(
            "[RELAY] Service pipe not ready, re-checking in {:?}",
            self.readiness_delay
        );
        let pipe = self.pipe.clone();
        let message = message.clone();
        let delay = self.readiness_delay;
        Some(tokio::spawn(async move {
            sleep(delay).await;
            if pipe.has_listener().await {
                deliver(pipe.as_ref(), &message).await;
            } else {
                warn!(
                    "[RELAY] Service pipe still not ready for {}",
                    message.command
                );
            }
        }))
    }
}

async fn deliver(pipe: &dyn ServicePipe, message: &RelayMessage) {
    match pipe.invoke(&message.to_pipe_message(now_ms())).await {
        Ok(()) => info!("[RELAY] Sent {} through service pipe", message.command),
        Err(e) => error!(
            "[RELAY] Service pipe delivery of {} failed: {}",
            message.command, e
        ),
    }
}
