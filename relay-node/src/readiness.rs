//! Host readiness: is the background host listening, and if not, ask it to start

use crate::channels::{HostService, ServicePipe};
use std::sync::Arc;
use tracing::{error, info};

/// Makes sure the background host owning the service pipe is asked to run
#[derive(Clone)]
pub struct HostReadiness {
    pipe: Arc<dyn ServicePipe>,
    host: Arc<dyn HostService>,
}

impl HostReadiness {
    pub fn new(pipe: Arc<dyn ServicePipe>, host: Arc<dyn HostService>) -> Self {
        Self { pipe, host }
    }

    pub async fn is_ready(&self) -> bool {
        self.pipe.has_listener().await
    }

    /// Request a host start if no listener is attached and report whether
    /// one was. Does not wait for the host to come up; a failed request is
    /// only logged.
    pub async fn ensure_running(&self) -> bool {
        if self.is_ready().await {
            return true;
        }
        match self.host.request_start() {
            Ok(()) => info!("[RELAY] Requested background host start"),
            Err(e) => error!("[RELAY] Failed to start background host: {}", e),
        }
        false
    }
}
