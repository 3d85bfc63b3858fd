//! Command executor - runs one vehicle command at a time

use super::session::{CommandFailure, CommandOutcome, CommandSession, SessionInput};
use crate::transport::{Central, CentralEventReceiver};
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use tokio::time::Duration;
use tracing::{debug, warn};
use unustasis_shared::{timing, CommandKind, WidgetState};

/// Phase deadlines for a command attempt
#[derive(Debug, Clone)]
pub struct CommandConfig {
    /// From acceptance until the command characteristic is found
    pub connection_timeout: Duration,
    /// From write submission until the acknowledgment
    pub write_timeout: Duration,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_millis(timing::CONNECTION_TIMEOUT_MS),
            write_timeout: Duration::from_millis(timing::WRITE_TIMEOUT_MS),
        }
    }
}

/// Sends lock, unlock, seat and ping commands to the saved vehicle.
///
/// The event queue lives behind an async mutex that doubles as the
/// single-flight guard: a command submitted while another holds it is
/// rejected as busy instead of queued.
pub struct VehicleCommander {
    central: Arc<dyn Central>,
    events: Mutex<CentralEventReceiver>,
    widget: WidgetState,
    config: CommandConfig,
}

impl VehicleCommander {
    pub fn new(
        central: Arc<dyn Central>,
        events: CentralEventReceiver,
        widget: WidgetState,
        config: CommandConfig,
    ) -> Self {
        Self {
            central,
            events: Mutex::new(events),
            widget,
            config,
        }
    }

    #[cfg(test)]
    pub fn widget(&self) -> &WidgetState {
        &self.widget
    }

    /// Run `kind` against the saved vehicle and wait for its single outcome
    pub async fn execute_command(&self, kind: CommandKind) -> CommandOutcome {
        let Ok(mut events) = self.events.try_lock() else {
            warn!("[CMD] Rejecting {}: another command is in flight", kind);
            return CommandOutcome::Rejected {
                reason: CommandFailure::Busy,
            };
        };

        let Some(identity) = self.widget.vehicle_identity() else {
            warn!("[CMD] Rejecting {}: no saved vehicle", kind);
            return CommandOutcome::Failed {
                reason: CommandFailure::NoSavedVehicle,
            };
        };

        // Results for a previous attempt must not reach this one
        let mut stale = 0;
        while events.try_recv().is_ok() {
            stale += 1;
        }
        if stale > 0 {
            debug!("[CMD] Dropped {} stale events", stale);
        }

        let (sink, outcome) = oneshot::channel();
        let mut session = CommandSession::new(
            kind,
            identity,
            &*self.central,
            &self.widget,
            &self.config,
            sink,
        );

        session.start().await;
        while !session.is_finished() {
            let input = tokio::select! {
                event = events.recv() => match event {
                    Some(event) => SessionInput::Central(event),
                    None => SessionInput::QueueClosed,
                },
                phase = session.deadline() => SessionInput::Deadline(phase),
            };
            session.handle(input).await;
        }
        drop(session);

        outcome.await.unwrap_or(CommandOutcome::Failed {
            reason: CommandFailure::Transport("command abandoned".into()),
        })
    }
}
