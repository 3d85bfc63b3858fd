//! One command attempt, from radio check to acknowledgment
//!
//! A [`CommandSession`] owns the state machine and the transient
//! [`ConnectionSession`] for a single command. Central events and deadline
//! expiries are fed in one at a time by the executor. The first terminal
//! outcome clears the connection session, and with it every later input
//! becomes a no-op.

use super::timer::{DeadlinePhase, TimerGuard};
use super::CommandConfig;
use crate::transport::{
    Central, CentralEvent, CharacteristicHandle, InvalidPeripheralId, PeripheralHandle,
    RadioState, ServiceHandle,
};
use std::future::pending;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use unustasis_shared::state_machine::{
    is_valid_transition, CommandEvent, CommandState, CommandStateMachine, TransitionResult,
};
use unustasis_shared::{profile, requested_services, CommandKind, VehicleIdentity, WidgetState};

/// Why a command did not complete
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandFailure {
    #[error("no saved vehicle")]
    NoSavedVehicle,

    /// The saved id can never name a peripheral on this platform
    #[error("invalid scooter id format: {0}")]
    InvalidVehicleId(String),

    #[error("busy")]
    Busy,

    #[error("bluetooth off")]
    BluetoothOff,

    #[error("bluetooth unauthorized")]
    BluetoothUnauthorized,

    #[error("bluetooth unsupported")]
    BluetoothUnsupported,

    #[error("connection failed: {0}")]
    ConnectFailed(String),

    #[error("disconnected: {0}")]
    Disconnected(String),

    #[error("service discovery failed: {0}")]
    ServiceDiscovery(String),

    #[error("command service not found")]
    CommandServiceMissing,

    #[error("characteristic discovery failed: {0}")]
    CharacteristicDiscovery(String),

    #[error("command characteristic not found")]
    CommandCharacteristicMissing,

    #[error("write failed: {0}")]
    WriteFailed(String),

    #[error("connection timeout")]
    ConnectionTimeout,

    #[error("command timeout")]
    CommandTimeout,

    #[error("bluetooth error: {0}")]
    Transport(String),
}

impl CommandFailure {
    fn from_radio(state: RadioState) -> Option<Self> {
        match state {
            RadioState::PoweredOff => Some(CommandFailure::BluetoothOff),
            RadioState::Unauthorized => Some(CommandFailure::BluetoothUnauthorized),
            RadioState::Unsupported => Some(CommandFailure::BluetoothUnsupported),
            RadioState::PoweredOn | RadioState::Unknown => None,
        }
    }
}

/// Result of a command, reported exactly once
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    /// Acknowledged by the vehicle; `locked` is the new lock state, if any
    Completed {
        kind: CommandKind,
        locked: Option<bool>,
    },
    /// Accepted but not carried out
    Failed { reason: CommandFailure },
    /// Not attempted
    Rejected { reason: CommandFailure },
}

impl CommandOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CommandOutcome::Completed { .. })
    }

    #[cfg(test)]
    pub fn reason(&self) -> Option<&CommandFailure> {
        match self {
            CommandOutcome::Completed { .. } => None,
            CommandOutcome::Failed { reason } | CommandOutcome::Rejected { reason } => Some(reason),
        }
    }
}

/// Where the single outcome of a session is delivered
pub type CompletionSink = oneshot::Sender<CommandOutcome>;

/// Transient state of one connection attempt
#[derive(Debug, Default)]
pub struct ConnectionSession {
    pub peripheral: Option<PeripheralHandle>,
    /// A scan is running on behalf of this attempt
    pub scanning: bool,
    pub command_characteristic: Option<CharacteristicHandle>,
    /// Recorded for status reads, never required
    pub status_characteristic: Option<CharacteristicHandle>,
    pub timers: TimerGuard,
}

/// Input fed to a running session
#[derive(Debug)]
pub enum SessionInput {
    Central(CentralEvent),
    Deadline(DeadlinePhase),
    /// The backend dropped its event sender
    QueueClosed,
}

pub struct CommandSession<'a> {
    kind: CommandKind,
    identity: VehicleIdentity,
    central: &'a dyn Central,
    widget: &'a WidgetState,
    config: &'a CommandConfig,
    machine: CommandStateMachine,
    connection: Option<ConnectionSession>,
    sink: Option<CompletionSink>,
}

impl<'a> CommandSession<'a> {
    pub fn new(
        kind: CommandKind,
        identity: VehicleIdentity,
        central: &'a dyn Central,
        widget: &'a WidgetState,
        config: &'a CommandConfig,
        sink: CompletionSink,
    ) -> Self {
        Self {
            kind,
            identity,
            central,
            widget,
            config,
            machine: CommandStateMachine::new(),
            connection: None,
            sink: Some(sink),
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> CommandState {
        self.machine.state()
    }

    /// True once the outcome has been delivered
    pub fn is_finished(&self) -> bool {
        self.sink.is_none()
    }

    #[cfg(test)]
    pub fn connection(&self) -> Option<&ConnectionSession> {
        self.connection.as_ref()
    }

    /// Resolves when the armed deadline fires; pends forever after finish
    pub async fn deadline(&mut self) -> DeadlinePhase {
        match self.connection.as_mut() {
            Some(connection) => connection.timers.expired().await,
            None => pending().await,
        }
    }

    /// Mark the command in flight, arm the connection deadline and check the radio
    pub async fn start(&mut self) {
        if self.machine.state() != CommandState::Idle {
            return;
        }
        info!("[CMD] {} -> {}", self.kind, self.identity);

        self.widget.begin_scanning();
        let mut connection = ConnectionSession::default();
        connection.timers.arm_connection(self.config.connection_timeout);
        self.connection = Some(connection);
        self.advance(CommandEvent::Started);

        let radio = self.central.radio_state().await;
        self.on_radio_state(radio).await;
    }

    pub async fn handle(&mut self, input: SessionInput) {
        if self.connection.is_none() {
            debug!("[CMD] Ignoring {:?} in {}", input, self.machine.state());
            return;
        }
        match input {
            SessionInput::Central(event) => self.on_central_event(event).await,
            SessionInput::Deadline(phase) => self.on_deadline(phase).await,
            SessionInput::QueueClosed => {
                self.fail(CommandFailure::Transport("event queue closed".into()))
                    .await
            }
        }
    }

    async fn on_deadline(&mut self, phase: DeadlinePhase) {
        warn!("[CMD] {} deadline expired in {}", phase, self.machine.state());
        let reason = match phase {
            DeadlinePhase::Connection => CommandFailure::ConnectionTimeout,
            DeadlinePhase::Write => CommandFailure::CommandTimeout,
        };
        self.fail(reason).await;
    }

    async fn on_radio_state(&mut self, radio: RadioState) {
        if self.machine.state() != CommandState::Initializing {
            // Radio lost while the attempt is under way
            if let Some(reason) = CommandFailure::from_radio(radio) {
                self.fail(reason).await;
            }
            return;
        }
        match radio {
            RadioState::PoweredOn => {
                self.advance(CommandEvent::RadioReady);
                self.resolve().await;
            }
            RadioState::Unknown => debug!("[CMD] Waiting for radio state"),
            other => {
                if let Some(reason) = CommandFailure::from_radio(other) {
                    self.fail(reason).await;
                }
            }
        }
    }

    /// Direct retrieval first, scanning only as a fallback
    async fn resolve(&mut self) {
        match self.central.retrieve_peripheral(&self.identity.id).await {
            Ok(Some(peripheral)) => {
                info!("[CMD] Retrieved {} without scanning", peripheral.id);
                self.connect(peripheral).await;
            }
            Ok(None) => match self.central.start_scan(&[profile::COMMAND_SERVICE_UUID]).await {
                Ok(()) => {
                    if let Some(connection) = self.connection.as_mut() {
                        connection.scanning = true;
                    }
                    info!("[CMD] {} not cached, scanning", self.identity.id);
                }
                Err(e) => self.fail(CommandFailure::Transport(format!("{:#}", e))).await,
            },
            Err(e) if e.is::<InvalidPeripheralId>() => {
                let id = self.identity.id.clone();
                self.fail(CommandFailure::InvalidVehicleId(id)).await
            }
            Err(e) => self.fail(CommandFailure::Transport(format!("{:#}", e))).await,
        }
    }

    async fn connect(&mut self, peripheral: PeripheralHandle) {
        if let Some(connection) = self.connection.as_mut() {
            connection.peripheral = Some(peripheral.clone());
        }
        self.advance(CommandEvent::PeripheralResolved);
        info!(
            "[CMD] Connecting to {} ({})",
            peripheral.id,
            peripheral.name.as_deref().unwrap_or("unnamed")
        );
        if let Err(e) = self.central.connect(&peripheral).await {
            self.fail(CommandFailure::ConnectFailed(format!("{:#}", e)))
                .await;
        }
    }

    async fn on_central_event(&mut self, event: CentralEvent) {
        let state = self.machine.state();
        match event {
            CentralEvent::StateUpdated(radio) => self.on_radio_state(radio).await,

            CentralEvent::Discovered(peripheral) => {
                if state != CommandState::Resolving || !self.is_saved_vehicle(&peripheral) {
                    debug!("[CMD] Ignoring advertisement from {}", peripheral.id);
                    return;
                }
                info!("[CMD] Found {} by scanning", peripheral.id);
                self.stop_scanning().await;
                self.connect(peripheral).await;
            }

            CentralEvent::Connected(peripheral) => {
                if state != CommandState::Connecting || !self.is_target(&peripheral) {
                    debug!("[CMD] Ignoring connect of {} in {}", peripheral.id, state);
                    return;
                }
                info!("[CMD] Connected to {}", peripheral.id);
                self.advance(CommandEvent::Connected);
                if let Err(e) = self
                    .central
                    .discover_services(&peripheral, &requested_services())
                    .await
                {
                    self.fail(CommandFailure::Transport(format!("{:#}", e))).await;
                }
            }

            CentralEvent::ConnectFailed { peripheral, error } => {
                if self.is_target(&peripheral) {
                    self.fail(CommandFailure::ConnectFailed(error)).await;
                }
            }

            CentralEvent::Disconnected { peripheral, error } => {
                if !self.is_target(&peripheral) {
                    return;
                }
                match state {
                    CommandState::Connecting
                    | CommandState::DiscoveringServices
                    | CommandState::DiscoveringCharacteristics
                    | CommandState::Writing => {
                        let error = error.unwrap_or_else(|| "link lost".into());
                        self.fail(CommandFailure::Disconnected(error)).await;
                    }
                    // The write deadline still decides an unacknowledged write
                    _ => debug!("[CMD] {} disconnected in {}", peripheral.id, state),
                }
            }

            CentralEvent::ServicesDiscovered { peripheral, result } => {
                if state != CommandState::DiscoveringServices || !self.is_target(&peripheral) {
                    return;
                }
                match result {
                    Ok(services) => self.on_services(peripheral, services).await,
                    Err(e) => self.fail(CommandFailure::ServiceDiscovery(e)).await,
                }
            }

            CentralEvent::CharacteristicsDiscovered {
                peripheral,
                service,
                result,
            } => {
                if !self.is_target(&peripheral) {
                    return;
                }
                if service.uuid == profile::STATUS_SERVICE_UUID {
                    self.on_status_characteristics(result);
                    return;
                }
                if service.uuid != profile::COMMAND_SERVICE_UUID
                    || state != CommandState::DiscoveringCharacteristics
                {
                    debug!("[CMD] Ignoring characteristics of {} in {}", service.uuid, state);
                    return;
                }
                let characteristics = match result {
                    Ok(characteristics) => characteristics,
                    Err(e) => {
                        return self.fail(CommandFailure::CharacteristicDiscovery(e)).await;
                    }
                };
                let Some(command) = characteristics
                    .into_iter()
                    .find(|c| c.uuid == profile::COMMAND_CHARACTERISTIC_UUID)
                else {
                    return self.fail(CommandFailure::CommandCharacteristicMissing).await;
                };
                if let Some(connection) = self.connection.as_mut() {
                    connection.command_characteristic = Some(command);
                }
                self.send_command(peripheral, command).await;
            }

            CentralEvent::ValueWritten {
                peripheral,
                characteristic,
                result,
            } => {
                let expected = self
                    .connection
                    .as_ref()
                    .and_then(|c| c.command_characteristic);
                if state != CommandState::AwaitingAck
                    || !self.is_target(&peripheral)
                    || expected != Some(characteristic)
                {
                    debug!("[CMD] Ignoring write result in {}", state);
                    return;
                }
                if let Some(connection) = self.connection.as_mut() {
                    connection.timers.cancel_write();
                }
                match result {
                    Ok(()) => {
                        self.advance(CommandEvent::AckReceived);
                        let outcome = CommandOutcome::Completed {
                            kind: self.kind,
                            locked: self.kind.resulting_lock_state(),
                        };
                        self.finish(outcome).await;
                    }
                    Err(e) => self.fail(CommandFailure::WriteFailed(e)).await,
                }
            }
        }
    }

    async fn on_services(&mut self, peripheral: PeripheralHandle, services: Vec<ServiceHandle>) {
        let Some(command_service) = services
            .iter()
            .find(|s| s.uuid == profile::COMMAND_SERVICE_UUID)
            .copied()
        else {
            return self.fail(CommandFailure::CommandServiceMissing).await;
        };
        self.advance(CommandEvent::ServicesDiscovered);

        if let Err(e) = self
            .central
            .discover_characteristics(
                &peripheral,
                &command_service,
                &[profile::COMMAND_CHARACTERISTIC_UUID],
            )
            .await
        {
            return self.fail(CommandFailure::Transport(format!("{:#}", e))).await;
        }

        match services.iter().find(|s| s.uuid == profile::STATUS_SERVICE_UUID) {
            Some(status) => {
                if let Err(e) = self
                    .central
                    .discover_characteristics(
                        &peripheral,
                        status,
                        &[profile::HANDLEBAR_CHARACTERISTIC_UUID],
                    )
                    .await
                {
                    warn!("[CMD] Status discovery not started: {:#}", e);
                }
            }
            None => debug!("[CMD] Status service not offered"),
        }
    }

    fn on_status_characteristics(&mut self, result: Result<Vec<CharacteristicHandle>, String>) {
        match result {
            Ok(characteristics) => {
                let status = characteristics
                    .into_iter()
                    .find(|c| c.uuid == profile::HANDLEBAR_CHARACTERISTIC_UUID);
                if status.is_none() {
                    debug!("[CMD] Handlebar characteristic not offered");
                }
                if let Some(connection) = self.connection.as_mut() {
                    connection.status_characteristic = status;
                }
            }
            Err(e) => warn!("[CMD] Status characteristic discovery failed: {}", e),
        }
    }

    /// Write the payload, or complete right away for commands without one
    async fn send_command(
        &mut self,
        peripheral: PeripheralHandle,
        characteristic: CharacteristicHandle,
    ) {
        let Some(payload) = self.kind.payload() else {
            info!("[CMD] {} reached the command characteristic", self.kind);
            self.advance(CommandEvent::PingSucceeded);
            let outcome = CommandOutcome::Completed {
                kind: self.kind,
                locked: None,
            };
            return self.finish(outcome).await;
        };

        if let Some(connection) = self.connection.as_mut() {
            connection.timers.cancel_connection();
        }
        self.advance(CommandEvent::CommandCharacteristicReady);

        if let Err(e) = self
            .central
            .write_value(&peripheral, &characteristic, payload)
            .await
        {
            return self.fail(CommandFailure::WriteFailed(format!("{:#}", e))).await;
        }
        if let Some(connection) = self.connection.as_mut() {
            connection.timers.arm_write(self.config.write_timeout);
        }
        self.advance(CommandEvent::WriteSubmitted);
        debug!("[CMD] Wrote {} bytes, awaiting ack", payload.len());
    }

    async fn stop_scanning(&mut self) {
        let scanning = self
            .connection
            .as_mut()
            .map(|c| std::mem::take(&mut c.scanning))
            .unwrap_or(false);
        if scanning {
            self.central.stop_scan().await;
        }
    }

    async fn fail(&mut self, reason: CommandFailure) {
        if self.connection.is_none() {
            return;
        }
        self.advance(CommandEvent::Failed);
        self.finish(CommandOutcome::Failed { reason }).await;
    }

    /// Single cleanup path. Taking the connection session first makes every
    /// later call a no-op.
    async fn finish(&mut self, outcome: CommandOutcome) {
        let Some(mut connection) = self.connection.take() else {
            return;
        };
        connection.timers.cancel_all();
        if connection.scanning {
            self.central.stop_scan().await;
        }
        if let Some(peripheral) = &connection.peripheral {
            self.central.cancel_connection(peripheral).await;
        }

        let locked = match &outcome {
            CommandOutcome::Completed { locked, .. } => *locked,
            _ => None,
        };
        self.widget.end_scanning(locked);

        match &outcome {
            CommandOutcome::Completed { .. } => info!("[CMD] {} completed", self.kind),
            CommandOutcome::Failed { reason } | CommandOutcome::Rejected { reason } => {
                warn!("[CMD] {} failed: {}", self.kind, reason)
            }
        }
        if let Some(sink) = self.sink.take() {
            if sink.send(outcome).is_err() {
                debug!("[CMD] Outcome receiver dropped");
            }
        }
    }

    fn advance(&mut self, event: CommandEvent) {
        let from = self.machine.state();
        match self.machine.process_event(event) {
            TransitionResult::Success(to) => {
                debug_assert!(is_valid_transition(from, to));
                debug!("[CMD] {} -> {}", from, to)
            }
            TransitionResult::Invalid { from, event } => {
                warn!("[CMD] Invalid transition {:?} from {}", event, from)
            }
        }
    }

    fn is_saved_vehicle(&self, peripheral: &PeripheralHandle) -> bool {
        peripheral.id.eq_ignore_ascii_case(&self.identity.id)
    }

    fn is_target(&self, peripheral: &PeripheralHandle) -> bool {
        self.connection
            .as_ref()
            .and_then(|c| c.peripheral.as_ref())
            .map_or(false, |target| target.id == peripheral.id)
    }
}
