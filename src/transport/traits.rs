//! Central role abstraction for pluggable wireless backends
//!
//! Requests return as soon as they are submitted; their results arrive later
//! as [`CentralEvent`]s on the queue handed to the backend at construction.

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Sending half of the central event queue
pub type CentralEventSender = mpsc::UnboundedSender<CentralEvent>;

/// Receiving half of the central event queue
pub type CentralEventReceiver = mpsc::UnboundedReceiver<CentralEvent>;

/// Create the serialized queue a backend delivers its events on
pub fn event_queue() -> (CentralEventSender, CentralEventReceiver) {
    mpsc::unbounded_channel()
}

/// Availability of the local radio
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioState {
    PoweredOn,
    PoweredOff,
    Unauthorized,
    Unsupported,
    /// Not known yet, a `StateUpdated` event will follow
    Unknown,
}

/// A remote device known to the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeripheralHandle {
    /// Platform identifier, compared against the persisted vehicle id
    pub id: String,
    pub name: Option<String>,
}

/// An id that can never name a peripheral on this backend
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid peripheral id: {0}")]
pub struct InvalidPeripheralId(pub String);

/// A discovered GATT service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceHandle {
    pub uuid: Uuid,
    pub id: u16,
}

/// A discovered GATT characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharacteristicHandle {
    pub service: ServiceHandle,
    pub uuid: Uuid,
    pub id: u16,
}

/// Events delivered by the central backend
#[derive(Debug, Clone, PartialEq)]
pub enum CentralEvent {
    StateUpdated(RadioState),
    Discovered(PeripheralHandle),
    Connected(PeripheralHandle),
    ConnectFailed {
        peripheral: PeripheralHandle,
        error: String,
    },
    Disconnected {
        peripheral: PeripheralHandle,
        error: Option<String>,
    },
    ServicesDiscovered {
        peripheral: PeripheralHandle,
        result: Result<Vec<ServiceHandle>, String>,
    },
    CharacteristicsDiscovered {
        peripheral: PeripheralHandle,
        service: ServiceHandle,
        result: Result<Vec<CharacteristicHandle>, String>,
    },
    ValueWritten {
        peripheral: PeripheralHandle,
        characteristic: CharacteristicHandle,
        result: Result<(), String>,
    },
}

/// Capabilities of the wireless central role used by the command machine
#[async_trait]
pub trait Central: Send + Sync {
    /// Current radio state
    async fn radio_state(&self) -> RadioState;

    /// Look up a peripheral the platform already knows, without scanning.
    /// Fails with [`InvalidPeripheralId`] for ids the backend cannot parse.
    async fn retrieve_peripheral(&self, id: &str) -> Result<Option<PeripheralHandle>>;

    /// Start scanning for peripherals advertising any of `services`
    async fn start_scan(&self, services: &[Uuid]) -> Result<()>;

    async fn stop_scan(&self);

    /// Request a connection; answered by `Connected` or `ConnectFailed`
    async fn connect(&self, peripheral: &PeripheralHandle) -> Result<()>;

    /// Cancel a pending or established connection
    async fn cancel_connection(&self, peripheral: &PeripheralHandle);

    /// Answered by `ServicesDiscovered`
    async fn discover_services(&self, peripheral: &PeripheralHandle, services: &[Uuid])
        -> Result<()>;

    /// Answered by `CharacteristicsDiscovered`
    async fn discover_characteristics(
        &self,
        peripheral: &PeripheralHandle,
        service: &ServiceHandle,
        characteristics: &[Uuid],
    ) -> Result<()>;

    /// Write with response; answered by `ValueWritten`
    async fn write_value(
        &self,
        peripheral: &PeripheralHandle,
        characteristic: &CharacteristicHandle,
        value: &[u8],
    ) -> Result<()>;
}
