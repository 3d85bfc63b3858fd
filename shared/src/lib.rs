//! unustasis shared types
//!
//! This crate provides the command vocabulary, wireless profile identifiers,
//! shared widget state store and wear-link codec used by the widget agent and
//! the relay node.

pub mod codec;
pub mod state_machine;
pub mod store;
pub mod uri;

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use uuid::Uuid;

pub use store::{JsonFileStore, MemoryStore, SharedStateStore, StoreError, StoreValue, WidgetState};
pub use uri::{UriError, WidgetAction};

/// Get current timestamp in milliseconds since Unix epoch
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// GATT profile advertised by the scooter
pub mod profile {
    use uuid::Uuid;

    /// Service carrying the command characteristic
    pub const COMMAND_SERVICE_UUID: Uuid = Uuid::from_u128(0x9a590000_6e67_5d0d_aab9_ad9126b66f91);

    /// Characteristic that accepts command tokens (write with response)
    pub const COMMAND_CHARACTERISTIC_UUID: Uuid =
        Uuid::from_u128(0x9a590001_6e67_5d0d_aab9_ad9126b66f91);

    /// Service carrying the vehicle state characteristics
    pub const STATUS_SERVICE_UUID: Uuid = Uuid::from_u128(0x9a590020_6e67_5d0d_aab9_ad9126b66f91);

    /// Handlebar lock status characteristic
    pub const HANDLEBAR_CHARACTERISTIC_UUID: Uuid =
        Uuid::from_u128(0x9a590023_6e67_5d0d_aab9_ad9126b66f91);
}

/// Timing parameters for command delivery
pub mod timing {
    /// Deadline from command start until the command characteristic is found
    pub const CONNECTION_TIMEOUT_MS: u64 = 15_000;

    /// Deadline for the write acknowledgment once the command is written
    pub const WRITE_TIMEOUT_MS: u64 = 5_000;

    /// Delay before re-checking the background host's pipe listener
    pub const SERVICE_START_DELAY_MS: u64 = 600;
}

/// Identity of the paired scooter, written by the pairing flow
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VehicleIdentity {
    /// Platform device identifier (a BlueZ address on Linux)
    pub id: String,
    /// Human-readable name, if the pairing flow stored one
    pub name: Option<String>,
}

impl fmt::Display for VehicleIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} ({})", name, self.id),
            None => write!(f, "{}", self.id),
        }
    }
}

/// Discrete commands a surface can issue to the vehicle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Lock,
    Unlock,
    OpenSeat,
    Ping,
}

impl CommandKind {
    /// Token used in URIs and relay messages
    pub fn token(self) -> &'static str {
        match self {
            CommandKind::Lock => "lock",
            CommandKind::Unlock => "unlock",
            CommandKind::OpenSeat => "openseat",
            CommandKind::Ping => "ping",
        }
    }

    /// ASCII payload written to the command characteristic.
    ///
    /// `None` means the command never writes (ping only checks reachability).
    pub fn payload(self) -> Option<&'static [u8]> {
        match self {
            CommandKind::Lock => Some(b"scooter:state lock"),
            CommandKind::Unlock => Some(b"scooter:state unlock"),
            CommandKind::OpenSeat => Some(b"scooter:seatbox open"),
            CommandKind::Ping => None,
        }
    }

    /// Lock flag the vehicle is in after this command succeeds
    pub fn resulting_lock_state(self) -> Option<bool> {
        match self {
            CommandKind::Lock => Some(true),
            CommandKind::Unlock => Some(false),
            CommandKind::OpenSeat | CommandKind::Ping => None,
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// Error for tokens outside the command vocabulary
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown command token: {0}")]
pub struct UnknownCommand(pub String);

impl FromStr for CommandKind {
    type Err = UnknownCommand;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lock" => Ok(CommandKind::Lock),
            "unlock" => Ok(CommandKind::Unlock),
            "openseat" => Ok(CommandKind::OpenSeat),
            "ping" => Ok(CommandKind::Ping),
            other => Err(UnknownCommand(other.to_string())),
        }
    }
}

/// Services the command machine asks the peripheral for
pub fn requested_services() -> [Uuid; 2] {
    [profile::COMMAND_SERVICE_UUID, profile::STATUS_SERVICE_UUID]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_encoding() {
        assert_eq!(CommandKind::Lock.payload(), Some(&b"scooter:state lock"[..]));
        assert_eq!(CommandKind::Unlock.payload(), Some(&b"scooter:state unlock"[..]));
        assert!(CommandKind::Ping.payload().is_none());
    }

    #[test]
    fn test_resulting_lock_state() {
        assert_eq!(CommandKind::Lock.resulting_lock_state(), Some(true));
        assert_eq!(CommandKind::Unlock.resulting_lock_state(), Some(false));
        assert_eq!(CommandKind::OpenSeat.resulting_lock_state(), None);
    }

    #[test]
    fn test_token_parsing() {
        assert_eq!("openseat".parse::<CommandKind>(), Ok(CommandKind::OpenSeat));
        assert!("foo".parse::<CommandKind>().is_err());
        // Tokens are case sensitive
        assert!("LOCK".parse::<CommandKind>().is_err());
    }

    #[test]
    fn test_profile_uuids() {
        assert_eq!(
            profile::COMMAND_SERVICE_UUID.to_string(),
            "9a590000-6e67-5d0d-aab9-ad9126b66f91"
        );
        assert_eq!(
            profile::HANDLEBAR_CHARACTERISTIC_UUID.to_string(),
            "9a590023-6e67-5d0d-aab9-ad9126b66f91"
        );
    }
}
