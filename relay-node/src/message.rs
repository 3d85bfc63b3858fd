//! Inbound wear payloads and the outbound service pipe message

use serde::{Deserialize, Serialize};
use std::str;
use thiserror::Error;
use unustasis_shared::CommandKind;
use url::Url;

/// Wear frame path that carries commands
pub const COMMAND_PATH: &str = "/unustasis/command";

/// Source tag on every pipe message
pub const WEAR_SOURCE: &str = "wear";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayParseError {
    #[error("Empty command payload")]
    Empty,

    #[error("Command payload is not UTF-8")]
    NotUtf8,

    #[error("Unknown command: {0}")]
    UnknownCommand(String),
}

/// A command received from the wearable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayMessage {
    pub command: CommandKind,
    /// The payload, when it parsed as a URI
    pub uri: Option<String>,
}

impl RelayMessage {
    pub fn from_bytes(payload: &[u8]) -> Result<Self, RelayParseError> {
        let payload = str::from_utf8(payload).map_err(|_| RelayParseError::NotUtf8)?;
        Self::parse(payload)
    }

    /// Command from a URI host (lowercased) or else the trailing path token
    pub fn parse(payload: &str) -> Result<Self, RelayParseError> {
        let payload = payload.trim();
        if payload.is_empty() {
            return Err(RelayParseError::Empty);
        }

        let uri = Url::parse(payload).ok();
        let token = match uri.as_ref().and_then(|u| u.host_str()) {
            Some(host) => host.to_lowercase(),
            None => payload.rsplit('/').next().unwrap_or(payload).to_string(),
        };

        let command = token
            .parse::<CommandKind>()
            .map_err(|_| RelayParseError::UnknownCommand(token.clone()))?;
        Ok(Self {
            command,
            uri: uri.map(|_| payload.to_string()),
        })
    }

    pub fn to_pipe_message(&self, timestamp: u64) -> PipeMessage {
        PipeMessage {
            id: self.command.token().to_string(),
            content: PipeContent {
                source: WEAR_SOURCE.to_string(),
                timestamp,
                uri: self.uri.clone(),
            },
        }
    }
}

/// Message handed to the in-process command listener
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipeMessage {
    pub id: String,
    pub content: PipeContent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipeContent {
    pub source: String,
    /// Milliseconds since the Unix epoch
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
}
