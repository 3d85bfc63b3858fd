//! Widget URI scheme
//!
//! Widgets and the relay address the host application through
//! `unustasis://<action>` URIs.

use crate::CommandKind;
use thiserror::Error;
use url::Url;

/// URI scheme shared by widgets, deep links and background intents
pub const URI_SCHEME: &str = "unustasis";

/// Errors that can occur while parsing a widget URI
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UriError {
    #[error("Invalid URI: {0}")]
    Invalid(String),

    #[error("Unexpected URI scheme: {0}")]
    WrongScheme(String),

    #[error("URI has no action host")]
    MissingHost,

    #[error("Unknown URI action: {0}")]
    UnknownAction(String),
}

/// Action named by a widget URI
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WidgetAction {
    /// A vehicle command
    Command(CommandKind),
    /// Refresh request, handled by the host application
    Scan,
}

impl WidgetAction {
    /// Parse `unustasis://<action>`
    pub fn parse_uri(input: &str) -> Result<Self, UriError> {
        let url = Url::parse(input).map_err(|e| UriError::Invalid(e.to_string()))?;

        if url.scheme() != URI_SCHEME {
            return Err(UriError::WrongScheme(url.scheme().to_string()));
        }

        let host = url.host_str().ok_or(UriError::MissingHost)?.to_lowercase();
        Self::from_token(&host)
    }

    /// Map a bare action token
    pub fn from_token(token: &str) -> Result<Self, UriError> {
        if token == "scan" {
            return Ok(WidgetAction::Scan);
        }
        token
            .parse::<CommandKind>()
            .map(WidgetAction::Command)
            .map_err(|_| UriError::UnknownAction(token.to_string()))
    }

    /// Token for this action
    pub fn token(self) -> &'static str {
        match self {
            WidgetAction::Command(kind) => kind.token(),
            WidgetAction::Scan => "scan",
        }
    }

    /// Render as `unustasis://<action>`
    pub fn to_uri(self) -> String {
        command_uri(self.token())
    }
}

/// Build the widget URI for a token
pub fn command_uri(token: &str) -> String {
    format!("{}://{}", URI_SCHEME, token)
}
