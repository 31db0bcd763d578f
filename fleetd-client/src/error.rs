use std::time::Duration;

use crate::registry::RegistryError;

/// Errors surfaced by the transport, task client and watch stream.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("invalid daemon address: {0}")]
    InvalidAddress(String),
    #[error("failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("no response from daemon")]
    NoResponse,
    #[error("failed to decode {context}: {source}")]
    Decode {
        context: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid {field} timestamp: {source}")]
    Timestamp {
        field: &'static str,
        #[source]
        source: chrono::ParseError,
    },
    #[error("line exceeds {limit} bytes")]
    LineTooLong { limit: usize },
    /// Application level failure (`success: false`).
    #[error("{message}")]
    Daemon { message: String },
    #[error("daemon returned no {0}")]
    MissingPayload(&'static str),
    #[error("invalid request: {0}")]
    InvalidRequest(&'static str),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("cancelled")]
    Cancelled,
    #[error("unknown daemon '{0}'")]
    UnknownDaemon(String),
    #[error("daemon '{0}' is disabled")]
    DaemonDisabled(String),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl ClientError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ClientError::Cancelled)
    }

    /// Build an application error, substituting `fallback` for a blank message.
    pub(crate) fn daemon(message: &str, fallback: &str) -> Self {
        let message = message.trim();
        let message = if message.is_empty() { fallback } else { message };
        ClientError::Daemon {
            message: message.to_string(),
        }
    }
}

pub type Result<T, E = ClientError> = std::result::Result<T, E>;
