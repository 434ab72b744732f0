//! Receiver errors

use conduit_protocol::ProtocolError;
use thiserror::Error;

/// Result alias for receiver operations
pub type Result<T> = std::result::Result<T, SourceError>;

#[derive(Debug, Error)]
pub enum SourceError {
    /// Could not bind the listening socket
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("receiver '{0}' is already running")]
    AlreadyRunning(String),

    /// Stream framing could not be recovered
    #[error("framing error: {0}")]
    Frame(#[from] ProtocolError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SourceError {
    pub fn bind(address: impl Into<String>, source: std::io::Error) -> Self {
        Self::Bind {
            address: address.into(),
            source,
        }
    }
}
