//! Error types for Burrow.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed request payload, e.g. a missing HTTP method. Raised
    /// before any origin call is attempted.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Failure while talking to the local origin server. Internal to the
    /// forwarder; it reaches the peer only as a synthetic 500 payload.
    #[error("Origin error: {0}")]
    Origin(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
