//! Error types for mtrelay

use thiserror::Error;

/// Main error type for mtrelay
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid secret: {0}")]
    Secret(String),

    #[error("Framing error: {0}")]
    Framing(String),

    #[error("Handshake error: {0}")]
    Handshake(String),

    #[error("No reachable endpoint for DC {0}")]
    UpstreamUnreachable(i16),

    #[error("Time skew of {0}s exceeds tolerance")]
    TimeSkew(u64),

    #[error("Timeout")]
    Timeout,

    #[error("Cancelled")]
    Cancelled,
}

/// Result type alias for mtrelay
pub type Result<T> = std::result::Result<T, Error>;
