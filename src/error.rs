//! Error types for Wireline

use thiserror::Error;

/// Main error type for Wireline
///
/// Every failure completes the in-flight operation exceptionally and moves
/// the connection to `Closed`; there is no retry at this layer.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connect timeout")]
    ConnectTimeout,

    #[error("Proxy negotiation failed: {0}")]
    Proxy(String),

    #[error("TLS handshake failed: {0}")]
    Tls(String),

    #[error("Framing violation: {0}")]
    Framing(String),

    #[error("HTTP decode failed: {0}")]
    HttpDecode(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Connection closed")]
    ConnectionClosed,
}

/// Result type alias for Wireline
pub type Result<T> = std::result::Result<T, Error>;
