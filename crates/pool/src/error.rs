//! Pool error types

use thiserror::Error;

/// Pool error type
#[derive(Error, Debug)]
pub enum PoolError {
    /// Operation requires read capability but the pool was configured read-off
    #[error("pool is not configured readable")]
    ReadDisabled,

    /// Operation requires write capability but the pool was configured write-off
    #[error("pool is not configured writable")]
    WriteDisabled,

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Not connected to relay
    #[error("not connected to relay")]
    NotConnected,

    /// Invalid URL
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    /// Timeout error
    #[error("timeout: {0}")]
    Timeout(String),

    /// Signer construction or delegation error
    #[error("signer error: {0}")]
    Signer(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Wire protocol error
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The pool has been shut down
    #[error("pool is closed")]
    Closed,
}

/// Pool result type
pub type Result<T> = std::result::Result<T, PoolError>;
