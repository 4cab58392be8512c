//! Error types for events-bridge-core

use thiserror::Error;

/// Result type alias for events-bridge-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error kinds shared across the pipeline, connector registry, and
/// every connector that plugs into it.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid or missing connector options, unknown connector kind, or any
    /// other startup-time validation failure. Prevents the pipeline from
    /// starting.
    #[error("config error: {0}")]
    ConfigError(String),

    /// Transient failure in a source/target's network layer. Sources loop
    /// with backoff; targets surface this to the worker, which Naks.
    #[error("transport error: {0}")]
    TransportError(String),

    /// A runner or target exceeded its configured deadline.
    #[error("timeout after {0:?}")]
    TimeoutError(std::time::Duration),

    /// Frame/codec parsing failure in auxiliary I/O.
    #[error("decode error: {0}")]
    DecodeError(String),

    /// A mutating operation was attempted on a read-only filesystem view.
    #[error("permission denied: {0}")]
    PermissionError(String),

    /// Invariant violation (e.g. send on a closed stream). Terminates the
    /// pipeline that raised it.
    #[error("fatal: {0}")]
    Fatal(String),

    /// I/O error, wrapped verbatim.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error, wrapped verbatim.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Error::ConfigError(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Error::TransportError(msg.into())
    }
}
