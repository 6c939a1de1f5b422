//! Transport error types.

use thiserror::Error;

/// Errors raised while starting or running a transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Binding the listen address failed.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// The address that was requested.
        addr: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Other I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;
