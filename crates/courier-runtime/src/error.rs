//! Runtime error types.

use thiserror::Error;

use courier_core::StoreError;
use courier_transport::TransportError;

use crate::config::ConfigError;

/// Errors that can occur while building or running the runtime.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Configuration could not be loaded or is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The session backend could not be opened.
    #[error("Session store error: {0}")]
    Store(#[from] StoreError),

    /// A transport failed to start.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// `build` was called without a platform client.
    #[error("No platform client configured")]
    MissingPlatformClient,
}

/// Result type for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;
