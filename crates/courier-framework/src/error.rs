//! Error types for the Courier framework.

use thiserror::Error;

use courier_core::{FailureClass, RateLimitError, SendError, StoreError, UserId};

/// Errors that abort a conversational turn.
///
/// When a turn fails with one of these, no session write has happened and
/// the pre-turn session stays authoritative.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// The session store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A conditional write lost against another instance.
    #[error("session of user {user_id} was modified concurrently")]
    Conflict {
        /// The contended user.
        user_id: UserId,
    },
}

impl EngineError {
    /// Returns the failure class of this error.
    pub fn class(&self) -> FailureClass {
        match self {
            Self::Store(e) => e.class(),
            Self::Conflict { .. } => FailureClass::Transient,
        }
    }
}

/// Errors returned when an outbound action could not be delivered.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// The rate limiter refused the send.
    #[error(transparent)]
    RateLimit(#[from] RateLimitError),

    /// The platform rejected the send, after retries where applicable.
    #[error("delivery failed after {attempts} attempt(s): {source}")]
    Rejected {
        /// The last platform error.
        source: SendError,
        /// Number of send attempts made.
        attempts: u32,
    },
}

impl DeliveryError {
    /// Returns the failure class of this error.
    pub fn class(&self) -> FailureClass {
        match self {
            Self::RateLimit(_) => FailureClass::RateLimited,
            Self::Rejected { source, .. } => source.class(),
        }
    }
}

/// Errors returned by the topic get-or-create path.
#[derive(Debug, Error)]
pub enum TopicError<E> {
    /// The topic cache failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The caller's creator failed; nothing was cached.
    #[error("topic creation failed: {0}")]
    Create(E),
}

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Result type for delivery operations.
pub type DeliveryResult<T> = Result<T, DeliveryError>;
