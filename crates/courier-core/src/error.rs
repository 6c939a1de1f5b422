//! Unified error types for the Courier core.
//!
//! Every collaborator boundary has its own error enum. Errors that the
//! framework must classify (retry, record, abort) expose a [`FailureClass`].

use std::time::Duration;

use thiserror::Error;

use crate::event::ChatId;

// =============================================================================
// Failure classification
// =============================================================================

/// How the runtime reacts to a failed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureClass {
    /// Retry with bounded exponential backoff.
    Transient,
    /// The platform asked us to slow down; retry after the given delay.
    RateLimited,
    /// Retrying cannot help (recipient blocked the bot, chat deleted).
    Permanent,
    /// The whole pipeline is affected (credentials rejected).
    Systemic,
}

impl FailureClass {
    /// Returns `true` for classes worth retrying.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Transient | Self::RateLimited)
    }
}

// =============================================================================
// Store Errors
// =============================================================================

/// Errors raised by session and topic backends.
///
/// An unavailable store must be propagated: callers never treat it as
/// "no session".
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The backend could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A persisted record could not be decoded.
    #[error("corrupt record for user {user_id}: {reason}")]
    Corrupt {
        /// The user whose record is broken.
        user_id: i64,
        /// Decoder message.
        reason: String,
    },

    /// Any other backend failure.
    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Returns the failure class of this error.
    pub fn class(&self) -> FailureClass {
        match self {
            Self::Unavailable(_) => FailureClass::Transient,
            Self::Corrupt { .. } => FailureClass::Permanent,
            Self::Backend(_) => FailureClass::Transient,
        }
    }
}

// =============================================================================
// Platform Send Errors
// =============================================================================

/// Failure reported by a [`PlatformClient`](crate::PlatformClient).
#[derive(Debug, Clone, Error)]
pub enum SendError {
    /// Network timeout, 5xx, connection reset.
    #[error("transient send failure: {0}")]
    Transient(String),

    /// Recipient blocked the bot, chat not found, message invalid.
    #[error("permanent send failure: {0}")]
    Permanent(String),

    /// The platform throttled the call.
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited {
        /// Delay requested by the platform.
        retry_after: Duration,
    },

    /// Credentials rejected.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
}

impl SendError {
    /// Returns the failure class of this error.
    pub fn class(&self) -> FailureClass {
        match self {
            Self::Transient(_) => FailureClass::Transient,
            Self::Permanent(_) => FailureClass::Permanent,
            Self::RateLimited { .. } => FailureClass::RateLimited,
            Self::Unauthorized(_) => FailureClass::Systemic,
        }
    }
}

// =============================================================================
// Rate Limit Errors
// =============================================================================

/// Errors returned by the outbound rate limiter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RateLimitError {
    /// No token became available before the caller's timeout.
    #[error("rate limiter deadline exceeded after {timeout:?}")]
    DeadlineExceeded {
        /// The timeout that was exceeded.
        timeout: Duration,
    },

    /// Too many sends are already queued for this chat.
    #[error("backpressure: {depth} sends already queued for chat {chat_id}")]
    Backpressure {
        /// The congested chat.
        chat_id: ChatId,
        /// The configured queue depth.
        depth: usize,
    },
}

// =============================================================================
// Ingestion Errors
// =============================================================================

/// Errors raised by an [`IngestionSource`](crate::IngestionSource).
#[derive(Debug, Clone, Error)]
pub enum SourceError {
    /// The source could not be reached; the poll will be retried.
    #[error("ingestion source unavailable: {0}")]
    Unavailable(String),

    /// The source returned data that could not be decoded into events.
    #[error("malformed ingestion batch: {0}")]
    Malformed(String),

    /// The source has been closed and will not produce more events.
    #[error("ingestion source closed")]
    Closed,
}

// =============================================================================
// Result Type Aliases
// =============================================================================

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Result type for ingestion operations.
pub type SourceResult<T> = Result<T, SourceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_error_classes() {
        assert_eq!(
            SendError::Transient("timeout".into()).class(),
            FailureClass::Transient
        );
        assert_eq!(
            SendError::Permanent("blocked".into()).class(),
            FailureClass::Permanent
        );
        assert_eq!(
            SendError::RateLimited {
                retry_after: Duration::from_secs(1)
            }
            .class(),
            FailureClass::RateLimited
        );
        assert_eq!(
            SendError::Unauthorized("bad token".into()).class(),
            FailureClass::Systemic
        );
    }

    #[test]
    fn test_retryable_classes() {
        assert!(FailureClass::Transient.is_retryable());
        assert!(FailureClass::RateLimited.is_retryable());
        assert!(!FailureClass::Permanent.is_retryable());
        assert!(!FailureClass::Systemic.is_retryable());
    }
}
