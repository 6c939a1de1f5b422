//! Platform client trait.
//!
//! The core never talks to the network directly. Every send goes through a
//! [`PlatformClient`], which wraps the wire-level HTTP client of the
//! messaging platform and reports failures already classified as
//! [`SendError`]s.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::action::OutboundAction;
use crate::error::SendError;

/// Successful response of a send call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlatformResponse {
    /// Id of the created message, if the platform returned one.
    pub message_id: Option<i64>,
    /// Raw response body.
    pub raw: Value,
}

impl PlatformResponse {
    /// Creates a response for the given message id.
    pub fn message(message_id: i64) -> Self {
        Self {
            message_id: Some(message_id),
            raw: Value::Null,
        }
    }
}

/// The outbound half of the messaging platform.
///
/// Implementations map platform status codes onto [`SendError`]:
///
/// | Platform condition | Variant |
/// |---|---|
/// | timeout, 5xx, reset | [`SendError::Transient`] |
/// | bot blocked, chat deleted | [`SendError::Permanent`] |
/// | 429 with `retry_after` | [`SendError::RateLimited`] |
/// | 401 / revoked token | [`SendError::Unauthorized`] |
#[async_trait]
pub trait PlatformClient: Send + Sync + 'static {
    /// Sends one outbound action.
    async fn send(&self, action: &OutboundAction) -> Result<PlatformResponse, SendError>;
}

/// A shared platform client.
pub type BoxedPlatformClient = Arc<dyn PlatformClient>;
