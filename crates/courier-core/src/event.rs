//! Inbound events.
//!
//! An [`Event`] is one occurrence delivered by the messaging platform: a text
//! message, a button callback, an inline query. Events are created by the
//! ingestion source, never mutated, and dropped once processed.
//!
//! The platform object model is opaque to Courier. Only the fields the runtime
//! needs for routing are typed; everything else travels in [`Payload::Other`].

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Globally unique, monotonically non-decreasing event identifier.
pub type EventId = u64;

/// Platform user identifier.
pub type UserId = i64;

/// Platform chat identifier.
pub type ChatId = i64;

/// Forum topic identifier within a chat.
pub type TopicId = i64;

/// Returns the current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// The body of an inbound event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    /// A plain text message (commands included).
    Text {
        /// Message text.
        text: String,
    },
    /// A button callback.
    Callback {
        /// Opaque callback data attached to the button.
        data: String,
    },
    /// An inline query typed in another chat.
    InlineQuery {
        /// The query text.
        query: String,
    },
    /// Anything else, transported verbatim.
    Other {
        /// Raw platform object.
        raw: Value,
    },
}

impl Payload {
    /// Returns the textual content of this payload, if it has one.
    ///
    /// Callbacks expose their data so conversation handlers can treat button
    /// presses like typed answers.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            Self::Callback { data } => Some(data),
            Self::InlineQuery { query } => Some(query),
            Self::Other { .. } => None,
        }
    }

    /// Returns a short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::Callback { .. } => "callback",
            Self::InlineQuery { .. } => "inline_query",
            Self::Other { .. } => "other",
        }
    }
}

/// One inbound occurrence from the messaging platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique id assigned by the platform.
    pub event_id: EventId,
    /// The user who triggered the event.
    pub user_id: UserId,
    /// The chat the event happened in.
    pub chat_id: ChatId,
    /// Event body.
    pub payload: Payload,
    /// Reception time in milliseconds since the Unix epoch.
    #[serde(default = "now_ms")]
    pub received_at: u64,
}

impl Event {
    /// Creates an event received now.
    pub fn new(event_id: EventId, user_id: UserId, chat_id: ChatId, payload: Payload) -> Self {
        Self {
            event_id,
            user_id,
            chat_id,
            payload,
            received_at: now_ms(),
        }
    }

    /// Creates a text event in the user's private chat (`chat_id == user_id`).
    pub fn text(event_id: EventId, user_id: UserId, text: impl Into<String>) -> Self {
        Self::new(
            event_id,
            user_id,
            user_id,
            Payload::Text { text: text.into() },
        )
    }

    /// Returns the textual content of the payload.
    pub fn plain_text(&self) -> Option<&str> {
        self.payload.as_text()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_tagged_json() {
        let json = r#"{"event_id":7,"user_id":1,"chat_id":2,"payload":{"type":"text","text":"/start"}}"#;
        let event: Event = serde_json::from_str(json).unwrap();
        assert_eq!(event.event_id, 7);
        assert_eq!(event.plain_text(), Some("/start"));
        assert!(event.received_at > 0);
    }

    #[test]
    fn test_other_payload_has_no_text() {
        let payload = Payload::Other {
            raw: serde_json::json!({"sticker": "cat"}),
        };
        assert_eq!(payload.as_text(), None);
        assert_eq!(payload.kind(), "other");
    }
}
