//! Outbound actions.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event::{ChatId, TopicId};

/// What produced an outbound action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// A normal reply to a turn.
    Reply,
    /// A deterministic error response (rejected input, insufficient level).
    Error,
    /// One delivery of a broadcast job.
    Broadcast,
}

/// A message the runtime wants the platform client to send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundAction {
    /// Destination chat.
    pub chat_id: ChatId,
    /// Message text.
    pub text: String,
    /// Origin of the action.
    pub kind: ActionKind,
    /// Forum topic to post into, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic_id: Option<TopicId>,
    /// Platform-specific extras (keyboards, parse mode) passed through verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<Value>,
}

impl OutboundAction {
    fn with_kind(chat_id: ChatId, text: impl Into<String>, kind: ActionKind) -> Self {
        Self {
            chat_id,
            text: text.into(),
            kind,
            topic_id: None,
            extra: None,
        }
    }

    /// Creates a reply action.
    pub fn reply(chat_id: ChatId, text: impl Into<String>) -> Self {
        Self::with_kind(chat_id, text, ActionKind::Reply)
    }

    /// Creates an error-class action.
    pub fn error(chat_id: ChatId, text: impl Into<String>) -> Self {
        Self::with_kind(chat_id, text, ActionKind::Error)
    }

    /// Creates a broadcast delivery action.
    pub fn broadcast(chat_id: ChatId, text: impl Into<String>) -> Self {
        Self::with_kind(chat_id, text, ActionKind::Broadcast)
    }

    /// Targets a forum topic.
    pub fn in_topic(mut self, topic_id: TopicId) -> Self {
        self.topic_id = Some(topic_id);
        self
    }

    /// Attaches platform-specific extras.
    pub fn with_extra(mut self, extra: Value) -> Self {
        self.extra = Some(extra);
        self
    }

    /// Returns `true` if this is an error-class action.
    pub fn is_error(&self) -> bool {
        self.kind == ActionKind::Error
    }
}
