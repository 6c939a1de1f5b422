//! Turns, steps and state handlers.
//!
//! A handler receives one [`Turn`] (the event plus the user's conversation
//! context) and returns a [`Step`] describing what should happen to the
//! session. Handlers are plain async functions:
//!
//! ```rust,ignore
//! async fn ask_name(turn: Turn) -> Step {
//!     Step::goto("AWAITING_NAME", ContextData::new()).reply("What is your name?")
//! }
//!
//! async fn take_name(turn: Turn) -> Result<Step, String> {
//!     let name = turn.text().trim();
//!     if name.is_empty() {
//!         return Err("Please send a non-empty name.".into());
//!     }
//!     Ok(Step::complete().reply(format!("Welcome, {name}!")))
//! }
//! ```

use std::fmt::Display;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;

use courier_core::{ChatId, ContextData, Event, UserId};

// ============================================================================
// Step
// ============================================================================

/// Effect of a turn on the user's session.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Keep the current state; replace the context when `Some`.
    Stay(Option<ContextData>),
    /// Move to `state` with a fresh context.
    To {
        /// Name of the next state.
        state: String,
        /// Context carried into the next state.
        context: ContextData,
    },
    /// End the conversation and delete the session.
    Complete,
    /// Refuse the input. Nothing is written; the reason is sent back as an
    /// error-class response.
    Reject(String),
}

/// Handler result: a transition plus an optional reply.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    /// What happens to the session.
    pub transition: Transition,
    /// Text sent back to the chat the event came from.
    pub reply: Option<String>,
}

impl Step {
    fn new(transition: Transition) -> Self {
        Self {
            transition,
            reply: None,
        }
    }

    /// Stay in the current state, context unchanged.
    pub fn stay() -> Self {
        Self::new(Transition::Stay(None))
    }

    /// Stay in the current state with a replaced context.
    pub fn stay_with(context: ContextData) -> Self {
        Self::new(Transition::Stay(Some(context)))
    }

    /// Move to `state`.
    pub fn goto(state: impl Into<String>, context: ContextData) -> Self {
        Self::new(Transition::To {
            state: state.into(),
            context,
        })
    }

    /// Finish the conversation.
    pub fn complete() -> Self {
        Self::new(Transition::Complete)
    }

    /// Reject the input with a user-facing reason.
    pub fn reject(reason: impl Into<String>) -> Self {
        Self::new(Transition::Reject(reason.into()))
    }

    /// Attaches a reply text.
    pub fn reply(mut self, text: impl Into<String>) -> Self {
        self.reply = Some(text.into());
        self
    }

    /// Returns `true` for rejections.
    pub fn is_reject(&self) -> bool {
        matches!(self.transition, Transition::Reject(_))
    }
}

/// Conversion of handler return values into a [`Step`].
pub trait IntoStep: Send {
    /// Performs the conversion.
    fn into_step(self) -> Step;
}

impl IntoStep for Step {
    fn into_step(self) -> Step {
        self
    }
}

/// `Err` becomes a rejection carrying the error's message.
impl<E: Display + Send> IntoStep for Result<Step, E> {
    fn into_step(self) -> Step {
        self.unwrap_or_else(|e| Step::reject(e.to_string()))
    }
}

// ============================================================================
// Turn
// ============================================================================

/// Everything a handler sees for one event.
#[derive(Debug, Clone)]
pub struct Turn {
    /// The inbound event.
    pub event: Event,
    /// Current state, `None` before the conversation starts.
    pub state: Option<String>,
    /// Context of the current session.
    pub context: ContextData,
    /// Authorization level of the sender.
    pub level: u32,
}

impl Turn {
    /// Creates a turn with an empty context.
    pub fn new(event: Event) -> Self {
        Self {
            event,
            state: None,
            context: ContextData::new(),
            level: 0,
        }
    }

    /// The sender.
    pub fn user_id(&self) -> UserId {
        self.event.user_id
    }

    /// The chat the event came from.
    pub fn chat_id(&self) -> ChatId {
        self.event.chat_id
    }

    /// Text of the payload, or `""` for non-text payloads.
    pub fn text(&self) -> &str {
        self.event.payload.as_text().unwrap_or_default()
    }

    /// Text after the leading command token, trimmed.
    pub fn args(&self) -> &str {
        let text = self.text().trim_start();
        match text.find(char::is_whitespace) {
            Some(idx) => text[idx..].trim(),
            None => "",
        }
    }

    /// Reads and decodes a context value.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.context
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Returns a copy of the context with `key` set to `value`.
    ///
    /// Values that fail to serialize leave the key untouched.
    pub fn context_with(&self, key: impl Into<String>, value: impl Serialize) -> ContextData {
        let mut context = self.context.clone();
        if let Ok(value) = serde_json::to_value(value) {
            context.insert(key.into(), value);
        }
        context
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// A type-erased handler stored by the engine and the router.
pub type BoxedStepHandler = Arc<dyn Fn(Turn) -> BoxFuture<'static, Step> + Send + Sync>;

/// Async functions usable as state or command handlers.
pub trait StepHandler: Send + Sync + 'static {
    /// Runs the handler.
    fn call(&self, turn: Turn) -> BoxFuture<'static, Step>;
}

impl<F, Fut, R> StepHandler for F
where
    F: Fn(Turn) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoStep + 'static,
{
    fn call(&self, turn: Turn) -> BoxFuture<'static, Step> {
        (self)(turn).map(IntoStep::into_step).boxed()
    }
}

/// Erases a handler.
pub fn into_step_handler<H: StepHandler>(handler: H) -> BoxedStepHandler {
    Arc::new(move |turn| handler.call(turn))
}
