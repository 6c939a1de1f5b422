//! # Courier Framework
//!
//! The engines of the Courier bot runtime.
//!
//! This layer provides:
//! - [`RateLimiter`]: global token bucket plus per-chat interval gate
//! - [`OutboundSender`]: rate-limited delivery with classified retries
//! - [`ConversationEngine`]: per-user finite-state dialogue over a session store
//! - [`CommandRouter`]: stateless commands, level checks, conversation routing
//! - [`Dispatcher`]: deduplicating, per-user ordered event pipeline
//! - [`BroadcastEngine`]: bounded-memory fan-out with a delivery report
//! - [`TopicResolver`]: get-or-create for forum topics
//! - Clap-based typed commands (with `command` feature)
//!
//! # Example
//!
//! ```rust,ignore
//! use courier_framework::prelude::*;
//!
//! let engine = ConversationEngine::builder()
//!     .state("AWAITING_NAME", |turn: Turn| async move {
//!         Step::complete().reply(format!("Welcome, {}!", turn.text()))
//!     })
//!     .build(store);
//!
//! let router = CommandRouter::builder(engine)
//!     .command("start", |_turn: Turn| async {
//!         Step::goto("AWAITING_NAME", ContextData::new()).reply("What is your name?")
//!     })
//!     .build();
//! ```

pub mod broadcast;
pub mod command;
pub mod conversation;
pub mod dedup;
pub mod dispatcher;
pub mod error;
pub mod keyed;
pub mod outbound;
pub mod ratelimit;
pub mod retry;
pub mod router;
pub mod step;
pub mod topic;

pub use broadcast::{
    AbortReason, BroadcastConfig, BroadcastEngine, BroadcastHandle, DeliveryReport, JobStatus,
};
pub use command::{parse_command, shell_split};
pub use conversation::{ConversationEngine, ConversationEngineBuilder, TurnKind, TurnOutcome, WriteMode};
pub use dedup::DedupWindow;
pub use dispatcher::{BatchSummary, DispatchStatus, Dispatcher, DispatcherConfig, FailedEvent};
pub use error::{DeliveryError, DeliveryResult, EngineError, EngineResult, TopicError};
pub use keyed::{KeyedGuard, KeyedMutex};
pub use outbound::OutboundSender;
pub use ratelimit::{RateLimitConfig, RateLimiter};
pub use retry::RetryPolicy;
pub use router::{CommandRouter, CommandRouterBuilder, Route, RouteOutcome};
pub use step::{BoxedStepHandler, IntoStep, Step, StepHandler, Transition, Turn, into_step_handler};
pub use topic::TopicResolver;

#[cfg(feature = "command")]
pub use command::{CommandArgs, typed};

/// Prelude for common imports.
pub mod prelude {
    pub use super::conversation::{ConversationEngine, WriteMode};
    pub use super::router::CommandRouter;
    pub use super::step::{Step, Turn};
    pub use courier_core::ContextData;

    #[cfg(feature = "command")]
    pub use super::command::{CommandArgs, typed};
}
