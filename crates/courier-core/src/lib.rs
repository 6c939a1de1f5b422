//! # Courier Core
//!
//! The data model and collaborator contracts of the Courier bot runtime.
//!
//! This crate is deliberately free of runtime logic. It defines what flows
//! through the system and the seams where backends plug in:
//!
//! - **Events**: immutable inbound occurrences ([`Event`], [`Payload`])
//! - **Actions**: outbound sends handed to the platform ([`OutboundAction`])
//! - **Sessions**: per-user conversation state ([`UserSession`], [`SessionStore`])
//! - **Topics**: name↔id memoization for forum topics ([`TopicCache`])
//! - **Collaborators**: [`PlatformClient`], [`IngestionSource`],
//!   [`TargetProvider`], [`UserLevelProvider`]
//!
//! ## Data Flow
//!
//! ```text
//! ┌──────────────────┐     ┌────────────┐     ┌───────────────┐     ┌────────────────┐
//! │ IngestionSource  │────▶│ Dispatcher │────▶│ CommandRouter │────▶│ OutboundAction │
//! └──────────────────┘     └────────────┘     └───────┬───────┘     └───────┬────────┘
//!                                                     │                     ▼
//!                                              ┌──────▼───────┐     ┌────────────────┐
//!                                              │ SessionStore │     │ PlatformClient │
//!                                              └──────────────┘     └────────────────┘
//! ```
//!
//! The engines that drive this flow live in `courier-framework`.

pub mod action;
pub mod error;
pub mod event;
pub mod level;
pub mod platform;
pub mod session;
pub mod source;
pub mod topic;

pub use action::{ActionKind, OutboundAction};
pub use error::{
    FailureClass, RateLimitError, SendError, SourceError, SourceResult, StoreError, StoreResult,
};
pub use event::{ChatId, Event, EventId, Payload, TopicId, UserId, now_ms};
pub use level::{UniformLevel, UserLevelProvider};
pub use platform::{BoxedPlatformClient, PlatformClient, PlatformResponse};
pub use session::{ContextData, MemorySessionStore, SessionStore, UserSession};
pub use source::{Batch, IngestionSource, IterTargets, StreamTargets, TargetProvider};
pub use topic::{MemoryTopicCache, TopicCache};

/// Prelude for common imports.
pub mod prelude {
    pub use super::action::*;
    pub use super::event::*;
    pub use super::platform::{PlatformClient, PlatformResponse};
    pub use super::session::{ContextData, SessionStore, UserSession};
    pub use super::source::{IngestionSource, TargetProvider};
}
