//! # Courier
//!
//! A bot runtime that turns an at-least-once stream of platform updates into
//! ordered per-user conversations, and delivers replies and mass broadcasts
//! under one outbound rate budget.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐   ┌────────────┐   ┌───────────────┐   ┌────────────────────┐
//! │ IngestionSource │──▶│ Dispatcher │──▶│ CommandRouter │──▶│ ConversationEngine │
//! │  (poll / push)  │   │  (dedup)   │   │ (per-user lock│   │  + SessionStore    │
//! └─────────────────┘   └─────┬──────┘   └───────────────┘   └────────────────────┘
//!                             │ replies
//!                             ▼
//! ┌─────────────────┐   ┌─────────────┐   ┌────────────────┐
//! │ BroadcastEngine │──▶│ RateLimiter │──▶│ PlatformClient │
//! └─────────────────┘   └─────────────┘   └────────────────┘
//! ```
//!
//! - **Dispatcher**: drops duplicate updates, keeps each user's events in order
//! - **CommandRouter**: stateless commands, level checks, conversation routing
//! - **ConversationEngine**: one handler per state, sessions persisted per turn
//! - **BroadcastEngine**: pulls recipients lazily, bounded in-flight deliveries
//! - **RateLimiter**: global token bucket plus a per-chat interval gate
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use courier::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = CourierRuntime::builder()
//!         .platform_client(client)
//!         .command("start", |_turn: Turn| async {
//!             Step::goto("AWAITING_NAME", ContextData::new()).reply("What is your name?")
//!         })
//!         .state("AWAITING_NAME", |turn: Turn| async move {
//!             Step::complete().reply(format!("Welcome, {}!", turn.text()))
//!         })
//!         .build()
//!         .await?;
//!
//!     runtime.run(source).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - `command` (default): clap-parsed command arguments
//! - `toml-config` (default) / `yaml-config`: configuration file formats
//! - `json-log`: JSON log output
//! - `sqlite`: SQLite session and topic backends
//! - `webhook`: axum push endpoint

pub use courier_core as core;
pub use courier_framework as framework;
pub use courier_runtime as runtime;
#[cfg(feature = "sqlite")]
pub use courier_storage as storage;
pub use courier_transport as transport;

/// Prelude module for convenient imports.
///
/// ```rust,ignore
/// use courier::prelude::*;
/// ```
pub mod prelude {
    // Runtime - main entry point
    pub use courier_runtime::{CourierRuntime, RuntimeError, RuntimeResult};

    // Data model
    pub use courier_core::{
        ChatId, ContextData, Event, IterTargets, OutboundAction, Payload, UserId, UserSession,
    };

    // Collaborator traits for custom implementations
    pub use courier_core::{
        IngestionSource, PlatformClient, PlatformResponse, SendError, SessionStore,
        TargetProvider, TopicCache, UserLevelProvider,
    };

    // Handlers
    pub use courier_framework::{JobStatus, Step, Turn, WriteMode};

    // Structured command support (requires "command" feature)
    #[cfg(feature = "command")]
    pub use courier_framework::{CommandArgs, typed};

    // Ingestion
    pub use courier_transport::ChannelSource;
}
