//! Courier Runtime - Orchestration layer for the Courier bot runtime.
//!
//! This crate provides:
//! - Layered configuration (`courier.toml`, `COURIER_*` environment variables)
//! - Logging setup on `tracing-subscriber`
//! - Runtime wiring: one shared rate limiter, the dispatcher, the broadcast
//!   engine and the session backend chosen by configuration
//! - Lifecycle: polling or webhook ingestion, periodic session cleanup,
//!   graceful shutdown on Ctrl+C or SIGTERM
//!
//! # Features
//!
//! - `toml-config` (default): TOML configuration files
//! - `yaml-config`: YAML configuration files
//! - `json-log`: JSON log lines
//! - `sqlite`: SQLite session backend
//! - `webhook`: push endpoint served next to (or instead of) polling
//!
//! ```ignore
//! use courier_runtime::CourierRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = CourierRuntime::builder()
//!         .platform_client(client)
//!         .command("start", start)
//!         .state("AWAITING_NAME", awaiting_name)
//!         .build()
//!         .await?;
//!
//!     runtime.run(source).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod runtime;

// Re-exports
pub use config::{ConfigError, ConfigLoader, ConfigResult, CourierConfig};
pub use error::{RuntimeError, RuntimeResult};
pub use logging::{LoggingBuilder, SpanEvents};
pub use runtime::{CourierRuntime, RuntimeBuilder, open_session_store, run_session_cleanup};

// Re-export tracing for use by other crates
pub use tracing;
pub use tracing_subscriber;

/// Prelude module for convenient imports.
///
/// This provides all the commonly used logging macros:
/// - `trace!`, `debug!`, `info!`, `warn!`, `error!`
/// - `span`, `event`
/// - `instrument` attribute
/// - `Level` for span creation
pub mod prelude {
    pub use tracing::{Level, debug, error, event, info, instrument, span, trace, warn};
}
