//! Configuration module for the Courier runtime.
//!
//! Layered loading (figment), the schema of `courier.toml`, and range checks.

pub mod error;
pub mod loader;
pub mod schema;
pub mod validation;

pub use error::{ConfigError, ConfigResult};
pub use loader::{ConfigLoader, Profile, load_config, load_config_from_file};
pub use schema::{
    BroadcastSettings, CourierConfig, DispatcherSettings, LogFormat, LogLevel, LogOutput,
    LogRotation, LoggingConfig, RateLimitSettings, RetryConfig, SessionBackend, SessionsConfig,
    SpanEventConfig, WebhookSettings,
};
pub use validation::validate_config;
