//! Configuration schema definitions.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use courier_framework::{BroadcastConfig, DispatcherConfig, RateLimitConfig, RetryPolicy};

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CourierConfig {
    /// Log output settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Outbound rate budget.
    #[serde(default)]
    pub rate_limit: RateLimitSettings,

    /// Event pipeline settings.
    #[serde(default)]
    pub dispatcher: DispatcherSettings,

    /// Broadcast job settings.
    #[serde(default)]
    pub broadcast: BroadcastSettings,

    /// Session backend and expiry.
    #[serde(default)]
    pub sessions: SessionsConfig,

    /// Backoff shared by routing, polling and delivery.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Push endpoint. Absent means polling only.
    #[serde(default)]
    pub webhook: Option<WebhookSettings>,
}

// =============================================================================
// Logging
// =============================================================================

/// Log verbosity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Returns the level as a filter directive string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    /// Converts to the `tracing` level.
    pub fn to_tracing_level(self) -> tracing::Level {
        match self {
            Self::Trace => tracing::Level::TRACE,
            Self::Debug => tracing::Level::DEBUG,
            Self::Info => tracing::Level::INFO,
            Self::Warn => tracing::Level::WARN,
            Self::Error => tracing::Level::ERROR,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Log line layout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Full,
    Pretty,
    /// Newline-delimited JSON. Needs the `json-log` feature.
    Json,
}

/// Where log lines go.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    #[default]
    Stdout,
    Stderr,
    File,
}

/// How often the log file rolls over.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    #[default]
    Never,
    Hourly,
    Daily,
}

/// Which span lifecycle events are logged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpanEventConfig {
    #[serde(default)]
    pub new: bool,
    #[serde(default)]
    pub enter: bool,
    #[serde(default)]
    pub exit: bool,
    #[serde(default)]
    pub close: bool,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Base level, overridden by `RUST_LOG` when set.
    #[serde(default)]
    pub level: LogLevel,

    #[serde(default)]
    pub format: LogFormat,

    #[serde(default)]
    pub output: LogOutput,

    /// Log file for `output = "file"`.
    #[serde(default)]
    pub file_path: Option<PathBuf>,

    #[serde(default)]
    pub rotation: LogRotation,

    /// Rolled files kept on disk.
    #[serde(default = "default_max_files")]
    pub max_files: u32,

    #[serde(default)]
    pub thread_ids: bool,

    /// Show file and line of each event.
    #[serde(default)]
    pub file_location: bool,

    #[serde(default)]
    pub span_events: SpanEventConfig,

    /// Per-module levels, e.g. `courier_framework = "debug"`.
    #[serde(default)]
    pub filters: HashMap<String, LogLevel>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Compact,
            output: LogOutput::Stdout,
            file_path: None,
            rotation: LogRotation::Never,
            max_files: default_max_files(),
            thread_ids: false,
            file_location: false,
            span_events: SpanEventConfig::default(),
            filters: HashMap::new(),
        }
    }
}

fn default_max_files() -> u32 {
    5
}

// =============================================================================
// Engines
// =============================================================================

/// Rate limiter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    /// Sustained global sends per second.
    #[serde(default = "default_global_rate")]
    pub global_rate: f64,

    #[serde(default = "default_burst")]
    pub burst: u32,

    /// Minimum gap between sends to one chat. `0` disables the gate.
    #[serde(default = "default_per_chat_interval_ms")]
    pub per_chat_interval_ms: u64,

    #[serde(default = "default_per_chat_queue_depth")]
    pub per_chat_queue_depth: usize,

    /// How long one send may wait for the limiter.
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            global_rate: default_global_rate(),
            burst: default_burst(),
            per_chat_interval_ms: default_per_chat_interval_ms(),
            per_chat_queue_depth: default_per_chat_queue_depth(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
        }
    }
}

impl RateLimitSettings {
    /// Converts to the limiter configuration.
    pub fn to_limiter_config(&self) -> RateLimitConfig {
        RateLimitConfig {
            global_rate: self.global_rate,
            burst: self.burst,
            per_chat_interval: Duration::from_millis(self.per_chat_interval_ms),
            per_chat_queue_depth: self.per_chat_queue_depth,
        }
    }

    /// The acquire timeout as a duration.
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

fn default_global_rate() -> f64 {
    25.0
}

fn default_burst() -> u32 {
    25
}

fn default_per_chat_interval_ms() -> u64 {
    1100
}

fn default_per_chat_queue_depth() -> usize {
    32
}

fn default_acquire_timeout_ms() -> u64 {
    30_000
}

/// Dispatcher settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherSettings {
    #[serde(default = "default_dedup_window")]
    pub dedup_window: usize,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Pause after an empty poll.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_max_parallel_users")]
    pub max_parallel_users: usize,

    #[serde(default = "default_replay_capacity")]
    pub replay_capacity: usize,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            dedup_window: default_dedup_window(),
            batch_size: default_batch_size(),
            poll_interval_ms: default_poll_interval_ms(),
            max_parallel_users: default_max_parallel_users(),
            replay_capacity: default_replay_capacity(),
        }
    }
}

impl DispatcherSettings {
    /// Converts to the dispatcher configuration.
    pub fn to_dispatcher_config(&self, retry: RetryPolicy) -> DispatcherConfig {
        DispatcherConfig {
            dedup_window: self.dedup_window,
            batch_size: self.batch_size,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            max_parallel_users: self.max_parallel_users,
            replay_capacity: self.replay_capacity,
            retry,
        }
    }
}

fn default_dedup_window() -> usize {
    10_000
}

fn default_batch_size() -> usize {
    100
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_max_parallel_users() -> usize {
    64
}

fn default_replay_capacity() -> usize {
    1_000
}

/// Broadcast settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastSettings {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[serde(default = "default_failure_sample_cap")]
    pub failure_sample_cap: usize,

    #[serde(default = "default_systemic_abort_threshold")]
    pub systemic_abort_threshold: u32,
}

impl Default for BroadcastSettings {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            failure_sample_cap: default_failure_sample_cap(),
            systemic_abort_threshold: default_systemic_abort_threshold(),
        }
    }
}

impl BroadcastSettings {
    /// Converts to the broadcast engine configuration.
    pub fn to_broadcast_config(&self) -> BroadcastConfig {
        BroadcastConfig {
            concurrency: self.concurrency,
            failure_sample_cap: self.failure_sample_cap,
            systemic_abort_threshold: self.systemic_abort_threshold,
        }
    }
}

fn default_concurrency() -> usize {
    16
}

fn default_failure_sample_cap() -> usize {
    100
}

fn default_systemic_abort_threshold() -> u32 {
    5
}

// =============================================================================
// Sessions
// =============================================================================

/// Session storage backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SessionBackend {
    /// Process-local map; sessions are lost on restart.
    #[default]
    Memory,
    /// SQLite database. Needs the `sqlite` feature.
    Sqlite {
        /// Connection URL, e.g. `sqlite://courier.db`.
        url: String,
    },
}

/// Session settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsConfig {
    #[serde(default)]
    pub backend: SessionBackend,

    /// Idle time after which a conversation is dropped.
    #[serde(default = "default_timeout_minutes")]
    pub timeout_minutes: u64,

    /// How often expired sessions are swept. `0` disables the sweep.
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            backend: SessionBackend::Memory,
            timeout_minutes: default_timeout_minutes(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}

impl SessionsConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_minutes * 60)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

fn default_timeout_minutes() -> u64 {
    30
}

fn default_cleanup_interval_secs() -> u64 {
    60
}

// =============================================================================
// Retry and webhook
// =============================================================================

/// Retry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Initial delay between retries in milliseconds.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Exponential backoff multiplier.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryConfig {
    /// Converts to the framework retry policy.
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            multiplier: self.backoff_multiplier,
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    200
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

/// Push endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSettings {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    pub port: u16,

    /// Route the platform posts to.
    #[serde(default = "default_webhook_path")]
    pub path: String,

    /// Shared secret expected in the `x-courier-secret` header.
    #[serde(default)]
    pub secret: Option<String>,
}

impl WebhookSettings {
    /// `host:port` to bind.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_webhook_path() -> String {
    "/updates".to_string()
}
