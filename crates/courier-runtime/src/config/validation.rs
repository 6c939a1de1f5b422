//! Configuration validation utilities.

use super::error::{ConfigError, ConfigResult};
use super::schema::{
    BroadcastSettings, CourierConfig, DispatcherSettings, LogFormat, LogOutput, LoggingConfig,
    RateLimitSettings, RetryConfig, SessionBackend, SessionsConfig, WebhookSettings,
};

/// Longest accepted `rate_limit.acquire_timeout_ms` (one day).
const MAX_ACQUIRE_TIMEOUT_MS: u64 = 24 * 60 * 60 * 1000;

/// Longest accepted `rate_limit.per_chat_interval_ms` (one hour).
const MAX_PER_CHAT_INTERVAL_MS: u64 = 60 * 60 * 1000;

/// Validates the entire configuration.
pub fn validate_config(config: &CourierConfig) -> ConfigResult<()> {
    validate_logging(&config.logging)?;
    validate_rate_limit(&config.rate_limit)?;
    validate_dispatcher(&config.dispatcher)?;
    validate_broadcast(&config.broadcast)?;
    validate_sessions(&config.sessions)?;
    validate_retry_config(&config.retry)?;
    if let Some(webhook) = &config.webhook {
        validate_webhook(webhook)?;
    }
    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> ConfigResult<()> {
    if logging.output == LogOutput::File && logging.file_path.is_none() {
        return Err(ConfigError::validation(
            "logging.file_path is required when logging.output is \"file\"",
        ));
    }

    if logging.format == LogFormat::Json && !cfg!(feature = "json-log") {
        return Err(ConfigError::FeatureDisabled {
            setting: "logging.format = \"json\"",
            feature: "json-log",
        });
    }

    Ok(())
}

fn validate_rate_limit(rate_limit: &RateLimitSettings) -> ConfigResult<()> {
    if !(rate_limit.global_rate.is_finite() && rate_limit.global_rate > 0.0) {
        return Err(ConfigError::validation(format!(
            "rate_limit.global_rate must be a positive number, got {}",
            rate_limit.global_rate
        )));
    }

    if rate_limit.burst == 0 {
        return Err(ConfigError::validation("rate_limit.burst must be at least 1"));
    }

    if rate_limit.per_chat_interval_ms > 0 && rate_limit.per_chat_queue_depth == 0 {
        return Err(ConfigError::validation(
            "rate_limit.per_chat_queue_depth must be at least 1 when the per-chat gate is enabled",
        ));
    }

    if rate_limit.acquire_timeout_ms == 0 || rate_limit.acquire_timeout_ms > MAX_ACQUIRE_TIMEOUT_MS {
        return Err(ConfigError::validation(format!(
            "rate_limit.acquire_timeout_ms must be between 1 and {MAX_ACQUIRE_TIMEOUT_MS}, got {}",
            rate_limit.acquire_timeout_ms
        )));
    }

    if rate_limit.per_chat_interval_ms > MAX_PER_CHAT_INTERVAL_MS {
        return Err(ConfigError::validation(format!(
            "rate_limit.per_chat_interval_ms must be at most {MAX_PER_CHAT_INTERVAL_MS}, got {}",
            rate_limit.per_chat_interval_ms
        )));
    }

    Ok(())
}

fn validate_dispatcher(dispatcher: &DispatcherSettings) -> ConfigResult<()> {
    let windows = [
        ("dispatcher.dedup_window", dispatcher.dedup_window),
        ("dispatcher.batch_size", dispatcher.batch_size),
        ("dispatcher.max_parallel_users", dispatcher.max_parallel_users),
        ("dispatcher.replay_capacity", dispatcher.replay_capacity),
    ];
    for (name, value) in windows {
        if value == 0 {
            return Err(ConfigError::validation(format!("{name} must be greater than 0")));
        }
    }
    Ok(())
}

fn validate_broadcast(broadcast: &BroadcastSettings) -> ConfigResult<()> {
    if broadcast.concurrency == 0 {
        return Err(ConfigError::validation(
            "broadcast.concurrency must be greater than 0",
        ));
    }

    if broadcast.systemic_abort_threshold == 0 {
        return Err(ConfigError::validation(
            "broadcast.systemic_abort_threshold must be greater than 0",
        ));
    }

    Ok(())
}

fn validate_sessions(sessions: &SessionsConfig) -> ConfigResult<()> {
    if sessions.timeout_minutes == 0 {
        return Err(ConfigError::validation(
            "sessions.timeout_minutes must be greater than 0",
        ));
    }

    if let SessionBackend::Sqlite { url } = &sessions.backend {
        if !cfg!(feature = "sqlite") {
            return Err(ConfigError::FeatureDisabled {
                setting: "sessions.backend = sqlite",
                feature: "sqlite",
            });
        }
        if !url.starts_with("sqlite:") {
            return Err(ConfigError::validation(format!(
                "sessions.backend.url must start with \"sqlite:\", got {url:?}"
            )));
        }
    }

    Ok(())
}

/// Validates retry configuration.
fn validate_retry_config(retry: &RetryConfig) -> ConfigResult<()> {
    if retry.initial_delay_ms == 0 {
        return Err(ConfigError::validation(
            "Initial retry delay must be greater than 0",
        ));
    }

    if retry.max_delay_ms < retry.initial_delay_ms {
        return Err(ConfigError::validation(
            "Max retry delay must be greater than or equal to initial delay",
        ));
    }

    if retry.backoff_multiplier.is_nan() || retry.backoff_multiplier < 1.0 {
        return Err(ConfigError::validation(
            "Backoff multiplier must be at least 1.0",
        ));
    }

    Ok(())
}

fn validate_webhook(webhook: &WebhookSettings) -> ConfigResult<()> {
    if !cfg!(feature = "webhook") {
        return Err(ConfigError::FeatureDisabled {
            setting: "webhook",
            feature: "webhook",
        });
    }

    if webhook.port == 0 {
        return Err(ConfigError::validation("webhook.port must not be 0"));
    }

    if !webhook.path.starts_with('/') {
        return Err(ConfigError::validation(format!(
            "webhook.path must start with '/', got {:?}",
            webhook.path
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(validate_config(&CourierConfig::default()).is_ok());
    }

    #[test]
    fn test_retry_delay_ordering() {
        let mut config = CourierConfig::default();
        config.retry.initial_delay_ms = 500;
        config.retry.max_delay_ms = 100;
        assert!(validate_config(&config).is_err());

        config.retry.max_delay_ms = 500;
        config.retry.backoff_multiplier = 0.5;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_zero_windows_rejected() {
        let mut config = CourierConfig::default();
        config.dispatcher.dedup_window = 0;
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("dispatcher.dedup_window"));
    }

    #[test]
    fn test_file_output_needs_path() {
        let mut config = CourierConfig::default();
        config.logging.output = LogOutput::File;
        assert!(validate_config(&config).is_err());
        config.logging.file_path = Some("courier.log".into());
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_rate_limit_durations_are_capped() {
        let mut config = CourierConfig::default();
        config.rate_limit.acquire_timeout_ms = u64::MAX;
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("rate_limit.acquire_timeout_ms"));

        config.rate_limit.acquire_timeout_ms = MAX_ACQUIRE_TIMEOUT_MS;
        assert!(validate_config(&config).is_ok());

        config.rate_limit.per_chat_interval_ms = u64::MAX;
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("rate_limit.per_chat_interval_ms"));
    }

    #[test]
    fn test_per_chat_gate_can_be_disabled() {
        let mut config = CourierConfig::default();
        config.rate_limit.per_chat_interval_ms = 0;
        config.rate_limit.per_chat_queue_depth = 0;
        assert!(validate_config(&config).is_ok());
    }
}
