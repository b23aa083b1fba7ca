//! Sync engine configuration
//!
//! Every timing and sizing knob of the engine is supplied from outside.
//! [`SyncConfig::from_env`] reads `SYNC_*` variables (durations in
//! milliseconds) on top of the defaults.

use std::env;
use std::time::Duration;

use url::Url;

use crate::backoff::BackoffPolicy;

const DEFAULT_STREAM_URL: &str = "ws://127.0.0.1:9400/stream";

/// Configuration for the sync engine
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Streaming endpoint
    pub stream_url: Url,
    /// Base URL of the REST snapshot endpoint (optional)
    pub snapshot_url: Option<Url>,
    /// API key presented on connect
    pub api_key: Option<String>,
    /// How long a connection attempt may take before it is abandoned
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    /// Shared by reconnects, subscribe retries and resync retries
    pub backoff: BackoffPolicy,
    pub max_subscribe_attempts: u32,
    pub resync_timeout: Duration,
    pub max_resync_attempts: u32,
    pub optimistic_timeout: Duration,
    pub flash_duration: Duration,
    /// How long a topic with no subscribers lingers before teardown
    pub teardown_debounce: Duration,
    /// Bound of the per-connection inbound queue
    pub inbound_capacity: usize,
    /// Queue length at which consecutive deltas start being coalesced
    pub coalesce_watermark: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            stream_url: default_stream_url(),
            snapshot_url: None,
            api_key: None,
            connect_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(5),
            backoff: BackoffPolicy::default(),
            max_subscribe_attempts: 5,
            resync_timeout: Duration::from_secs(5),
            max_resync_attempts: 5,
            optimistic_timeout: Duration::from_secs(10),
            flash_duration: Duration::from_millis(800),
            teardown_debounce: Duration::from_millis(250),
            inbound_capacity: 4096,
            coalesce_watermark: 3072,
        }
    }
}

impl SyncConfig {
    /// Load configuration from `SYNC_*` environment variables
    ///
    /// Recognized variables:
    /// - `SYNC_STREAM_URL`, `SYNC_SNAPSHOT_URL`, `SYNC_API_KEY`
    /// - `SYNC_CONNECT_TIMEOUT_MS`, `SYNC_HEARTBEAT_INTERVAL_MS`, `SYNC_HEARTBEAT_TIMEOUT_MS`
    /// - `SYNC_BACKOFF_BASE_MS`, `SYNC_BACKOFF_CAP_MS`, `SYNC_BACKOFF_JITTER`
    /// - `SYNC_MAX_SUBSCRIBE_ATTEMPTS`, `SYNC_RESYNC_TIMEOUT_MS`, `SYNC_MAX_RESYNC_ATTEMPTS`
    /// - `SYNC_OPTIMISTIC_TIMEOUT_MS`, `SYNC_FLASH_DURATION_MS`, `SYNC_TEARDOWN_DEBOUNCE_MS`
    /// - `SYNC_INBOUND_CAPACITY`, `SYNC_COALESCE_WATERMARK`
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(raw) = var("SYNC_STREAM_URL") {
            config.stream_url = parse_url("SYNC_STREAM_URL", &raw)?;
        }
        if let Some(raw) = var("SYNC_SNAPSHOT_URL") {
            config.snapshot_url = Some(parse_url("SYNC_SNAPSHOT_URL", &raw)?);
        }
        config.api_key = var("SYNC_API_KEY");

        override_ms("SYNC_CONNECT_TIMEOUT_MS", &mut config.connect_timeout)?;
        override_ms("SYNC_HEARTBEAT_INTERVAL_MS", &mut config.heartbeat_interval)?;
        override_ms("SYNC_HEARTBEAT_TIMEOUT_MS", &mut config.heartbeat_timeout)?;
        override_ms("SYNC_BACKOFF_BASE_MS", &mut config.backoff.base)?;
        override_ms("SYNC_BACKOFF_CAP_MS", &mut config.backoff.cap)?;
        override_parsed("SYNC_BACKOFF_JITTER", &mut config.backoff.jitter)?;
        override_parsed("SYNC_MAX_SUBSCRIBE_ATTEMPTS", &mut config.max_subscribe_attempts)?;
        override_ms("SYNC_RESYNC_TIMEOUT_MS", &mut config.resync_timeout)?;
        override_parsed("SYNC_MAX_RESYNC_ATTEMPTS", &mut config.max_resync_attempts)?;
        override_ms("SYNC_OPTIMISTIC_TIMEOUT_MS", &mut config.optimistic_timeout)?;
        override_ms("SYNC_FLASH_DURATION_MS", &mut config.flash_duration)?;
        override_ms("SYNC_TEARDOWN_DEBOUNCE_MS", &mut config.teardown_debounce)?;
        override_parsed("SYNC_INBOUND_CAPACITY", &mut config.inbound_capacity)?;
        override_parsed("SYNC_COALESCE_WATERMARK", &mut config.coalesce_watermark)?;

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::Invalid {
                field: "heartbeat_interval".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                field: "connect_timeout".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        if self.backoff.base.is_zero() || self.backoff.cap < self.backoff.base {
            return Err(ConfigError::Invalid {
                field: "backoff".to_string(),
                reason: "base must be positive and not above cap".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.backoff.jitter) {
            return Err(ConfigError::Invalid {
                field: "backoff.jitter".to_string(),
                reason: "must be within [0, 1]".to_string(),
            });
        }
        if self.inbound_capacity == 0 || self.coalesce_watermark > self.inbound_capacity {
            return Err(ConfigError::Invalid {
                field: "coalesce_watermark".to_string(),
                reason: "capacity must be positive and at least the watermark".to_string(),
            });
        }
        Ok(())
    }
}

fn default_stream_url() -> Url {
    // Constant URL, always parses
    Url::parse(DEFAULT_STREAM_URL).unwrap_or_else(|_| unreachable!("default stream URL is valid"))
}

fn var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_url(field: &str, raw: &str) -> Result<Url, ConfigError> {
    Url::parse(raw).map_err(|e| ConfigError::Invalid {
        field: field.to_string(),
        reason: e.to_string(),
    })
}

fn override_ms(name: &str, target: &mut Duration) -> Result<(), ConfigError> {
    let mut ms = target.as_millis() as u64;
    override_parsed(name, &mut ms)?;
    *target = Duration::from_millis(ms);
    Ok(())
}

fn override_parsed<T: std::str::FromStr>(name: &str, target: &mut T) -> Result<(), ConfigError>
where
    T::Err: std::fmt::Display,
{
    if let Some(raw) = var(name) {
        *target = raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            field: name.to_string(),
            reason: e.to_string(),
        })?;
    }
    Ok(())
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = SyncConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.stream_url.as_str(), DEFAULT_STREAM_URL);
    }

    #[test]
    fn test_rejects_watermark_above_capacity() {
        let config = SyncConfig {
            inbound_capacity: 10,
            coalesce_watermark: 11,
            ..SyncConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_rejects_cap_below_base() {
        let mut config = SyncConfig::default();
        config.backoff.cap = Duration::from_millis(10);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_override_parsed_reports_field() {
        // Variable name is unique to this test so parallel tests don't collide
        env::set_var("SYNC_TEST_BAD_NUMBER", "not-a-number");
        let mut value = 3u32;
        let err = override_parsed("SYNC_TEST_BAD_NUMBER", &mut value).unwrap_err();
        assert!(err.to_string().contains("SYNC_TEST_BAD_NUMBER"));
        assert_eq!(value, 3);
        env::remove_var("SYNC_TEST_BAD_NUMBER");
    }
}
