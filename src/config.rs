//! Broker configuration
//!
//! Every field has a default, so an empty TOML document is a valid
//! configuration. Files are validated on load.

use crate::protocol::messages::Priority;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Upper bound for any computed retry delay
const MAX_RETRY_DELAY_MS: u64 = 60_000;

/// Longest accepted interval between worker health checks (one day)
const MAX_HEALTH_CHECK_INTERVAL_SEC: f64 = 86_400.0;

/// What `send` does when the queue is at capacity
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackpressurePolicy {
    /// Return `false` immediately
    #[default]
    Reject,
    /// Wait for space up to `send_timeout_ms`
    Block,
}

/// How the delay before a retry grows with `retry_count`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// `retry_backoff_ms` every time
    Fixed,
    /// `retry_backoff_ms * retry_count`
    #[default]
    Linear,
    /// `retry_backoff_ms * 2^(retry_count - 1)`
    Exponential,
}

/// Broker configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BrokerConfig {
    /// Number of worker tasks draining the queue
    pub num_workers: usize,
    pub enable_batching: bool,
    pub batch_size: usize,
    /// Maximum time spent collecting one batch
    pub batch_timeout_ms: u64,
    /// Hard queue capacity
    pub max_queue_size: usize,
    /// Utilization (0, 1] at which statistics report `queue_warning`
    pub queue_warning_threshold: f64,
    /// Deliveries in flight per worker
    pub delivery_parallelism: usize,
    pub retry_max_attempts: u32,
    pub retry_backoff_ms: u64,
    pub retry_backoff: BackoffStrategy,
    /// Messages below this priority are dead-lettered on first failure
    pub retry_min_priority: Priority,
    pub worker_health_check_interval_sec: f64,
    pub worker_restart_on_failure: bool,
    /// Consecutive failed deliveries after which a worker reports itself unhealthy
    pub max_consecutive_errors: u32,
    pub backpressure: BackpressurePolicy,
    /// Wait bound for `send` under the blocking policy
    pub send_timeout_ms: u64,
    pub default_request_timeout_ms: u64,
    /// Oldest dead letters are evicted beyond this size
    pub dead_letter_max_size: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            num_workers: 3,
            enable_batching: true,
            batch_size: 10,
            batch_timeout_ms: 50,
            max_queue_size: 10_000,
            queue_warning_threshold: 0.8,
            delivery_parallelism: 5,
            retry_max_attempts: 3,
            retry_backoff_ms: 100,
            retry_backoff: BackoffStrategy::Linear,
            retry_min_priority: Priority::Low,
            worker_health_check_interval_sec: 30.0,
            worker_restart_on_failure: true,
            max_consecutive_errors: 50,
            backpressure: BackpressurePolicy::Reject,
            send_timeout_ms: 5_000,
            default_request_timeout_ms: 30_000,
            dead_letter_max_size: 1_000,
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl BrokerConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: BrokerConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_workers == 0 {
            return Err(invalid("num_workers must be at least 1"));
        }
        if self.batch_size == 0 {
            return Err(invalid("batch_size must be at least 1"));
        }
        if self.batch_timeout_ms == 0 {
            return Err(invalid("batch_timeout_ms must be greater than 0"));
        }
        if self.delivery_parallelism == 0 {
            return Err(invalid("delivery_parallelism must be at least 1"));
        }
        if self.max_queue_size == 0 {
            return Err(invalid("max_queue_size must be at least 1"));
        }
        if !(self.queue_warning_threshold > 0.0 && self.queue_warning_threshold <= 1.0) {
            return Err(invalid(format!(
                "queue_warning_threshold must be in (0, 1], got {}",
                self.queue_warning_threshold
            )));
        }
        if !(self.worker_health_check_interval_sec > 0.0
            && self.worker_health_check_interval_sec <= MAX_HEALTH_CHECK_INTERVAL_SEC)
        {
            return Err(invalid(format!(
                "worker_health_check_interval_sec must be in (0, {MAX_HEALTH_CHECK_INTERVAL_SEC}], got {}",
                self.worker_health_check_interval_sec
            )));
        }
        if self.max_consecutive_errors == 0 {
            return Err(invalid("max_consecutive_errors must be at least 1"));
        }
        if self.dead_letter_max_size == 0 {
            return Err(invalid("dead_letter_max_size must be at least 1"));
        }
        Ok(())
    }

    /// Delay before the attempt numbered `retry_count` (1-based)
    pub fn retry_delay(&self, retry_count: u32) -> Duration {
        let attempt = u64::from(retry_count.max(1));
        let millis = match self.retry_backoff {
            BackoffStrategy::Fixed => self.retry_backoff_ms,
            BackoffStrategy::Linear => self.retry_backoff_ms.saturating_mul(attempt),
            BackoffStrategy::Exponential => {
                let factor = 1u64.checked_shl((attempt - 1) as u32).unwrap_or(u64::MAX);
                self.retry_backoff_ms.saturating_mul(factor)
            }
        };
        Duration::from_millis(millis.min(MAX_RETRY_DELAY_MS))
    }

    /// Whether a message at `priority` may be retried at all
    pub fn retry_allowed(&self, priority: Priority) -> bool {
        priority >= self.retry_min_priority
    }

    /// Interval between health checks, clamped to the accepted range
    pub fn health_check_interval(&self) -> Duration {
        let max = Duration::from_secs_f64(MAX_HEALTH_CHECK_INTERVAL_SEC);
        Duration::try_from_secs_f64(self.worker_health_check_interval_sec)
            .map_or(max, |interval| interval.min(max))
    }

    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn default_request_timeout(&self) -> Duration {
        Duration::from_millis(self.default_request_timeout_ms)
    }

    /// Effective batch size: 1 when batching is disabled
    pub fn effective_batch_size(&self) -> usize {
        if self.enable_batching {
            self.batch_size
        } else {
            1
        }
    }

    /// Small, fast-cycling configuration for tests
    pub fn for_testing() -> Self {
        Self {
            num_workers: 2,
            batch_size: 5,
            batch_timeout_ms: 10,
            max_queue_size: 1_000,
            retry_backoff_ms: 10,
            worker_health_check_interval_sec: 0.1,
            default_request_timeout_ms: 2_000,
            ..Self::default()
        }
    }
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidConfig(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = BrokerConfig::from_toml_str("").unwrap();
        assert_eq!(config, BrokerConfig::default());
        assert_eq!(config.num_workers, 3);
        assert_eq!(config.max_queue_size, 10_000);
        assert_eq!(config.retry_max_attempts, 3);
        assert_eq!(config.backpressure, BackpressurePolicy::Reject);
        assert_eq!(config.retry_min_priority, Priority::Low);
    }

    #[test]
    fn test_full_config() {
        let toml_content = r#"
num_workers = 4
enable_batching = false
batch_size = 20
batch_timeout_ms = 100
max_queue_size = 500
queue_warning_threshold = 0.9
delivery_parallelism = 8
retry_max_attempts = 5
retry_backoff_ms = 250
retry_backoff = "exponential"
retry_min_priority = "high"
worker_health_check_interval_sec = 2.5
worker_restart_on_failure = false
backpressure = "block"
send_timeout_ms = 1000
"#;

        let config = BrokerConfig::from_toml_str(toml_content).unwrap();
        assert_eq!(config.num_workers, 4);
        assert!(!config.enable_batching);
        assert_eq!(config.effective_batch_size(), 1);
        assert_eq!(config.retry_backoff, BackoffStrategy::Exponential);
        assert_eq!(config.retry_min_priority, Priority::High);
        assert_eq!(config.backpressure, BackpressurePolicy::Block);
        assert_eq!(config.health_check_interval(), Duration::from_millis(2500));
        assert!(!config.worker_restart_on_failure);
    }

    #[test]
    fn test_priority_accepts_integer_level() {
        let config = BrokerConfig::from_toml_str("retry_min_priority = 3").unwrap();
        assert_eq!(config.retry_min_priority, Priority::High);
    }

    #[test]
    fn test_invalid_values_rejected() {
        for bad in [
            "num_workers = 0",
            "batch_size = 0",
            "batch_timeout_ms = 0",
            "delivery_parallelism = 0",
            "max_queue_size = 0",
            "queue_warning_threshold = 1.5",
            "queue_warning_threshold = 0.0",
            "worker_health_check_interval_sec = 0.0",
            "worker_health_check_interval_sec = 1e300",
            "worker_health_check_interval_sec = inf",
            "worker_health_check_interval_sec = nan",
            "max_consecutive_errors = 0",
        ] {
            let result = BrokerConfig::from_toml_str(bad);
            assert!(
                matches!(result, Err(ConfigError::InvalidConfig(_))),
                "expected rejection for {bad}"
            );
        }
    }

    #[test]
    fn test_health_check_interval_never_panics() {
        let config = BrokerConfig {
            worker_health_check_interval_sec: 1e300,
            ..BrokerConfig::default()
        };
        assert!(config.validate().is_err());
        assert_eq!(config.health_check_interval(), Duration::from_secs(86_400));
    }

    #[test]
    fn test_malformed_toml_is_parse_error() {
        let result = BrokerConfig::from_toml_str("num_workers = ");
        assert!(matches!(result, Err(ConfigError::TomlParse(_))));

        let result = BrokerConfig::from_toml_str("backpressure = \"drop\"");
        assert!(matches!(result, Err(ConfigError::TomlParse(_))));
    }

    #[test]
    fn test_linear_retry_delay() {
        let config = BrokerConfig::default();
        assert_eq!(config.retry_delay(1), Duration::from_millis(100));
        assert_eq!(config.retry_delay(3), Duration::from_millis(300));
    }

    #[test]
    fn test_fixed_and_exponential_retry_delay() {
        let mut config = BrokerConfig {
            retry_backoff: BackoffStrategy::Fixed,
            ..BrokerConfig::default()
        };
        assert_eq!(config.retry_delay(3), Duration::from_millis(100));

        config.retry_backoff = BackoffStrategy::Exponential;
        assert_eq!(config.retry_delay(1), Duration::from_millis(100));
        assert_eq!(config.retry_delay(2), Duration::from_millis(200));
        assert_eq!(config.retry_delay(4), Duration::from_millis(800));
        assert_eq!(config.retry_delay(200), Duration::from_millis(60_000));
    }

    #[test]
    fn test_retry_priority_gate() {
        let config = BrokerConfig {
            retry_min_priority: Priority::High,
            ..BrokerConfig::default()
        };
        assert!(config.retry_allowed(Priority::Urgent));
        assert!(config.retry_allowed(Priority::High));
        assert!(!config.retry_allowed(Priority::Normal));
        assert!(BrokerConfig::default().retry_allowed(Priority::Low));
    }

    #[test]
    fn test_testing_profile_is_valid() {
        assert!(BrokerConfig::for_testing().validate().is_ok());
    }
}
