//! Throttling, retry and monitoring configuration.
//!
//! These are plain serde structs with defaults matching the upstream services
//! Pipeworks was tuned against: at most 10 requests in flight, a 35 second
//! latency ceiling that triggers a 35 second collective cool-down, and a
//! retry budget of 5 attempts spaced 31 seconds apart.

use std::time::Duration;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// ThrottleConfig
// ---------------------------------------------------------------------------

/// Backpressure settings shared by every tracked rate limiter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThrottleConfig {
    /// Maximum number of tracked requests in flight at once.
    #[serde(default = "default_max_active_requests")]
    pub max_active_requests: u64,

    /// A single request slower than this sets the anomaly flag.
    #[serde(default = "default_anomaly_threshold_secs")]
    pub anomaly_threshold_secs: u64,

    /// Length of the collective pause once the anomaly flag is set.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,

    /// Poll step while waiting for in-flight capacity.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_max_active_requests() -> u64 {
    10
}

fn default_anomaly_threshold_secs() -> u64 {
    35
}

fn default_cooldown_secs() -> u64 {
    35
}

fn default_poll_interval_ms() -> u64 {
    300
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            max_active_requests: default_max_active_requests(),
            anomaly_threshold_secs: default_anomaly_threshold_secs(),
            cooldown_secs: default_cooldown_secs(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl ThrottleConfig {
    pub fn anomaly_threshold(&self) -> Duration {
        Duration::from_secs(self.anomaly_threshold_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

// ---------------------------------------------------------------------------
// RetryConfig
// ---------------------------------------------------------------------------

/// Retry budget for transient upstream responses (429 and 5xx).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Pause between attempts.
    #[serde(default = "default_backoff_secs")]
    pub backoff_secs: u64,

    /// Minimum spacing between retry wrapper entries (its own rate limit).
    #[serde(default = "default_retry_interval_ms")]
    pub interval_ms: u64,

    /// Throttle tag of the retry wrapper's own rate limiter.
    #[serde(default = "default_retry_tag")]
    pub tag: String,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_backoff_secs() -> u64 {
    31
}

fn default_retry_interval_ms() -> u64 {
    200
}

fn default_retry_tag() -> String {
    "repeats".to_string()
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_secs: default_backoff_secs(),
            interval_ms: default_retry_interval_ms(),
            tag: default_retry_tag(),
        }
    }
}

impl RetryConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_secs(self.backoff_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

// ---------------------------------------------------------------------------
// MonitorConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Sampling period of the progress monitor.
    #[serde(default = "default_monitor_interval_ms")]
    pub interval_ms: u64,
}

fn default_monitor_interval_ms() -> u64 {
    1000
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_monitor_interval_ms(),
        }
    }
}

impl MonitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

// ---------------------------------------------------------------------------
// UpstreamConfig
// ---------------------------------------------------------------------------

/// Settings for the rate-limited upstream HTTP client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Minimum spacing between requests sharing `tag` (100ms = 10 req/s).
    #[serde(default = "default_upstream_interval_ms")]
    pub interval_ms: u64,

    #[serde(default = "default_upstream_tag")]
    pub tag: String,

    /// Persist every response body under `requests/{execution_id}/`.
    #[serde(default = "default_record_responses")]
    pub record_responses: bool,
}

fn default_upstream_interval_ms() -> u64 {
    100
}

fn default_upstream_tag() -> String {
    "upstream".to_string()
}

fn default_record_responses() -> bool {
    true
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_upstream_interval_ms(),
            tag: default_upstream_tag(),
            record_responses: default_record_responses(),
        }
    }
}

impl UpstreamConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttle_defaults() {
        let config = ThrottleConfig::default();
        assert_eq!(config.max_active_requests, 10);
        assert_eq!(config.anomaly_threshold(), Duration::from_secs(35));
        assert_eq!(config.cooldown(), Duration::from_secs(35));
        assert_eq!(config.poll_interval(), Duration::from_millis(300));
    }

    #[test]
    fn retry_defaults() {
        let config = RetryConfig::default();
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.backoff(), Duration::from_secs(31));
        assert_eq!(config.interval(), Duration::from_millis(200));
        assert_eq!(config.tag, "repeats");
    }

    #[test]
    fn partial_toml_keeps_remaining_defaults() {
        let config: ThrottleConfig = toml::from_str("max_active_requests = 2").unwrap();
        assert_eq!(config.max_active_requests, 2);
        assert_eq!(config.cooldown_secs, 35);
    }
}
