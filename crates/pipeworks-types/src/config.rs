//! Global configuration types for Pipeworks.
//!
//! `GlobalConfig` represents the top-level `config.toml` in the data directory.
//! Every section is optional; missing keys fall back to their defaults.

use serde::{Deserialize, Serialize};

use crate::throttle::{MonitorConfig, RetryConfig, ThrottleConfig, UpstreamConfig};

/// Top-level configuration for Pipeworks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalConfig {
    #[serde(default)]
    pub throttle: ThrottleConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub monitor: MonitorConfig,

    #[serde(default)]
    pub upstream: UpstreamConfig,
}
