//! Circuit breaker thresholds.

use std::time::Duration;

use duration_str::deserialize_duration;
use serde::Deserialize;

/// Thresholds for the per-provider circuit breaker.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BreakerConfig {
    /// The breaker opens once the failure ratio in the trailing window exceeds this, in [0.0, 1.0).
    pub failure_threshold: f64,
    /// Length of the trailing outcome window.
    #[serde(deserialize_with = "deserialize_duration")]
    pub window: Duration,
    /// Minimum outcomes in the window before the ratio is considered.
    pub min_requests: u32,
    /// Time an open breaker waits before admitting a probe.
    #[serde(deserialize_with = "deserialize_duration")]
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 0.5,
            window: Duration::from_secs(60),
            min_requests: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}
