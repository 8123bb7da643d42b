use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Broadcast tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    /// Timeout for one orchestrator round-trip.
    pub http_timeout_secs: u64,
    /// Nominal duration of one source segment.
    pub segment_duration_secs: u64,
    /// Initial pause between dispatch retries for one segment.
    pub retry_backoff_ms: u64,
    /// Upper bound the retry pause doubles toward.
    pub max_retry_backoff_ms: u64,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            http_timeout_secs: 8,
            segment_duration_secs: 2,
            retry_backoff_ms: 250,
            max_retry_backoff_ms: 2_000,
        }
    }
}

impl BroadcastConfig {
    #[must_use]
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    #[must_use]
    pub fn segment_duration(&self) -> Duration {
        Duration::from_secs(self.segment_duration_secs)
    }

    #[must_use]
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    #[must_use]
    pub fn max_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.max_retry_backoff_ms)
    }

    /// How many orchestrator sessions to hold for one stream: enough to keep
    /// twice the segments that can be in flight during one round-trip, capped
    /// by the discovery pool size.
    #[must_use]
    pub fn target_pool_size(&self, pool_size: usize) -> usize {
        let per_timeout =
            2.0 * self.http_timeout().as_secs_f64() / self.segment_duration().as_secs_f64();
        pool_size.min(per_timeout.ceil() as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BroadcastConfig::default();
        assert_eq!(config.http_timeout(), Duration::from_secs(8));
        assert_eq!(config.segment_duration(), Duration::from_secs(2));
        assert!(config.retry_backoff() < config.max_retry_backoff());
    }

    #[test]
    fn test_target_pool_size_caps_at_discovery_size() {
        let config = BroadcastConfig::default();
        // 2 * 8s / 2s = 8 target sessions
        assert_eq!(config.target_pool_size(100), 8);
        assert_eq!(config.target_pool_size(3), 3);
        assert_eq!(config.target_pool_size(0), 0);
    }

    #[test]
    fn test_target_pool_size_rounds_up() {
        let config = BroadcastConfig {
            http_timeout_secs: 5,
            segment_duration_secs: 3,
            ..BroadcastConfig::default()
        };
        // 2 * 5 / 3 = 3.33 -> 4
        assert_eq!(config.target_pool_size(100), 4);
    }
}
