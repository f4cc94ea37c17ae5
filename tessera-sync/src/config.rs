//! Tunables for one sync core.

use std::time::Duration;

use crate::error::SyncError;

/// Sync core configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Quiet period after the last update before the cold tier is written.
    pub debounce: Duration,
    /// Lifetime of warm-tier snapshots, refreshed on every update.
    pub warm_ttl: Duration,
    /// Lifetime of the warm snapshot written after a failed durable write.
    pub fallback_ttl: Duration,
    /// Retained history and replay entries per document.
    pub history_limit: usize,
    /// Consecutive persistence failures before an operator alert is logged.
    pub persist_alert_threshold: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_secs(5),
            warm_ttl: Duration::from_secs(60 * 60),
            fallback_ttl: Duration::from_secs(24 * 60 * 60),
            history_limit: 100,
            persist_alert_threshold: 5,
        }
    }
}

impl SyncConfig {
    /// Config for testing (short debounce, small history).
    pub fn for_testing() -> Self {
        Self {
            debounce: Duration::from_millis(50),
            warm_ttl: Duration::from_secs(60),
            fallback_ttl: Duration::from_secs(600),
            history_limit: 10,
            persist_alert_threshold: 3,
        }
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        if self.history_limit == 0 {
            return Err(SyncError::Config("history_limit must be at least 1".into()));
        }
        if self.debounce.is_zero() {
            return Err(SyncError::Config("debounce must be non-zero".into()));
        }
        if self.fallback_ttl < self.warm_ttl {
            return Err(SyncError::Config(
                "fallback_ttl must not be shorter than warm_ttl".into(),
            ));
        }
        Ok(())
    }
}
