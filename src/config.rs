//! Engine configuration
//!
//! All tunables of the selection engine live here. Values can be loaded from a
//! JSON file; any field left out falls back to its default.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SdkError;

/// Concurrent probes by default; covers a whole public feed in one wave
pub const DEFAULT_PROBE_BATCH_SIZE: usize = 256;

/// Public relay list (CSV)
pub const DEFAULT_FEED_URL: &str = "https://www.vpngate.net/api/iphone/";

/// Suffix appended to bare hostnames from the feed
pub const DEFAULT_DOMAIN_SUFFIX: &str = ".opengw.net";

/// Hard retry budget for one connect sequence
pub const MAX_CONNECT_ATTEMPTS: u32 = 15;

/// Cache TTL in seconds (4 hours)
pub const CACHE_TTL_SECONDS: i64 = 4 * 3600;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    pub feed_url: String,
    pub domain_suffix: String,
    /// TCP port probed for latency
    pub probe_port: u16,
    pub full_probe_timeout_ms: u64,
    pub rapid_probe_timeout_ms: u64,
    /// Upper bound on probes in flight at once. A probe run over N candidates
    /// takes about `ceil(N / probe_batch_size)` probe timeouts, so this must
    /// stay above the feed size (public feeds list 100-200 relays) for a run
    /// to finish within one timeout. Lower it only to save sockets.
    pub probe_batch_size: usize,
    pub attempt_timeout_ms: u64,
    pub max_attempts: u32,
    /// Candidates re-probed before each failover pick
    pub failover_probe_batch: usize,
    pub failover_enabled: bool,
    pub cache_ttl_secs: i64,
    pub idle_refresh_cooldown_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            feed_url: DEFAULT_FEED_URL.to_string(),
            domain_suffix: DEFAULT_DOMAIN_SUFFIX.to_string(),
            probe_port: 443,
            full_probe_timeout_ms: 3000,
            rapid_probe_timeout_ms: 800,
            probe_batch_size: DEFAULT_PROBE_BATCH_SIZE,
            attempt_timeout_ms: 20_000,
            max_attempts: MAX_CONNECT_ATTEMPTS,
            failover_probe_batch: 8,
            failover_enabled: true,
            cache_ttl_secs: CACHE_TTL_SECONDS,
            idle_refresh_cooldown_secs: 60,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file and validate it.
    pub fn load(path: &Path) -> Result<Self, SdkError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SdkError::Config(format!("Failed to read {:?}: {}", path, e)))?;
        let config: EngineConfig = serde_json::from_str(&content)
            .map_err(|e| SdkError::Config(format!("Failed to parse {:?}: {}", path, e)))?;
        config.validate()?;
        log::info!("Loaded engine config from {:?}", path);
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SdkError> {
        if self.feed_url.trim().is_empty() {
            return Err(SdkError::Config("feedUrl must not be empty".into()));
        }
        if self.full_probe_timeout_ms == 0 || self.rapid_probe_timeout_ms == 0 {
            return Err(SdkError::Config("probe timeouts must be positive".into()));
        }
        if self.attempt_timeout_ms == 0 {
            return Err(SdkError::Config("attemptTimeoutMs must be positive".into()));
        }
        if self.max_attempts == 0 || self.max_attempts > MAX_CONNECT_ATTEMPTS {
            return Err(SdkError::Config(format!(
                "maxAttempts must be within 1..={}",
                MAX_CONNECT_ATTEMPTS
            )));
        }
        if self.probe_batch_size == 0 || self.failover_probe_batch == 0 {
            return Err(SdkError::Config("batch sizes must be positive".into()));
        }
        if self.cache_ttl_secs <= 0 {
            return Err(SdkError::Config("cacheTtlSecs must be positive".into()));
        }
        Ok(())
    }

    pub fn full_probe_timeout(&self) -> Duration {
        Duration::from_millis(self.full_probe_timeout_ms)
    }

    pub fn rapid_probe_timeout(&self) -> Duration {
        Duration::from_millis(self.rapid_probe_timeout_ms)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn idle_refresh_cooldown(&self) -> Duration {
        Duration::from_secs(self.idle_refresh_cooldown_secs)
    }
}
