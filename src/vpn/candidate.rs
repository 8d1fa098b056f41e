//! Candidate data model
//!
//! A candidate is one relay endpoint from the feed, plus whatever latency we
//! measured against it. `quality_score` is derived at ranking time and never
//! persisted.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Latency value for a candidate that has not been measured (or was unreachable).
pub const LATENCY_NOT_MEASURED: i64 = -1;

/// Latency value while a probe is in flight.
pub const LATENCY_IN_FLIGHT: i64 = 0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub hostname: String,
    pub ip: String,
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub country_code: String,
    #[serde(default)]
    pub speed_bps: u64,
    #[serde(default)]
    pub session_count: u64,
    #[serde(default)]
    pub is_pool_tagged: bool,
    #[serde(default = "not_measured")]
    pub measured_latency_ms: i64,
    /// Position in the feed; the stable tie-break for ranking
    #[serde(default)]
    pub feed_order: u32,
    /// Feed-reported ping (legacy layout only, informational)
    #[serde(default)]
    pub feed_ping_ms: u64,
    #[serde(default)]
    pub uptime_ms: u64,
    #[serde(default)]
    pub total_users: u64,
    #[serde(default)]
    pub total_traffic: u64,
    #[serde(skip)]
    pub quality_score: f64,
}

fn not_measured() -> i64 {
    LATENCY_NOT_MEASURED
}

impl Candidate {
    pub fn new(hostname: impl Into<String>, ip: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            ip: ip.into(),
            country: String::new(),
            country_code: String::new(),
            speed_bps: 0,
            session_count: 0,
            is_pool_tagged: false,
            measured_latency_ms: LATENCY_NOT_MEASURED,
            feed_order: 0,
            feed_ping_ms: 0,
            uptime_ms: 0,
            total_users: 0,
            total_traffic: 0,
            quality_score: 0.0,
        }
    }

    /// True once a probe measured a real (positive) latency.
    pub fn is_reachable(&self) -> bool {
        self.measured_latency_ms > 0
    }

    pub fn is_probing(&self) -> bool {
        self.measured_latency_ms == LATENCY_IN_FLIGHT
    }
}

/// Ordered collection of candidates. Order is presentation only.
pub type CandidateSet = Vec<Candidate>;

/// Hostnames that completed a full tunnel establishment before.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuccessHistory {
    pub successful_hostnames: BTreeSet<String>,
    pub last_successful: Option<String>,
}

impl SuccessHistory {
    pub fn contains(&self, hostname: &str) -> bool {
        self.successful_hostnames.contains(hostname)
    }

    pub fn record(&mut self, hostname: &str) {
        self.successful_hostnames.insert(hostname.to_string());
        self.last_successful = Some(hostname.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reachability_follows_latency_sentinels() {
        let mut c = Candidate::new("a.opengw.net", "1.2.3.4");
        assert!(!c.is_reachable());
        c.measured_latency_ms = LATENCY_IN_FLIGHT;
        assert!(c.is_probing());
        assert!(!c.is_reachable());
        c.measured_latency_ms = 42;
        assert!(c.is_reachable());
    }

    #[test]
    fn quality_score_is_not_serialized() {
        let mut c = Candidate::new("a.opengw.net", "1.2.3.4");
        c.quality_score = 99.0;
        let json = serde_json::to_string(&c).unwrap();
        assert!(!json.contains("qualityScore"));
        let back: Candidate = serde_json::from_str(&json).unwrap();
        assert_eq!(back.quality_score, 0.0);
    }

    #[test]
    fn missing_latency_deserializes_as_not_measured() {
        let c: Candidate =
            serde_json::from_str(r#"{"hostname":"a.opengw.net","ip":"1.2.3.4"}"#).unwrap();
        assert_eq!(c.measured_latency_ms, LATENCY_NOT_MEASURED);
    }

    #[test]
    fn history_record_overwrites_last_successful() {
        let mut history = SuccessHistory::default();
        history.record("a");
        history.record("b");
        assert_eq!(history.last_successful.as_deref(), Some("b"));
        assert!(history.contains("a") && history.contains("b"));
    }
}
