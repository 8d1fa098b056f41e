//! Candidate feed parser
//!
//! The relay feed is CSV-like text framed by `*`-prefixed marker lines and a
//! `#`-prefixed header. Its column layout has changed over time, so each row is
//! dispatched on its column count:
//!
//! - legacy (11+ columns): `HostName,IP,Score,Ping,Speed,CountryLong,
//!   CountryShort,NumVpnSessions,Uptime,TotalUsers,TotalTraffic,...`
//! - compact (6 columns): `hostname,ip,speed,country,countryCode,sessions`
//!
//! Parsing never fails. Bad rows are skipped and counted.

use std::collections::HashSet;

use super::candidate::{Candidate, CandidateSet, LATENCY_NOT_MEASURED};

const LEGACY_MIN_COLUMNS: usize = 11;
const COMPACT_COLUMNS: usize = 6;
const MIN_HOSTNAME_LEN: usize = 3;

/// Hostname prefix of the shared public pool (`public-vpn-<n>`)
const POOL_PREFIX: &str = "public-vpn-";

/// Which layouts the parsed feed contained
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedLayout {
    Legacy,
    Compact,
    Mixed,
    /// No row had a recognised column count
    Unrecognized,
}

#[derive(Debug, Clone)]
pub struct ParseReport {
    pub candidates: CandidateSet,
    /// Data rows dropped for a bad layout, hostname or IP
    pub skipped: usize,
    pub duplicates: usize,
    pub layout: FeedLayout,
}

impl ParseReport {
    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

pub struct CandidateParser {
    domain_suffix: String,
}

impl CandidateParser {
    pub fn new(domain_suffix: impl Into<String>) -> Self {
        Self {
            domain_suffix: domain_suffix.into(),
        }
    }

    pub fn parse(&self, raw: &[u8]) -> ParseReport {
        let text = String::from_utf8_lossy(raw);
        let mut candidates = Vec::new();
        let mut seen = HashSet::new();
        let mut skipped = 0usize;
        let mut duplicates = 0usize;
        let mut saw_legacy = false;
        let mut saw_compact = false;

        for (line_no, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('*') || line.starts_with('#') {
                continue;
            }

            let cols: Vec<&str> = line.split(',').map(str::trim).collect();
            let parsed = match cols.len() {
                n if n >= LEGACY_MIN_COLUMNS => {
                    saw_legacy = true;
                    self.parse_legacy(&cols)
                }
                COMPACT_COLUMNS => {
                    saw_compact = true;
                    self.parse_compact(&cols)
                }
                n => {
                    log::debug!("Feed line {}: unrecognised layout ({} columns)", line_no + 1, n);
                    None
                }
            };

            match parsed {
                Some(mut candidate) => {
                    if !seen.insert(candidate.hostname.clone()) {
                        duplicates += 1;
                        continue;
                    }
                    candidate.feed_order = candidates.len() as u32;
                    candidates.push(candidate);
                }
                None => {
                    log::debug!("Feed line {}: dropped invalid row", line_no + 1);
                    skipped += 1;
                }
            }
        }

        let layout = match (saw_legacy, saw_compact) {
            (true, true) => FeedLayout::Mixed,
            (true, false) => FeedLayout::Legacy,
            (false, true) => FeedLayout::Compact,
            (false, false) => FeedLayout::Unrecognized,
        };

        if skipped > 0 {
            log::warn!("Feed parser skipped {} malformed rows", skipped);
        }
        log::info!(
            "Parsed {} candidates ({:?} layout, {} duplicates)",
            candidates.len(),
            layout,
            duplicates
        );

        ParseReport {
            candidates,
            skipped,
            duplicates,
            layout,
        }
    }

    fn parse_legacy(&self, cols: &[&str]) -> Option<Candidate> {
        let mut c = self.base(cols[0], cols[1])?;
        c.feed_ping_ms = parse_count(cols[3]);
        c.speed_bps = parse_count(cols[4]);
        c.country = cols[5].to_string();
        c.country_code = cols[6].to_string();
        c.session_count = parse_count(cols[7]);
        c.uptime_ms = parse_count(cols[8]);
        c.total_users = parse_count(cols[9]);
        c.total_traffic = parse_count(cols[10]);
        Some(c)
    }

    fn parse_compact(&self, cols: &[&str]) -> Option<Candidate> {
        let mut c = self.base(cols[0], cols[1])?;
        c.speed_bps = parse_count(cols[2]);
        c.country = cols[3].to_string();
        c.country_code = cols[4].to_string();
        c.session_count = parse_count(cols[5]);
        Some(c)
    }

    fn base(&self, hostname: &str, ip: &str) -> Option<Candidate> {
        if !is_valid_hostname(hostname) || !is_valid_ipv4(ip) {
            return None;
        }
        let mut c = Candidate::new(self.canonical_hostname(hostname), ip);
        c.is_pool_tagged = is_pool_hostname(hostname);
        c.measured_latency_ms = LATENCY_NOT_MEASURED;
        Some(c)
    }

    fn canonical_hostname(&self, hostname: &str) -> String {
        if self.domain_suffix.is_empty()
            || hostname
                .to_ascii_lowercase()
                .ends_with(&self.domain_suffix.to_ascii_lowercase())
        {
            hostname.to_string()
        } else {
            format!("{}{}", hostname, self.domain_suffix)
        }
    }
}

/// Non-empty, at least 3 chars, only `[A-Za-z0-9._-]`.
pub fn is_valid_hostname(hostname: &str) -> bool {
    hostname.len() >= MIN_HOSTNAME_LEN
        && hostname
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'_' || b == b'-')
}

/// Four dot-separated decimal octets, each 0..=255.
pub fn is_valid_ipv4(ip: &str) -> bool {
    let parts: Vec<&str> = ip.split('.').collect();
    parts.len() == 4
        && parts.iter().all(|p| {
            !p.is_empty() && p.len() <= 3 && p.bytes().all(|b| b.is_ascii_digit())
                && p.parse::<u16>().map(|v| v <= 255).unwrap_or(false)
        })
}

/// Generic shared-pool names, historically unreliable.
pub fn is_pool_hostname(hostname: &str) -> bool {
    let lower = hostname.to_ascii_lowercase();
    let label = lower.split('.').next().unwrap_or("");
    match label.strip_prefix(POOL_PREFIX) {
        Some(rest) => !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()),
        None => false,
    }
}

/// Non-negative integer column; garbage and negatives read as 0.
fn parse_count(raw: &str) -> u64 {
    if let Ok(v) = raw.parse::<u64>() {
        return v;
    }
    match raw.parse::<f64>() {
        Ok(v) if v.is_finite() && v > 0.0 => v as u64,
        _ => 0,
    }
}
