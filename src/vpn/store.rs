//! Candidate persistence
//!
//! `CandidateStore` keeps the raw feed list, the probed/scored list, the fetch
//! timestamp and the success history on top of a plain key-value backend.
//! The orchestrator and probe completions both write here, so every
//! read-modify-write goes through one mutex.
//!
//! Hygiene rules:
//! - the scored list never holds a candidate with non-positive latency
//! - `purge` removes a host from both lists for good

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::candidate::{Candidate, CandidateSet, SuccessHistory};
use crate::error::SdkError;

const KEY_RAW: &str = "servers.raw";
const KEY_SCORED: &str = "servers.scored";
const KEY_FETCHED_AT: &str = "servers.fetched_at";
const KEY_HISTORY: &str = "servers.success_history";

// ── Key-value backends ──────────────────────────────────────────────────────

/// Narrow storage interface. Only single-key atomicity is assumed.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, SdkError>;
    fn set(&self, key: &str, value: &str) -> Result<(), SdkError>;
    fn delete(&self, key: &str) -> Result<(), SdkError>;
}

/// In-process store, lost on exit.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, SdkError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), SdkError> {
        self.entries.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), SdkError> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

/// JSON object on disk, rewritten whole on every change.
pub struct FileStore {
    path: PathBuf,
    entries: Mutex<HashMap<String, String>>,
}

impl FileStore {
    /// Default location: `<data_local_dir>/SwiftTunnel/selector.json`
    pub fn default_path() -> Option<PathBuf> {
        dirs::data_local_dir().map(|d| d.join("SwiftTunnel").join("selector.json"))
    }

    pub fn open(path: impl Into<PathBuf>) -> Result<Self, SdkError> {
        let path = path.into();
        let entries = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            match serde_json::from_str::<HashMap<String, String>>(&content) {
                Ok(map) => {
                    log::info!("Loaded selector store from {:?} ({} keys)", path, map.len());
                    map
                }
                Err(e) => {
                    log::warn!("Selector store {:?} is corrupt, starting empty: {}", path, e);
                    HashMap::new()
                }
            }
        } else {
            log::debug!("Selector store does not exist yet: {:?}", path);
            HashMap::new()
        };

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn open_default() -> Result<Self, SdkError> {
        let path = Self::default_path()
            .ok_or_else(|| SdkError::Storage("Could not determine data directory".into()))?;
        Self::open(path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self, entries: &HashMap<String, String>) -> Result<(), SdkError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(entries)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, SdkError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), SdkError> {
        let mut entries = self.entries.lock();
        let mut next = entries.clone();
        next.insert(key.to_string(), value.to_string());
        // Memory only changes once the disk has the same view
        self.flush(&next)?;
        *entries = next;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), SdkError> {
        let mut entries = self.entries.lock();
        if !entries.contains_key(key) {
            return Ok(());
        }
        let mut next = entries.clone();
        next.remove(key);
        self.flush(&next)?;
        *entries = next;
        Ok(())
    }
}

// ── Clock ───────────────────────────────────────────────────────────────────

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

// ── Candidate store ─────────────────────────────────────────────────────────

/// Snapshot of the cached candidate data
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheRecord {
    pub raw_list: CandidateSet,
    pub scored_list: CandidateSet,
    pub fetched_at: Option<DateTime<Utc>>,
}

pub struct CandidateStore {
    kv: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    ttl: chrono::Duration,
    write_lock: Mutex<()>,
}

impl CandidateStore {
    pub fn new(kv: Arc<dyn KeyValueStore>, ttl_secs: i64) -> Self {
        Self::with_clock(kv, Arc::new(SystemClock), ttl_secs)
    }

    pub fn with_clock(kv: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>, ttl_secs: i64) -> Self {
        Self {
            kv,
            clock,
            ttl: chrono::Duration::seconds(ttl_secs),
            write_lock: Mutex::new(()),
        }
    }

    /// Replace the raw feed list and stamp the fetch time.
    pub fn save_raw(&self, candidates: &[Candidate]) -> Result<(), SdkError> {
        let _guard = self.write_lock.lock();
        self.put(KEY_RAW, candidates)?;
        self.put(KEY_FETCHED_AT, &self.clock.now())?;
        log::info!("Saved {} raw candidates", candidates.len());
        Ok(())
    }

    /// Replace the scored list, keeping only reachable candidates.
    pub fn save_scored(&self, candidates: &[Candidate]) -> Result<(), SdkError> {
        let reachable: CandidateSet = candidates
            .iter()
            .filter(|c| c.is_reachable())
            .cloned()
            .collect();
        let dropped = candidates.len() - reachable.len();
        if dropped > 0 {
            log::debug!("Not persisting {} unreachable candidates", dropped);
        }

        let _guard = self.write_lock.lock();
        self.put(KEY_SCORED, &reachable)?;
        log::info!("Saved {} scored candidates", reachable.len());
        Ok(())
    }

    pub fn load_raw(&self) -> Option<CandidateSet> {
        self.fetch(KEY_RAW)
    }

    pub fn load_scored(&self) -> Option<CandidateSet> {
        self.fetch::<CandidateSet>(KEY_SCORED)
            .map(|list| list.into_iter().filter(|c| c.is_reachable()).collect())
    }

    pub fn fetched_at(&self) -> Option<DateTime<Utc>> {
        self.fetch(KEY_FETCHED_AT)
    }

    /// True iff a fetch was recorded less than one TTL ago.
    pub fn is_fresh(&self) -> bool {
        match self.fetched_at() {
            Some(at) => self.clock.now().signed_duration_since(at) < self.ttl,
            None => false,
        }
    }

    /// Whether the feed has to be fetched again. Depends only on stored
    /// state, the clock and `manual`.
    pub fn should_refetch(&self, manual: bool) -> bool {
        if manual {
            return true;
        }
        match self.load_raw() {
            Some(list) if !list.is_empty() => !self.is_fresh(),
            _ => true,
        }
    }

    pub fn success_history(&self) -> SuccessHistory {
        self.fetch(KEY_HISTORY).unwrap_or_default()
    }

    pub fn record_success(&self, hostname: &str) -> Result<(), SdkError> {
        let _guard = self.write_lock.lock();
        let mut history = self.success_history();
        history.record(hostname);
        self.put(KEY_HISTORY, &history)?;
        log::info!("Recorded successful connection to {}", hostname);
        Ok(())
    }

    /// Drop a host that failed a real tunnel attempt from every cached list.
    pub fn purge(&self, hostname: &str) -> Result<(), SdkError> {
        let _guard = self.write_lock.lock();

        for key in [KEY_RAW, KEY_SCORED] {
            if let Some(mut list) = self.fetch::<CandidateSet>(key) {
                let before = list.len();
                list.retain(|c| c.hostname != hostname);
                if list.len() != before {
                    self.put(key, &list)?;
                }
            }
        }

        let mut history = self.success_history();
        if history.last_successful.as_deref() == Some(hostname) {
            history.last_successful = None;
            self.put(KEY_HISTORY, &history)?;
        }

        log::info!("Purged {} from candidate cache", hostname);
        Ok(())
    }

    pub fn snapshot(&self) -> CacheRecord {
        CacheRecord {
            raw_list: self.load_raw().unwrap_or_default(),
            scored_list: self.load_scored().unwrap_or_default(),
            fetched_at: self.fetched_at(),
        }
    }

    pub fn clear(&self) -> Result<(), SdkError> {
        let _guard = self.write_lock.lock();
        for key in [KEY_RAW, KEY_SCORED, KEY_FETCHED_AT, KEY_HISTORY] {
            self.kv.delete(key)?;
        }
        log::info!("Candidate cache cleared");
        Ok(())
    }

    fn put<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), SdkError> {
        let json = serde_json::to_string(value)?;
        self.kv.set(key, &json)
    }

    fn fetch<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = match self.kv.get(key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                log::warn!("Failed to read {}: {}", key, e);
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                log::warn!("Failed to parse {}: {}", key, e);
                None
            }
        }
    }
}
