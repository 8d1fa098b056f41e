//! Server list loading
//!
//! Fetches the candidate feed over HTTP and keeps the raw list cached in the
//! candidate store. The cache is used while fresh; after the TTL a refetch is
//! attempted, and a stale cache is still better than nothing if it fails.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::candidate::CandidateSet;
use super::parser::{CandidateParser, FeedLayout};
use super::store::CandidateStore;
use crate::config::EngineConfig;
use crate::error::SdkError;

const FEED_TIMEOUT: Duration = Duration::from_secs(10);

/// Where the raw feed bytes come from.
#[async_trait]
pub trait FeedSource: Send + Sync {
    async fn fetch(&self) -> Result<Vec<u8>, SdkError>;
}

/// Feed over HTTP(S)
pub struct HttpFeed {
    url: String,
    client: reqwest::Client,
}

impl HttpFeed {
    pub fn new(url: impl Into<String>) -> Result<Self, SdkError> {
        let client = reqwest::Client::builder()
            .timeout(FEED_TIMEOUT)
            .build()
            .map_err(|e| SdkError::FeedFetch(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }
}

#[async_trait]
impl FeedSource for HttpFeed {
    async fn fetch(&self) -> Result<Vec<u8>, SdkError> {
        log::info!("Fetching server list from {}", self.url);

        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| SdkError::FeedFetch(format!("Failed to fetch server list: {}", e)))?;

        if !response.status().is_success() {
            return Err(SdkError::FeedFetch(format!(
                "Feed returned error status: {}",
                response.status()
            )));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| SdkError::FeedFetch(format!("Failed to read server list: {}", e)))?;

        log::info!("Fetched {} bytes of server list", body.len());
        Ok(body.to_vec())
    }
}

/// Source of the server list data
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerListSource {
    /// Fetched from the feed
    Api,
    /// Loaded from fresh local cache
    Cache,
    /// Loaded from stale cache (feed failed)
    StaleCache,
}

impl std::fmt::Display for ServerListSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerListSource::Api => write!(f, "API"),
            ServerListSource::Cache => write!(f, "Cache"),
            ServerListSource::StaleCache => write!(f, "Stale Cache"),
        }
    }
}

/// Raw candidate list manager
pub struct ServerList {
    feed: Arc<dyn FeedSource>,
    parser: CandidateParser,
    store: Arc<CandidateStore>,
}

impl ServerList {
    pub fn new(feed: Arc<dyn FeedSource>, store: Arc<CandidateStore>, config: &EngineConfig) -> Self {
        Self {
            feed,
            parser: CandidateParser::new(config.domain_suffix.clone()),
            store,
        }
    }

    /// Load the raw candidate list from cache or feed.
    ///
    /// Strategy:
    /// 1. Fresh cache (and not `manual`) wins
    /// 2. Otherwise fetch, parse and cache the feed
    /// 3. If that fails and any cache exists (even stale), use it
    /// 4. Otherwise `FeedFetch`
    pub async fn load(&self, manual: bool) -> Result<(CandidateSet, ServerListSource), SdkError> {
        if !self.store.should_refetch(manual) {
            if let Some(cached) = self.store.load_raw() {
                log::info!("Using fresh cached server list ({} servers)", cached.len());
                return Ok((cached, ServerListSource::Cache));
            }
        }

        match self.fetch_and_cache().await {
            Ok(candidates) => Ok((candidates, ServerListSource::Api)),
            Err(e) => match self.store.load_raw() {
                Some(stale) if !stale.is_empty() => {
                    log::warn!("Failed to refresh server list, using stale cache: {}", e);
                    Ok((stale, ServerListSource::StaleCache))
                }
                _ => {
                    log::error!("No servers available: {}", e);
                    Err(e)
                }
            },
        }
    }

    async fn fetch_and_cache(&self) -> Result<CandidateSet, SdkError> {
        let raw = self.feed.fetch().await?;
        let report = self.parser.parse(&raw);

        if report.is_empty() {
            let reason = match report.layout {
                FeedLayout::Unrecognized => "unrecognised feed layout",
                _ => "feed contained no valid servers",
            };
            return Err(SdkError::FeedFetch(reason.to_string()));
        }

        if let Err(e) = self.store.save_raw(&report.candidates) {
            log::warn!("Failed to save server list to cache: {}", e);
        }
        Ok(report.candidates)
    }
}
