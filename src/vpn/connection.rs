//! VPN Connection Manager
//!
//! Drives one connect sequence at a time:
//! - connectivity check (fail fast when offline)
//! - candidate selection (scored cache, last good server, or cold start)
//! - per-attempt connect with timeout against the tunnel subsystem
//! - failover to the next best candidate within the retry budget
//!
//! The manager never blocks on a probe or on the tunnel: every wait is an
//! `await` raced against user cancellation.

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use super::candidate::{Candidate, CandidateSet};
use super::prober::{Probe, ProbeProfile, ProbeSummary, Prober, TcpProbe};
use super::scorer::QualityScorer;
use super::servers::{FeedSource, HttpFeed, ServerList};
use super::store::{CandidateStore, FileStore};
use super::tunnel::{
    ConnectivityCheck, Credentials, RouteConnectivity, TunnelController, TunnelStatus,
};
use crate::config::EngineConfig;
use crate::error::{SdkError, ERROR_VPN};
use crate::events::{EngineEvent, EventBus};

/// VPN connection state
#[derive(Debug, Clone, Default, PartialEq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    /// `hostname` is `None` while a candidate is still being chosen
    Connecting {
        hostname: Option<String>,
        attempt: u32,
    },
    Connected {
        since: Instant,
        hostname: String,
    },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected { .. })
    }

    pub fn is_connecting(&self) -> bool {
        matches!(self, ConnectionState::Connecting { .. })
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(self, ConnectionState::Disconnected)
    }

    pub fn status_text(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting { .. } => "Connecting to server...",
            ConnectionState::Connected { .. } => "Connected",
        }
    }

    pub fn as_code(&self) -> i32 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connecting { .. } => 2,
            ConnectionState::Connected { .. } => 4,
        }
    }
}

/// Failover bookkeeping for one connect sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionFailoverState {
    pub attempted: HashSet<String>,
    pub failed_this_session: HashSet<String>,
    pub attempt_count: u32,
}

impl SessionFailoverState {
    pub fn is_excluded(&self, hostname: &str) -> bool {
        self.attempted.contains(hostname) || self.failed_this_session.contains(hostname)
    }

    /// Returns false if `hostname` was already tried this session.
    pub fn mark_attempted(&mut self, hostname: &str) -> bool {
        self.attempted.insert(hostname.to_string())
    }

    pub fn record_failure(&mut self, hostname: &str) -> u32 {
        self.failed_this_session.insert(hostname.to_string());
        self.attempt_count += 1;
        self.attempt_count
    }
}

/// External collaborators the manager drives.
pub struct Collaborators {
    pub feed: Arc<dyn FeedSource>,
    pub probe: Arc<dyn Probe>,
    pub tunnel: Arc<dyn TunnelController>,
    pub connectivity: Arc<dyn ConnectivityCheck>,
}

struct Inner {
    state: ConnectionState,
    session: Option<SessionFailoverState>,
    user_initiated_disconnect: bool,
    failover_active: bool,
    /// Bumped when a sequence starts and on disconnect. A running sequence
    /// stops as soon as this moves away from the id it started with.
    session_id: u64,
    last_idle_refresh: Option<tokio::time::Instant>,
}

/// VPN connection manager
pub struct VpnConnection {
    config: EngineConfig,
    store: Arc<CandidateStore>,
    servers: ServerList,
    prober: Prober,
    probe: Arc<dyn Probe>,
    scorer: QualityScorer,
    tunnel: Arc<dyn TunnelController>,
    connectivity: Arc<dyn ConnectivityCheck>,
    credentials: Credentials,
    events: EventBus,
    inner: Mutex<Inner>,
    status_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<TunnelStatus>>,
    cancel: Notify,
}

impl VpnConnection {
    pub fn new(
        config: EngineConfig,
        store: Arc<CandidateStore>,
        collaborators: Collaborators,
        status_rx: mpsc::UnboundedReceiver<TunnelStatus>,
    ) -> Self {
        let scorer = QualityScorer::default();
        Self {
            servers: ServerList::new(collaborators.feed, Arc::clone(&store), &config),
            prober: Prober::new(Arc::clone(&collaborators.probe), scorer.clone(), &config),
            probe: collaborators.probe,
            scorer,
            tunnel: collaborators.tunnel,
            connectivity: collaborators.connectivity,
            credentials: Credentials::default(),
            events: EventBus::new(),
            inner: Mutex::new(Inner {
                state: ConnectionState::Disconnected,
                session: None,
                user_initiated_disconnect: false,
                failover_active: false,
                session_id: 0,
                last_idle_refresh: None,
            }),
            status_rx: tokio::sync::Mutex::new(status_rx),
            cancel: Notify::new(),
            store,
            config,
        }
    }

    /// Production wiring: HTTP feed, TCP probes, on-disk store, route check.
    pub fn with_defaults(
        config: EngineConfig,
        tunnel: Arc<dyn TunnelController>,
        status_rx: mpsc::UnboundedReceiver<TunnelStatus>,
    ) -> Result<Self, SdkError> {
        config.validate()?;
        let kv = FileStore::open_default()?;
        log::info!("Selector store at {:?}", kv.path());
        let store = Arc::new(CandidateStore::new(Arc::new(kv), config.cache_ttl_secs));
        let feed = HttpFeed::new(config.feed_url.clone())?;

        Ok(Self::new(
            config,
            store,
            Collaborators {
                feed: Arc::new(feed),
                probe: Arc::new(TcpProbe),
                tunnel,
                connectivity: Arc::new(RouteConnectivity::default()),
            },
            status_rx,
        ))
    }

    /// Swap the scoring strategy used for ranking and probing.
    pub fn with_scorer(mut self, scorer: QualityScorer) -> Self {
        self.prober = Prober::new(Arc::clone(&self.probe), scorer.clone(), &self.config);
        self.scorer = scorer;
        self
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state.clone()
    }

    /// Snapshot of the running sequence's failover state, if any.
    pub fn session(&self) -> Option<SessionFailoverState> {
        self.inner.lock().session.clone()
    }

    pub fn is_failover_active(&self) -> bool {
        self.inner.lock().failover_active
    }

    pub fn user_initiated_disconnect(&self) -> bool {
        self.inner.lock().user_initiated_disconnect
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn store(&self) -> &CandidateStore {
        &self.store
    }

    fn set_state(&self, inner: &mut Inner, state: ConnectionState) {
        log::info!("Connection state: {:?}", state);
        inner.state = state.clone();
        self.events.fire_state_change(&state);
    }

    // ── Connect ─────────────────────────────────────────────────────────────

    /// Run a full connect sequence. Resolves with the connected hostname, or
    /// with the terminal error once failover gives up or the user cancels.
    pub async fn connect(&self) -> Result<String, SdkError> {
        // Claim the single connect slot before anything can yield
        let id = {
            let mut inner = self.inner.lock();
            if inner.state.is_connected() {
                return Err(SdkError::AlreadyConnected);
            }
            if inner.state.is_connecting() {
                return Err(SdkError::ConnectionInProgress);
            }
            inner.session_id += 1;
            inner.user_initiated_disconnect = false;
            inner.state = ConnectionState::Connecting {
                hostname: None,
                attempt: 0,
            };
            inner.session_id
        };

        if !self.connectivity.is_online() {
            {
                let mut inner = self.inner.lock();
                if inner.session_id == id {
                    inner.session_id += 1;
                    inner.state = ConnectionState::Disconnected;
                }
            }
            let err = SdkError::NoConnectivity;
            log::warn!("Connect requested while offline");
            self.events.fire_error(err.code(), &err.to_string());
            return Err(err);
        }

        {
            let mut inner = self.inner.lock();
            if inner.session_id != id {
                return Err(SdkError::Cancelled);
            }
            inner.failover_active = self.config.failover_enabled;
            inner.session = Some(SessionFailoverState::default());
            let state = inner.state.clone();
            self.set_state(&mut inner, state);
        }

        let result = self.run_sequence(id).await;

        let mut inner = self.inner.lock();
        if inner.session_id != id {
            // disconnect() already tore the sequence down
            return Err(SdkError::Cancelled);
        }

        match result {
            Ok(hostname) => {
                if let Err(e) = self.store.record_success(&hostname) {
                    log::warn!("Failed to record success for {}: {}", hostname, e);
                }
                inner.session = None;
                inner.failover_active = false;
                self.set_state(
                    &mut inner,
                    ConnectionState::Connected {
                        since: Instant::now(),
                        hostname: hostname.clone(),
                    },
                );
                log::info!("Connected to {}", hostname);
                Ok(hostname)
            }
            Err(err) => {
                inner.session = None;
                inner.failover_active = false;
                inner.session_id += 1;
                self.set_state(&mut inner, ConnectionState::Disconnected);
                drop(inner);
                log::error!("Connect sequence failed: {}", err);
                self.events.fire_error(err.code(), &err.to_string());
                Err(err)
            }
        }
    }

    async fn run_sequence(&self, id: u64) -> Result<String, SdkError> {
        let preferred: HashSet<String> = self
            .store
            .success_history()
            .successful_hostnames
            .into_iter()
            .collect();

        let mut queue = self.until_cancelled(id, self.initial_queue(&preferred)).await??;
        let mut queue_fresh = true;
        let mut refilled = false;
        let mut last_error = String::from("No servers left to try");

        loop {
            let next = self
                .pick_next(id, &mut queue, queue_fresh, &preferred)
                .await?;
            queue_fresh = false;

            let candidate = match next {
                Some(c) => c,
                None if !refilled => {
                    refilled = true;
                    log::info!("Failover queue exhausted, reloading server list");
                    queue = match self.until_cancelled(id, self.cold_start(&preferred)).await? {
                        Ok(list) => list,
                        Err(e) => {
                            log::warn!("Reload failed: {}", e);
                            return Err(SdkError::AllCandidatesExhausted { last_error });
                        }
                    };
                    queue_fresh = true;
                    continue;
                }
                None => return Err(SdkError::AllCandidatesExhausted { last_error }),
            };

            let hostname = candidate.hostname.clone();
            let attempt_no = self.begin_attempt(id, &hostname)?;
            log::info!("Attempt {}: connecting to {}", attempt_no, hostname);

            let err = match self.attempt(id, &hostname).await {
                Ok(()) => return Ok(hostname),
                Err(SdkError::Cancelled) => return Err(SdkError::Cancelled),
                Err(e) => e,
            };
            last_error = err.to_string();

            if !err.is_retryable() {
                log::error!("{} rejected the attempt: {}", hostname, err);
                return Err(err);
            }
            if !self.is_failover_active() {
                log::warn!("{} failed and failover is off: {}", hostname, err);
                return Err(err);
            }

            let failures = self.record_failure(id, &hostname)?;
            log::warn!(
                "{} failed ({}), attempt {}/{}",
                hostname,
                err,
                failures,
                self.config.max_attempts
            );
            if failures >= self.config.max_attempts {
                return Err(SdkError::AllCandidatesExhausted { last_error });
            }

            self.events.emit(EngineEvent::FailedOver {
                hostname: hostname.clone(),
                attempt: failures,
                max_attempts: self.config.max_attempts,
            });
            self.events.fire_progress(format!(
                "Trying next server ({}/{})",
                failures + 1,
                self.config.max_attempts
            ));
        }
    }

    /// Selection priority, evaluated fresh on every connect.
    async fn initial_queue(&self, preferred: &HashSet<String>) -> Result<CandidateSet, SdkError> {
        if let Some(scored) = self.store.load_scored() {
            // Re-rank now: stored scores are never trusted
            let ranked = self.scorer.rank(&scored, preferred);
            if !ranked.is_empty() {
                log::info!("Selecting from {} cached scored servers", ranked.len());
                return Ok(ranked);
            }
        }

        if let Some(last) = self.store.success_history().last_successful {
            log::info!("No scored servers, retrying last good server {}", last);
            let candidate = self
                .store
                .load_raw()
                .and_then(|raw| raw.into_iter().find(|c| c.hostname == last))
                .unwrap_or_else(|| Candidate::new(last.clone(), ""));
            return Ok(vec![candidate]);
        }

        self.cold_start(preferred).await
    }

    /// Fetch the feed, probe everything, keep what answered.
    async fn cold_start(&self, preferred: &HashSet<String>) -> Result<CandidateSet, SdkError> {
        self.events.fire_progress("Fetching server list...");
        let (raw, source) = self.servers.load(false).await?;
        log::info!("Cold start with {} servers ({})", raw.len(), source);

        self.events
            .fire_progress(format!("Pinging {} servers...", raw.len()));
        let summary = self
            .probe_with_events(raw, ProbeProfile::Rapid, preferred.clone())
            .await;

        if let Err(e) = self.store.save_scored(&summary.ranked) {
            log::warn!("Failed to save scored servers: {}", e);
        }
        if summary.ranked.is_empty() {
            return Err(SdkError::FeedFetch("no reachable servers".into()));
        }
        Ok(summary.ranked)
    }

    /// Next candidate not yet tried this session. Unless `queue` was just
    /// ranked, the head of the queue is re-probed first.
    async fn pick_next(
        &self,
        id: u64,
        queue: &mut CandidateSet,
        queue_fresh: bool,
        preferred: &HashSet<String>,
    ) -> Result<Option<Candidate>, SdkError> {
        {
            let inner = self.inner.lock();
            let session = match (inner.session_id == id, inner.session.as_ref()) {
                (true, Some(session)) => session,
                _ => return Err(SdkError::Cancelled),
            };
            queue.retain(|c| !session.is_excluded(&c.hostname));
        }

        if queue_fresh {
            return Ok(if queue.is_empty() {
                None
            } else {
                Some(queue.remove(0))
            });
        }

        while !queue.is_empty() {
            let n = self.config.failover_probe_batch.min(queue.len());
            let subset: CandidateSet = queue.drain(..n).collect();
            let summary = self
                .until_cancelled(
                    id,
                    self.probe_with_events(subset, ProbeProfile::Rapid, preferred.clone()),
                )
                .await?;

            if summary.ranked.is_empty() {
                log::info!("None of the next {} servers answered, moving on", n);
                continue;
            }

            let mut ranked = summary.ranked;
            let best = ranked.remove(0);
            ranked.append(queue);
            *queue = ranked;
            return Ok(Some(best));
        }

        Ok(None)
    }

    fn begin_attempt(&self, id: u64, hostname: &str) -> Result<u32, SdkError> {
        let mut inner = self.inner.lock();
        if inner.session_id != id {
            return Err(SdkError::Cancelled);
        }
        let attempt = match inner.session.as_mut() {
            Some(session) => {
                session.mark_attempted(hostname);
                session.attempt_count + 1
            }
            None => return Err(SdkError::Cancelled),
        };
        self.set_state(
            &mut inner,
            ConnectionState::Connecting {
                hostname: Some(hostname.to_string()),
                attempt,
            },
        );
        Ok(attempt)
    }

    fn record_failure(&self, id: u64, hostname: &str) -> Result<u32, SdkError> {
        if let Err(e) = self.store.purge(hostname) {
            log::warn!("Failed to purge {}: {}", hostname, e);
        }
        let mut inner = self.inner.lock();
        if inner.session_id != id {
            return Err(SdkError::Cancelled);
        }
        match inner.session.as_mut() {
            Some(session) => Ok(session.record_failure(hostname)),
            None => Err(SdkError::Cancelled),
        }
    }

    /// One tunnel attempt: first of CONNECTED, failure status, timeout, cancel.
    async fn attempt(&self, id: u64, hostname: &str) -> Result<(), SdkError> {
        let mut status_rx = self
            .until_cancelled(id, self.status_rx.lock())
            .await?;

        // Leftovers from an earlier attempt must not be read as ours
        while status_rx.try_recv().is_ok() {}

        self.tunnel.connect(hostname, &self.credentials)?;

        let deadline = tokio::time::sleep(self.config.attempt_timeout());
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                biased;
                _ = self.cancelled(id) => return Err(SdkError::Cancelled),
                _ = &mut deadline => {
                    log::warn!(
                        "No status from {} within {}ms",
                        hostname,
                        self.config.attempt_timeout_ms
                    );
                    self.tunnel.disconnect();
                    return Err(SdkError::TunnelTimeout(hostname.to_string()));
                }
                status = status_rx.recv() => match status {
                    Some(TunnelStatus::Connected) => return Ok(()),
                    Some(TunnelStatus::Connecting) => {
                        self.events.fire_progress(format!("Connecting to {}...", hostname));
                    }
                    Some(TunnelStatus::Disconnected) => {
                        return Err(SdkError::Tunnel(format!("{} closed the connection", hostname)));
                    }
                    Some(TunnelStatus::Error(msg)) => return Err(SdkError::Tunnel(msg)),
                    None => return Err(SdkError::Tunnel("Tunnel status channel closed".into())),
                },
            }
        }
    }

    async fn probe_with_events(
        &self,
        candidates: CandidateSet,
        profile: ProbeProfile,
        preferred: HashSet<String>,
    ) -> ProbeSummary {
        let events = self.events.clone();
        self.prober
            .probe(candidates, profile, preferred)
            .finish_with(move |index, c| {
                events.emit(EngineEvent::ProbeCompleted {
                    index,
                    hostname: c.hostname.clone(),
                    latency_ms: c.measured_latency_ms,
                })
            })
            .await
    }

    // ── Cancellation ────────────────────────────────────────────────────────

    /// Resolves once the sequence `id` has been superseded or cancelled.
    async fn cancelled(&self, id: u64) {
        loop {
            let notified = self.cancel.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let superseded = self.inner.lock().session_id != id;
            if superseded {
                return;
            }
            notified.await;
        }
    }

    async fn until_cancelled<T>(
        &self,
        id: u64,
        fut: impl Future<Output = T>,
    ) -> Result<T, SdkError> {
        tokio::select! {
            biased;
            _ = self.cancelled(id) => Err(SdkError::Cancelled),
            out = fut => Ok(out),
        }
    }

    // ── Disconnect / monitoring ─────────────────────────────────────────────

    /// User-initiated disconnect. Takes effect immediately and never retries.
    pub fn disconnect(&self) {
        log::info!("Disconnecting VPN");
        {
            let mut inner = self.inner.lock();
            inner.user_initiated_disconnect = true;
            inner.failover_active = false;
            inner.session = None;
            inner.session_id += 1;
            if !inner.state.is_disconnected() {
                self.set_state(&mut inner, ConnectionState::Disconnected);
            }
        }
        self.cancel.notify_waiters();
        self.tunnel.disconnect();
    }

    /// Watch an established tunnel. A drop that the user did not ask for is
    /// surfaced verbatim and ends the connection; no failover happens here.
    pub async fn monitor(&self) -> Result<(), SdkError> {
        let id = {
            let inner = self.inner.lock();
            if !inner.state.is_connected() {
                return Ok(());
            }
            inner.session_id
        };

        let mut status_rx = match self.until_cancelled(id, self.status_rx.lock()).await {
            Ok(rx) => rx,
            Err(_) => return Ok(()),
        };

        loop {
            let status = tokio::select! {
                biased;
                _ = self.cancelled(id) => return Ok(()),
                status = status_rx.recv() => status,
            };

            let message = match status {
                Some(TunnelStatus::Connected) | Some(TunnelStatus::Connecting) => continue,
                Some(TunnelStatus::Disconnected) => "Connection lost".to_string(),
                Some(TunnelStatus::Error(msg)) => msg,
                None => "Tunnel status channel closed".to_string(),
            };

            {
                let mut inner = self.inner.lock();
                if inner.session_id != id || inner.user_initiated_disconnect {
                    return Ok(());
                }
                inner.session_id += 1;
                self.set_state(&mut inner, ConnectionState::Disconnected);
            }
            log::warn!("Tunnel dropped: {}", message);
            self.events.fire_error(ERROR_VPN, &message);
            return Err(SdkError::Tunnel(message));
        }
    }

    // ── Idle refresh ────────────────────────────────────────────────────────

    /// Re-probe the cached servers while idle, at most once per cooldown.
    /// Returns whether fresh results were saved.
    pub async fn refresh_idle(&self) -> bool {
        if self.idle_refresh_gate().is_none() {
            return false;
        }

        let snapshot = self.store.snapshot();
        let cached = if snapshot.scored_list.is_empty() {
            snapshot.raw_list
        } else {
            snapshot.scored_list
        };
        if cached.is_empty() {
            log::debug!("Idle refresh skipped: nothing cached");
            return false;
        }

        // The cooldown only starts once a probe run actually goes out
        let id = {
            let mut inner = self.inner.lock();
            let id = match self.idle_refresh_gate_locked(&inner) {
                Some(id) => id,
                None => return false,
            };
            inner.last_idle_refresh = Some(tokio::time::Instant::now());
            id
        };

        let preferred: HashSet<String> = self
            .store
            .success_history()
            .successful_hostnames
            .into_iter()
            .collect();
        log::info!("Idle refresh of {} cached servers", cached.len());
        let summary = self
            .probe_with_events(cached, ProbeProfile::Full, preferred)
            .await;

        // Held across the save so a connect cannot start (and purge) in between
        let inner = self.inner.lock();
        if inner.session_id != id || !inner.state.is_disconnected() {
            log::info!("Idle refresh discarded: a connection started meanwhile");
            return false;
        }
        match self.store.save_scored(&summary.ranked) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Failed to save idle refresh results: {}", e);
                false
            }
        }
    }

    fn idle_refresh_gate(&self) -> Option<u64> {
        let inner = self.inner.lock();
        self.idle_refresh_gate_locked(&inner)
    }

    /// Session id to refresh under, if idle and out of cooldown.
    fn idle_refresh_gate_locked(&self, inner: &Inner) -> Option<u64> {
        if !inner.state.is_disconnected() || inner.session.is_some() {
            return None;
        }
        if let Some(last) = inner.last_idle_refresh {
            if last.elapsed() < self.config.idle_refresh_cooldown() {
                return None;
            }
        }
        Some(inner.session_id)
    }

    /// Run `refresh_idle` on every cooldown tick until the handle is stopped.
    pub fn spawn_idle_refresh(self: &Arc<Self>) -> IdleRefreshHandle {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let conn = Arc::clone(self);
        let period = self.config.idle_refresh_cooldown();

        let task = tokio::spawn(async move {
            log::info!("Idle refresh started ({}s cooldown)", period.as_secs());
            loop {
                tokio::time::sleep(period).await;
                if stop_flag.load(Ordering::SeqCst) {
                    break;
                }
                conn.refresh_idle().await;
            }
            log::info!("Idle refresh stopped");
        });

        IdleRefreshHandle { stop, task }
    }
}

/// Stops the background refresh loop when asked or dropped.
pub struct IdleRefreshHandle {
    stop: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl IdleRefreshHandle {
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.task.abort();
    }
}

impl Drop for IdleRefreshHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
