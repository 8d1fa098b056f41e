use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};

use swifttunnel_selector::vpn::{
    Candidate, CandidateStore, Collaborators, ConnectivityCheck, Credentials, FeedSource,
    FileStore, MemoryStore, Probe, QualityScorer, TunnelController, TunnelStatus,
};
use swifttunnel_selector::{ConnectionState, EngineConfig, EngineEvent, SdkError, VpnConnection};

// ── Fakes ───────────────────────────────────────────────────────────────────

struct CountingFeed {
    body: String,
    calls: AtomicUsize,
}

#[async_trait]
impl FeedSource for CountingFeed {
    async fn fetch(&self) -> Result<Vec<u8>, SdkError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.body.as_bytes().to_vec())
    }
}

/// Every IP answers in 20ms except the ones listed as down.
struct TableProbe {
    down: HashSet<String>,
    calls: AtomicUsize,
}

#[async_trait]
impl Probe for TableProbe {
    async fn measure(&self, addr: SocketAddr, _timeout: Duration) -> Option<Duration> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.down.contains(&addr.ip().to_string()) {
            None
        } else {
            Some(Duration::from_millis(20))
        }
    }
}

#[derive(Clone)]
enum Outcome {
    Connect,
    Fail(&'static str),
    /// Starts, then reports the tunnel closed before it came up
    Drop,
    /// The controller refuses the request outright
    Reject(&'static str),
    Silent,
}

struct ScriptedTunnel {
    script: HashMap<String, Outcome>,
    fallback: Outcome,
    status: mpsc::UnboundedSender<TunnelStatus>,
    connects: Mutex<Vec<String>>,
    disconnects: AtomicUsize,
}

impl TunnelController for ScriptedTunnel {
    fn connect(&self, hostname: &str, credentials: &Credentials) -> Result<(), SdkError> {
        assert_eq!(credentials.username, "vpn");
        self.connects.lock().push(hostname.to_string());
        let outcome = self
            .script
            .get(hostname)
            .cloned()
            .unwrap_or_else(|| self.fallback.clone());
        match outcome {
            Outcome::Connect => {
                let _ = self.status.send(TunnelStatus::Connecting);
                let _ = self.status.send(TunnelStatus::Connected);
            }
            Outcome::Fail(msg) => {
                let _ = self.status.send(TunnelStatus::Error(msg.to_string()));
            }
            Outcome::Drop => {
                let _ = self.status.send(TunnelStatus::Connecting);
                let _ = self.status.send(TunnelStatus::Disconnected);
            }
            Outcome::Reject(msg) => return Err(SdkError::InvalidParam(msg.to_string())),
            Outcome::Silent => {}
        }
        Ok(())
    }

    fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}

/// Blocks for `delay` like a real route lookup would.
struct Online {
    up: bool,
    delay: Duration,
}

impl ConnectivityCheck for Online {
    fn is_online(&self) -> bool {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        self.up
    }
}

// ── Harness ─────────────────────────────────────────────────────────────────

/// alpha: 10 Mbps / 9 sessions, bravo: 5 Mbps / 0 sessions, charlie: unreachable
const ABC_FEED: &str = "\
*vpn_servers
#HostName,IP,Speed,CountryLong,CountryShort,NumVpnSessions
alpha,10.0.0.1,10000000,Japan,JP,9
bravo,10.0.0.2,5000000,Korea,KR,0
charlie,10.0.0.3,90000000,Japan,JP,0
*
";

fn host(name: &str) -> String {
    format!("{}.opengw.net", name)
}

struct Setup {
    feed: String,
    online: bool,
    online_check_delay: Duration,
    down: Vec<&'static str>,
    script: Vec<(&'static str, Outcome)>,
    fallback: Outcome,
    config: EngineConfig,
    store: Option<Arc<CandidateStore>>,
}

impl Default for Setup {
    fn default() -> Self {
        Self {
            feed: ABC_FEED.to_string(),
            online: true,
            online_check_delay: Duration::ZERO,
            down: vec!["10.0.0.3"],
            script: Vec::new(),
            fallback: Outcome::Fail("Connection refused"),
            config: EngineConfig::default(),
            store: None,
        }
    }
}

struct Harness {
    conn: Arc<VpnConnection>,
    feed: Arc<CountingFeed>,
    probe: Arc<TableProbe>,
    tunnel: Arc<ScriptedTunnel>,
    events: broadcast::Receiver<EngineEvent>,
}

impl Setup {
    fn build(self) -> Harness {
        let (tx, rx) = mpsc::unbounded_channel();
        let feed = Arc::new(CountingFeed {
            body: self.feed,
            calls: AtomicUsize::new(0),
        });
        let probe = Arc::new(TableProbe {
            down: self.down.into_iter().map(String::from).collect(),
            calls: AtomicUsize::new(0),
        });
        let tunnel = Arc::new(ScriptedTunnel {
            script: self
                .script
                .into_iter()
                .map(|(name, outcome)| (host(name), outcome))
                .collect(),
            fallback: self.fallback,
            status: tx,
            connects: Mutex::new(Vec::new()),
            disconnects: AtomicUsize::new(0),
        });
        let store = self.store.unwrap_or_else(|| {
            Arc::new(CandidateStore::new(
                Arc::new(MemoryStore::new()),
                self.config.cache_ttl_secs,
            ))
        });

        let conn = VpnConnection::new(
            self.config,
            store,
            Collaborators {
                feed: feed.clone(),
                probe: probe.clone(),
                tunnel: tunnel.clone(),
                connectivity: Arc::new(Online {
                    up: self.online,
                    delay: self.online_check_delay,
                }),
            },
            rx,
        );
        let events = conn.events().subscribe();

        Harness {
            conn: Arc::new(conn),
            feed,
            probe,
            tunnel,
            events,
        }
    }
}

impl Harness {
    fn connects(&self) -> Vec<String> {
        self.tunnel.connects.lock().clone()
    }

    fn drain_events(&mut self) -> Vec<EngineEvent> {
        let mut out = Vec::new();
        loop {
            match self.events.try_recv() {
                Ok(event) => out.push(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return out,
            }
        }
    }
}

fn wide_feed(n: usize) -> String {
    (0..n)
        .map(|i| format!("node{:02},10.1.{}.1,{},Japan,JP,{}\n", i, i, 1_000_000 + i * 1000, i))
        .collect()
}

// ── Scenarios ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn offline_connect_fails_without_fetch_or_probe() {
    let mut h = Setup {
        online: false,
        ..Default::default()
    }
    .build();

    let err = h.conn.connect().await.unwrap_err();

    assert_eq!(err, SdkError::NoConnectivity);
    assert_eq!(h.feed.calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.probe.calls.load(Ordering::SeqCst), 0);
    assert!(h.connects().is_empty());
    assert_eq!(h.conn.state(), ConnectionState::Disconnected);
    assert!(h
        .drain_events()
        .iter()
        .any(|e| matches!(e, EngineEvent::Error { code, .. } if *code == err.code())));
}

#[tokio::test]
async fn ranking_prefers_throughput_per_session() {
    let mut a = Candidate::new(host("alpha"), "10.0.0.1");
    a.speed_bps = 10_000_000;
    a.session_count = 9;
    a.measured_latency_ms = 40;
    let mut b = Candidate::new(host("bravo"), "10.0.0.2");
    b.speed_bps = 5_000_000;
    b.measured_latency_ms = 60;
    let mut c = Candidate::new(host("charlie"), "10.0.0.3");
    c.speed_bps = 90_000_000;
    c.measured_latency_ms = -1;

    let scorer = QualityScorer::default();
    assert_eq!(scorer.score(&a), 1_000_000.0);
    assert_eq!(scorer.score(&b), 5_000_000.0);

    let ranked = scorer.rank(&[a, b, c], &HashSet::new());
    let names: Vec<&str> = ranked.iter().map(|c| c.hostname.as_str()).collect();
    assert_eq!(names, vec![host("bravo"), host("alpha")]);
    assert!(ranked[0].quality_score >= ranked[1].quality_score);
}

#[tokio::test]
async fn cold_start_selects_best_ranked_first() {
    let h = Setup {
        script: vec![("bravo", Outcome::Connect)],
        ..Default::default()
    }
    .build();

    let connected = h.conn.connect().await.unwrap();

    assert_eq!(connected, host("bravo"));
    assert_eq!(h.connects(), vec![host("bravo")]);
    assert_eq!(h.feed.calls.load(Ordering::SeqCst), 1);
    let scored = h.conn.store().load_scored().unwrap();
    assert!(scored.iter().all(|c| c.measured_latency_ms > 0));
    assert!(scored.iter().all(|c| c.hostname != host("charlie")));
}

#[tokio::test(start_paused = true)]
async fn attempt_timeout_purges_and_fails_over() {
    let mut h = Setup {
        script: vec![("bravo", Outcome::Silent), ("alpha", Outcome::Connect)],
        ..Default::default()
    }
    .build();

    let started = tokio::time::Instant::now();
    let connected = h.conn.connect().await.unwrap();

    assert_eq!(connected, host("alpha"));
    assert!(started.elapsed() >= Duration::from_secs(20));
    assert_eq!(h.connects(), vec![host("bravo"), host("alpha")]);
    assert_eq!(h.tunnel.disconnects.load(Ordering::SeqCst), 1, "timed-out attempt is torn down");

    let store = h.conn.store();
    assert!(store.load_raw().unwrap().iter().all(|c| c.hostname != host("bravo")));
    assert!(store.load_scored().unwrap().iter().all(|c| c.hostname != host("bravo")));
    assert_eq!(
        store.success_history().last_successful,
        Some(host("alpha"))
    );
    assert!(h.conn.session().is_none());
    assert!(!h.conn.is_failover_active());
    assert!(h.conn.state().is_connected());

    let events = h.drain_events();
    assert!(events.iter().any(|e| matches!(
        e,
        EngineEvent::FailedOver { hostname, attempt: 1, .. } if *hostname == host("bravo")
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        EngineEvent::StateChanged(ConnectionState::Connecting { hostname: Some(name), attempt: 2 })
            if *name == host("alpha")
    )));
    assert!(
        !events.iter().any(|e| matches!(e, EngineEvent::Error { .. })),
        "no error surfaces while failover recovers"
    );
}

#[tokio::test]
async fn budget_is_fifteen_attempts_and_never_repeats_a_host() {
    let mut h = Setup {
        feed: wide_feed(20),
        down: Vec::new(),
        ..Default::default()
    }
    .build();

    let err = h.conn.connect().await.unwrap_err();

    assert_eq!(
        err,
        SdkError::AllCandidatesExhausted {
            last_error: "Connection refused".into()
        }
    );
    let connects = h.connects();
    assert_eq!(connects.len(), 15);
    let unique: HashSet<&String> = connects.iter().collect();
    assert_eq!(unique.len(), 15);
    assert_eq!(h.conn.state(), ConnectionState::Disconnected);
    assert!(h.conn.session().is_none());

    let errors: Vec<EngineEvent> = h
        .drain_events()
        .into_iter()
        .filter(|e| matches!(e, EngineEvent::Error { .. }))
        .collect();
    assert_eq!(errors.len(), 1, "only the terminal failure is surfaced");
}

#[tokio::test]
async fn exhausting_every_candidate_refills_once_then_gives_up() {
    let h = Setup::default().build();

    let err = h.conn.connect().await.unwrap_err();

    assert!(matches!(err, SdkError::AllCandidatesExhausted { .. }));
    let mut connects = h.connects();
    connects.sort();
    assert_eq!(connects, vec![host("alpha"), host("bravo")]);
}

#[tokio::test(start_paused = true)]
async fn user_disconnect_cancels_pending_attempt() {
    let h = Setup {
        fallback: Outcome::Silent,
        ..Default::default()
    }
    .build();

    let conn = Arc::clone(&h.conn);
    let pending = tokio::spawn(async move { conn.connect().await });

    for _ in 0..100 {
        if !h.connects().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(h.connects(), vec![host("bravo")]);

    h.conn.disconnect();
    let result = pending.await.unwrap();

    assert_eq!(result, Err(SdkError::Cancelled));
    assert_eq!(h.connects().len(), 1, "no retry after a user disconnect");
    assert!(h.conn.user_initiated_disconnect());
    assert_eq!(h.conn.state(), ConnectionState::Disconnected);
    assert!(h.conn.session().is_none());
    assert!(
        h.conn.store().load_scored().unwrap().iter().any(|c| c.hostname == host("bravo")),
        "a cancelled attempt is not a failure"
    );
}

#[tokio::test]
async fn failover_disabled_surfaces_error_verbatim() {
    let mut config = EngineConfig::default();
    config.failover_enabled = false;
    let mut h = Setup {
        config,
        script: vec![("bravo", Outcome::Fail("AUTH_FAILED: bad credentials"))],
        ..Default::default()
    }
    .build();

    let err = h.conn.connect().await.unwrap_err();

    assert_eq!(err, SdkError::Tunnel("AUTH_FAILED: bad credentials".into()));
    assert_eq!(h.connects(), vec![host("bravo")]);
    assert!(h.drain_events().iter().any(|e| matches!(
        e,
        EngineEvent::Error { message, .. } if message == "AUTH_FAILED: bad credentials"
    )));
}

#[tokio::test]
async fn second_connect_while_connecting_is_rejected() {
    let h = Setup {
        fallback: Outcome::Silent,
        ..Default::default()
    }
    .build();

    let conn = Arc::clone(&h.conn);
    let pending = tokio::spawn(async move { conn.connect().await });
    while h.connects().is_empty() {
        tokio::task::yield_now().await;
    }

    assert_eq!(h.conn.connect().await, Err(SdkError::ConnectionInProgress));

    h.conn.disconnect();
    assert_eq!(pending.await.unwrap(), Err(SdkError::Cancelled));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_connects_admit_exactly_one() {
    let h = Setup {
        fallback: Outcome::Silent,
        online_check_delay: Duration::from_millis(100),
        ..Default::default()
    }
    .build();

    let first = {
        let conn = Arc::clone(&h.conn);
        tokio::spawn(async move { conn.connect().await })
    };
    let second = {
        let conn = Arc::clone(&h.conn);
        tokio::spawn(async move { conn.connect().await })
    };

    for _ in 0..500 {
        if first.is_finished() || second.is_finished() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(
        first.is_finished() || second.is_finished(),
        "the losing connect must return without waiting"
    );

    h.conn.disconnect();
    let results = [first.await.unwrap(), second.await.unwrap()];

    assert!(results.contains(&Err(SdkError::ConnectionInProgress)), "{:?}", results);
    assert!(results.contains(&Err(SdkError::Cancelled)), "{:?}", results);
    assert!(h.connects().len() <= 1, "only the admitted connect reaches the tunnel");
}

#[tokio::test]
async fn tunnel_closing_mid_attempt_fails_over() {
    let mut h = Setup {
        script: vec![("bravo", Outcome::Drop), ("alpha", Outcome::Connect)],
        ..Default::default()
    }
    .build();

    let connected = h.conn.connect().await.unwrap();

    assert_eq!(connected, host("alpha"));
    assert_eq!(h.connects(), vec![host("bravo"), host("alpha")]);
    assert!(h
        .conn
        .store()
        .load_scored()
        .unwrap()
        .iter()
        .all(|c| c.hostname != host("bravo")));
    assert!(h.drain_events().iter().any(|e| matches!(
        e,
        EngineEvent::FailedOver { hostname, attempt: 1, .. } if *hostname == host("bravo")
    )));
}

#[tokio::test]
async fn rejected_request_is_not_retried() {
    let mut h = Setup {
        script: vec![("bravo", Outcome::Reject("unsupported host"))],
        fallback: Outcome::Connect,
        ..Default::default()
    }
    .build();

    let err = h.conn.connect().await.unwrap_err();

    assert_eq!(err, SdkError::InvalidParam("unsupported host".into()));
    assert!(!err.is_retryable());
    assert_eq!(h.connects(), vec![host("bravo")], "no second server is tried");
    assert_eq!(h.conn.state(), ConnectionState::Disconnected);
    assert!(
        h.conn.store().load_scored().unwrap().iter().any(|c| c.hostname == host("bravo")),
        "a refused request says nothing about the server"
    );
    let events = h.drain_events();
    assert!(events.iter().any(|e| matches!(
        e,
        EngineEvent::Error { code, .. } if *code == err.code()
    )));
    assert!(!events.iter().any(|e| matches!(e, EngineEvent::FailedOver { .. })));
}

#[tokio::test]
async fn monitor_surfaces_unexpected_drop() {
    let mut h = Setup {
        script: vec![("bravo", Outcome::Connect)],
        ..Default::default()
    }
    .build();
    h.conn.connect().await.unwrap();
    h.drain_events();

    h.tunnel
        .status
        .send(TunnelStatus::Error("Server closed the session".into()))
        .unwrap();
    let err = h.conn.monitor().await.unwrap_err();

    assert_eq!(err, SdkError::Tunnel("Server closed the session".into()));
    assert_eq!(h.conn.state(), ConnectionState::Disconnected);
    assert_eq!(h.connects().len(), 1, "a dropped tunnel is not retried");
    assert!(h.drain_events().iter().any(|e| matches!(
        e,
        EngineEvent::Error { message, .. } if message == "Server closed the session"
    )));
}

#[tokio::test]
async fn reconnect_prefers_previously_successful_host() {
    let h = Setup {
        script: vec![("alpha", Outcome::Connect)],
        ..Default::default()
    }
    .build();

    let mut alpha = Candidate::new(host("alpha"), "10.0.0.1");
    alpha.speed_bps = 1_000;
    alpha.measured_latency_ms = 80;
    let mut bravo = Candidate::new(host("bravo"), "10.0.0.2");
    bravo.speed_bps = 5_000_000;
    bravo.measured_latency_ms = 20;
    h.conn.store().save_scored(&[bravo, alpha]).unwrap();
    h.conn.store().record_success(&host("alpha")).unwrap();

    // bravo ranks first on raw score, but alpha has connected before
    let connected = h.conn.connect().await.unwrap();

    assert_eq!(connected, host("alpha"));
    assert_eq!(h.connects(), vec![host("alpha")]);
    assert_eq!(h.feed.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn last_successful_is_tried_when_nothing_is_scored() {
    let h = Setup {
        script: vec![("alpha", Outcome::Connect)],
        ..Default::default()
    }
    .build();
    h.conn.store().record_success(&host("alpha")).unwrap();

    // Skips the feed and the probes entirely
    let connected = h.conn.connect().await.unwrap();

    assert_eq!(connected, host("alpha"));
    assert_eq!(h.feed.calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.probe.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn scored_servers_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("selector.json");
    let open = || {
        let kv = FileStore::open(&path).unwrap();
        Arc::new(CandidateStore::new(Arc::new(kv), 4 * 3600))
    };

    let first = Setup {
        script: vec![("bravo", Outcome::Connect)],
        store: Some(open()),
        ..Default::default()
    }
    .build();
    first.conn.connect().await.unwrap();
    first.conn.disconnect();

    let second = Setup {
        script: vec![("bravo", Outcome::Connect)],
        store: Some(open()),
        ..Default::default()
    }
    .build();
    let connected = second.conn.connect().await.unwrap();

    assert_eq!(connected, host("bravo"));
    assert_eq!(second.feed.calls.load(Ordering::SeqCst), 0, "served from the scored cache");
}

#[tokio::test]
async fn idle_refresh_does_nothing_while_connected() {
    let h = Setup {
        script: vec![("bravo", Outcome::Connect)],
        ..Default::default()
    }
    .build();
    h.conn.connect().await.unwrap();
    let probes = h.probe.calls.load(Ordering::SeqCst);

    assert!(!h.conn.refresh_idle().await);
    assert_eq!(h.probe.calls.load(Ordering::SeqCst), probes);
}
