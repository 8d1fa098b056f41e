//! Concurrent latency probing
//!
//! Latency is the wall-clock time to complete a TCP connect to a fixed port.
//! Every candidate gets its own task; completions are streamed back as they
//! land, followed by one aggregate summary. A failed or timed-out probe
//! records `-1` and never surfaces as an error.

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;

use super::candidate::{Candidate, CandidateSet, LATENCY_IN_FLIGHT, LATENCY_NOT_MEASURED};
use super::scorer::QualityScorer;
use crate::config::EngineConfig;

/// Single reachability measurement.
#[async_trait]
pub trait Probe: Send + Sync {
    /// Round-trip time, or `None` when unreachable. Implementations may
    /// ignore `timeout`; the prober enforces it anyway.
    async fn measure(&self, addr: SocketAddr, timeout: Duration) -> Option<Duration>;
}

/// TCP connect timing
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpProbe;

#[async_trait]
impl Probe for TcpProbe {
    async fn measure(&self, addr: SocketAddr, timeout: Duration) -> Option<Duration> {
        let start = Instant::now();
        match tokio::time::timeout(timeout, tokio::net::TcpStream::connect(addr)).await {
            Ok(Ok(_stream)) => Some(start.elapsed()),
            Ok(Err(e)) => {
                log::debug!("Probe to {} failed: {}", addr, e);
                None
            }
            Err(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeProfile {
    /// Full list refresh (seconds)
    Full,
    /// Cold start with nothing else to go on (sub-second)
    Rapid,
}

#[derive(Debug, Clone)]
pub enum ProbeUpdate {
    /// Probe dispatched; the candidate now carries the in-flight sentinel
    Started { index: usize, hostname: String },
    /// One candidate finished. Arrives in completion order, not input order
    Measured { index: usize, candidate: Candidate },
    /// All probes done. Always the last update
    Finished(ProbeSummary),
}

#[derive(Debug, Clone, Default)]
pub struct ProbeSummary {
    /// Every input candidate, input order, latency filled in
    pub measured: CandidateSet,
    /// Reachable candidates only, ranked
    pub ranked: CandidateSet,
}

/// Receiving half of a probe run. Dropping it discards the remaining results
/// but does not cancel probes already in flight.
pub struct ProbeStream {
    rx: mpsc::UnboundedReceiver<ProbeUpdate>,
}

impl ProbeStream {
    pub async fn next(&mut self) -> Option<ProbeUpdate> {
        self.rx.recv().await
    }

    /// Drain to the final summary, calling `on_item` for each completion.
    pub async fn finish_with<F>(mut self, mut on_item: F) -> ProbeSummary
    where
        F: FnMut(usize, &Candidate),
    {
        while let Some(update) = self.rx.recv().await {
            match update {
                ProbeUpdate::Started { .. } => {}
                ProbeUpdate::Measured { index, candidate } => on_item(index, &candidate),
                ProbeUpdate::Finished(summary) => return summary,
            }
        }
        log::warn!("Probe run ended without a summary");
        ProbeSummary::default()
    }

    pub async fn finish(self) -> ProbeSummary {
        self.finish_with(|_, _| {}).await
    }
}

pub struct Prober {
    probe: Arc<dyn Probe>,
    scorer: QualityScorer,
    port: u16,
    batch_size: usize,
    full_timeout: Duration,
    rapid_timeout: Duration,
}

impl Prober {
    pub fn new(probe: Arc<dyn Probe>, scorer: QualityScorer, config: &EngineConfig) -> Self {
        Self {
            probe,
            scorer,
            port: config.probe_port,
            batch_size: config.probe_batch_size.max(1),
            full_timeout: config.full_probe_timeout(),
            rapid_timeout: config.rapid_probe_timeout(),
        }
    }

    pub fn timeout_for(&self, profile: ProbeProfile) -> Duration {
        match profile {
            ProbeProfile::Full => self.full_timeout,
            ProbeProfile::Rapid => self.rapid_timeout,
        }
    }

    /// Probe all `candidates` concurrently. `preferred` feeds the success
    /// bonus of the final ranking.
    pub fn probe(
        &self,
        candidates: CandidateSet,
        profile: ProbeProfile,
        preferred: HashSet<String>,
    ) -> ProbeStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let timeout = self.timeout_for(profile);
        let probe = Arc::clone(&self.probe);
        let scorer = self.scorer.clone();
        let semaphore = Arc::new(Semaphore::new(self.batch_size));
        let port = self.port;

        log::info!(
            "Probing {} candidates ({:?}, timeout {}ms)",
            candidates.len(),
            profile,
            timeout.as_millis()
        );

        tokio::spawn(async move {
            let mut measured = candidates.clone();
            let mut tasks = JoinSet::new();

            for (index, mut candidate) in candidates.into_iter().enumerate() {
                measured[index].measured_latency_ms = LATENCY_IN_FLIGHT;
                let _ = tx.send(ProbeUpdate::Started {
                    index,
                    hostname: candidate.hostname.clone(),
                });

                let probe = Arc::clone(&probe);
                let semaphore = Arc::clone(&semaphore);
                tasks.spawn(async move {
                    let _permit = semaphore.acquire_owned().await.ok();
                    candidate.measured_latency_ms =
                        measure_candidate(probe.as_ref(), &candidate, port, timeout).await;
                    (index, candidate)
                });
            }

            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((index, candidate)) => {
                        measured[index] = candidate.clone();
                        let _ = tx.send(ProbeUpdate::Measured { index, candidate });
                    }
                    Err(e) => log::warn!("Probe task failed: {}", e),
                }
            }

            // A panicked task leaves its slot at the in-flight sentinel
            for c in measured.iter_mut() {
                if c.measured_latency_ms == LATENCY_IN_FLIGHT {
                    c.measured_latency_ms = LATENCY_NOT_MEASURED;
                }
            }

            let ranked = scorer.rank(&measured, &preferred);
            log::info!(
                "Probe finished: {}/{} candidates reachable",
                ranked.len(),
                measured.len()
            );
            let _ = tx.send(ProbeUpdate::Finished(ProbeSummary { measured, ranked }));
        });

        ProbeStream { rx }
    }

    /// Probe and wait for the summary.
    pub async fn probe_all(
        &self,
        candidates: CandidateSet,
        profile: ProbeProfile,
        preferred: HashSet<String>,
    ) -> ProbeSummary {
        self.probe(candidates, profile, preferred).finish().await
    }
}

async fn measure_candidate(
    probe: &dyn Probe,
    candidate: &Candidate,
    port: u16,
    timeout: Duration,
) -> i64 {
    let ip: Ipv4Addr = match candidate.ip.parse() {
        Ok(ip) => ip,
        Err(_) => return LATENCY_NOT_MEASURED,
    };
    let addr = SocketAddr::from((ip, port));

    match tokio::time::timeout(timeout, probe.measure(addr, timeout)).await {
        Ok(Some(rtt)) => {
            let ms = rtt.as_millis() as i64;
            log::debug!("{} responded in {}ms", candidate.hostname, ms);
            // Sub-millisecond answers must not collide with the in-flight sentinel
            ms.max(1)
        }
        Ok(None) => LATENCY_NOT_MEASURED,
        Err(_) => {
            log::debug!("{} timed out after {}ms", candidate.hostname, timeout.as_millis());
            LATENCY_NOT_MEASURED
        }
    }
}
