//! Candidate quality scoring and ranking
//!
//! Scores are always recomputed from the candidate's current fields; nothing
//! stored in `quality_score` is trusted across calls.
//!
//! Ranking order:
//! 1. unreachable candidates (`measured_latency_ms <= 0`) are excluded
//! 2. non-pool candidates before pool-tagged ones
//! 3. previously successful hosts before the rest
//! 4. higher raw score first
//! 5. feed order

use std::collections::HashSet;
use std::sync::Arc;

use super::candidate::{Candidate, CandidateSet};

/// Width of one preference tier. Raw scores are clamped below it so the tier
/// offsets below can never be outweighed by throughput.
const TIER_SPAN: f64 = 1e15;
/// Applied to pool-tagged candidates
const POOL_PENALTY: f64 = 2.0 * TIER_SPAN;
/// Applied to previously successful hosts
const SUCCESS_BONUS: f64 = TIER_SPAN;

/// Pluggable raw-score formula.
pub trait ScoringStrategy: Send + Sync {
    fn raw_score(&self, candidate: &Candidate) -> f64;
}

/// `speed / (sessions + 1)`: throughput each user would get if we joined.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThroughputPerSession;

impl ScoringStrategy for ThroughputPerSession {
    fn raw_score(&self, candidate: &Candidate) -> f64 {
        candidate.speed_bps as f64 / (candidate.session_count as f64 + 1.0)
    }
}

/// Normalised blend of throughput, load and measured latency.
#[derive(Debug, Clone, Copy)]
pub struct WeightedComposite {
    pub speed_weight: f64,
    pub load_weight: f64,
    pub latency_weight: f64,
}

impl Default for WeightedComposite {
    fn default() -> Self {
        Self {
            speed_weight: 0.5,
            load_weight: 0.2,
            latency_weight: 0.3,
        }
    }
}

impl ScoringStrategy for WeightedComposite {
    fn raw_score(&self, candidate: &Candidate) -> f64 {
        // 1 Gbps, 100 sessions and 1 s are treated as saturation points
        let speed = (candidate.speed_bps as f64 / 1e9).min(1.0);
        let load = 1.0 - (candidate.session_count as f64 / 100.0).min(1.0);
        let latency = if candidate.measured_latency_ms > 0 {
            1.0 - (candidate.measured_latency_ms as f64 / 1000.0).min(1.0)
        } else {
            0.0
        };
        // Scaled so results stay comparable in magnitude to throughput scores
        (self.speed_weight * speed + self.load_weight * load + self.latency_weight * latency) * 1e6
    }
}

#[derive(Clone)]
pub struct QualityScorer {
    strategy: Arc<dyn ScoringStrategy>,
}

impl QualityScorer {
    pub fn new(strategy: Arc<dyn ScoringStrategy>) -> Self {
        Self { strategy }
    }

    /// Raw score from the configured strategy.
    pub fn score(&self, candidate: &Candidate) -> f64 {
        let raw = self.strategy.raw_score(candidate);
        if raw.is_finite() {
            raw.max(0.0)
        } else {
            0.0
        }
    }

    /// Score with the pool penalty and success bonus applied.
    pub fn adjusted(&self, candidate: &Candidate, preferred: &HashSet<String>) -> f64 {
        let mut score = self.score(candidate).min(TIER_SPAN - 1.0) + POOL_PENALTY;
        if candidate.is_pool_tagged {
            score -= POOL_PENALTY;
        }
        if preferred.contains(&candidate.hostname) {
            score += SUCCESS_BONUS;
        }
        score
    }

    /// Reachable candidates only, best first, `quality_score` filled in.
    ///
    /// Ordering compares tier and raw score exactly; the tier offsets in
    /// `quality_score` are too coarse to separate close raw scores.
    pub fn rank(&self, candidates: &[Candidate], preferred: &HashSet<String>) -> CandidateSet {
        let mut keyed: Vec<((bool, bool), f64, Candidate)> = candidates
            .iter()
            .filter(|c| c.is_reachable())
            .cloned()
            .map(|mut c| {
                let tier = (!c.is_pool_tagged, preferred.contains(&c.hostname));
                let raw = self.score(&c);
                c.quality_score = self.adjusted(&c, preferred);
                (tier, raw, c)
            })
            .collect();

        keyed.sort_by(|(tier_a, raw_a, a), (tier_b, raw_b, b)| {
            tier_b
                .cmp(tier_a)
                .then(raw_b.total_cmp(raw_a))
                .then(a.feed_order.cmp(&b.feed_order))
        });
        keyed.into_iter().map(|(_, _, c)| c).collect()
    }
}

impl Default for QualityScorer {
    fn default() -> Self {
        Self::new(Arc::new(ThroughputPerSession))
    }
}
