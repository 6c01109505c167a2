//! Prometheus metrics for the consensus engine

use crate::ConsensusResult;
use prometheus::{Gauge, IntCounter, IntCounterVec, IntGauge, Opts, Registry};

/// Consensus metrics, registered on a caller-supplied registry
#[derive(Clone)]
pub struct ConsensusMetrics {
    /// Rounds that ended in a commit
    pub rounds_committed: IntCounter,
    /// Rounds that failed, by reason
    pub rounds_failed: IntCounterVec,
    /// Height currently under decision
    pub current_height: IntGauge,
    /// Round currently under decision
    pub current_round: IntGauge,
    /// Messages folded into round state, by type
    pub messages_applied: IntCounterVec,
    /// Messages dropped, by reason
    pub messages_rejected: IntCounterVec,
    /// Local node's reputation score
    pub local_reputation: Gauge,
}

impl ConsensusMetrics {
    /// Create the metrics and register them on `registry`
    pub fn new(registry: &Registry) -> ConsensusResult<Self> {
        let metrics = Self {
            rounds_committed: IntCounter::new(
                "bft_rounds_committed_total",
                "Rounds that committed a block",
            )?,
            rounds_failed: IntCounterVec::new(
                Opts::new("bft_rounds_failed_total", "Rounds that failed"),
                &["reason"],
            )?,
            current_height: IntGauge::new("bft_height", "Height under decision")?,
            current_round: IntGauge::new("bft_round", "Round under decision")?,
            messages_applied: IntCounterVec::new(
                Opts::new("bft_messages_applied_total", "Consensus messages applied"),
                &["type"],
            )?,
            messages_rejected: IntCounterVec::new(
                Opts::new("bft_messages_rejected_total", "Consensus messages dropped"),
                &["reason"],
            )?,
            local_reputation: Gauge::new("bft_local_reputation", "Local reputation score")?,
        };

        registry.register(Box::new(metrics.rounds_committed.clone()))?;
        registry.register(Box::new(metrics.rounds_failed.clone()))?;
        registry.register(Box::new(metrics.current_height.clone()))?;
        registry.register(Box::new(metrics.current_round.clone()))?;
        registry.register(Box::new(metrics.messages_applied.clone()))?;
        registry.register(Box::new(metrics.messages_rejected.clone()))?;
        registry.register(Box::new(metrics.local_reputation.clone()))?;

        Ok(metrics)
    }

    /// Metrics on a private registry, for tests and embedded nodes
    pub fn unregistered() -> ConsensusResult<Self> {
        Self::new(&Registry::new())
    }

    pub fn record_position(&self, height: u64, round: u64) {
        self.current_height.set(height as i64);
        self.current_round.set(round as i64);
    }
}
