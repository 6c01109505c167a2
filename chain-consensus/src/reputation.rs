//! Exponentially smoothed per-validator reputation

use chain_core::Address;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Score assigned to an address with no record
pub const NEUTRAL_SCORE: f64 = 100.0;

/// Per-address reputation record
#[derive(Debug, Clone, PartialEq)]
pub struct ReputationRecord {
    /// Smoothed score
    pub score: f64,
    /// Voting influence derived from the score (`score / 100`)
    pub weight: f64,
    /// Every score this record has held after an update, oldest first
    pub history: Vec<f64>,
}

impl Default for ReputationRecord {
    fn default() -> Self {
        Self {
            score: NEUTRAL_SCORE,
            weight: 1.0,
            history: Vec::new(),
        }
    }
}

/// Shared reputation map, safe to call from the engine and message handlers
#[derive(Debug, Default)]
pub struct ReputationTracker {
    records: RwLock<HashMap<Address, ReputationRecord>>,
}

impl ReputationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold `delta` into the address's score: `score * 0.8 + delta * 0.2`.
    ///
    /// Creates the record on first use.
    pub fn update_reputation(&self, address: &Address, delta: f64) -> f64 {
        let mut records = self.records.write();
        let record = records.entry(*address).or_default();
        record.score = record.score * 0.8 + delta * 0.2;
        record.weight = record.score / NEUTRAL_SCORE;
        record.history.push(record.score);
        record.score
    }

    /// Instantaneous score with a +1% / -1% nudge for success / failure.
    ///
    /// Unknown addresses are neutral and not nudged.
    pub fn calculate_score(&self, address: &Address, success: bool) -> f64 {
        match self.records.read().get(address) {
            Some(record) if success => record.score * 1.01,
            Some(record) => record.score * 0.99,
            None => NEUTRAL_SCORE,
        }
    }

    /// Snapshot of an address's record
    pub fn record(&self, address: &Address) -> Option<ReputationRecord> {
        self.records.read().get(address).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_address_is_neutral() {
        let tracker = ReputationTracker::new();
        let addr = Address::new([7; 20]);
        assert_eq!(tracker.calculate_score(&addr, true), 100.0);
        assert_eq!(tracker.calculate_score(&addr, false), 100.0);
        assert!(tracker.record(&addr).is_none());
    }

    #[test]
    fn test_update_smooths_and_appends_history() {
        let tracker = ReputationTracker::new();
        let addr = Address::new([1; 20]);

        let first = tracker.update_reputation(&addr, 0.0);
        assert!((first - 80.0).abs() < 1e-9);

        let second = tracker.update_reputation(&addr, 105.0);
        assert!((second - 85.0).abs() < 1e-9);

        let record = tracker.record(&addr).unwrap();
        assert_eq!(record.history.len(), 2);
        assert!((record.history[0] - 80.0).abs() < 1e-9);
        assert!((record.weight - 0.85).abs() < 1e-9);
    }

    #[test]
    fn test_calculate_score_nudges() {
        let tracker = ReputationTracker::new();
        let addr = Address::new([2; 20]);
        tracker.update_reputation(&addr, 100.0);

        assert!((tracker.calculate_score(&addr, true) - 101.0).abs() < 1e-9);
        assert!((tracker.calculate_score(&addr, false) - 99.0).abs() < 1e-9);
    }

    #[test]
    fn test_repeated_failures_sink_below_floor() {
        let tracker = ReputationTracker::new();
        let addr = Address::new([3; 20]);
        for _ in 0..4 {
            tracker.update_reputation(&addr, 0.0);
        }
        // 100 * 0.8^4
        assert!(tracker.calculate_score(&addr, true) < 50.0);
    }
}
