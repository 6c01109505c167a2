//! Deterministic stake × reputation weighted proposer selection

use crate::reputation::ReputationTracker;
use crate::validator::{Validator, ValidatorSet};
use blake3::Hasher;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;

/// Domain separation tag mixed into every selection seed
const SEED_DOMAIN: &[u8] = b"bft-proposer-v1";

/// Selection seed for a `(height, round)` pair.
///
/// Depends only on public round position so every node derives the same value.
pub fn selection_seed(height: u64, round: u64) -> [u8; 32] {
    let mut hasher = Hasher::new();
    hasher.update(SEED_DOMAIN);
    hasher.update(&height.to_le_bytes());
    hasher.update(&round.to_le_bytes());
    *hasher.finalize().as_bytes()
}

/// Weighted proposer selector
pub struct ProposerSelector<'a> {
    validators: &'a ValidatorSet,
    reputation: &'a ReputationTracker,
}

impl<'a> ProposerSelector<'a> {
    /// Create a new selector over a validator set and reputation view
    pub fn new(validators: &'a ValidatorSet, reputation: &'a ReputationTracker) -> Self {
        Self {
            validators,
            reputation,
        }
    }

    /// Select the proposer for `(height, round)`, `None` only for an empty set.
    pub fn select(&self, height: u64, round: u64) -> Option<&'a Validator> {
        let first = self.validators.get_validator(0)?;

        let mut total = 0.0f64;
        let cumulative: Vec<f64> = self
            .validators
            .iter()
            .map(|v| {
                total += v.weight(self.reputation).max(0.0);
                total
            })
            .collect();

        if total <= 0.0 {
            return Some(first);
        }

        let mut rng = ChaCha20Rng::from_seed(selection_seed(height, round));
        let r = rng.random::<f64>() * total;

        let mut previous = 0.0f64;
        for (validator, &cum) in self.validators.iter().zip(cumulative.iter()) {
            // Zero-weight validators never win, even when r lands on a boundary
            if cum > previous && cum >= r {
                return Some(validator);
            }
            previous = cum;
        }

        // Floating-point slack at the top end
        self.validators.iter().rev().find(|v| v.weight(self.reputation) > 0.0)
    }
}
