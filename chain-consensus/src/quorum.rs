//! Stake-weighted quorum over signed votes

use crate::message::VotePayload;
use crate::traits::KeyRegistry;
use crate::validator::ValidatorSet;
use chain_core::Address;
use std::collections::HashMap;
use tracing::debug;

/// `true` iff `verified` strictly exceeds two thirds of `total`
pub fn has_supermajority(verified: u64, total: u64) -> bool {
    total > 0 && 3 * verified as u128 > 2 * total as u128
}

/// Outcome of a quorum evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuorumResult {
    /// Stake of signers whose signature verified
    pub verified_stake: u64,
    /// Stake of the whole validator set
    pub total_stake: u64,
    /// Number of votes that verified
    pub valid_votes: usize,
}

impl QuorumResult {
    pub fn reached(&self) -> bool {
        has_supermajority(self.verified_stake, self.total_stake)
    }
}

/// Verifies votes against the canonical payload and sums signer stake
pub struct QuorumEvaluator<'a> {
    validators: &'a ValidatorSet,
    keys: &'a dyn KeyRegistry,
}

impl<'a> QuorumEvaluator<'a> {
    pub fn new(validators: &'a ValidatorSet, keys: &'a dyn KeyRegistry) -> Self {
        Self { validators, keys }
    }

    /// Evaluate `votes` (signer → signature) for `payload`.
    ///
    /// Unknown signers, signers without a registered key and bad signatures
    /// contribute nothing.
    pub fn evaluate(
        &self,
        votes: &HashMap<Address, Vec<u8>>,
        payload: &VotePayload,
    ) -> QuorumResult {
        let data = payload.encode();
        let mut verified_stake = 0u64;
        let mut valid_votes = 0usize;

        for (signer, signature) in votes {
            let Some(validator) = self.validators.get(signer) else {
                debug!("Vote from non-validator {} ignored", signer);
                continue;
            };
            let Some(public_key) = self.keys.public_key(signer) else {
                debug!("No public key registered for {}", signer);
                continue;
            };
            if chain_core::verify(&public_key, &data, signature) {
                verified_stake = verified_stake.saturating_add(validator.stake);
                valid_votes += 1;
            } else {
                debug!("Invalid {} signature from {}", payload.phase.message_type(), signer);
            }
        }

        QuorumResult {
            verified_stake,
            total_stake: self.validators.total_stake(),
            valid_votes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryKeyRegistry;
    use crate::message::VotePhase;
    use crate::validator::Validator;
    use chain_core::{Hash, Signer, SigningKey};

    struct Fixture {
        keys: Vec<SigningKey>,
        validators: ValidatorSet,
        registry: MemoryKeyRegistry,
    }

    fn fixture(stakes: &[u64]) -> Fixture {
        let keys: Vec<SigningKey> = (0..stakes.len())
            .map(|i| SigningKey::from_seed(format!("validator-{}", i).as_bytes()).unwrap())
            .collect();
        let validators = ValidatorSet::new(
            keys.iter()
                .zip(stakes)
                .map(|(k, &stake)| Validator::new(k.address(), "", stake))
                .collect(),
        )
        .unwrap();
        let registry = MemoryKeyRegistry::new();
        for key in &keys {
            registry.register(key.public_key());
        }
        Fixture {
            keys,
            validators,
            registry,
        }
    }

    fn payload() -> VotePayload {
        VotePayload::new(VotePhase::Precommit, 4, 1, Some(Hash::new([9; 32])))
    }

    fn votes_from(keys: &[&SigningKey], payload: &VotePayload) -> HashMap<Address, Vec<u8>> {
        keys.iter()
            .map(|k| (k.address(), k.sign(&payload.encode()).unwrap().to_bytes().to_vec()))
            .collect()
    }

    #[test]
    fn test_supermajority_threshold() {
        assert!(has_supermajority(67, 100));
        assert!(!has_supermajority(66, 100));
        // Exactly two thirds is not enough
        assert!(!has_supermajority(2, 3));
        assert!(!has_supermajority(0, 0));
        assert!(has_supermajority(u64::MAX, u64::MAX));
    }

    #[test]
    fn test_weighted_scenarios() {
        let f = fixture(&[40, 30, 20, 10]);
        let evaluator = QuorumEvaluator::new(&f.validators, &f.registry);
        let p = payload();

        let top_three = votes_from(&[&f.keys[0], &f.keys[1], &f.keys[2]], &p);
        let result = evaluator.evaluate(&top_three, &p);
        assert_eq!(result.verified_stake, 90);
        assert!(result.reached());

        let top_two = votes_from(&[&f.keys[0], &f.keys[1]], &p);
        assert!(evaluator.evaluate(&top_two, &p).reached());

        let bottom_two = votes_from(&[&f.keys[2], &f.keys[3]], &p);
        let result = evaluator.evaluate(&bottom_two, &p);
        assert_eq!(result.verified_stake, 30);
        assert!(!result.reached());
    }

    #[test]
    fn test_removing_load_bearing_signer() {
        let f = fixture(&[40, 30, 20, 10]);
        let evaluator = QuorumEvaluator::new(&f.validators, &f.registry);
        let p = payload();

        let mut votes = votes_from(&[&f.keys[0], &f.keys[2], &f.keys[3]], &p);
        assert!(evaluator.evaluate(&votes, &p).reached());

        votes.remove(&f.keys[0].address());
        assert!(!evaluator.evaluate(&votes, &p).reached());
    }

    #[test]
    fn test_mismatched_payload_contributes_nothing() {
        let f = fixture(&[40, 30, 20, 10]);
        let evaluator = QuorumEvaluator::new(&f.validators, &f.registry);
        let signed = payload();
        let other = VotePayload::new(VotePhase::Precommit, 4, 2, signed.block_hash);

        let votes = votes_from(&[&f.keys[0], &f.keys[1], &f.keys[2]], &signed);
        let result = evaluator.evaluate(&votes, &other);
        assert_eq!(result.verified_stake, 0);
        assert_eq!(result.valid_votes, 0);
    }

    #[test]
    fn test_unknown_and_unregistered_signers_ignored() {
        let f = fixture(&[40, 30, 20, 10]);
        let outsider = SigningKey::from_seed(b"outsider").unwrap();
        let registry = MemoryKeyRegistry::new();
        registry.register(f.keys[1].public_key());
        let evaluator = QuorumEvaluator::new(&f.validators, &registry);
        let p = payload();

        // keys[0] is a validator without a registered key
        let votes = votes_from(&[&f.keys[0], &f.keys[1], &outsider], &p);
        let result = evaluator.evaluate(&votes, &p);
        assert_eq!(result.verified_stake, 30);
        assert!(!result.reached());
    }

    #[test]
    fn test_garbage_signature_ignored() {
        let f = fixture(&[50, 50]);
        let evaluator = QuorumEvaluator::new(&f.validators, &f.registry);
        let p = payload();

        let mut votes = votes_from(&[&f.keys[0]], &p);
        votes.insert(f.keys[1].address(), vec![1, 2, 3]);
        assert_eq!(evaluator.evaluate(&votes, &p).verified_stake, 50);
    }
}
