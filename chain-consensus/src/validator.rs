//! Validator set for a consensus run

use crate::reputation::ReputationTracker;
use crate::{ConsensusError, ConsensusResult};
use chain_core::Address;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Validator information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validator {
    /// Validator address
    pub address: Address,
    /// Transport address peers dial to reach this validator
    pub network_address: String,
    /// Stake (voting power), fixed for the run
    pub stake: u64,
}

impl Validator {
    /// Create a new validator
    pub fn new(address: Address, network_address: impl Into<String>, stake: u64) -> Self {
        Self {
            address,
            network_address: network_address.into(),
            stake,
        }
    }

    /// Selection weight: stake scaled by the current reputation score
    pub fn weight(&self, reputation: &ReputationTracker) -> f64 {
        self.stake as f64 * reputation.calculate_score(&self.address, true)
    }
}

/// Ordered, address-unique collection of validators
#[derive(Debug, Clone, Default)]
pub struct ValidatorSet {
    validators: Vec<Validator>,
    index: HashMap<Address, usize>,
}

impl ValidatorSet {
    /// Create a validator set, rejecting duplicate addresses
    pub fn new(validators: Vec<Validator>) -> ConsensusResult<Self> {
        let mut index = HashMap::with_capacity(validators.len());
        for (i, validator) in validators.iter().enumerate() {
            if index.insert(validator.address, i).is_some() {
                return Err(ConsensusError::InvalidValidator(format!(
                    "duplicate validator address {}",
                    validator.address
                )));
            }
        }
        Ok(Self { validators, index })
    }

    /// Get validator by index
    pub fn get_validator(&self, index: usize) -> Option<&Validator> {
        self.validators.get(index)
    }

    /// Get validator by address
    pub fn get(&self, address: &Address) -> Option<&Validator> {
        self.index.get(address).map(|&i| &self.validators[i])
    }

    /// Get validator index by address
    pub fn get_validator_index(&self, address: &Address) -> Option<usize> {
        self.index.get(address).copied()
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.index.contains_key(address)
    }

    /// Stake of a validator, zero for unknown addresses
    pub fn stake_of(&self, address: &Address) -> u64 {
        self.get(address).map(|v| v.stake).unwrap_or(0)
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Validator> {
        self.validators.iter()
    }

    /// Get total number of validators
    pub fn len(&self) -> usize {
        self.validators.len()
    }

    /// Check if validator set is empty
    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    /// Get total stake
    pub fn total_stake(&self) -> u64 {
        self.validators.iter().map(|v| v.stake).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(byte: u8) -> Address {
        Address::new([byte; 20])
    }

    #[test]
    fn test_lookup_and_totals() {
        let set = ValidatorSet::new(vec![
            Validator::new(addr(1), "127.0.0.1:3001", 40),
            Validator::new(addr(2), "127.0.0.1:3002", 30),
        ])
        .unwrap();

        assert_eq!(set.len(), 2);
        assert_eq!(set.total_stake(), 70);
        assert_eq!(set.get_validator_index(&addr(2)), Some(1));
        assert_eq!(set.get(&addr(1)).unwrap().network_address, "127.0.0.1:3001");
        assert_eq!(set.stake_of(&addr(9)), 0);
        assert!(!set.contains(&addr(9)));
    }

    #[test]
    fn test_iter_walks_both_ends() {
        let set = ValidatorSet::new(vec![
            Validator::new(addr(1), "a", 5),
            Validator::new(addr(2), "b", 0),
            Validator::new(addr(3), "c", 7),
        ])
        .unwrap();

        assert_eq!(set.iter().next().unwrap().address, addr(1));
        assert_eq!(set.iter().next_back().unwrap().address, addr(3));
        let last_staked = set.iter().rev().find(|v| v.stake > 0).unwrap();
        assert_eq!(last_staked.address, addr(3));
    }

    #[test]
    fn test_duplicate_address_rejected() {
        let result = ValidatorSet::new(vec![
            Validator::new(addr(1), "a", 1),
            Validator::new(addr(1), "b", 2),
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_weight_uses_reputation() {
        let reputation = ReputationTracker::new();
        let validator = Validator::new(addr(1), "a", 10);
        assert!((validator.weight(&reputation) - 1000.0).abs() < 1e-9);

        reputation.update_reputation(&addr(1), 100.0);
        assert!((validator.weight(&reputation) - 1010.0).abs() < 1e-9);
    }
}
