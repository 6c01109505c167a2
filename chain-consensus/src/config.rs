//! BFT consensus configuration

use crate::validator::{Validator, ValidatorSet};
use crate::{ConsensusError, ConsensusResult};
use chain_core::{Address, PublicKey, Signer, SigningKey};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// BFT consensus configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BftConfig {
    /// Propose window in milliseconds
    pub propose_timeout_ms: u64,
    /// Prevote window in milliseconds
    pub prevote_timeout_ms: u64,
    /// Precommit window in milliseconds
    pub precommit_timeout_ms: u64,
    /// Maximum transactions pulled from the pool per proposal
    pub max_block_transactions: usize,
    /// Proposers scoring below this are skipped
    pub reputation_floor: f64,
    /// Reputation delta applied to the local node after a commit
    pub success_score: f64,
    /// Reputation delta applied to the local node after a failed round
    pub failure_score: f64,
    /// Seen-message cache size that triggers a clear
    pub seen_cache_capacity: usize,
    /// Seconds between whole-cache clears
    pub seen_cache_clear_interval_secs: u64,
    /// End a phase as soon as it is ready instead of waiting out the window
    pub early_wake: bool,
    /// Ask peers for their height at the start of every round
    pub catch_up: bool,
    /// Validator set
    pub validators: Vec<ValidatorConfig>,
}

/// Validator configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorConfig {
    /// Validator address (`0x` + 40 hex chars)
    pub address: String,
    /// Compressed secp256k1 public key, hex
    pub public_key: String,
    /// Transport address, `host:port`
    pub network_address: String,
    /// Validator stake (voting power)
    pub stake: u64,
}

impl ValidatorConfig {
    /// Build the config entry for a signing key
    pub fn from_key(key: &SigningKey, network_address: impl Into<String>, stake: u64) -> Self {
        Self {
            address: key.address().to_string(),
            public_key: key.public_key().to_string(),
            network_address: network_address.into(),
            stake,
        }
    }

    /// Parse and cross-check address and public key
    pub fn parse(&self) -> ConsensusResult<(Validator, PublicKey)> {
        let address: Address = self
            .address
            .parse()
            .map_err(|e| ConsensusError::Config(format!("Invalid validator address: {}", e)))?;
        let public_key = PublicKey::from_hex(&self.public_key).map_err(|e| {
            ConsensusError::Config(format!("Invalid public key for {}: {}", self.address, e))
        })?;
        if public_key.address() != address {
            return Err(ConsensusError::Config(format!(
                "Public key does not belong to validator {}",
                self.address
            )));
        }
        Ok((
            Validator::new(address, self.network_address.clone(), self.stake),
            public_key,
        ))
    }
}

impl Default for BftConfig {
    fn default() -> Self {
        Self {
            propose_timeout_ms: 1_000,
            prevote_timeout_ms: 2_000,
            precommit_timeout_ms: 1_000,
            max_block_transactions: 100,
            reputation_floor: 50.0,
            success_score: 105.0,
            failure_score: 0.0,
            seen_cache_capacity: 10_000,
            seen_cache_clear_interval_secs: 300,
            early_wake: false,
            catch_up: true,
            validators: vec![],
        }
    }
}

impl BftConfig {
    /// Create a new configuration for a validator set
    pub fn new(validators: Vec<ValidatorConfig>) -> Self {
        Self {
            validators,
            ..Self::default()
        }
    }

    /// Load configuration from file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> ConsensusResult<Self> {
        let content = fs::read_to_string(path.as_ref())
            .map_err(|e| ConsensusError::Config(format!("Failed to read config file: {}", e)))?;

        let config: BftConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> ConsensusResult<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path.as_ref(), content)
            .map_err(|e| ConsensusError::Config(format!("Failed to write config file: {}", e)))?;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConsensusResult<()> {
        if self.propose_timeout_ms == 0
            || self.prevote_timeout_ms == 0
            || self.precommit_timeout_ms == 0
        {
            return Err(ConsensusError::Config(
                "Phase timeouts must be greater than 0".to_string(),
            ));
        }

        if self.max_block_transactions == 0 {
            return Err(ConsensusError::Config(
                "Block transaction limit must be greater than 0".to_string(),
            ));
        }

        if self.seen_cache_capacity == 0 || self.seen_cache_clear_interval_secs == 0 {
            return Err(ConsensusError::Config(
                "Seen-message cache capacity and interval must be greater than 0".to_string(),
            ));
        }

        if self.validators.is_empty() {
            return Err(ConsensusError::Config(
                "At least one validator is required".to_string(),
            ));
        }

        for (i, validator) in self.validators.iter().enumerate() {
            validator.parse()?;
            if validator.network_address.is_empty() {
                return Err(ConsensusError::Config(format!(
                    "Validator {} has no network address",
                    i
                )));
            }
        }

        if self.validators.iter().map(|v| v.stake).sum::<u64>() == 0 {
            return Err(ConsensusError::Config(
                "Total validator stake must be greater than 0".to_string(),
            ));
        }

        // Duplicate addresses are caught here
        self.to_validator_set()?;
        Ok(())
    }

    /// Convert to validator set
    pub fn to_validator_set(&self) -> ConsensusResult<ValidatorSet> {
        let validators = self
            .validators
            .iter()
            .map(|v| v.parse().map(|(validator, _)| validator))
            .collect::<ConsensusResult<Vec<_>>>()?;
        ValidatorSet::new(validators)
    }

    /// Public keys of all configured validators
    pub fn public_keys(&self) -> ConsensusResult<Vec<PublicKey>> {
        self.validators
            .iter()
            .map(|v| v.parse().map(|(_, key)| key))
            .collect()
    }

    pub fn propose_timeout(&self) -> Duration {
        Duration::from_millis(self.propose_timeout_ms)
    }

    pub fn prevote_timeout(&self) -> Duration {
        Duration::from_millis(self.prevote_timeout_ms)
    }

    pub fn precommit_timeout(&self) -> Duration {
        Duration::from_millis(self.precommit_timeout_ms)
    }

    pub fn seen_cache_clear_interval(&self) -> Duration {
        Duration::from_secs(self.seen_cache_clear_interval_secs)
    }

    /// Set all three phase windows
    pub fn with_timeouts(mut self, propose_ms: u64, prevote_ms: u64, precommit_ms: u64) -> Self {
        self.propose_timeout_ms = propose_ms;
        self.prevote_timeout_ms = prevote_ms;
        self.precommit_timeout_ms = precommit_ms;
        self
    }

    /// Enable or disable early wake
    pub fn with_early_wake(mut self, early_wake: bool) -> Self {
        self.early_wake = early_wake;
        self
    }

    /// Enable or disable peer height catch-up
    pub fn with_catch_up(mut self, catch_up: bool) -> Self {
        self.catch_up = catch_up;
        self
    }
}

/// Deterministic key for test validator `index`
pub fn test_signing_key(index: usize) -> SigningKey {
    SigningKey::from_seed(format!("validator-{}", index).as_bytes())
        .unwrap_or_else(|_| SigningKey::generate())
}

/// Four local validators with stakes 40/30/20/10, for tests and dev networks
pub fn default_test_validators() -> Vec<ValidatorConfig> {
    [40, 30, 20, 10]
        .iter()
        .enumerate()
        .map(|(i, &stake)| {
            ValidatorConfig::from_key(&test_signing_key(i), format!("127.0.0.1:{}", 3000 + i), stake)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = BftConfig::default();
        assert_eq!(config.propose_timeout(), Duration::from_secs(1));
        assert_eq!(config.prevote_timeout(), Duration::from_secs(2));
        assert_eq!(config.precommit_timeout(), Duration::from_secs(1));
        assert_eq!(config.max_block_transactions, 100);
        assert_eq!(config.reputation_floor, 50.0);
        assert!(!config.early_wake);
        assert!(config.validators.is_empty());
    }

    #[test]
    fn test_config_validation() {
        let mut config = BftConfig::default();

        // Empty validator set should fail
        assert!(config.validate().is_err());

        config.validators = default_test_validators();
        assert!(config.validate().is_ok());

        config.prevote_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_mismatched_public_key_rejected() {
        let mut validators = default_test_validators();
        validators[0].public_key = validators[1].public_key.clone();
        assert!(BftConfig::new(validators).validate().is_err());
    }

    #[test]
    fn test_duplicate_validator_rejected() {
        let mut validators = default_test_validators();
        validators[1] = validators[0].clone();
        assert!(BftConfig::new(validators).validate().is_err());
    }

    #[test]
    fn test_zero_total_stake_rejected() {
        let mut validators = default_test_validators();
        for v in &mut validators {
            v.stake = 0;
        }
        assert!(BftConfig::new(validators).validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = serde_json::json!({
            "prevote_timeout_ms": 500,
            "validators": default_test_validators(),
        });
        let config: BftConfig = serde_json::from_value(json).unwrap();
        assert_eq!(config.prevote_timeout_ms, 500);
        assert_eq!(config.propose_timeout_ms, 1_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_file_operations() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("consensus.json");

        let config = BftConfig::new(default_test_validators()).with_timeouts(10, 20, 30);
        config.save_to_file(&file_path).unwrap();

        let loaded = BftConfig::load_from_file(&file_path).unwrap();
        assert_eq!(loaded.precommit_timeout_ms, 30);
        assert_eq!(loaded.validators, config.validators);
    }

    #[test]
    fn test_to_validator_set() {
        let config = BftConfig::new(default_test_validators());
        let set = config.to_validator_set().unwrap();
        assert_eq!(set.len(), 4);
        assert_eq!(set.total_stake(), 100);
        assert_eq!(config.public_keys().unwrap().len(), 4);
        assert!(set.contains(&test_signing_key(2).address()));
    }
}
