//! Node configuration file

use anyhow::{bail, Context, Result};
use chain_consensus::config::default_test_validators;
use chain_consensus::BftConfig;
use chain_core::{Signer, SigningKey};
use chain_network::NetworkConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;

/// Top-level node configuration, one TOML file per validator
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub node: NodeSection,

    #[serde(default)]
    pub consensus: BftConfig,

    #[serde(default)]
    pub network: NetworkConfig,
}

/// Node identity
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    /// Hex-encoded secp256k1 secret
    pub secret_key: Option<String>,

    /// Seed phrase for a deterministic development key
    pub key_seed: Option<String>,

    /// Signed transfers placed in the pool at startup
    pub dev_transactions: u64,

    /// Seconds between metrics snapshots in the log, 0 disables them
    pub metrics_log_interval_secs: u64,
}

impl NodeConfig {
    /// Load and validate a TOML configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let mut config: NodeConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.fill_peers()?;
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration as TOML
    #[cfg(test)]
    pub fn save(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))
    }

    /// Configuration for validator `index` of the four-node local network
    pub fn dev(index: usize) -> Result<Self> {
        let validators = default_test_validators();
        let Some(own) = validators.get(index) else {
            bail!("Dev validator index must be below {}", validators.len());
        };
        let listen_address: SocketAddr = own
            .network_address
            .parse()
            .with_context(|| format!("Invalid dev address {}", own.network_address))?;

        let mut config = Self {
            node: NodeSection {
                key_seed: Some(format!("validator-{}", index)),
                dev_transactions: 10,
                metrics_log_interval_secs: 30,
                ..NodeSection::default()
            },
            consensus: BftConfig::new(validators),
            network: NetworkConfig::new().with_listen_address(listen_address),
        };
        config.fill_peers()?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve the validator signing key
    pub fn signing_key(&self) -> Result<SigningKey> {
        match (&self.node.secret_key, &self.node.key_seed) {
            (Some(secret), _) => {
                SigningKey::from_secret_hex(secret).context("Invalid node.secret_key")
            }
            (None, Some(seed)) => {
                SigningKey::from_seed(seed.as_bytes()).context("Invalid node.key_seed")
            }
            (None, None) => bail!("Either node.secret_key or node.key_seed must be set"),
        }
    }

    /// Broadcast to every other validator when no explicit peer list is given
    fn fill_peers(&mut self) -> Result<()> {
        if !self.network.peers.is_empty() {
            return Ok(());
        }
        let own = self.signing_key()?.address().to_string();
        self.network.peers = self
            .consensus
            .validators
            .iter()
            .filter(|v| !v.address.eq_ignore_ascii_case(&own))
            .map(|v| v.network_address.clone())
            .collect();
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.consensus
            .validate()
            .context("Invalid consensus configuration")?;
        if let Err(e) = self.network.validate() {
            bail!("Invalid network configuration: {}", e);
        }
        let address = self.signing_key()?.address().to_string();
        if !self
            .consensus
            .validators
            .iter()
            .any(|v| v.address.eq_ignore_ascii_case(&address))
        {
            bail!("Node key {} is not in the validator set", address);
        }
        Ok(())
    }
}
