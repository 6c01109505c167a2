//! Network configuration

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the consensus listener binds to
    pub listen_address: SocketAddr,

    /// Peer addresses (`host:port`) that receive broadcasts
    pub peers: Vec<String>,

    /// Dial and read timeout in milliseconds
    pub connection_timeout_ms: u64,

    /// Upper bound on concurrent outbound sends
    pub max_concurrent_sends: usize,

    /// Largest accepted frame in bytes
    pub max_frame_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_address: SocketAddr::from(([0, 0, 0, 0], 3000)),
            peers: Vec::new(),
            connection_timeout_ms: 2_000,
            max_concurrent_sends: 64,
            max_frame_size: 4 * 1024 * 1024, // 4 MB
        }
    }
}

impl NetworkConfig {
    /// Create a new network configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set listening address
    pub fn with_listen_address(mut self, address: SocketAddr) -> Self {
        self.listen_address = address;
        self
    }

    /// Set peers
    pub fn with_peers(mut self, peers: Vec<String>) -> Self {
        self.peers = peers;
        self
    }

    /// Set connection timeout
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.connection_timeout_ms == 0 {
            return Err("Connection timeout must be greater than zero".to_string());
        }

        if self.max_concurrent_sends == 0 {
            return Err("Maximum concurrent sends must be greater than zero".to_string());
        }

        if self.max_frame_size < 1024 {
            return Err("Maximum frame size must be at least 1 KB".to_string());
        }

        if let Some(peer) = self.peers.iter().find(|p| !p.contains(':')) {
            return Err(format!("Peer address must be host:port, got {}", peer));
        }

        Ok(())
    }
}
