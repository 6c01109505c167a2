//! Seen-message cache for replay protection

use crate::message::SignedConsensusMessage;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Identity of a message for deduplication.
///
/// Covers type, position, sender and payload so identical vote payloads from
/// different validators stay distinct.
pub fn message_key(message: &SignedConsensusMessage) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(message.msg_type.as_str().as_bytes());
    hasher.update(&message.height.to_le_bytes());
    hasher.update(&message.round.to_le_bytes());
    hasher.update(message.from.as_bytes());
    hasher.update(&(message.data.len() as u64).to_le_bytes());
    hasher.update(&message.data);
    *hasher.finalize().as_bytes()
}

/// Set of seen message keys with whole-cache eviction.
///
/// A key present means the message must not be applied again. The cache is
/// cleared on a fixed interval and whenever it reaches capacity, so absence
/// does not prove novelty.
#[derive(Debug)]
pub struct SeenMessageCache {
    seen: Mutex<HashSet<[u8; 32]>>,
    capacity: usize,
}

impl SeenMessageCache {
    /// Create a new cache holding at most `capacity` keys between clears
    pub fn new(capacity: usize) -> Self {
        Self {
            seen: Mutex::new(HashSet::new()),
            capacity: capacity.max(1),
        }
    }

    /// Check if a message has been seen before
    pub fn is_seen(&self, key: &[u8; 32]) -> bool {
        self.seen.lock().contains(key)
    }

    /// Mark a message as seen; returns `false` if it already was
    pub fn mark_seen(&self, key: [u8; 32]) -> bool {
        let mut seen = self.seen.lock();
        if seen.contains(&key) {
            return false;
        }
        if seen.len() >= self.capacity {
            debug!("Seen-message cache full ({} entries), clearing", seen.len());
            seen.clear();
        }
        seen.insert(key)
    }

    pub fn clear(&self) {
        self.seen.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.lock().is_empty()
    }

    /// Clear the cache every `interval` until `shutdown` fires
    pub fn spawn_eviction(
        self: Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = self.len();
                        self.clear();
                        debug!("Evicted {} seen-message entries", evicted);
                    }
                }
            }
        })
    }
}
