//! In-memory collaborators for single-process networks and tests

use crate::traits::{KeyRegistry, Ledger, TransactionPool};
use chain_core::{Address, Block, Hash, PublicKey, Transaction};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use tracing::debug;

#[derive(Debug, Default)]
struct LedgerInner {
    blocks: Vec<Block>,
    block_hashes: HashSet<Hash>,
    transaction_ids: HashSet<Hash>,
}

/// Append-only chain held in memory, seeded with the genesis block
#[derive(Debug)]
pub struct MemoryLedger {
    inner: RwLock<LedgerInner>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        let ledger = Self {
            inner: RwLock::new(LedgerInner::default()),
        };
        ledger.add_block(Block::genesis());
        ledger
    }

    /// Number of blocks, genesis included
    pub fn len(&self) -> usize {
        self.inner.read().blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().blocks.is_empty()
    }

    /// Block at a given number
    pub fn block(&self, number: u64) -> Option<Block> {
        self.inner
            .read()
            .blocks
            .iter()
            .find(|b| b.number() == number)
            .cloned()
    }
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl Ledger for MemoryLedger {
    fn latest_block(&self) -> Option<Block> {
        self.inner.read().blocks.last().cloned()
    }

    fn add_block(&self, block: Block) {
        let Ok(hash) = block.hash() else {
            debug!("Refusing to store unencodable block #{}", block.number());
            return;
        };
        let mut inner = self.inner.write();
        for tx in &block.transactions {
            if let Ok(id) = tx.id() {
                inner.transaction_ids.insert(id);
            }
        }
        inner.block_hashes.insert(hash);
        inner.blocks.push(block);
    }

    fn has_block(&self, hash: &Hash) -> bool {
        self.inner.read().block_hashes.contains(hash)
    }

    fn has_transaction(&self, id: &Hash) -> bool {
        self.inner.read().transaction_ids.contains(id)
    }
}

/// FIFO transaction pool that refuses ids it already holds
#[derive(Debug, Default)]
pub struct MemoryTxPool {
    pending: RwLock<Vec<(Hash, Transaction)>>,
}

impl MemoryTxPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a transaction; returns `false` for duplicates and unencodable input
    pub fn add_transaction(&self, tx: Transaction) -> bool {
        let Ok(id) = tx.id() else {
            return false;
        };
        let mut pending = self.pending.write();
        if pending.iter().any(|(known, _)| *known == id) {
            debug!("Duplicate transaction {} rejected by pool", id);
            return false;
        }
        pending.push((id, tx));
        true
    }

    pub fn len(&self) -> usize {
        self.pending.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.read().is_empty()
    }
}

impl TransactionPool for MemoryTxPool {
    fn get_transactions(&self, limit: usize) -> Vec<Transaction> {
        self.pending
            .read()
            .iter()
            .take(limit)
            .map(|(_, tx)| tx.clone())
            .collect()
    }

    fn remove_transaction(&self, id: &Hash) {
        self.pending.write().retain(|(known, _)| known != id);
    }
}

/// Explicitly constructed public key registry
#[derive(Debug, Default)]
pub struct MemoryKeyRegistry {
    keys: RwLock<HashMap<Address, PublicKey>>,
}

impl MemoryKeyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a key under the address it derives
    pub fn register(&self, public_key: PublicKey) -> Address {
        let address = public_key.address();
        self.keys.write().insert(address, public_key);
        address
    }
}

impl KeyRegistry for MemoryKeyRegistry {
    fn public_key(&self, address: &Address) -> Option<PublicKey> {
        self.keys.read().get(address).copied()
    }
}
