//! Collaborator interfaces consumed by the consensus engine

use crate::message::SignedConsensusMessage;
use chain_core::{Address, Block, BlockNumber, Hash, PublicKey, Transaction};
use futures::future::BoxFuture;

/// Persistent block store
pub trait Ledger: Send + Sync {
    /// Head of the chain, `None` when the ledger holds no blocks
    fn latest_block(&self) -> Option<Block>;

    /// Append a committed block
    fn add_block(&self, block: Block);

    /// Whether a block with this hash has been appended
    fn has_block(&self, hash: &Hash) -> bool;

    /// Whether a transaction with this id is part of any appended block
    fn has_transaction(&self, id: &Hash) -> bool;
}

/// Pending transaction pool
pub trait TransactionPool: Send + Sync {
    /// Up to `limit` pending transactions, oldest first
    fn get_transactions(&self, limit: usize) -> Vec<Transaction>;

    /// Drop a transaction by id
    fn remove_transaction(&self, id: &Hash);
}

/// Address → public key lookup
pub trait KeyRegistry: Send + Sync {
    fn public_key(&self, address: &Address) -> Option<PublicKey>;
}

/// Outbound side of the transport
pub trait Broadcaster: Send + Sync {
    /// Best-effort fan-out to every known peer; must not block
    fn broadcast(&self, message: &SignedConsensusMessage);

    /// Ask every peer for its chain height via a Status request.
    ///
    /// Each reply is returned as `(responder, height)`; unreachable peers are
    /// simply absent from the result.
    fn query_heights(
        &self,
        request: SignedConsensusMessage,
    ) -> BoxFuture<'_, Vec<(Address, BlockNumber)>>;
}
