//! In-process message hub connecting several engines without sockets

use chain_consensus::{Broadcaster, HandleOutcome, MessageHandler, SignedConsensusMessage};
use chain_core::{Address, BlockNumber};
use futures::future::BoxFuture;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::trace;

/// Routes messages between handlers registered in the same process
#[derive(Default)]
pub struct LocalHub {
    handlers: RwLock<HashMap<Address, Arc<MessageHandler>>>,
    offline: RwLock<HashSet<Address>>,
}

impl LocalHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach the inbound side of a node
    pub fn register(&self, address: Address, handler: Arc<MessageHandler>) {
        self.handlers.write().insert(address, handler);
    }

    /// Outbound side for the node at `address`
    pub fn endpoint(self: &Arc<Self>, address: Address) -> HubEndpoint {
        HubEndpoint {
            hub: self.clone(),
            local: address,
        }
    }

    /// Partition a node: it neither sends nor receives while offline
    pub fn set_offline(&self, address: Address, offline: bool) {
        let mut set = self.offline.write();
        if offline {
            set.insert(address);
        } else {
            set.remove(&address);
        }
    }

    fn peers_of(&self, local: &Address) -> Vec<Arc<MessageHandler>> {
        let offline = self.offline.read();
        if offline.contains(local) {
            return Vec::new();
        }
        self.handlers
            .read()
            .iter()
            .filter(|(addr, _)| *addr != local && !offline.contains(*addr))
            .map(|(_, handler)| handler.clone())
            .collect()
    }
}

/// Per-node handle implementing [`Broadcaster`] over a [`LocalHub`]
pub struct HubEndpoint {
    hub: Arc<LocalHub>,
    local: Address,
}

impl Broadcaster for HubEndpoint {
    fn broadcast(&self, message: &SignedConsensusMessage) {
        for handler in self.hub.peers_of(&self.local) {
            let message = message.clone();
            // Deliver on a fresh task so the sender never runs peer handlers inline
            tokio::spawn(async move {
                trace!("Hub delivering {} from {}", message.msg_type, message.from);
                handler.process_message(&message);
            });
        }
    }

    fn query_heights(
        &self,
        request: SignedConsensusMessage,
    ) -> BoxFuture<'_, Vec<(Address, BlockNumber)>> {
        let heights = self
            .hub
            .peers_of(&self.local)
            .iter()
            .filter_map(|handler| match handler.process_message(&request) {
                HandleOutcome::Reply(reply) => Some((reply.from, reply.height)),
                _ => None,
            })
            .collect();
        Box::pin(async move { heights })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chain_consensus::config::{default_test_validators, test_signing_key};
    use chain_consensus::{
        BftConfig, ConsensusEngine, Ledger, MemoryLedger, MemoryTxPool, ProposerSelector,
        ReputationTracker, RoundOutcome,
    };
    use chain_core::{Signer, SigningKey, Transaction};

    struct Node {
        engine: ConsensusEngine,
        ledger: Arc<MemoryLedger>,
        pool: Arc<MemoryTxPool>,
    }

    fn network_config() -> BftConfig {
        BftConfig::new(default_test_validators())
            .with_timeouts(60, 60, 60)
            .with_early_wake(false)
    }

    fn transfer(nonce: u64) -> Transaction {
        let key = SigningKey::from_seed(b"alice").unwrap();
        Transaction::signed_transfer(&key, nonce, Address::new([9; 20]), 5).unwrap()
    }

    /// Build and register the validators at `indices` with empty pools
    fn build_nodes(hub: &Arc<LocalHub>, indices: &[usize]) -> Vec<Node> {
        indices
            .iter()
            .map(|&i| {
                let key = test_signing_key(i);
                let address = key.address();
                let ledger = Arc::new(MemoryLedger::new());
                let pool = Arc::new(MemoryTxPool::new());

                let engine = ConsensusEngine::builder(network_config(), Arc::new(key))
                    .ledger(ledger.clone())
                    .pool(pool.clone())
                    .broadcaster(Arc::new(hub.endpoint(address)))
                    .build()
                    .unwrap();
                hub.register(address, engine.handler());
                Node {
                    engine,
                    ledger,
                    pool,
                }
            })
            .collect()
    }

    /// Build the validators at `indices`, all holding the same pending transaction
    fn spawn_network(hub: &Arc<LocalHub>, indices: &[usize]) -> Vec<Node> {
        let nodes = build_nodes(hub, indices);
        for node in &nodes {
            node.pool.add_transaction(transfer(0));
        }
        nodes
    }

    async fn run_one_round(nodes: Vec<Node>) -> Vec<(RoundOutcome, Arc<MemoryLedger>)> {
        let tasks: Vec<_> = nodes
            .into_iter()
            .map(|mut node| {
                tokio::spawn(async move {
                    let outcome = node.engine.run_round().await;
                    (outcome, node.ledger)
                })
            })
            .collect();

        let mut results = Vec::new();
        for task in tasks {
            results.push(task.await.unwrap());
        }
        results
    }

    fn first_proposer() -> Address {
        let validators = network_config().to_validator_set().unwrap();
        let reputation = ReputationTracker::new();
        ProposerSelector::new(&validators, &reputation)
            .select(1, 0)
            .unwrap()
            .address
    }

    #[tokio::test]
    async fn test_four_validators_commit_same_block() {
        let hub = LocalHub::new();
        let nodes = spawn_network(&hub, &[0, 1, 2, 3]);

        let results = run_one_round(nodes).await;
        let mut hashes = Vec::new();
        for (outcome, ledger) in &results {
            let RoundOutcome::Committed { height, hash } = outcome else {
                panic!("expected commit, got {:?}", outcome);
            };
            assert_eq!(*height, 1);
            assert!(ledger.has_block(hash));
            assert_eq!(ledger.latest_block().unwrap().header.proposer, first_proposer());
            hashes.push(*hash);
        }
        hashes.dedup();
        assert_eq!(hashes.len(), 1);
    }

    #[tokio::test]
    async fn test_commit_with_one_validator_offline() {
        let proposer = first_proposer();
        // Smallest stake that is not the proposer; remaining stake stays above two thirds
        let validators = default_test_validators();
        let offline = (0..validators.len())
            .rev()
            .find(|&i| test_signing_key(i).address() != proposer)
            .unwrap();
        let online: Vec<usize> = (0..validators.len()).filter(|&i| i != offline).collect();

        let hub = LocalHub::new();
        let nodes = spawn_network(&hub, &online);
        let results = run_one_round(nodes).await;

        assert_eq!(results.len(), 3);
        for (outcome, ledger) in &results {
            assert!(
                matches!(outcome, RoundOutcome::Committed { height: 1, .. }),
                "unexpected outcome {:?}",
                outcome
            );
            assert_eq!(ledger.latest_block().unwrap().number(), 1);
        }
    }

    #[tokio::test]
    async fn test_offline_proposer_fails_round() {
        let proposer = first_proposer();
        let online: Vec<usize> = (0..4)
            .filter(|&i| test_signing_key(i).address() != proposer)
            .collect();

        let hub = LocalHub::new();
        let nodes = spawn_network(&hub, &online);
        let results = run_one_round(nodes).await;

        for (outcome, ledger) in &results {
            assert!(matches!(
                outcome,
                RoundOutcome::Failed {
                    height: 1,
                    round: 0,
                    ..
                }
            ));
            assert_eq!(ledger.latest_block().unwrap().number(), 0);
        }
    }

    #[tokio::test]
    async fn test_query_heights_skips_offline_nodes() {
        let hub = LocalHub::new();
        let nodes = spawn_network(&hub, &[0, 1, 2, 3]);
        let endpoint = hub.endpoint(nodes[0].engine.address());
        let request = SignedConsensusMessage::status(nodes[0].engine.address(), 0);

        let mut reports = endpoint.query_heights(request.clone()).await;
        reports.sort();
        let mut expected: Vec<_> = nodes[1..]
            .iter()
            .map(|node| (node.engine.address(), 0))
            .collect();
        expected.sort();
        assert_eq!(reports, expected);

        hub.set_offline(nodes[1].engine.address(), true);
        assert_eq!(endpoint.query_heights(request.clone()).await.len(), 2);

        hub.set_offline(nodes[0].engine.address(), true);
        assert!(endpoint.query_heights(request).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_commits_resume_after_idle_rounds() {
        const IDLE_ROUNDS: u64 = 6;
        const BUSY_ROUNDS: u64 = 4;

        let hub = LocalHub::new();
        let nodes = build_nodes(&hub, &[0, 1, 2, 3]);
        let tasks: Vec<_> = nodes
            .into_iter()
            .map(|mut node| {
                tokio::spawn(async move {
                    let mut outcomes = Vec::new();
                    for round in 0..IDLE_ROUNDS + BUSY_ROUNDS {
                        if round >= IDLE_ROUNDS {
                            node.pool.add_transaction(transfer(round - IDLE_ROUNDS));
                        }
                        outcomes.push(node.engine.run_round().await);
                    }
                    (outcomes, node.ledger)
                })
            })
            .collect();

        let mut chains = Vec::new();
        for task in tasks {
            let (outcomes, ledger) = task.await.unwrap();
            let (idle, busy) = outcomes.split_at(IDLE_ROUNDS as usize);
            for (round, outcome) in idle.iter().enumerate() {
                assert!(
                    matches!(outcome, RoundOutcome::Failed { height: 1, round: r, .. } if *r == round as u64),
                    "unexpected idle outcome {:?}",
                    outcome
                );
            }
            let hashes: Vec<_> = busy
                .iter()
                .enumerate()
                .map(|(i, outcome)| match outcome {
                    RoundOutcome::Committed { height, hash } => {
                        assert_eq!(*height, i as u64 + 1);
                        *hash
                    }
                    other => panic!("expected commit, got {:?}", other),
                })
                .collect();
            assert_eq!(ledger.len(), 1 + BUSY_ROUNDS as usize);
            chains.push(hashes);
        }
        chains.dedup();
        assert_eq!(chains.len(), 1);
    }
}
