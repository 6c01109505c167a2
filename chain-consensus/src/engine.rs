//! BFT round driver
//!
//! The engine is the only writer of the height and round counters and the
//! only task that installs a new [`RoundState`]. Message handlers mutate the
//! installed round concurrently through [`SharedRound`].

use crate::config::BftConfig;
use crate::dedup::SeenMessageCache;
use crate::handler::MessageHandler;
use crate::memory::MemoryKeyRegistry;
use crate::message::{MessageType, SignedConsensusMessage, VotePayload, VotePhase};
use crate::metrics::ConsensusMetrics;
use crate::proposer::ProposerSelector;
use crate::quorum::QuorumEvaluator;
use crate::reputation::{ReputationTracker, NEUTRAL_SCORE};
use crate::round::{ProposedBlock, RoundState, SharedRound, Step};
use crate::timer::PhaseTimer;
use crate::traits::{Broadcaster, KeyRegistry, Ledger, TransactionPool};
use crate::validator::ValidatorSet;
use crate::{ConsensusError, ConsensusResult};
use chain_core::{Address, Block, BlockNumber, Hash, Signer};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Why a round ended without a commit
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RoundFailure {
    #[error("no proposer could be selected")]
    NoProposer,

    #[error("proposer {proposer} reputation {score:.2} below floor")]
    LowReputation { proposer: Address, score: f64 },

    #[error("no transactions to propose")]
    NoTransactions,

    #[error("no valid transactions to propose")]
    NoValidTransactions,

    #[error("ledger has no head block")]
    EmptyChain,

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("round was replaced before voting")]
    StaleRound,

    #[error("precommit quorum not reached ({verified} of {total} stake)")]
    NoQuorum { verified: u64, total: u64 },

    #[error("quorum reached without a proposed block")]
    MissingProposal,

    #[error("invalid block: {0}")]
    InvalidBlock(String),

    #[error("block {0} already in ledger")]
    AlreadyCommitted(Hash),
}

impl RoundFailure {
    /// Metric label
    pub fn reason(&self) -> &'static str {
        match self {
            RoundFailure::NoProposer => "no_proposer",
            RoundFailure::LowReputation { .. } => "low_reputation",
            RoundFailure::NoTransactions => "no_transactions",
            RoundFailure::NoValidTransactions => "no_valid_transactions",
            RoundFailure::EmptyChain => "empty_chain",
            RoundFailure::Signing(_) => "signing",
            RoundFailure::StaleRound => "stale_round",
            RoundFailure::NoQuorum { .. } => "no_quorum",
            RoundFailure::MissingProposal => "missing_proposal",
            RoundFailure::InvalidBlock(_) => "invalid_block",
            RoundFailure::AlreadyCommitted(_) => "already_committed",
        }
    }
}

/// Terminal result of one round
#[derive(Debug, Clone, PartialEq)]
pub enum RoundOutcome {
    /// Block appended; height advanced and round reset
    Committed { height: BlockNumber, hash: Hash },
    /// Height unchanged; round incremented
    Failed {
        height: BlockNumber,
        round: u64,
        reason: RoundFailure,
    },
}

/// Consensus events
#[derive(Debug, Clone)]
pub enum ConsensusEvent {
    /// A round was installed
    RoundStarted {
        height: BlockNumber,
        round: u64,
        proposer: Address,
    },
    /// A round ended
    RoundFinished(RoundOutcome),
}

/// Builder collecting the engine's collaborators
pub struct EngineBuilder {
    config: BftConfig,
    signer: Arc<dyn Signer>,
    ledger: Option<Arc<dyn Ledger>>,
    pool: Option<Arc<dyn TransactionPool>>,
    broadcaster: Option<Arc<dyn Broadcaster>>,
    keys: Option<Arc<dyn KeyRegistry>>,
    reputation: Option<Arc<ReputationTracker>>,
    metrics: Option<ConsensusMetrics>,
}

impl EngineBuilder {
    pub fn ledger(mut self, ledger: Arc<dyn Ledger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn pool(mut self, pool: Arc<dyn TransactionPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn broadcaster(mut self, broadcaster: Arc<dyn Broadcaster>) -> Self {
        self.broadcaster = Some(broadcaster);
        self
    }

    /// Key registry; defaults to the keys listed in the validator config
    pub fn keys(mut self, keys: Arc<dyn KeyRegistry>) -> Self {
        self.keys = Some(keys);
        self
    }

    /// Reputation view shared by every node for proposer weights and the floor check
    pub fn reputation(mut self, reputation: Arc<ReputationTracker>) -> Self {
        self.reputation = Some(reputation);
        self
    }

    pub fn metrics(mut self, metrics: ConsensusMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Validate everything and assemble the engine
    pub fn build(self) -> ConsensusResult<ConsensusEngine> {
        self.config.validate()?;

        let ledger = self
            .ledger
            .ok_or_else(|| ConsensusError::Config("Ledger is required".to_string()))?;
        let pool = self
            .pool
            .ok_or_else(|| ConsensusError::Config("Transaction pool is required".to_string()))?;
        let broadcaster = self
            .broadcaster
            .ok_or_else(|| ConsensusError::Config("Broadcaster is required".to_string()))?;

        let validators = Arc::new(self.config.to_validator_set()?);
        let local_address = self.signer.address();
        if !validators.contains(&local_address) {
            return Err(ConsensusError::Config(format!(
                "Local key {} is not in the validator set",
                local_address
            )));
        }

        let keys = match self.keys {
            Some(keys) => keys,
            None => {
                let registry = MemoryKeyRegistry::new();
                for key in self.config.public_keys()? {
                    registry.register(key);
                }
                Arc::new(registry) as Arc<dyn KeyRegistry>
            }
        };
        let metrics = match self.metrics {
            Some(metrics) => metrics,
            None => ConsensusMetrics::unregistered()?,
        };

        let height = ledger
            .latest_block()
            .map(|b| b.number() + 1)
            .unwrap_or(0);
        let round = Arc::new(SharedRound::new());
        let seen = Arc::new(SeenMessageCache::new(self.config.seen_cache_capacity));
        let handler = Arc::new(MessageHandler::new(
            local_address,
            validators.clone(),
            round.clone(),
            seen.clone(),
            keys.clone(),
            ledger.clone(),
            metrics.clone(),
        ));

        info!(
            "Consensus engine for {} ready at height {} with {} validators",
            local_address,
            height,
            validators.len()
        );

        Ok(ConsensusEngine {
            timer: PhaseTimer::new(self.config.early_wake),
            config: self.config,
            signer: self.signer,
            local_address,
            validators,
            reputation: self.reputation.unwrap_or_default(),
            feedback: ReputationTracker::new(),
            round,
            seen,
            handler,
            keys,
            ledger,
            pool,
            broadcaster,
            metrics,
            height,
            round_number: 0,
            event_sender: None,
        })
    }
}

/// BFT consensus engine
pub struct ConsensusEngine {
    config: BftConfig,
    signer: Arc<dyn Signer>,
    local_address: Address,
    validators: Arc<ValidatorSet>,
    reputation: Arc<ReputationTracker>,
    feedback: ReputationTracker,
    round: Arc<SharedRound>,
    seen: Arc<SeenMessageCache>,
    handler: Arc<MessageHandler>,
    keys: Arc<dyn KeyRegistry>,
    ledger: Arc<dyn Ledger>,
    pool: Arc<dyn TransactionPool>,
    broadcaster: Arc<dyn Broadcaster>,
    metrics: ConsensusMetrics,
    timer: PhaseTimer,
    height: BlockNumber,
    round_number: u64,
    event_sender: Option<mpsc::UnboundedSender<ConsensusEvent>>,
}

impl ConsensusEngine {
    /// Start building an engine for `signer`
    pub fn builder(config: BftConfig, signer: Arc<dyn Signer>) -> EngineBuilder {
        EngineBuilder {
            config,
            signer,
            ledger: None,
            pool: None,
            broadcaster: None,
            keys: None,
            reputation: None,
            metrics: None,
        }
    }

    /// Handler the transport feeds inbound messages to
    pub fn handler(&self) -> Arc<MessageHandler> {
        self.handler.clone()
    }

    /// Replay cache shared with the handler
    pub fn seen_cache(&self) -> Arc<SeenMessageCache> {
        self.seen.clone()
    }

    /// Reputation view used for proposer selection
    pub fn reputation(&self) -> Arc<ReputationTracker> {
        self.reputation.clone()
    }

    /// Smoothed score of the local node after its own round outcomes
    pub fn local_score(&self) -> f64 {
        self.feedback
            .record(&self.local_address)
            .map(|r| r.score)
            .unwrap_or(NEUTRAL_SCORE)
    }

    pub fn address(&self) -> Address {
        self.local_address
    }

    /// Height under decision
    pub fn height(&self) -> BlockNumber {
        self.height
    }

    /// Round within the current height
    pub fn round(&self) -> u64 {
        self.round_number
    }

    /// Set event sender for notifications
    pub fn set_event_sender(&mut self, sender: mpsc::UnboundedSender<ConsensusEvent>) {
        self.event_sender = Some(sender);
    }

    /// Drive rounds until `shutdown` fires; a started round always runs to completion
    pub async fn run(&mut self, shutdown: CancellationToken) {
        info!("Consensus loop started for {}", self.local_address);
        while !shutdown.is_cancelled() {
            self.run_round().await;
        }
        info!(
            "Consensus loop stopped at height {} round {}",
            self.height, self.round_number
        );
    }

    /// Run one complete round
    pub async fn run_round(&mut self) -> RoundOutcome {
        if self.config.catch_up {
            self.catch_up().await;
        }

        let (height, round) = (self.height, self.round_number);
        self.metrics.record_position(height, round);

        let outcome = match self.drive(height, round).await {
            Ok(hash) => self.on_commit(height, hash),
            Err(reason) => self.on_failure(height, round, reason),
        };
        self.round.clear();
        self.send_event(ConsensusEvent::RoundFinished(outcome.clone()));
        outcome
    }

    async fn drive(&self, height: BlockNumber, round: u64) -> Result<Hash, RoundFailure> {
        // Local outcomes go to `feedback`, never into the selection view, so every
        // node weighs the same validators the same way
        let proposer = ProposerSelector::new(&self.validators, &self.reputation)
            .select(height, round)
            .map(|v| v.address)
            .ok_or(RoundFailure::NoProposer)?;

        let score = self.reputation.calculate_score(&proposer, true);
        if score < self.config.reputation_floor {
            return Err(RoundFailure::LowReputation { proposer, score });
        }

        let round_deadline = Instant::now()
            + self.config.propose_timeout()
            + self.config.prevote_timeout()
            + self.config.precommit_timeout();
        self.round.replace(RoundState::new(height, round, proposer));
        info!(
            "Starting round {} for height {}. Proposer: {}",
            round, height, proposer
        );
        self.send_event(ConsensusEvent::RoundStarted {
            height,
            round,
            proposer,
        });

        if proposer == self.local_address {
            if let Err(reason) = self.propose(height, round) {
                // Peers wait out every window for the missing proposal; stay in step with them
                sleep_until(round_deadline).await;
                return Err(reason);
            }
        } else {
            debug!("Waiting for proposal from {}", proposer);
        }

        self.timer
            .wait(self.config.propose_timeout(), self.round.changed(), || {
                self.round
                    .read(|r| r.proposed_block.is_some())
                    .unwrap_or(false)
            })
            .await;

        if self.round.position() != Some((height, round)) {
            return Err(RoundFailure::StaleRound);
        }

        self.vote(VotePhase::Prevote, height, round)?;
        self.timer
            .wait(self.config.prevote_timeout(), self.round.changed(), || {
                self.quorum(VotePhase::Prevote, height, round).0
            })
            .await;

        self.vote(VotePhase::Precommit, height, round)?;
        self.timer
            .wait(self.config.precommit_timeout(), self.round.changed(), || {
                self.quorum(VotePhase::Precommit, height, round).0
            })
            .await;

        let (reached, verified, total) = self.quorum(VotePhase::Precommit, height, round);
        info!(
            "Precommit stake {} of {} at {}/{}",
            verified, total, height, round
        );
        if !reached {
            return Err(RoundFailure::NoQuorum { verified, total });
        }

        let proposal = self
            .round
            .read(|r| r.proposed_block.clone())
            .flatten()
            .ok_or(RoundFailure::MissingProposal)?;
        self.commit(height, round, proposal)
    }

    /// Build, sign, install and broadcast a block
    fn propose(&self, height: BlockNumber, round: u64) -> Result<(), RoundFailure> {
        let candidates = self.pool.get_transactions(self.config.max_block_transactions);
        if candidates.is_empty() {
            return Err(RoundFailure::NoTransactions);
        }

        let transactions: Vec<_> = candidates.into_iter().filter(|tx| tx.verify()).collect();
        if transactions.is_empty() {
            return Err(RoundFailure::NoValidTransactions);
        }

        let parent = self.ledger.latest_block().ok_or(RoundFailure::EmptyChain)?;
        let parent_hash = parent
            .hash()
            .map_err(|e| RoundFailure::InvalidBlock(e.to_string()))?;

        let count = transactions.len();
        let mut block = Block::new(height, parent_hash, transactions, self.local_address)
            .map_err(|e| RoundFailure::InvalidBlock(e.to_string()))?;
        block
            .sign(self.signer.as_ref())
            .map_err(|e| RoundFailure::Signing(e.to_string()))?;

        let bytes = block
            .encode()
            .map_err(|e| RoundFailure::InvalidBlock(e.to_string()))?;
        let hash = block
            .hash()
            .map_err(|e| RoundFailure::InvalidBlock(e.to_string()))?;
        let signature = block
            .signature
            .as_ref()
            .map(|s| s.to_bytes().to_vec())
            .unwrap_or_default();

        self.round
            .update(height, round, |r| r.set_proposal(bytes.clone(), hash))
            .ok_or(RoundFailure::StaleRound)?;
        self.broadcaster.broadcast(&SignedConsensusMessage::new(
            MessageType::Propose,
            height,
            round,
            self.local_address,
            bytes,
            signature,
        ));

        info!("Proposed block {} with {} transactions", hash, count);
        Ok(())
    }

    /// Sign, record and broadcast our vote for the round's proposal (or nil)
    fn vote(&self, phase: VotePhase, height: BlockNumber, round: u64) -> Result<(), RoundFailure> {
        let block_hash = self.round.read(|r| r.proposal_hash()).flatten();
        let payload = VotePayload::new(phase, height, round, block_hash);
        let message = SignedConsensusMessage::vote(self.signer.as_ref(), &payload)
            .map_err(|e| RoundFailure::Signing(e.to_string()))?;

        let step = match phase {
            VotePhase::Prevote => Step::Prevote,
            VotePhase::Precommit => Step::Precommit,
        };
        self.round
            .update(height, round, |r| {
                r.advance(step);
                r.record_vote(phase, self.local_address, message.signature.clone());
            })
            .ok_or(RoundFailure::StaleRound)?;
        self.broadcaster.broadcast(&message);

        debug!("{} from {} for {}", phase.message_type(), self.local_address, payload);
        Ok(())
    }

    /// `(reached, verified stake, total stake)` for the active round's votes
    fn quorum(&self, phase: VotePhase, height: BlockNumber, round: u64) -> (bool, u64, u64) {
        let evaluator = QuorumEvaluator::new(&self.validators, self.keys.as_ref());
        self.round
            .read(|r| {
                if r.position() != (height, round) {
                    return (false, 0, self.validators.total_stake());
                }
                let payload = VotePayload::new(phase, height, round, r.proposal_hash());
                let result = evaluator.evaluate(r.votes(phase), &payload);
                (result.reached(), result.verified_stake, result.total_stake)
            })
            .unwrap_or((false, 0, self.validators.total_stake()))
    }

    /// Verify and append the decided block
    fn commit(
        &self,
        height: BlockNumber,
        round: u64,
        proposal: ProposedBlock,
    ) -> Result<Hash, RoundFailure> {
        let block =
            Block::decode(&proposal.bytes).map_err(|e| RoundFailure::InvalidBlock(e.to_string()))?;
        let hash = block
            .hash()
            .map_err(|e| RoundFailure::InvalidBlock(e.to_string()))?;
        if hash != proposal.hash {
            return Err(RoundFailure::InvalidBlock(format!(
                "hash {} does not match proposal {}",
                hash, proposal.hash
            )));
        }

        let proposer = block.header.proposer;
        let public_key = self.keys.public_key(&proposer).ok_or_else(|| {
            RoundFailure::InvalidBlock(format!("proposer {} has no public key", proposer))
        })?;
        if !block.verify_signature(&public_key).unwrap_or(false) {
            return Err(RoundFailure::InvalidBlock("invalid block signature".to_string()));
        }

        if self.ledger.has_block(&hash) {
            return Err(RoundFailure::AlreadyCommitted(hash));
        }

        let mut ids = Vec::with_capacity(block.transactions.len());
        for tx in &block.transactions {
            let Ok(id) = tx.id() else {
                warn!("Transaction in block {} could not be encoded", hash);
                continue;
            };
            if self.ledger.has_transaction(&id) {
                warn!("Transaction {} already exists in chain", id);
            } else if !tx.verify() {
                warn!("Transaction {} is invalid", id);
            }
            ids.push(id);
        }

        self.ledger.add_block(block);
        for id in &ids {
            self.pool.remove_transaction(id);
        }
        self.round.update(height, round, |r| r.advance(Step::Commit));

        self.broadcaster.broadcast(&SignedConsensusMessage::new(
            MessageType::Commit,
            height,
            round,
            self.local_address,
            proposal.bytes,
            Vec::new(),
        ));

        info!(
            "Block {} committed at height {} ({} transactions)",
            hash,
            height,
            ids.len()
        );
        Ok(hash)
    }

    fn on_commit(&mut self, height: BlockNumber, hash: Hash) -> RoundOutcome {
        self.feedback
            .update_reputation(&self.local_address, self.config.success_score);
        self.height = height + 1;
        self.round_number = 0;

        self.metrics.rounds_committed.inc();
        self.record_reputation();
        RoundOutcome::Committed { height, hash }
    }

    fn on_failure(&mut self, height: BlockNumber, round: u64, reason: RoundFailure) -> RoundOutcome {
        warn!("Round {} at height {} failed: {}", round, height, reason);
        self.feedback
            .update_reputation(&self.local_address, self.config.failure_score);
        self.round_number = round + 1;

        self.metrics
            .rounds_failed
            .with_label_values(&[reason.reason()])
            .inc();
        self.record_reputation();
        RoundOutcome::Failed {
            height,
            round,
            reason,
        }
    }

    fn record_reputation(&self) {
        self.metrics
            .local_reputation
            .set(self.local_score());
    }

    /// Adopt a peer's position when enough stake reports a longer chain
    async fn catch_up(&mut self) {
        let local = self.ledger.latest_block().map(|b| b.number()).unwrap_or(0);
        let request = SignedConsensusMessage::status(self.local_address, local);
        let reports = self.broadcaster.query_heights(request).await;

        let Some(peer_height) = stake_backed_height(&self.validators, self.local_address, &reports)
        else {
            return;
        };
        match peer_height.checked_add(1) {
            Some(target) if target > self.height => {
                info!(
                    "Node is behind. Syncing from height {} to {}",
                    self.height, target
                );
                self.height = target;
                self.round_number = 0;
            }
            Some(_) => {}
            None => warn!("Ignoring reported chain height {}", peer_height),
        }
    }

    /// Send event notification
    fn send_event(&self, event: ConsensusEvent) {
        if let Some(sender) = &self.event_sender {
            if let Err(e) = sender.send(event) {
                debug!("Failed to send consensus event: {}", e);
            }
        }
    }
}

/// Highest height reported by validators holding more than a third of the stake.
///
/// At least one honest validator is then among the reporters. Reports from
/// unknown addresses, from the local node and repeated reports are ignored.
fn stake_backed_height(
    validators: &ValidatorSet,
    local: Address,
    reports: &[(Address, BlockNumber)],
) -> Option<BlockNumber> {
    let mut counted = HashSet::new();
    let mut backed: Vec<(BlockNumber, u64)> = reports
        .iter()
        .filter(|(from, _)| *from != local && validators.contains(from) && counted.insert(*from))
        .map(|(from, height)| (*height, validators.stake_of(from)))
        .collect();
    backed.sort_unstable_by(|a, b| b.0.cmp(&a.0));

    let total = u128::from(validators.total_stake());
    let mut stake = 0u128;
    for (height, weight) in backed {
        stake += u128::from(weight);
        if stake * 3 > total {
            return Some(height);
        }
    }
    None
}
