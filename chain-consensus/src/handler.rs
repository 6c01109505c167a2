//! Validation and application of inbound consensus messages
//!
//! [`MessageHandler::process_message`] is the single entry point the transport
//! calls for every decoded message. It never fails: every problem with a
//! message becomes a [`Rejection`], which is logged and counted.

use crate::dedup::{message_key, SeenMessageCache};
use crate::message::{MessageType, SignedConsensusMessage, VotePayload, VotePhase};
use crate::metrics::ConsensusMetrics;
use crate::round::SharedRound;
use crate::traits::{KeyRegistry, Ledger};
use crate::validator::ValidatorSet;
use chain_core::{Address, Block, BlockNumber};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Why a message was dropped
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    #[error("duplicate message")]
    Duplicate,

    #[error("empty payload")]
    EmptyPayload,

    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("no active round")]
    NoActiveRound,

    #[error("message for {got_height}/{got_round}, current round is {height}/{round}")]
    WrongPosition {
        height: BlockNumber,
        round: u64,
        got_height: BlockNumber,
        got_round: u64,
    },

    #[error("sender {sender} is not the round proposer {proposer}")]
    NotProposer { sender: Address, proposer: Address },

    #[error("block proposer {block_proposer} does not match sender {sender}")]
    ProposerMismatch {
        sender: Address,
        block_proposer: Address,
    },

    #[error("block #{number} proposed for height {height}")]
    WrongBlockNumber { number: BlockNumber, height: BlockNumber },

    #[error("sender {0} is not a validator")]
    UnknownValidator(Address),

    #[error("no public key registered for {0}")]
    MissingPublicKey(Address),

    #[error("invalid signature from {0}")]
    InvalidSignature(Address),

    #[error("vote payload does not match message type and position")]
    PayloadMismatch,
}

impl Rejection {
    /// Metric label
    pub fn reason(&self) -> &'static str {
        match self {
            Rejection::Duplicate => "duplicate",
            Rejection::EmptyPayload => "empty_payload",
            Rejection::Malformed(_) => "malformed",
            Rejection::NoActiveRound => "no_active_round",
            Rejection::WrongPosition { .. } => "wrong_position",
            Rejection::NotProposer { .. } => "not_proposer",
            Rejection::ProposerMismatch { .. } => "proposer_mismatch",
            Rejection::WrongBlockNumber { .. } => "wrong_block_number",
            Rejection::UnknownValidator(_) => "unknown_validator",
            Rejection::MissingPublicKey(_) => "missing_public_key",
            Rejection::InvalidSignature(_) => "invalid_signature",
            Rejection::PayloadMismatch => "payload_mismatch",
        }
    }

    /// Rejections that point at a misbehaving or misconfigured peer
    fn is_suspicious(&self) -> bool {
        matches!(
            self,
            Rejection::NotProposer { .. }
                | Rejection::ProposerMismatch { .. }
                | Rejection::InvalidSignature(_)
                | Rejection::UnknownValidator(_)
        )
    }
}

/// Result of processing one message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleOutcome {
    /// Folded into the active round
    Applied,
    /// Dropped without touching round state
    Rejected(Rejection),
    /// Send this back to the requester
    Reply(SignedConsensusMessage),
    /// Accepted but has no effect on round state
    Ignored,
}

/// Consensus message handler
pub struct MessageHandler {
    local_address: Address,
    validators: Arc<ValidatorSet>,
    round: Arc<SharedRound>,
    seen: Arc<SeenMessageCache>,
    keys: Arc<dyn KeyRegistry>,
    ledger: Arc<dyn Ledger>,
    metrics: ConsensusMetrics,
}

impl MessageHandler {
    pub fn new(
        local_address: Address,
        validators: Arc<ValidatorSet>,
        round: Arc<SharedRound>,
        seen: Arc<SeenMessageCache>,
        keys: Arc<dyn KeyRegistry>,
        ledger: Arc<dyn Ledger>,
        metrics: ConsensusMetrics,
    ) -> Self {
        Self {
            local_address,
            validators,
            round,
            seen,
            keys,
            ledger,
            metrics,
        }
    }

    /// Validate and apply one inbound message
    pub fn process_message(&self, msg: &SignedConsensusMessage) -> HandleOutcome {
        let result = match msg.msg_type {
            MessageType::Propose => self.handle_propose(msg),
            MessageType::Prevote => self.handle_vote(msg, VotePhase::Prevote),
            MessageType::Precommit => self.handle_vote(msg, VotePhase::Precommit),
            MessageType::Status => Ok(self.handle_status(msg)),
            MessageType::Commit => Ok(self.handle_commit(msg)),
        };

        match result {
            Ok(outcome) => {
                if outcome == HandleOutcome::Applied {
                    self.metrics
                        .messages_applied
                        .with_label_values(&[msg.msg_type.as_str()])
                        .inc();
                }
                outcome
            }
            Err(rejection) => {
                if rejection.is_suspicious() {
                    warn!(
                        "Dropped {} from {} at {}/{}: {}",
                        msg.msg_type, msg.from, msg.height, msg.round, rejection
                    );
                } else {
                    debug!(
                        "Dropped {} from {} at {}/{}: {}",
                        msg.msg_type, msg.from, msg.height, msg.round, rejection
                    );
                }
                self.metrics
                    .messages_rejected
                    .with_label_values(&[rejection.reason()])
                    .inc();
                HandleOutcome::Rejected(rejection)
            }
        }
    }

    fn handle_propose(&self, msg: &SignedConsensusMessage) -> Result<HandleOutcome, Rejection> {
        if msg.data.is_empty() {
            return Err(Rejection::EmptyPayload);
        }
        let key = message_key(msg);
        if self.seen.is_seen(&key) {
            return Err(Rejection::Duplicate);
        }

        let block = Block::decode(&msg.data).map_err(|e| Rejection::Malformed(e.to_string()))?;

        let proposer = self.check_position(msg)?;
        if msg.from != proposer {
            return Err(Rejection::NotProposer {
                sender: msg.from,
                proposer,
            });
        }
        if block.header.proposer != msg.from {
            return Err(Rejection::ProposerMismatch {
                sender: msg.from,
                block_proposer: block.header.proposer,
            });
        }
        if block.number() != msg.height {
            return Err(Rejection::WrongBlockNumber {
                number: block.number(),
                height: msg.height,
            });
        }

        let public_key = self
            .keys
            .public_key(&msg.from)
            .ok_or(Rejection::MissingPublicKey(msg.from))?;
        let signing_bytes = block
            .signing_bytes()
            .map_err(|e| Rejection::Malformed(e.to_string()))?;
        let embedded_ok = block.verify_signature(&public_key).unwrap_or(false);
        if !embedded_ok || !chain_core::verify(&public_key, &signing_bytes, &msg.signature) {
            return Err(Rejection::InvalidSignature(msg.from));
        }

        let hash = chain_core::keccak256(&signing_bytes);
        self.round
            .update(msg.height, msg.round, |round| {
                round.set_proposal(msg.data.clone(), hash)
            })
            .ok_or(Rejection::NoActiveRound)?;
        self.seen.mark_seen(key);

        info!(
            "Accepted proposal {} for {}/{} from {} ({} txs)",
            hash,
            msg.height,
            msg.round,
            msg.from,
            block.transactions.len()
        );
        Ok(HandleOutcome::Applied)
    }

    fn handle_vote(
        &self,
        msg: &SignedConsensusMessage,
        phase: VotePhase,
    ) -> Result<HandleOutcome, Rejection> {
        if !self.validators.contains(&msg.from) {
            return Err(Rejection::UnknownValidator(msg.from));
        }
        self.check_position(msg)?;

        // Precommits are re-processed so retransmissions still land
        let key = message_key(msg);
        if phase == VotePhase::Prevote && self.seen.is_seen(&key) {
            return Err(Rejection::Duplicate);
        }

        let payload =
            VotePayload::decode(&msg.data).map_err(|e| Rejection::Malformed(e.to_string()))?;
        if payload.phase != phase || payload.height != msg.height || payload.round != msg.round {
            return Err(Rejection::PayloadMismatch);
        }

        let public_key = self
            .keys
            .public_key(&msg.from)
            .ok_or(Rejection::MissingPublicKey(msg.from))?;
        if !chain_core::verify(&public_key, &msg.data, &msg.signature) {
            return Err(Rejection::InvalidSignature(msg.from));
        }

        self.round
            .update(msg.height, msg.round, |round| {
                round.record_vote(phase, msg.from, msg.signature.clone())
            })
            .ok_or(Rejection::NoActiveRound)?;
        if phase == VotePhase::Prevote {
            self.seen.mark_seen(key);
        }

        debug!("{} from {} at {}/{} recorded", msg.msg_type, msg.from, msg.height, msg.round);
        Ok(HandleOutcome::Applied)
    }

    fn handle_status(&self, msg: &SignedConsensusMessage) -> HandleOutcome {
        if msg.from == self.local_address {
            return HandleOutcome::Ignored;
        }
        let height = self
            .ledger
            .latest_block()
            .map(|b| b.number())
            .unwrap_or(0);
        debug!("Status request from {}, answering height {}", msg.from, height);
        HandleOutcome::Reply(SignedConsensusMessage::status(self.local_address, height))
    }

    fn handle_commit(&self, msg: &SignedConsensusMessage) -> HandleOutcome {
        match Block::decode(&msg.data).and_then(|b| b.hash()) {
            Ok(hash) => info!("Peer {} committed block {} at height {}", msg.from, hash, msg.height),
            Err(_) => debug!("Peer {} announced an undecodable commit", msg.from),
        }
        HandleOutcome::Ignored
    }

    /// Check the message targets the active round; returns the round proposer
    fn check_position(&self, msg: &SignedConsensusMessage) -> Result<Address, Rejection> {
        let (position, proposer) = self
            .round
            .read(|r| (r.position(), r.proposer))
            .ok_or(Rejection::NoActiveRound)?;
        if position != (msg.height, msg.round) {
            return Err(Rejection::WrongPosition {
                height: position.0,
                round: position.1,
                got_height: msg.height,
                got_round: msg.round,
            });
        }
        Ok(proposer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{default_test_validators, test_signing_key, BftConfig};
    use crate::memory::{MemoryKeyRegistry, MemoryLedger};
    use crate::round::RoundState;
    use chain_core::{Hash, Signer, SigningKey, Transaction};

    struct Fixture {
        handler: MessageHandler,
        round: Arc<SharedRound>,
        seen: Arc<SeenMessageCache>,
        ledger: Arc<MemoryLedger>,
    }

    fn fixture() -> Fixture {
        let config = BftConfig::new(default_test_validators());
        let registry = MemoryKeyRegistry::new();
        for key in config.public_keys().unwrap() {
            registry.register(key);
        }
        let round = Arc::new(SharedRound::new());
        let seen = Arc::new(SeenMessageCache::new(100));
        let ledger = Arc::new(MemoryLedger::new());
        let handler = MessageHandler::new(
            test_signing_key(3).address(),
            Arc::new(config.to_validator_set().unwrap()),
            round.clone(),
            seen.clone(),
            Arc::new(registry),
            ledger.clone(),
            ConsensusMetrics::unregistered().unwrap(),
        );
        Fixture {
            handler,
            round,
            seen,
            ledger,
        }
    }

    fn signed_block(proposer: &SigningKey, height: u64) -> Block {
        let tx = Transaction::signed_transfer(proposer, 0, Address::new([5; 20]), 1).unwrap();
        let mut block = Block::new(height, Hash::zero(), vec![tx], proposer.address()).unwrap();
        block.sign(proposer).unwrap();
        block
    }

    fn propose(sender: &SigningKey, block: &Block, height: u64, round: u64) -> SignedConsensusMessage {
        let signature = block.signature.as_ref().unwrap().to_bytes().to_vec();
        SignedConsensusMessage::new(
            MessageType::Propose,
            height,
            round,
            sender.address(),
            block.encode().unwrap(),
            signature,
        )
    }

    fn vote(key: &SigningKey, phase: VotePhase, height: u64, round: u64) -> SignedConsensusMessage {
        let payload = VotePayload::new(phase, height, round, Some(Hash::new([1; 32])));
        SignedConsensusMessage::vote(key, &payload).unwrap()
    }

    #[test]
    fn test_valid_proposal_is_recorded() {
        let f = fixture();
        let proposer = test_signing_key(0);
        f.round.replace(RoundState::new(1, 0, proposer.address()));

        let block = signed_block(&proposer, 1);
        let outcome = f.handler.process_message(&propose(&proposer, &block, 1, 0));
        assert_eq!(outcome, HandleOutcome::Applied);
        assert_eq!(
            f.round.read(|r| r.proposal_hash()).flatten(),
            Some(block.hash().unwrap())
        );
    }

    #[test]
    fn test_proposal_with_foreign_block_proposer_rejected() {
        let f = fixture();
        let sender = test_signing_key(0);
        let other = test_signing_key(1);
        f.round.replace(RoundState::new(1, 0, sender.address()));

        // Block built and signed by another validator, relayed by the round proposer
        let block = signed_block(&other, 1);
        let outcome = f.handler.process_message(&propose(&sender, &block, 1, 0));
        assert!(matches!(
            outcome,
            HandleOutcome::Rejected(Rejection::ProposerMismatch { .. })
        ));
        assert!(f.round.read(|r| r.proposed_block.clone()).flatten().is_none());
    }

    #[test]
    fn test_proposal_from_non_proposer_rejected() {
        let f = fixture();
        let proposer = test_signing_key(0);
        let impostor = test_signing_key(1);
        f.round.replace(RoundState::new(1, 0, proposer.address()));

        let block = signed_block(&impostor, 1);
        let outcome = f.handler.process_message(&propose(&impostor, &block, 1, 0));
        assert!(matches!(
            outcome,
            HandleOutcome::Rejected(Rejection::NotProposer { .. })
        ));
    }

    #[test]
    fn test_proposal_checks() {
        let f = fixture();
        let proposer = test_signing_key(0);
        let block = signed_block(&proposer, 1);

        // No active round
        let outcome = f.handler.process_message(&propose(&proposer, &block, 1, 0));
        assert_eq!(outcome, HandleOutcome::Rejected(Rejection::NoActiveRound));

        f.round.replace(RoundState::new(1, 0, proposer.address()));

        let mut empty = propose(&proposer, &block, 1, 0);
        empty.data.clear();
        assert_eq!(
            f.handler.process_message(&empty),
            HandleOutcome::Rejected(Rejection::EmptyPayload)
        );

        let mut garbage = propose(&proposer, &block, 1, 0);
        garbage.data = vec![0xff; 8];
        assert!(matches!(
            f.handler.process_message(&garbage),
            HandleOutcome::Rejected(Rejection::Malformed(_))
        ));

        let mut tampered = block.clone();
        tampered.header.timestamp += 1;
        assert_eq!(
            f.handler.process_message(&propose(&proposer, &tampered, 1, 0)),
            HandleOutcome::Rejected(Rejection::InvalidSignature(proposer.address()))
        );

        let wrong_height = signed_block(&proposer, 7);
        assert!(matches!(
            f.handler.process_message(&propose(&proposer, &wrong_height, 1, 0)),
            HandleOutcome::Rejected(Rejection::WrongBlockNumber { .. })
        ));
    }

    #[test]
    fn test_duplicate_proposal_not_reapplied() {
        let f = fixture();
        let proposer = test_signing_key(0);
        f.round.replace(RoundState::new(1, 0, proposer.address()));
        let msg = propose(&proposer, &signed_block(&proposer, 1), 1, 0);

        assert_eq!(f.handler.process_message(&msg), HandleOutcome::Applied);
        assert_eq!(
            f.handler.process_message(&msg),
            HandleOutcome::Rejected(Rejection::Duplicate)
        );

        // After a clear the message is novel again
        f.seen.clear();
        assert_eq!(f.handler.process_message(&msg), HandleOutcome::Applied);
    }

    #[test]
    fn test_votes_recorded_per_sender() {
        let f = fixture();
        f.round.replace(RoundState::new(2, 1, test_signing_key(0).address()));

        for i in 0..3 {
            let msg = vote(&test_signing_key(i), VotePhase::Prevote, 2, 1);
            assert_eq!(f.handler.process_message(&msg), HandleOutcome::Applied);
        }
        let msg = vote(&test_signing_key(0), VotePhase::Precommit, 2, 1);
        assert_eq!(f.handler.process_message(&msg), HandleOutcome::Applied);

        assert_eq!(f.round.read(|r| r.prevotes.len()), Some(3));
        assert_eq!(f.round.read(|r| r.precommits.len()), Some(1));
    }

    #[test]
    fn test_stale_and_premature_votes_dropped() {
        let f = fixture();
        f.round.replace(RoundState::new(5, 2, test_signing_key(0).address()));
        let key = test_signing_key(1);

        for (height, round) in [(4, 2), (5, 1), (5, 3), (6, 0)] {
            let outcome = f.handler.process_message(&vote(&key, VotePhase::Precommit, height, round));
            assert!(matches!(
                outcome,
                HandleOutcome::Rejected(Rejection::WrongPosition { .. })
            ));
        }
        assert_eq!(f.round.read(|r| r.precommits.is_empty()), Some(true));
    }

    #[test]
    fn test_prevote_dedup_but_precommit_reprocessed() {
        let f = fixture();
        f.round.replace(RoundState::new(1, 0, test_signing_key(0).address()));
        let key = test_signing_key(2);

        let prevote = vote(&key, VotePhase::Prevote, 1, 0);
        assert_eq!(f.handler.process_message(&prevote), HandleOutcome::Applied);
        assert_eq!(
            f.handler.process_message(&prevote),
            HandleOutcome::Rejected(Rejection::Duplicate)
        );

        let precommit = vote(&key, VotePhase::Precommit, 1, 0);
        assert_eq!(f.handler.process_message(&precommit), HandleOutcome::Applied);
        assert_eq!(f.handler.process_message(&precommit), HandleOutcome::Applied);
    }

    #[test]
    fn test_vote_authentication() {
        let f = fixture();
        f.round.replace(RoundState::new(1, 0, test_signing_key(0).address()));

        let outsider = SigningKey::from_seed(b"outsider").unwrap();
        assert!(matches!(
            f.handler.process_message(&vote(&outsider, VotePhase::Prevote, 1, 0)),
            HandleOutcome::Rejected(Rejection::UnknownValidator(_))
        ));

        // Signed by validator 1 but claiming to come from validator 2
        let mut forged = vote(&test_signing_key(1), VotePhase::Prevote, 1, 0);
        forged.from = test_signing_key(2).address();
        assert!(matches!(
            f.handler.process_message(&forged),
            HandleOutcome::Rejected(Rejection::InvalidSignature(_))
        ));

        // A prevote payload sent as a precommit
        let mut relabelled = vote(&test_signing_key(1), VotePhase::Prevote, 1, 0);
        relabelled.msg_type = MessageType::Precommit;
        assert_eq!(
            f.handler.process_message(&relabelled),
            HandleOutcome::Rejected(Rejection::PayloadMismatch)
        );
        assert_eq!(f.round.read(|r| r.prevotes.len() + r.precommits.len()), Some(0));
    }

    #[test]
    fn test_status_reply() {
        let f = fixture();
        let peer = test_signing_key(0).address();

        match f.handler.process_message(&SignedConsensusMessage::status(peer, 0)) {
            HandleOutcome::Reply(reply) => {
                assert_eq!(reply.msg_type, MessageType::Status);
                assert_eq!(reply.height, f.ledger.latest_block().unwrap().number());
                assert_eq!(reply.from, test_signing_key(3).address());
            }
            other => panic!("expected reply, got {:?}", other),
        }

        let own = SignedConsensusMessage::status(test_signing_key(3).address(), 0);
        assert_eq!(f.handler.process_message(&own), HandleOutcome::Ignored);
    }

    #[test]
    fn test_commit_announcement_is_only_logged() {
        let f = fixture();
        f.round.replace(RoundState::new(1, 0, test_signing_key(0).address()));
        let block = signed_block(&test_signing_key(0), 1);
        let msg = SignedConsensusMessage::new(
            MessageType::Commit,
            1,
            0,
            test_signing_key(0).address(),
            block.encode().unwrap(),
            vec![],
        );
        assert_eq!(f.handler.process_message(&msg), HandleOutcome::Ignored);
        assert_eq!(f.round.read(|r| r.proposed_block.is_none()), Some(true));
    }
}
