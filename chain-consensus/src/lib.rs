//! Blockchain consensus engine
//!
//! This crate provides a Tendermint-style BFT consensus core: stake and
//! reputation weighted proposer election, stake-weighted quorum over signed
//! votes, the propose → prevote → precommit → commit round machine, and
//! replay-protected handling of inbound consensus messages.

pub mod config;
pub mod dedup;
pub mod engine;
pub mod error;
pub mod handler;
pub mod memory;
pub mod message;
pub mod metrics;
pub mod proposer;
pub mod quorum;
pub mod reputation;
pub mod round;
pub mod timer;
pub mod traits;
pub mod validator;

pub use config::{BftConfig, ValidatorConfig};
pub use dedup::SeenMessageCache;
pub use engine::{ConsensusEngine, ConsensusEvent, EngineBuilder, RoundFailure, RoundOutcome};
pub use error::{ConsensusError, ConsensusResult};
pub use handler::{HandleOutcome, MessageHandler, Rejection};
pub use memory::{MemoryKeyRegistry, MemoryLedger, MemoryTxPool};
pub use message::{MessageType, SignedConsensusMessage, VotePayload, VotePhase};
pub use metrics::ConsensusMetrics;
pub use proposer::ProposerSelector;
pub use quorum::{QuorumEvaluator, QuorumResult};
pub use reputation::ReputationTracker;
pub use round::{RoundState, SharedRound, Step};
pub use timer::PhaseTimer;
pub use traits::{Broadcaster, KeyRegistry, Ledger, TransactionPool};
pub use validator::{Validator, ValidatorSet};
