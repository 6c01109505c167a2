//! Per-(height, round) consensus state

use crate::message::VotePhase;
use chain_core::{Address, BlockNumber, Hash};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use tokio::sync::Notify;

/// Round step, in protocol order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Step {
    Propose,
    Prevote,
    Precommit,
    Commit,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Step::Propose => "propose",
            Step::Prevote => "prevote",
            Step::Precommit => "precommit",
            Step::Commit => "commit",
        };
        f.write_str(name)
    }
}

/// Block offered for the round: signed encoding plus its detached hash
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposedBlock {
    pub bytes: Vec<u8>,
    pub hash: Hash,
}

/// State of one consensus round
#[derive(Debug, Clone)]
pub struct RoundState {
    pub height: BlockNumber,
    pub round: u64,
    pub step: Step,
    pub proposer: Address,
    pub proposed_block: Option<ProposedBlock>,
    pub prevotes: HashMap<Address, Vec<u8>>,
    pub precommits: HashMap<Address, Vec<u8>>,
}

impl RoundState {
    /// Fresh round in the Propose step
    pub fn new(height: BlockNumber, round: u64, proposer: Address) -> Self {
        Self {
            height,
            round,
            step: Step::Propose,
            proposer,
            proposed_block: None,
            prevotes: HashMap::new(),
            precommits: HashMap::new(),
        }
    }

    pub fn position(&self) -> (BlockNumber, u64) {
        (self.height, self.round)
    }

    /// Move forward to `step`; steps never go backwards
    pub fn advance(&mut self, step: Step) {
        if step > self.step {
            self.step = step;
        }
    }

    pub fn set_proposal(&mut self, bytes: Vec<u8>, hash: Hash) {
        self.proposed_block = Some(ProposedBlock { bytes, hash });
    }

    pub fn proposal_hash(&self) -> Option<Hash> {
        self.proposed_block.as_ref().map(|p| p.hash)
    }

    /// Store a vote signature, replacing any earlier one from the same signer
    pub fn record_vote(&mut self, phase: VotePhase, signer: Address, signature: Vec<u8>) {
        self.votes_mut(phase).insert(signer, signature);
    }

    pub fn votes(&self, phase: VotePhase) -> &HashMap<Address, Vec<u8>> {
        match phase {
            VotePhase::Prevote => &self.prevotes,
            VotePhase::Precommit => &self.precommits,
        }
    }

    fn votes_mut(&mut self, phase: VotePhase) -> &mut HashMap<Address, Vec<u8>> {
        match phase {
            VotePhase::Prevote => &mut self.prevotes,
            VotePhase::Precommit => &mut self.precommits,
        }
    }
}

/// The active round, shared by the round driver and message handlers.
///
/// Every mutation wakes tasks waiting in [`SharedRound::changed`].
#[derive(Debug, Default)]
pub struct SharedRound {
    current: RwLock<Option<RoundState>>,
    changed: Notify,
}

impl SharedRound {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a new round, dropping the previous one
    pub fn replace(&self, round: RoundState) {
        *self.current.write() = Some(round);
        self.changed.notify_waiters();
    }

    /// Drop the active round
    pub fn clear(&self) {
        *self.current.write() = None;
        self.changed.notify_waiters();
    }

    /// `(height, round)` of the active round
    pub fn position(&self) -> Option<(BlockNumber, u64)> {
        self.current.read().as_ref().map(RoundState::position)
    }

    /// Read the active round
    pub fn read<T>(&self, f: impl FnOnce(&RoundState) -> T) -> Option<T> {
        self.current.read().as_ref().map(f)
    }

    /// Mutate the active round if it is still at `(height, round)`
    pub fn update<T>(
        &self,
        height: BlockNumber,
        round: u64,
        f: impl FnOnce(&mut RoundState) -> T,
    ) -> Option<T> {
        let result = {
            let mut guard = self.current.write();
            match guard.as_mut() {
                Some(state) if state.position() == (height, round) => Some(f(state)),
                _ => None,
            }
        };
        if result.is_some() {
            self.changed.notify_waiters();
        }
        result
    }

    /// Snapshot of the active round
    pub fn snapshot(&self) -> Option<RoundState> {
        self.current.read().clone()
    }

    pub fn changed(&self) -> &Notify {
        &self.changed
    }
}
