//! Consensus wire messages and the canonical vote payload

use crate::{ConsensusError, ConsensusResult};
use chain_core::{Address, BlockNumber, Hash, Signer};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Consensus message type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Propose,
    Prevote,
    Precommit,
    Commit,
    Status,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Propose => "propose",
            MessageType::Prevote => "prevote",
            MessageType::Precommit => "precommit",
            MessageType::Commit => "commit",
            MessageType::Status => "status",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Signed consensus message as it travels between nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedConsensusMessage {
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    pub height: BlockNumber,
    pub round: u64,
    pub from: Address,
    #[serde(default)]
    pub data: Vec<u8>,
    #[serde(default)]
    pub signature: Vec<u8>,
}

impl SignedConsensusMessage {
    /// Create a new message
    pub fn new(
        msg_type: MessageType,
        height: BlockNumber,
        round: u64,
        from: Address,
        data: Vec<u8>,
        signature: Vec<u8>,
    ) -> Self {
        Self {
            msg_type,
            height,
            round,
            from,
            data,
            signature,
        }
    }

    /// Sign `payload` and wrap it as a vote message
    pub fn vote(signer: &dyn Signer, payload: &VotePayload) -> ConsensusResult<Self> {
        let data = payload.encode();
        let signature = signer.sign(&data)?;
        Ok(Self::new(
            payload.phase.message_type(),
            payload.height,
            payload.round,
            signer.address(),
            data,
            signature.to_bytes().to_vec(),
        ))
    }

    /// Status request, or the reply carrying the responder's chain height
    pub fn status(from: Address, height: BlockNumber) -> Self {
        Self::new(MessageType::Status, height, 0, from, Vec::new(), Vec::new())
    }

    /// Encode to JSON bytes
    pub fn encode(&self) -> ConsensusResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode from JSON bytes
    pub fn decode(bytes: &[u8]) -> ConsensusResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Voting phase covered by a [`VotePayload`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VotePhase {
    Prevote,
    Precommit,
}

impl VotePhase {
    pub fn message_type(&self) -> MessageType {
        match self {
            VotePhase::Prevote => MessageType::Prevote,
            VotePhase::Precommit => MessageType::Precommit,
        }
    }

    pub fn from_message_type(msg_type: MessageType) -> Option<Self> {
        match msg_type {
            MessageType::Prevote => Some(VotePhase::Prevote),
            MessageType::Precommit => Some(VotePhase::Precommit),
            _ => None,
        }
    }
}

/// The bytes a validator signs when voting.
///
/// Encoded as `"<phase>:<height>:<round>:<hex block hash | nil>"`. Signing,
/// inbound vote checks and quorum verification all go through [`VotePayload::encode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VotePayload {
    pub phase: VotePhase,
    pub height: BlockNumber,
    pub round: u64,
    /// Block voted for; `None` is a nil vote
    pub block_hash: Option<Hash>,
}

impl VotePayload {
    pub fn new(phase: VotePhase, height: BlockNumber, round: u64, block_hash: Option<Hash>) -> Self {
        Self {
            phase,
            height,
            round,
            block_hash,
        }
    }

    /// Canonical encoding
    pub fn encode(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }

    /// Parse a canonical encoding
    pub fn decode(bytes: &[u8]) -> ConsensusResult<Self> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| ConsensusError::Serialization(format!("vote payload: {}", e)))?;
        text.parse()
    }
}

impl fmt::Display for VotePayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phase = self.phase.message_type();
        match &self.block_hash {
            Some(hash) => write!(f, "{}:{}:{}:{}", phase, self.height, self.round, hash.to_hex()),
            None => write!(f, "{}:{}:{}:nil", phase, self.height, self.round),
        }
    }
}

impl FromStr for VotePayload {
    type Err = ConsensusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || ConsensusError::Serialization(format!("malformed vote payload: {}", s));

        let parts: Vec<&str> = s.split(':').collect();
        let [phase, height, round, hash] = parts.as_slice() else {
            return Err(malformed());
        };

        let phase = match *phase {
            "prevote" => VotePhase::Prevote,
            "precommit" => VotePhase::Precommit,
            _ => return Err(malformed()),
        };
        let height = height.parse().map_err(|_| malformed())?;
        let round = round.parse().map_err(|_| malformed())?;
        let block_hash = match *hash {
            "nil" => None,
            hex => Some(Hash::from_hex(hex).map_err(|_| malformed())?),
        };

        Ok(Self::new(phase, height, round, block_hash))
    }
}
