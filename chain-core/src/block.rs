//! Block data structures and operations

use crate::{keccak256, Address, BlockNumber, CoreError, CoreResult, Hash, Timestamp, Transaction};
use crate::{PublicKey, Signature, Signer};
use serde::{Deserialize, Serialize};

/// Block header containing metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct BlockHeader {
    /// Block number (height)
    pub number: BlockNumber,
    /// Hash of the parent block
    pub parent_hash: Hash,
    /// Block timestamp in milliseconds
    pub timestamp: Timestamp,
    /// Keccak-256 over the ordered transaction ids
    pub transactions_root: Hash,
    /// Validator that proposed and signed this block
    pub proposer: Address,
}

impl BlockHeader {
    /// Get the genesis block header
    pub fn genesis() -> Self {
        Self {
            number: 0,
            parent_hash: Hash::zero(),
            timestamp: 0,
            transactions_root: Hash::zero(),
            proposer: Address::zero(),
        }
    }
}

/// Complete block with header, transactions and proposer signature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct Block {
    /// Block header
    pub header: BlockHeader,
    /// List of transactions
    pub transactions: Vec<Transaction>,
    /// Proposer signature over [`Block::signing_bytes`]
    pub signature: Option<Signature>,
}

/// Borrowed view used to encode a block without its signature
#[derive(bincode::Encode)]
struct UnsignedBlock<'a> {
    header: &'a BlockHeader,
    transactions: &'a [Transaction],
}

impl Block {
    /// Create a new unsigned block on top of `parent`.
    pub fn new(
        number: BlockNumber,
        parent_hash: Hash,
        transactions: Vec<Transaction>,
        proposer: Address,
    ) -> CoreResult<Self> {
        let transactions_root = calculate_transactions_root(&transactions)?;
        Ok(Self {
            header: BlockHeader {
                number,
                parent_hash,
                timestamp: chrono::Utc::now().timestamp_millis() as Timestamp,
                transactions_root,
                proposer,
            },
            transactions,
            signature: None,
        })
    }

    /// Create genesis block
    pub fn genesis() -> Self {
        Self {
            header: BlockHeader::genesis(),
            transactions: Vec::new(),
            signature: None,
        }
    }

    /// Signature-stripped canonical encoding; this is what the proposer signs
    pub fn signing_bytes(&self) -> CoreResult<Vec<u8>> {
        let unsigned = UnsignedBlock {
            header: &self.header,
            transactions: &self.transactions,
        };
        Ok(bincode::encode_to_vec(&unsigned, bincode::config::standard())?)
    }

    /// Block hash, detached from the signature
    pub fn hash(&self) -> CoreResult<Hash> {
        Ok(keccak256(&self.signing_bytes()?))
    }

    /// Sign the block as its proposer
    pub fn sign(&mut self, signer: &dyn Signer) -> CoreResult<()> {
        if signer.address() != self.header.proposer {
            return Err(CoreError::InvalidAddress(format!(
                "signer {} is not proposer {}",
                signer.address(),
                self.header.proposer
            )));
        }
        let bytes = self.signing_bytes()?;
        self.signature = Some(signer.sign(&bytes)?);
        Ok(())
    }

    /// Check the embedded proposer signature against `public_key`
    pub fn verify_signature(&self, public_key: &PublicKey) -> CoreResult<bool> {
        let Some(signature) = &self.signature else {
            return Ok(false);
        };
        let bytes = self.signing_bytes()?;
        Ok(crate::verify(public_key, &bytes, &signature.to_bytes()))
    }

    /// Full wire encoding, signature included
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        Ok(bincode::encode_to_vec(self, bincode::config::standard())?)
    }

    /// Decode a block produced by [`Block::encode`]
    pub fn decode(bytes: &[u8]) -> CoreResult<Self> {
        let (block, read) = bincode::decode_from_slice(bytes, bincode::config::standard())?;
        if read != bytes.len() {
            return Err(CoreError::Crypto(format!(
                "trailing bytes after block: {} of {}",
                read,
                bytes.len()
            )));
        }
        Ok(block)
    }

    /// Get the block number
    pub fn number(&self) -> BlockNumber {
        self.header.number
    }

    /// Check if block is genesis
    pub fn is_genesis(&self) -> bool {
        self.header.number == 0 && self.header.parent_hash == Hash::zero()
    }
}

/// Calculate the transactions root hash
pub fn calculate_transactions_root(transactions: &[Transaction]) -> CoreResult<Hash> {
    if transactions.is_empty() {
        return Ok(Hash::zero());
    }

    let mut ids = Vec::with_capacity(transactions.len() * 32);
    for tx in transactions {
        ids.extend_from_slice(tx.id()?.as_bytes());
    }
    Ok(keccak256(&ids))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SigningKey;

    fn signed_block(key: &SigningKey) -> Block {
        let to = Address::from_hex("1234567890abcdef1234567890abcdef12345678").unwrap();
        let tx = Transaction::signed_transfer(key, 0, to, 10).unwrap();
        let mut block = Block::new(1, Block::genesis().hash().unwrap(), vec![tx], key.address())
            .unwrap();
        block.sign(key).unwrap();
        block
    }

    #[test]
    fn test_genesis_block() {
        let genesis = Block::genesis();
        assert_eq!(genesis.number(), 0);
        assert_eq!(genesis.header.parent_hash, Hash::zero());
        assert!(genesis.transactions.is_empty());
        assert!(genesis.is_genesis());
    }

    #[test]
    fn test_hash_is_detached_from_signature() {
        let key = SigningKey::from_seed(b"proposer").unwrap();
        let block = signed_block(&key);
        let mut unsigned = block.clone();
        unsigned.signature = None;
        assert_eq!(block.hash().unwrap(), unsigned.hash().unwrap());
    }

    #[test]
    fn test_encode_decode_preserves_signature() {
        let key = SigningKey::from_seed(b"proposer").unwrap();
        let block = signed_block(&key);
        let decoded = Block::decode(&block.encode().unwrap()).unwrap();
        assert_eq!(decoded, block);
        assert!(decoded.verify_signature(&key.public_key()).unwrap());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(Block::decode(&[0xff, 0x00, 0x13]).is_err());
    }

    #[test]
    fn test_signature_checks_proposer_key() {
        let key = SigningKey::from_seed(b"proposer").unwrap();
        let other = SigningKey::from_seed(b"other").unwrap();
        let block = signed_block(&key);
        assert!(!block.verify_signature(&other.public_key()).unwrap());
    }

    #[test]
    fn test_only_proposer_may_sign() {
        let key = SigningKey::from_seed(b"proposer").unwrap();
        let other = SigningKey::from_seed(b"other").unwrap();
        let mut block = Block::new(1, Hash::zero(), vec![], key.address()).unwrap();
        assert!(block.sign(&other).is_err());
    }

    #[test]
    fn test_transactions_root() {
        assert_eq!(calculate_transactions_root(&[]).unwrap(), Hash::zero());
        let key = SigningKey::from_seed(b"proposer").unwrap();
        let block = signed_block(&key);
        assert_ne!(block.header.transactions_root, Hash::zero());
    }
}
