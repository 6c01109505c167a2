//! Transaction data structures and operations

use crate::{keccak256, recover_public_key, Address, Amount, CoreError, CoreResult, Hash, Nonce};
use crate::{Signature, Signer};
use serde::{Deserialize, Serialize};

/// Transaction data structure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct Transaction {
    /// Per-sender sequence number
    pub nonce: Nonce,
    /// Sender address; must match the signer
    pub from: Address,
    /// Recipient address
    pub to: Address,
    /// Value to transfer
    pub value: Amount,
    /// Arbitrary payload
    pub data: Vec<u8>,
    /// Sender signature over the signature-stripped encoding
    pub signature: Option<Signature>,
}

impl Transaction {
    /// Create a new unsigned transaction
    pub fn new(nonce: Nonce, from: Address, to: Address, value: Amount, data: Vec<u8>) -> Self {
        Self {
            nonce,
            from,
            to,
            value,
            data,
            signature: None,
        }
    }

    /// Create a simple transfer signed by `signer`
    pub fn signed_transfer(
        signer: &dyn Signer,
        nonce: Nonce,
        to: Address,
        value: Amount,
    ) -> CoreResult<Self> {
        let mut tx = Self::new(nonce, signer.address(), to, value, Vec::new());
        tx.sign(signer)?;
        Ok(tx)
    }

    /// Encode transaction for signing (without signature)
    pub fn encode_for_signing(&self) -> CoreResult<Vec<u8>> {
        let tx_data = TransactionForSigning {
            nonce: self.nonce,
            from: self.from,
            to: self.to,
            value: self.value,
            data: self.data.clone(),
        };

        Ok(bincode::encode_to_vec(&tx_data, bincode::config::standard())?)
    }

    /// Transaction id: hash of the signature-stripped encoding.
    ///
    /// Stable across re-signing so the pool and ledger agree on identity.
    pub fn id(&self) -> CoreResult<Hash> {
        Ok(keccak256(&self.encode_for_signing()?))
    }

    /// Sign the transaction
    pub fn sign(&mut self, signer: &dyn Signer) -> CoreResult<()> {
        if signer.address() != self.from {
            return Err(CoreError::InvalidAddress(format!(
                "signer {} is not sender {}",
                signer.address(),
                self.from
            )));
        }
        let encoded = self.encode_for_signing()?;
        self.signature = Some(signer.sign(&encoded)?);
        Ok(())
    }

    /// Recover the signer address from the signature
    pub fn sender(&self) -> CoreResult<Address> {
        let signature = self.signature.as_ref().ok_or(CoreError::InvalidSignature)?;
        let encoded = self.encode_for_signing()?;
        Ok(recover_public_key(&encoded, signature)?.address())
    }

    /// Integrity check: signed, and signed by the declared sender
    pub fn verify(&self) -> bool {
        matches!(self.sender(), Ok(sender) if sender == self.from)
    }
}

/// Helper struct for encoding transaction data for signing
#[derive(bincode::Encode)]
struct TransactionForSigning {
    nonce: Nonce,
    from: Address,
    to: Address,
    value: Amount,
    data: Vec<u8>,
}
