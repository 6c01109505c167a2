//! secp256k1 signing keys and signature verification
//!
//! Every signature in the system is a recoverable ECDSA signature over the
//! Keccak-256 digest of the signed bytes. Verification recovers the signer's
//! public key and compares it with the expected one.

use crate::{keccak256, Address, CoreError, CoreResult};
use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use secp256k1::{Message, Secp256k1};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Length of a serialized signature (`r || s || v`)
pub const SIGNATURE_LENGTH: usize = 65;

/// Recoverable ECDSA signature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct Signature {
    pub r: [u8; 32],
    pub s: [u8; 32],
    pub v: u8,
}

impl Signature {
    /// Create new signature
    pub fn new(r: [u8; 32], s: [u8; 32], v: u8) -> Self {
        Self { r, s, v }
    }

    /// Convert to bytes (65 bytes total)
    pub fn to_bytes(&self) -> [u8; SIGNATURE_LENGTH] {
        let mut bytes = [0u8; SIGNATURE_LENGTH];
        bytes[0..32].copy_from_slice(&self.r);
        bytes[32..64].copy_from_slice(&self.s);
        bytes[64] = self.v;
        bytes
    }

    /// Create from bytes
    pub fn from_bytes(bytes: &[u8]) -> CoreResult<Self> {
        if bytes.len() != SIGNATURE_LENGTH {
            return Err(CoreError::InvalidSignature);
        }

        let mut r = [0u8; 32];
        let mut s = [0u8; 32];
        r.copy_from_slice(&bytes[0..32]);
        s.copy_from_slice(&bytes[32..64]);
        let v = bytes[64];

        Ok(Self { r, s, v })
    }

    fn to_recoverable(&self) -> CoreResult<RecoverableSignature> {
        let recovery_id = RecoveryId::from_u8_masked(self.v);

        let mut sig_bytes = [0u8; 64];
        sig_bytes[0..32].copy_from_slice(&self.r);
        sig_bytes[32..64].copy_from_slice(&self.s);

        RecoverableSignature::from_compact(&sig_bytes, recovery_id)
            .map_err(|e| CoreError::Crypto(e.to_string()))
    }
}

/// secp256k1 public key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublicKey(secp256k1::PublicKey);

impl PublicKey {
    /// Parse from compressed (33 bytes) or uncompressed (65 bytes) encoding
    pub fn from_slice(bytes: &[u8]) -> CoreResult<Self> {
        secp256k1::PublicKey::from_slice(bytes)
            .map(Self)
            .map_err(|e| CoreError::InvalidPublicKey(e.to_string()))
    }

    /// Parse from hex, with or without `0x` prefix
    pub fn from_hex(hex: &str) -> CoreResult<Self> {
        let bytes = hex::decode(hex.strip_prefix("0x").unwrap_or(hex))?;
        Self::from_slice(&bytes)
    }

    /// Compressed 33-byte encoding
    pub fn to_bytes(&self) -> [u8; 33] {
        self.0.serialize()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    /// Address = last 20 bytes of the Keccak-256 hash of the uncompressed key
    pub fn address(&self) -> Address {
        let uncompressed = self.0.serialize_uncompressed();
        let digest = keccak256(&uncompressed[1..]); // Skip the 0x04 tag
        Address::from_slice(&digest.as_bytes()[12..32])
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", self.to_hex())
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        PublicKey::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Anything able to produce signatures on behalf of a validator
pub trait Signer: Send + Sync {
    /// Address of the signing identity
    fn address(&self) -> Address;

    /// Public key of the signing identity
    fn public_key(&self) -> PublicKey;

    /// Sign arbitrary bytes
    fn sign(&self, data: &[u8]) -> CoreResult<Signature>;
}

/// In-process secp256k1 signing key
#[derive(Clone)]
pub struct SigningKey {
    secret: secp256k1::SecretKey,
    public: PublicKey,
}

impl SigningKey {
    /// Create from a raw 32-byte secret
    pub fn from_secret_bytes(secret: &[u8]) -> CoreResult<Self> {
        let secp = Secp256k1::new();
        let secret = secp256k1::SecretKey::from_slice(secret)
            .map_err(|e| CoreError::Crypto(e.to_string()))?;
        let public = PublicKey(secp256k1::PublicKey::from_secret_key(&secp, &secret));
        Ok(Self { secret, public })
    }

    /// Create from a hex-encoded secret
    pub fn from_secret_hex(hex: &str) -> CoreResult<Self> {
        let bytes = hex::decode(hex.strip_prefix("0x").unwrap_or(hex))?;
        Self::from_secret_bytes(&bytes)
    }

    /// Derive a key deterministically from an arbitrary seed phrase.
    ///
    /// Intended for local networks and tests.
    pub fn from_seed(seed: &[u8]) -> CoreResult<Self> {
        let mut digest = keccak256(seed);
        // An out-of-range scalar is astronomically unlikely; rehash if it happens
        for _ in 0..8 {
            if let Ok(key) = Self::from_secret_bytes(digest.as_bytes()) {
                return Ok(key);
            }
            digest = keccak256(digest.as_bytes());
        }
        Err(CoreError::Crypto("could not derive key from seed".to_string()))
    }

    /// Generate a fresh random key
    pub fn generate() -> Self {
        loop {
            let bytes: [u8; 32] = rand::random();
            if let Ok(key) = Self::from_secret_bytes(&bytes) {
                return key;
            }
        }
    }

    /// Hex encoding of the secret scalar
    pub fn secret_hex(&self) -> String {
        hex::encode(self.secret.secret_bytes())
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("address", &self.public.address())
            .finish_non_exhaustive()
    }
}

impl Signer for SigningKey {
    fn address(&self) -> Address {
        self.public.address()
    }

    fn public_key(&self) -> PublicKey {
        self.public
    }

    fn sign(&self, data: &[u8]) -> CoreResult<Signature> {
        let digest = keccak256(data);
        let secp = Secp256k1::new();
        let message = Message::from_digest(*digest.as_bytes());

        let sig = secp.sign_ecdsa_recoverable(message, &self.secret);
        let (recovery_id, sig_bytes) = sig.serialize_compact();

        let mut r = [0u8; 32];
        let mut s = [0u8; 32];
        r.copy_from_slice(&sig_bytes[0..32]);
        s.copy_from_slice(&sig_bytes[32..64]);

        Ok(Signature::new(r, s, recovery_id as u8))
    }
}

/// Recover the public key that produced `signature` over `data`
pub fn recover_public_key(data: &[u8], signature: &Signature) -> CoreResult<PublicKey> {
    let digest = keccak256(data);
    let secp = Secp256k1::new();
    let message = Message::from_digest(*digest.as_bytes());
    let recoverable = signature.to_recoverable()?;

    secp.recover_ecdsa(message, &recoverable)
        .map(PublicKey)
        .map_err(|e| CoreError::Crypto(e.to_string()))
}

/// Verify raw signature bytes against an expected public key.
///
/// Malformed signatures simply fail verification.
pub fn verify(public_key: &PublicKey, data: &[u8], signature: &[u8]) -> bool {
    let Ok(signature) = Signature::from_bytes(signature) else {
        return false;
    };
    match recover_public_key(data, &signature) {
        Ok(recovered) => recovered == *public_key,
        Err(_) => false,
    }
}
