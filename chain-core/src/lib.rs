//! Core blockchain data structures and traits
//!
//! This crate provides the fundamental building blocks shared by the
//! consensus engine and its collaborators:
//! - Basic types (Hash, Address, BlockNumber, etc.)
//! - Transaction and Block structures
//! - secp256k1 signing keys and the `Signer` abstraction

pub mod block;
pub mod crypto;
pub mod error;
pub mod transaction;
pub mod types;

// Re-export commonly used types
pub use block::*;
pub use crypto::*;
pub use error::*;
pub use transaction::*;
pub use types::*;
