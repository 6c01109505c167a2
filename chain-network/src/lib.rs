//! Consensus networking layer
//!
//! This crate carries signed consensus messages between validators: a framed
//! TCP transport for real deployments and an in-process hub for running
//! several engines side by side.

pub mod codec;
pub mod config;
pub mod error;
pub mod hub;
pub mod transport;

pub use config::NetworkConfig;
pub use error::{NetworkError, NetworkResult};
pub use hub::{HubEndpoint, LocalHub};
pub use transport::{serve, TcpBroadcaster};
