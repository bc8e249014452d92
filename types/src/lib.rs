//! Fundamental types for the Strand protocol.
//!
//! This crate defines the core types shared across every other crate in the
//! workspace: accounts, hashes, amounts, key material, and network endpoints.

pub mod account;
pub mod amount;
pub mod endpoint;
pub mod error;
pub mod hash;
pub mod keys;
pub mod network;

pub use account::Account;
pub use amount::Amount;
pub use endpoint::Endpoint;
pub use error::TypeError;
pub use hash::{BlockHash, HashOrAccount, Link, Root};
pub use keys::{KeyPair, PrivateKey, Signature};
pub use network::NetworkId;
