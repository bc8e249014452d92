//! The Strand node core: block admission, bootstrap, cementation, and
//! frontier prioritization.
//!
//! Decoded messages arrive from the channel layer; new blocks flow through
//! the [`BlockProcessor`] into the store, cementation notifications drive
//! the [`ConfirmationHeightProcessor`], and the bootstrap attempts pull
//! missing sub-graphs from peers.

pub mod block_processor;
pub mod bootstrap;
pub mod config;
pub mod confirmation_height;
pub mod error;
pub mod frontiers;
pub mod node;
pub mod peer_service;

pub use block_processor::{BlockItem, BlockProcessor};
pub use config::NodeConfig;
pub use confirmation_height::ConfirmationHeightProcessor;
pub use error::NodeError;
pub use frontiers::FrontierPrioritizer;
pub use node::{Node, StreamResponse};
pub use peer_service::PeerService;
