//! Node error type.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Ledger(#[from] strand_ledger::LedgerError),

    #[error(transparent)]
    Store(#[from] strand_store::StoreError),

    #[error(transparent)]
    Message(#[from] strand_messages::MessageError),

    #[error(transparent)]
    Network(#[from] strand_network::NetworkError),

    #[error("record failed to decode: {0}")]
    Decode(#[from] bincode::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
