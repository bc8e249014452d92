//! Ledger error type.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error(transparent)]
    Store(#[from] strand_store::StoreError),

    #[error("block record failed to decode: {0}")]
    Decode(#[from] bincode::Error),

    #[error("ledger inconsistency: {0}")]
    Inconsistent(String),
}
