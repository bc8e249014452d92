//! Store error type.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("lmdb error: {0}")]
    Lmdb(#[from] heed::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt record in table {table}: {reason}")]
    Corrupt {
        table: &'static str,
        reason: String,
    },

    #[error("serialization failed: {0}")]
    Serialize(#[from] bincode::Error),
}
