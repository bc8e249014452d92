//! Transactional key/value storage for the Strand ledger.
//!
//! One LMDB environment holds every table. Reads run against snapshot
//! transactions and never block; writes are funneled through a
//! [`WriteQueue`](write_queue::WriteQueue) so exactly one exclusive writer
//! is active at a time. Table accessors take the transaction explicitly,
//! which is what makes multi-table updates atomic: everything touched
//! through one `RwTxn` becomes visible in a single commit.

pub mod error;
pub mod info;
pub mod store;
pub mod write_queue;

pub use error::StoreError;
pub use info::{AccountInfo, ConfirmationHeightInfo, PendingInfo, PendingKey, UncheckedKey};
pub use store::LedgerStore;
pub use write_queue::{WriteGuard, WriteQueue, Writer};
