//! Account-chain block model and ledger application logic.
//!
//! Every account owns a linear chain of blocks linked by `previous`; value
//! moves between chains through send/receive pairs. [`Ledger::process`]
//! admits one block at a time against the store, and
//! [`Ledger::rollback`] unwinds uncemented chain tails.

pub mod block;
pub mod error;
pub mod genesis;
pub mod ledger;

pub use block::{
    Block, BlockSideband, BlockType, ChangeBlock, OpenBlock, ReceiveBlock, SendBlock, StateBlock,
    StoredBlock,
};
pub use error::LedgerError;
pub use genesis::{dev_genesis, dev_genesis_key, Genesis};
pub use ledger::{epoch_link, is_epoch_link, Ledger, ProcessResult};
