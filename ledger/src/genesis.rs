//! Genesis definitions.
//!
//! The development network seeds its ledger from a well-known key so
//! multiple nodes (and tests) agree on the first block without exchanging
//! anything.

use strand_types::{Account, Amount, BlockHash, KeyPair, Signature};

use crate::block::{Block, OpenBlock};

/// Seed of the development genesis key. Publicly known; dev network only.
pub const DEV_GENESIS_SEED: [u8; 32] = [0xDA; 32];

/// A network's first block and the account that owns it.
#[derive(Clone, Debug)]
pub struct Genesis {
    pub block: Block,
    pub account: Account,
    pub hash: BlockHash,
    /// Balance assigned to the genesis account.
    pub balance: Amount,
}

/// The development genesis key pair.
pub fn dev_genesis_key() -> KeyPair {
    KeyPair::from_seed(&DEV_GENESIS_SEED)
}

/// Build the development genesis. The open block's source is the account
/// itself; no send precedes it.
pub fn dev_genesis() -> Genesis {
    let key = dev_genesis_key();
    let mut block = Block::Open(OpenBlock {
        source: BlockHash::from(key.account),
        representative: key.account,
        account: key.account,
        signature: Signature::ZERO,
        work: 0,
    });
    block.sign(&key.private);
    let hash = block.hash();
    Genesis {
        block,
        account: key.account,
        hash,
        balance: Amount::MAX,
    }
}
