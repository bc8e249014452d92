//! Table record types and their fixed-width encodings.

use serde::{Deserialize, Serialize};
use strand_types::{Account, Amount, BlockHash};

/// Per-account summary: the head of the chain and running totals.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountInfo {
    /// Hash of the latest block in this account's chain.
    pub head: BlockHash,
    /// Consensus representative chosen by the account.
    pub representative: Account,
    /// Balance after the head block.
    pub balance: Amount,
    /// Number of blocks in this account's chain.
    pub block_count: u64,
    /// Unix seconds of the last modification.
    pub modified: u64,
}

/// Per-account cementation mark, persisted as a fixed-width pair:
/// height (8 bytes, big-endian) followed by the 32-byte frontier hash.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConfirmationHeightInfo {
    /// Count of cemented blocks, open block included.
    pub height: u64,
    /// Hash of the most recently cemented block.
    pub frontier: BlockHash,
}

impl ConfirmationHeightInfo {
    pub const ENCODED_LEN: usize = 40;

    pub fn to_bytes(&self) -> [u8; Self::ENCODED_LEN] {
        let mut out = [0u8; Self::ENCODED_LEN];
        out[..8].copy_from_slice(&self.height.to_be_bytes());
        out[8..].copy_from_slice(self.frontier.as_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::ENCODED_LEN {
            return None;
        }
        let mut height_bytes = [0u8; 8];
        height_bytes.copy_from_slice(&bytes[..8]);
        let mut frontier = [0u8; 32];
        frontier.copy_from_slice(&bytes[8..]);
        Some(Self {
            height: u64::from_be_bytes(height_bytes),
            frontier: BlockHash::new(frontier),
        })
    }
}

/// Key for the pending table: a receivable send, addressed by the
/// destination account and the send block's hash.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PendingKey {
    pub destination: Account,
    pub send_hash: BlockHash,
}

impl PendingKey {
    pub fn new(destination: Account, send_hash: BlockHash) -> Self {
        Self {
            destination,
            send_hash,
        }
    }

    pub fn to_bytes(&self) -> [u8; 64] {
        let mut out = [0u8; 64];
        out[..32].copy_from_slice(self.destination.as_bytes());
        out[32..].copy_from_slice(self.send_hash.as_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 64 {
            return None;
        }
        let mut dest = [0u8; 32];
        dest.copy_from_slice(&bytes[..32]);
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&bytes[32..]);
        Some(Self {
            destination: Account::from_bytes(dest),
            send_hash: BlockHash::new(hash),
        })
    }
}

/// Value of a pending table entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingInfo {
    /// Account that produced the send.
    pub source: Account,
    /// Amount carried by the send.
    pub amount: Amount,
}

/// Key for the unchecked table: the missing dependency hash plus the
/// waiting block's own hash, so multiple dependents of one hash coexist.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UncheckedKey {
    pub dependency: BlockHash,
    pub hash: BlockHash,
}

impl UncheckedKey {
    pub fn new(dependency: BlockHash, hash: BlockHash) -> Self {
        Self { dependency, hash }
    }

    pub fn to_bytes(&self) -> [u8; 64] {
        let mut out = [0u8; 64];
        out[..32].copy_from_slice(self.dependency.as_bytes());
        out[32..].copy_from_slice(self.hash.as_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 64 {
            return None;
        }
        let mut dep = [0u8; 32];
        dep.copy_from_slice(&bytes[..32]);
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&bytes[32..]);
        Some(Self {
            dependency: BlockHash::new(dep),
            hash: BlockHash::new(hash),
        })
    }
}
