//! Block hash and related 32-byte identifier types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A 32-byte Blake2b hash identifying a block in an account's chain.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockHash([u8; 32]);

impl Default for BlockHash {
    fn default() -> Self {
        Self::ZERO
    }
}

impl BlockHash {
    pub const ZERO: Self = Self([0u8; 32]);

    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockHash(")?;
        for b in &self.0[..4] {
            write!(f, "{:02x}", b)?;
        }
        write!(f, "\u{2026})")
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02X}", b)?;
        }
        Ok(())
    }
}

impl From<crate::Account> for BlockHash {
    fn from(account: crate::Account) -> Self {
        Self(*account.as_bytes())
    }
}

/// A 32-byte value that is either a block hash or an account, depending on
/// context. Bootstrap pulls start from one of these: the requester may only
/// know a frontier hash, or an account whose chain it wants.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HashOrAccount([u8; 32]);

impl HashOrAccount {
    pub const ZERO: Self = Self([0u8; 32]);

    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    pub fn as_hash(&self) -> BlockHash {
        BlockHash(self.0)
    }

    pub fn as_account(&self) -> crate::Account {
        crate::Account::from_bytes(self.0)
    }
}

impl From<BlockHash> for HashOrAccount {
    fn from(hash: BlockHash) -> Self {
        Self(hash.0)
    }
}

impl From<crate::Account> for HashOrAccount {
    fn from(account: crate::Account) -> Self {
        Self(*account.as_bytes())
    }
}

impl fmt::Debug for HashOrAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HashOrAccount({})", self.as_hash())
    }
}

impl fmt::Display for HashOrAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_hash().fmt(f)
    }
}

/// The `link` field of a state block: a source hash, a destination account,
/// or an epoch marker, disambiguated by the balance delta.
pub type Link = HashOrAccount;

/// The root of a block: its `previous` hash, or for an open block the
/// account itself. Two blocks with the same root compete for one chain slot.
pub type Root = HashOrAccount;
