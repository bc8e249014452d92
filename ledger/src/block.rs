//! Block types and deterministic hashing.
//!
//! A block's hash is Blake2b-256 over a type preamble byte followed by the
//! hashable fields in declaration order; the signature covers the hash.
//! Blocks are immutable once admitted to the ledger.

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use serde::{Deserialize, Serialize};
use strand_types::{Account, Amount, BlockHash, Link, PrivateKey, Root, Signature};

type Blake2b256 = Blake2b<U32>;

/// Wire discriminant for each block type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum BlockType {
    Send = 2,
    Receive = 3,
    Open = 4,
    Change = 5,
    State = 6,
}

impl BlockType {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            2 => Some(Self::Send),
            3 => Some(Self::Receive),
            4 => Some(Self::Open),
            5 => Some(Self::Change),
            6 => Some(Self::State),
            _ => None,
        }
    }
}

/// Debits the sender's chain. `balance` is the balance *after* the send;
/// the amount is the difference from the predecessor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendBlock {
    pub previous: BlockHash,
    pub destination: Account,
    pub balance: Amount,
    pub signature: Signature,
    pub work: u64,
}

/// Pockets a send from another chain. `source` is the send block's hash.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiveBlock {
    pub previous: BlockHash,
    pub source: BlockHash,
    pub signature: Signature,
    pub work: u64,
}

/// First block of an account chain; pockets the send that funded it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenBlock {
    pub source: BlockHash,
    pub representative: Account,
    pub account: Account,
    pub signature: Signature,
    pub work: u64,
}

/// Rotates the account's consensus representative without moving value.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeBlock {
    pub previous: BlockHash,
    pub representative: Account,
    pub signature: Signature,
    pub work: u64,
}

/// Universal block. The subtype (send/receive/change/open/epoch) follows
/// from the balance delta against the predecessor and the meaning of
/// `link`: a source hash when receiving, a destination account when
/// sending, the epoch marker for upgrades, zero for a representative
/// change.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateBlock {
    pub account: Account,
    pub previous: BlockHash,
    pub representative: Account,
    pub balance: Amount,
    pub link: Link,
    pub signature: Signature,
    pub work: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Block {
    Send(SendBlock),
    Receive(ReceiveBlock),
    Open(OpenBlock),
    Change(ChangeBlock),
    State(StateBlock),
}

impl Block {
    pub fn block_type(&self) -> BlockType {
        match self {
            Block::Send(_) => BlockType::Send,
            Block::Receive(_) => BlockType::Receive,
            Block::Open(_) => BlockType::Open,
            Block::Change(_) => BlockType::Change,
            Block::State(_) => BlockType::State,
        }
    }

    /// The content hash identifying this block.
    pub fn hash(&self) -> BlockHash {
        let mut hasher = Blake2b256::new();
        hasher.update([self.block_type() as u8]);
        match self {
            Block::Send(b) => {
                hasher.update(b.previous.as_bytes());
                hasher.update(b.destination.as_bytes());
                hasher.update(b.balance.to_be_bytes());
            }
            Block::Receive(b) => {
                hasher.update(b.previous.as_bytes());
                hasher.update(b.source.as_bytes());
            }
            Block::Open(b) => {
                hasher.update(b.source.as_bytes());
                hasher.update(b.representative.as_bytes());
                hasher.update(b.account.as_bytes());
            }
            Block::Change(b) => {
                hasher.update(b.previous.as_bytes());
                hasher.update(b.representative.as_bytes());
            }
            Block::State(b) => {
                hasher.update(b.account.as_bytes());
                hasher.update(b.previous.as_bytes());
                hasher.update(b.representative.as_bytes());
                hasher.update(b.balance.to_be_bytes());
                hasher.update(b.link.as_bytes());
            }
        }
        let digest = hasher.finalize();
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        BlockHash::new(out)
    }

    /// `previous` link; zero for open blocks.
    pub fn previous(&self) -> BlockHash {
        match self {
            Block::Send(b) => b.previous,
            Block::Receive(b) => b.previous,
            Block::Open(_) => BlockHash::ZERO,
            Block::Change(b) => b.previous,
            Block::State(b) => b.previous,
        }
    }

    /// The send this block pockets, where the type states it directly.
    /// State blocks return `None`: their `link` needs the predecessor's
    /// balance before it can be read as a source.
    pub fn source(&self) -> Option<BlockHash> {
        match self {
            Block::Receive(b) => Some(b.source),
            Block::Open(b) => Some(b.source),
            _ => None,
        }
    }

    pub fn destination(&self) -> Option<Account> {
        match self {
            Block::Send(b) => Some(b.destination),
            _ => None,
        }
    }

    /// Post-block balance, for types that state it.
    pub fn balance(&self) -> Option<Amount> {
        match self {
            Block::Send(b) => Some(b.balance),
            Block::State(b) => Some(b.balance),
            _ => None,
        }
    }

    pub fn representative(&self) -> Option<Account> {
        match self {
            Block::Open(b) => Some(b.representative),
            Block::Change(b) => Some(b.representative),
            Block::State(b) => Some(b.representative),
            _ => None,
        }
    }

    pub fn link(&self) -> Link {
        match self {
            Block::State(b) => b.link,
            _ => Link::ZERO,
        }
    }

    /// The account stated in the block itself (open and state blocks);
    /// other types derive their account from the predecessor.
    pub fn account_field(&self) -> Option<Account> {
        match self {
            Block::Open(b) => Some(b.account),
            Block::State(b) => Some(b.account),
            _ => None,
        }
    }

    /// The chain slot this block competes for: `previous`, or the account
    /// for first blocks.
    pub fn root(&self) -> Root {
        let previous = self.previous();
        if !previous.is_zero() {
            Root::from(previous)
        } else {
            match self.account_field() {
                Some(account) => Root::from(account),
                None => Root::ZERO,
            }
        }
    }

    pub fn signature(&self) -> &Signature {
        match self {
            Block::Send(b) => &b.signature,
            Block::Receive(b) => &b.signature,
            Block::Open(b) => &b.signature,
            Block::Change(b) => &b.signature,
            Block::State(b) => &b.signature,
        }
    }

    /// Sign the block hash in place.
    pub fn sign(&mut self, private: &PrivateKey) {
        let signature = strand_types::keys::sign_message(self.hash().as_bytes(), private);
        match self {
            Block::Send(b) => b.signature = signature,
            Block::Receive(b) => b.signature = signature,
            Block::Open(b) => b.signature = signature,
            Block::Change(b) => b.signature = signature,
            Block::State(b) => b.signature = signature,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, Block::Open(_)) || self.previous().is_zero()
    }
}

/// Context recorded next to a block when it is admitted: which chain it
/// belongs to, where it sits, and the running balance. Saves a chain walk
/// every time an arbitrary hash must be resolved to its account.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSideband {
    pub account: Account,
    /// 1-based position in the account chain; the open block is height 1.
    pub height: u64,
    /// Account balance after this block.
    pub balance: Amount,
    /// Representative in effect after this block.
    pub representative: Account,
    /// Unix seconds when the block was admitted locally.
    pub timestamp: u64,
}

/// A block together with its sideband, as persisted in the blocks table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredBlock {
    pub block: Block,
    pub sideband: BlockSideband,
}

impl StoredBlock {
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}
