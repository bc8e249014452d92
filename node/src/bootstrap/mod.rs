//! Bootstrap: pulling missing block sub-graphs from peers and serving the
//! peers doing the same.
//!
//! Two attempt kinds drive outbound pulls: [`lazy`] resolves a block graph
//! transitively from seed hashes, [`wallet`] fetches the pending receives
//! of locally owned accounts. [`server`] answers `bulk_pull`,
//! `bulk_pull_account`, and `frontier_req` from the local ledger.

pub mod connections;
pub mod lazy;
pub mod server;
pub mod wallet;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use strand_ledger::Block;
use strand_types::{Account, Amount, BlockHash, HashOrAccount};

/// Retry sentinel for pulls seeded from confirmed information. Requeue
/// arithmetic treats it with saturating comparisons so it never expires.
pub const RETRY_UNLIMITED: u32 = u32::MAX;

/// One outstanding bulk pull.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PullInfo {
    /// What the peer is asked for: a frontier hash or an account.
    pub account_or_head: HashOrAccount,
    /// The hash this pull is expected to deliver first.
    pub head: BlockHash,
    /// Walk stops before this hash; zero walks to the open block.
    pub end: BlockHash,
    /// Cap on blocks per response; zero means the peer's default.
    pub count: u32,
    /// Failed dispatches so far (network errors excluded).
    pub attempts: u32,
    /// Blocks delivered across every dispatch of this pull.
    pub processed: u64,
    pub retry_limit: u32,
}

impl PullInfo {
    pub fn new(start: HashOrAccount, count: u32, retry_limit: u32) -> Self {
        Self {
            account_or_head: start,
            head: start.as_hash(),
            end: BlockHash::ZERO,
            count,
            attempts: 0,
            processed: 0,
            retry_limit,
        }
    }
}

/// Why a pull dispatch failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PullError {
    /// Connection-level failure; the pull is requeued without penalty.
    Network,
    /// The peer answered with something unparseable; drop the connection.
    BadResponse,
}

/// One bootstrap connection able to serve pulls.
///
/// Implementations speak the wire protocol over a stream channel; tests
/// substitute an in-memory ledger walker.
pub trait PullConnection: Send + Sync {
    /// Stream the blocks of a bulk pull, newest first. `on_block` returns
    /// `true` to stop the pull early (the connection is then dropped and
    /// rescheduled). Returns the number of blocks delivered.
    fn bulk_pull(
        &self,
        pull: &PullInfo,
        on_block: &mut dyn FnMut(Block) -> bool,
    ) -> Result<u64, PullError>;

    /// Stream `{send_hash, amount}` pending entries of an account.
    fn bulk_pull_account(
        &self,
        account: &Account,
        minimum: Amount,
        on_pending: &mut dyn FnMut(BlockHash, Amount),
    ) -> Result<u64, PullError>;
}

/// Hands out idle connections to attempt run loops.
pub trait ConnectionPool: Send + Sync {
    /// Wait up to `timeout` for an idle connection.
    fn connection(&self, timeout: Duration) -> Option<Arc<dyn PullConnection>>;
}

/// Failed pulls, kept so a later attempt can re-seed from where the last
/// one gave up.
pub struct PullsCache {
    entries: Mutex<HashMap<BlockHash, PullInfo>>,
    max_entries: usize,
}

impl PullsCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_entries,
        }
    }

    pub fn add(&self, pull: &PullInfo) {
        let mut entries = self.lock();
        if entries.len() >= self.max_entries && !entries.contains_key(&pull.head) {
            return;
        }
        entries.insert(pull.head, pull.clone());
    }

    pub fn take(&self, head: &BlockHash) -> Option<PullInfo> {
        self.lock().remove(head)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<BlockHash, PullInfo>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
