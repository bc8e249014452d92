//! Lazy bootstrap: resolve a block sub-graph transitively from seed hashes.
//!
//! Starting from hashes the caller trusts (typically observed confirmed),
//! the attempt pulls chains from peers, discovers dependencies as blocks
//! arrive (`source` links, state-block subtypes, send destinations), and
//! feeds everything into the block processor. Memory stays bounded: seen
//! hashes are kept as 64-bit digests, per-pull batch sizes shrink when
//! responses mostly duplicate what is already held, and the attempt
//! expires on a wallclock cap.
//!
//! Lock order: the pulls mutex is never taken while holding `lazy`;
//! requeue paths release `lazy` before touching the pulls queue.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use strand_ledger::{is_epoch_link, Block, Ledger};
use strand_types::{Account, Amount, BlockHash, HashOrAccount, Link};
use strand_utils::Stats;

use crate::block_processor::{BlockItem, BlockProcessor};
use crate::bootstrap::{ConnectionPool, PullError, PullInfo, PullsCache, RETRY_UNLIMITED};
use crate::config::BootstrapConfig;
use crate::NodeError;

/// Most speculative destination pulls released per flush.
const DESTINATIONS_REQUEST_LIMIT: usize = 1024;
/// Total-block threshold before adaptive batch sizing kicks in.
const BATCH_RESIZE_BLOCKS_LIMIT: u64 = 4096;
/// Duplicate-to-fresh ratio above which batches shrink.
const BATCH_RESIZE_RATIO: f64 = 2.0;
/// Fresh-block count that forces the attempt to restart (legacy mode).
const BLOCKS_RESTART_LIMIT: usize = 1024 * 1024;
/// Re-flush interval when the run loop is otherwise idle.
const FLUSH_DELAY: Duration = Duration::from_secs(5);

/// A state block whose subtype cannot be decided until its predecessor's
/// balance is known.
#[derive(Clone, Debug, PartialEq, Eq)]
struct BacklogItem {
    link: Link,
    /// Balance claimed by the deferred state block.
    balance: Amount,
    retry_limit: u32,
}

/// Send destinations discovered so far, count-ordered and account-unique.
/// Two cooperating structures updated together: the map carries the
/// current count, the ordered set yields eviction/flush order.
#[derive(Default)]
struct LazyDestinations {
    by_account: HashMap<Account, u64>,
    ordered: BTreeSet<(u64, Account)>,
}

impl LazyDestinations {
    fn increment(&mut self, account: Account) {
        let count = self.by_account.entry(account).or_insert(0);
        if *count > 0 {
            self.ordered.remove(&(*count, account));
        }
        *count += 1;
        self.ordered.insert((*count, account));
    }

    fn len(&self) -> usize {
        self.by_account.len()
    }

    fn is_empty(&self) -> bool {
        self.by_account.is_empty()
    }

    /// Remove and return up to `limit` accounts, highest count first.
    fn drain_top(&mut self, limit: usize) -> Vec<Account> {
        let mut out = Vec::new();
        while out.len() < limit {
            let Some(&(count, account)) = self.ordered.iter().next_back() else {
                break;
            };
            self.ordered.remove(&(count, account));
            self.by_account.remove(&account);
            out.push(account);
        }
        out
    }
}

struct LazyState {
    /// Seed hashes the caller asked for; the attempt is not finished
    /// until each exists in storage.
    keys: HashSet<HashOrAccount>,
    /// Discovered hashes waiting to become pulls.
    pulls: VecDeque<(HashOrAccount, u32)>,
    /// Digests of hashes already received this attempt.
    blocks: HashSet<u64>,
    blocks_count: usize,
    /// previous → deferred state-block subtype decision.
    state_backlog: HashMap<BlockHash, BacklogItem>,
    /// Recent balances, for subtype decisions without a storage read.
    balances: HashMap<BlockHash, Amount>,
    destinations: LazyDestinations,
    /// Links already re-requested from an undecidable backlog entry.
    undefined_links: HashSet<BlockHash>,
    destinations_flushed: bool,
}

struct PullsState {
    pulls: VecDeque<PullInfo>,
}

pub struct LazyBootstrap {
    ledger: Arc<Ledger>,
    block_processor: Arc<BlockProcessor>,
    cache: Arc<PullsCache>,
    stats: Arc<Stats>,
    config: BootstrapConfig,

    pulls: Mutex<PullsState>,
    condition: Condvar,
    lazy: Mutex<LazyState>,

    stopped: AtomicBool,
    total_blocks: AtomicU64,
    requeued_pulls: AtomicU64,
    started_at: Mutex<Instant>,
    last_flush: Mutex<Instant>,
}

impl LazyBootstrap {
    pub fn new(
        ledger: Arc<Ledger>,
        block_processor: Arc<BlockProcessor>,
        cache: Arc<PullsCache>,
        stats: Arc<Stats>,
        config: BootstrapConfig,
    ) -> Self {
        tracing::info!("starting lazy bootstrap attempt");
        Self {
            ledger,
            block_processor,
            cache,
            stats,
            config,
            pulls: Mutex::new(PullsState {
                pulls: VecDeque::new(),
            }),
            condition: Condvar::new(),
            lazy: Mutex::new(LazyState {
                keys: HashSet::new(),
                pulls: VecDeque::new(),
                blocks: HashSet::new(),
                blocks_count: 0,
                state_backlog: HashMap::new(),
                balances: HashMap::new(),
                destinations: LazyDestinations::default(),
                undefined_links: HashSet::new(),
                destinations_flushed: false,
            }),
            stopped: AtomicBool::new(false),
            total_blocks: AtomicU64::new(0),
            requeued_pulls: AtomicU64::new(0),
            started_at: Mutex::new(Instant::now()),
            last_flush: Mutex::new(Instant::now()),
        }
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.condition.notify_all();
    }

    pub fn stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn total_blocks(&self) -> u64 {
        self.total_blocks.load(Ordering::Relaxed)
    }

    pub fn requeued_pulls(&self) -> u64 {
        self.requeued_pulls.load(Ordering::Relaxed)
    }

    pub fn lazy_blocks_count(&self) -> usize {
        self.lock_lazy().blocks_count
    }

    pub fn backlog_len(&self) -> usize {
        self.lock_lazy().state_backlog.len()
    }

    pub fn destinations_len(&self) -> usize {
        self.lock_lazy().destinations.len()
    }

    pub fn pulls_len(&self) -> usize {
        self.lock_pulls().pulls.len()
    }

    // ── Seeding ─────────────────────────────────────────────────────────

    /// Register a seed hash. Pulls seeded from confirmed information get
    /// the unlimited retry sentinel.
    pub fn lazy_start(&self, seed: HashOrAccount, confirmed: bool) {
        let max_keys: usize = if self.config.disable_legacy_bootstrap {
            4 * 1024
        } else {
            1024
        };
        let mut lazy = self.lock_lazy();
        if lazy.keys.len() < max_keys
            && !lazy.keys.contains(&seed)
            && !blocks_processed(&lazy, &seed.as_hash())
        {
            lazy.keys.insert(seed);
            let retry_limit = if confirmed {
                RETRY_UNLIMITED
            } else {
                self.config.lazy_retry_limit
            };
            lazy.pulls.push_back((seed, retry_limit));
        }
    }

    /// Re-seed a hash known to this attempt after an external
    /// invalidation (e.g. a fork winner replaced it).
    pub fn lazy_requeue(&self, hash: &BlockHash, previous: &BlockHash, confirmed: bool) {
        let mut lazy = self.lock_lazy();
        if blocks_processed(&lazy, hash) {
            blocks_erase(&mut lazy, hash);
            drop(lazy);
            let mut pull = PullInfo::new(HashOrAccount::from(*hash), 1, if confirmed {
                RETRY_UNLIMITED
            } else {
                self.config.lazy_destinations_retry_limit
            });
            pull.end = *previous;
            self.requeue_pull(pull, false);
        }
    }

    // ── Pull queue management ───────────────────────────────────────────

    /// Move ready lazy pulls into the dispatch queue. The only path from
    /// `lazy_pulls` to `pulls`; capped at three times the per-connection
    /// block target and deduplicated against received blocks and storage.
    fn lazy_pull_flush(&self, pulls_state: &mut PullsState) -> Result<(), NodeError> {
        let max_pulls = self.config.target_blocks_per_connection * 3;
        if pulls_state.pulls.len() >= max_pulls {
            return Ok(());
        }
        *self.lock_last_flush() = Instant::now();

        let batch_count = self.batch_count();
        let txn = self.ledger.store().read_txn()?;
        let mut lazy = self.lock_lazy();
        let mut count = 0usize;
        while let Some(&(start, retry_limit)) = lazy.pulls.front() {
            if pulls_state.pulls.len() + count >= max_pulls {
                break;
            }
            lazy.pulls.pop_front();
            if !blocks_processed(&lazy, &start.as_hash())
                && !self.ledger.block_exists(&txn, &start.as_hash())?
            {
                pulls_state
                    .pulls
                    .push_back(PullInfo::new(start, batch_count, retry_limit));
                count += 1;
            }
        }
        Ok(())
    }

    /// Adaptive per-pull block count: shrink when responses mostly repeat
    /// blocks this attempt has already seen.
    fn batch_count(&self) -> u32 {
        let total = self.total_blocks.load(Ordering::Relaxed);
        let fresh = self.lock_lazy().blocks_count;
        let max = self.config.lazy_max_pull_blocks;
        if total <= BATCH_RESIZE_BLOCKS_LIMIT || fresh == 0 {
            return max;
        }
        let ratio = total as f64 / fresh as f64;
        if ratio <= BATCH_RESIZE_RATIO {
            return max;
        }
        let ratio_factor = (ratio / BATCH_RESIZE_RATIO).powi(3);
        let total_factor = (total as f64 / BATCH_RESIZE_BLOCKS_LIMIT as f64).sqrt();
        let shrunk = (max as f64 / (ratio_factor * total_factor)) as u32;
        shrunk.max(self.config.lazy_min_pull_blocks)
    }

    /// Put a failed or incomplete pull back, within the retry policy.
    pub fn requeue_pull(&self, pull: PullInfo, network_error: bool) {
        let mut pull = pull;
        if !network_error {
            pull.attempts += 1;
        }
        self.requeued_pulls.fetch_add(1, Ordering::Relaxed);
        self.stats.inc("bootstrap/requeue");

        let processed_bonus =
            (pull.processed / u64::from(self.config.lazy_max_pull_blocks.max(1))) as u32;
        let within_retry = pull.retry_limit == RETRY_UNLIMITED
            || pull.attempts <= pull.retry_limit.saturating_add(processed_bonus);

        if within_retry {
            if !self.processed_or_exists(&pull.head) {
                let mut pulls = self.lock_pulls();
                pulls.pulls.push_back(pull);
                drop(pulls);
                self.condition.notify_all();
            }
        } else {
            tracing::debug!(
                head = %pull.head,
                attempts = pull.attempts,
                processed = pull.processed,
                "pull dropped after retry limit"
            );
            self.stats.inc("bootstrap/pull_failed");
            self.cache.add(&pull);
            if pull.processed > 0 {
                // The source may hold more chain than one pull delivered.
                let mut lazy = self.lock_lazy();
                let retry_limit = pull.retry_limit;
                lazy_add(&mut lazy, pull.account_or_head, retry_limit);
            }
        }
    }

    // ── Completion ──────────────────────────────────────────────────────

    /// Whether every seed resolved and no discovery work remains.
    pub fn lazy_finished(&self) -> Result<bool, NodeError> {
        if self.stopped() {
            return Ok(true);
        }
        let txn = self.ledger.store().read_txn()?;
        let mut lazy = self.lock_lazy();
        let mut unresolved = false;
        let keys: Vec<HashOrAccount> = lazy.keys.iter().copied().collect();
        for key in keys {
            if self.ledger.block_exists(&txn, &key.as_hash())? {
                lazy.keys.remove(&key);
            } else {
                unresolved = true;
                break;
            }
        }
        let mut result = !unresolved;
        // Nothing left that could resolve the remaining keys.
        if !result && lazy.pulls.is_empty() && lazy.state_backlog.is_empty() {
            result = true;
        }
        // Speculative destinations still pending keep the attempt open.
        if result && !lazy.destinations.is_empty() {
            result = false;
        }
        Ok(result)
    }

    /// Hard wallclock cap: 30 minutes while legacy bootstrap can take
    /// over, 7 days otherwise; also trips on the fresh-block restart
    /// limit in legacy mode.
    pub fn lazy_has_expired(&self) -> bool {
        let max_time = if self.config.disable_legacy_bootstrap {
            Duration::from_secs(7 * 24 * 3600)
        } else {
            Duration::from_secs(30 * 60)
        };
        if self.lock_started_at().elapsed() >= max_time {
            return true;
        }
        !self.config.disable_legacy_bootstrap && self.lock_lazy().blocks_count > BLOCKS_RESTART_LIMIT
    }

    // ── Run loop ────────────────────────────────────────────────────────

    /// Drive the attempt until finished or expired. Pull dispatch is
    /// gated on an idle connection from `pool`; with no pulls ready the
    /// loop parks on the condition variable with a one-second re-flush.
    pub fn run(&self, pool: &dyn ConnectionPool) -> Result<(), NodeError> {
        *self.lock_started_at() = Instant::now();
        let mut lock = self.lock_pulls();
        let mut iterations = 0u64;
        while (!lock.pulls.is_empty() || !self.finished_unlocked()?) && !self.lazy_has_expired() {
            while !lock.pulls.is_empty() && !self.lazy_has_expired() && !self.stopped() {
                if let Some(pull) = next_pull(&mut lock, self) {
                    drop(lock);
                    self.dispatch(pool, pull);
                    self.block_processor.flush()?;
                    lock = self.lock_pulls();
                } else {
                    break;
                }
                iterations += 1;
                if iterations % 100 == 0 || self.lock_last_flush().elapsed() > FLUSH_DELAY {
                    self.lazy_pull_flush(&mut lock)?;
                }
                if iterations % 200 == 0 {
                    drop(lock);
                    self.lazy_backlog_cleanup()?;
                    lock = self.lock_pulls();
                }
            }
            if self.stopped() {
                break;
            }
            self.lazy_pull_flush(&mut lock)?;
            if lock.pulls.is_empty() {
                drop(lock);
                self.block_processor.flush()?;
                self.lazy_backlog_cleanup()?;
                self.lazy_destinations_flush();
                lock = self.lock_pulls();
                self.lazy_pull_flush(&mut lock)?;
                if lock.pulls.is_empty() && !self.finished_unlocked()? {
                    lock = self
                        .condition
                        .wait_timeout(lock, Duration::from_secs(1))
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .0;
                }
            }
        }
        drop(lock);
        self.block_processor.flush()?;
        if !self.stopped() {
            tracing::info!(
                total = self.total_blocks(),
                fresh = self.lazy_blocks_count(),
                "completed lazy pulls"
            );
        }
        self.stopped.store(true, Ordering::SeqCst);
        self.condition.notify_all();
        Ok(())
    }

    fn finished_unlocked(&self) -> Result<bool, NodeError> {
        // Called with the pulls lock held by the run loop; lazy_finished
        // only touches storage and the lazy side.
        self.lazy_finished()
    }

    fn dispatch(&self, pool: &dyn ConnectionPool, pull: PullInfo) {
        let Some(connection) = pool.connection(Duration::from_secs(1)) else {
            self.requeue_pull(pull, true);
            return;
        };
        self.stats.inc("bootstrap/pull");
        let mut pull_blocks = 0u64;
        let max_blocks = u64::from(pull.count.max(1));
        let retry_limit = pull.retry_limit;
        // Cursor along the chain being pulled: after a clean walk it lands
        // on `pull.end` (or the zero previous of an open block).
        let mut expected = pull.head;
        let result = {
            let mut on_block = |block: Block| {
                let hash = block.hash();
                if hash == expected || expected == pull.head {
                    expected = block.previous();
                }
                let stop = self.process_block(&block, None, pull_blocks, max_blocks, retry_limit);
                pull_blocks += 1;
                stop
            };
            connection.bulk_pull(&pull, &mut on_block)
        };
        let mut pull = pull;
        pull.processed += pull_blocks;
        match result {
            Ok(_) => {
                let complete = expected == pull.end || expected.is_zero();
                if !complete && !self.processed_or_exists(&expected) {
                    // Partial chain; continue from the first missing hash.
                    pull.account_or_head = HashOrAccount::from(expected);
                    pull.head = expected;
                    self.requeue_pull(pull, false);
                }
            }
            Err(PullError::Network) => self.requeue_pull(pull, true),
            Err(PullError::BadResponse) => self.requeue_pull(pull, false),
        }
    }

    // ── Block intake ────────────────────────────────────────────────────

    /// Handle one block delivered by a pull. Returns `true` when the pull
    /// should stop (the connection delivered more than `max_blocks`).
    pub fn process_block(
        &self,
        block: &Block,
        known_account: Option<Account>,
        pull_blocks: u64,
        max_blocks: u64,
        retry_limit: u32,
    ) -> bool {
        let hash = block.hash();
        // Counts duplicates as well; the duplicate-to-fresh ratio drives
        // the adaptive batch size.
        self.total_blocks.fetch_add(1, Ordering::Relaxed);
        let mut lazy = self.lock_lazy();
        if !blocks_processed(&lazy, &hash) {
            // Discover dependencies.
            if let Some(source) = block.source() {
                let genesis_marker = BlockHash::from(self.ledger.genesis().account);
                if !source.is_zero()
                    && source != genesis_marker
                    && !blocks_processed(&lazy, &source)
                    && !self.exists_in_store(&source)
                {
                    lazy_add(&mut lazy, HashOrAccount::from(source), retry_limit);
                }
            } else if let Block::State(state) = block {
                self.lazy_block_state(&mut lazy, state, retry_limit);
            } else if let Some(destination) = block.destination() {
                if !destination.is_zero() {
                    self.destinations_increment(&mut lazy, destination);
                }
            }
            blocks_insert(&mut lazy, &hash);
            // First block of a pull: remember its balance for subtype
            // decisions on the next (older) state block.
            if pull_blocks == 0 {
                if let Some(balance) = block.balance() {
                    lazy.balances.insert(hash, balance);
                }
            }
            let previous = block.previous();
            if !previous.is_zero() {
                lazy.balances.remove(&previous);
            }
            self.backlog_check(&mut lazy, block, &hash);
            drop(lazy);
            self.block_processor.add(BlockItem {
                block: block.clone(),
                known_account,
                verified: retry_limit == RETRY_UNLIMITED,
            });
        }
        pull_blocks > max_blocks
    }

    /// Decide what a state block's `link` means. The subtype follows from
    /// the sign of (balance − previous.balance); the predecessor may be
    /// absent, in storage, processed this attempt, or still unknown.
    fn lazy_block_state(
        &self,
        lazy: &mut LazyState,
        state: &strand_ledger::StateBlock,
        retry_limit: u32,
    ) {
        let link = state.link;
        if link.is_zero() || is_epoch_link(&link) {
            return;
        }
        if blocks_processed(lazy, &link.as_hash()) || self.exists_in_store(&link.as_hash()) {
            return;
        }
        let previous = state.previous;
        let balance = state.balance;
        if previous.is_zero() {
            // Open subtype: the link is a source.
            lazy_add(lazy, HashOrAccount::from(link.as_hash()), retry_limit);
        } else if let Some(previous_balance) = self.balance_in_store(&previous) {
            if previous_balance <= balance {
                lazy_add(lazy, HashOrAccount::from(link.as_hash()), retry_limit);
            } else {
                self.destinations_increment(lazy, link.as_account());
            }
        } else if blocks_processed(lazy, &previous) {
            if let Some(previous_balance) = lazy.balances.remove(&previous) {
                if previous_balance <= balance {
                    lazy_add(lazy, HashOrAccount::from(link.as_hash()), retry_limit);
                } else {
                    self.destinations_increment(lazy, link.as_account());
                }
            }
        } else {
            // Defer until the predecessor arrives.
            lazy.state_backlog.insert(
                previous,
                BacklogItem {
                    link,
                    balance,
                    retry_limit,
                },
            );
        }
    }

    /// A new block may be the predecessor some backlog entry waits for.
    fn backlog_check(&self, lazy: &mut LazyState, block: &Block, hash: &BlockHash) {
        let Some(item) = lazy.state_backlog.remove(hash) else {
            return;
        };
        match block.balance() {
            Some(balance) => {
                if balance <= item.balance {
                    lazy_add(lazy, HashOrAccount::from(item.link.as_hash()), item.retry_limit);
                } else {
                    self.destinations_increment(lazy, item.link.as_account());
                }
            }
            None => {
                // Legacy receive/open/change predecessors state no
                // balance; re-request the link once, flagged so an
                // unresolvable entry is not re-queued forever.
                if !lazy.undefined_links.contains(&item.link.as_hash()) {
                    lazy_add(
                        lazy,
                        HashOrAccount::from(item.link.as_hash()),
                        self.config.lazy_retry_limit,
                    );
                    lazy.undefined_links.insert(item.link.as_hash());
                }
            }
        }
    }

    /// Periodic sweep: resolve backlog entries whose predecessor reached
    /// storage through another path, and re-request the ones still
    /// missing.
    pub fn lazy_backlog_cleanup(&self) -> Result<(), NodeError> {
        let txn = self.ledger.store().read_txn()?;
        let mut lazy = self.lock_lazy();
        let entries: Vec<(BlockHash, BacklogItem)> = lazy
            .state_backlog
            .iter()
            .map(|(k, v)| (*k, v.clone()))
            .collect();
        for (previous, item) in entries {
            if self.stopped() {
                break;
            }
            if self.ledger.block_exists(&txn, &previous)? {
                let previous_balance = self
                    .ledger
                    .balance(&txn, &previous)?
                    .unwrap_or(Amount::ZERO);
                if previous_balance <= item.balance {
                    lazy_add(&mut lazy, HashOrAccount::from(item.link.as_hash()), item.retry_limit);
                } else {
                    self.destinations_increment(&mut lazy, item.link.as_account());
                }
                lazy.state_backlog.remove(&previous);
            } else {
                lazy_add(&mut lazy, HashOrAccount::from(previous), item.retry_limit);
            }
        }
        Ok(())
    }

    /// Release the most-referenced discovered destinations as pulls.
    /// Speculation on receive-side chains only pays off when the legacy
    /// frontier scan is unavailable, so it is gated on that flag.
    pub fn lazy_destinations_flush(&self) {
        let mut lazy = self.lock_lazy();
        lazy.destinations_flushed = true;
        let retry_limit = self.config.lazy_destinations_retry_limit;
        for account in lazy.destinations.drain_top(DESTINATIONS_REQUEST_LIMIT) {
            lazy_add(&mut lazy, HashOrAccount::from(account), retry_limit);
        }
    }

    fn destinations_increment(&self, lazy: &mut LazyState, destination: Account) {
        if self.config.disable_legacy_bootstrap && !destination.is_zero() {
            lazy.destinations.increment(destination);
        }
    }

    // ── Helpers ─────────────────────────────────────────────────────────

    fn processed_or_exists(&self, hash: &BlockHash) -> bool {
        {
            let lazy = self.lock_lazy();
            if blocks_processed(&lazy, hash) {
                return true;
            }
        }
        self.exists_in_store(hash)
    }

    fn exists_in_store(&self, hash: &BlockHash) -> bool {
        let Ok(txn) = self.ledger.store().read_txn() else {
            return false;
        };
        self.ledger.block_exists(&txn, hash).unwrap_or(false)
    }

    fn balance_in_store(&self, hash: &BlockHash) -> Option<Amount> {
        let txn = self.ledger.store().read_txn().ok()?;
        self.ledger.balance(&txn, hash).ok()?
    }

    fn lock_pulls(&self) -> MutexGuard<'_, PullsState> {
        self.pulls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_lazy(&self) -> MutexGuard<'_, LazyState> {
        self.lazy
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_started_at(&self) -> MutexGuard<'_, Instant> {
        self.started_at
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_last_flush(&self) -> MutexGuard<'_, Instant> {
        self.last_flush
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    #[cfg(test)]
    pub(crate) fn force_started_at(&self, instant: Instant) {
        *self.lock_started_at() = instant;
    }
}

/// Skip queued pulls whose head has already been received or stored.
fn next_pull(lock: &mut MutexGuard<'_, PullsState>, attempt: &LazyBootstrap) -> Option<PullInfo> {
    while let Some(pull) = lock.pulls.pop_front() {
        if pull.head.is_zero() || !attempt.processed_or_exists(&pull.head) {
            return Some(pull);
        }
    }
    None
}

fn hash_digest(hash: &BlockHash) -> u64 {
    let mut hasher = DefaultHasher::new();
    hash.as_bytes().hash(&mut hasher);
    hasher.finish()
}

fn blocks_processed(lazy: &LazyState, hash: &BlockHash) -> bool {
    lazy.blocks.contains(&hash_digest(hash))
}

fn blocks_insert(lazy: &mut LazyState, hash: &BlockHash) {
    if lazy.blocks.insert(hash_digest(hash)) {
        lazy.blocks_count += 1;
    }
}

fn blocks_erase(lazy: &mut LazyState, hash: &BlockHash) {
    if lazy.blocks.remove(&hash_digest(hash)) {
        lazy.blocks_count -= 1;
    }
}

/// Queue a hash for pulling unless it was already received this attempt.
fn lazy_add(lazy: &mut LazyState, start: HashOrAccount, retry_limit: u32) {
    if !blocks_processed(lazy, &start.as_hash()) {
        lazy.pulls.push_back((start, retry_limit));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::server::BootstrapServer;
    use strand_ledger::{dev_genesis, dev_genesis_key, OpenBlock, ReceiveBlock, SendBlock, StateBlock};
    use strand_store::LedgerStore;
    use strand_types::{KeyPair, Signature};

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<LedgerStore>,
        ledger: Arc<Ledger>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LedgerStore::open(dir.path(), 64 * 1024 * 1024).unwrap());
        let ledger = Arc::new(Ledger::new(Arc::clone(&store), dev_genesis()));
        let mut txn = store.write_txn().unwrap();
        ledger.initialize(&mut txn).unwrap();
        txn.commit().unwrap();
        Fixture {
            _dir: dir,
            store,
            ledger,
        }
    }

    fn attempt_for(fx: &Fixture, config: BootstrapConfig) -> LazyBootstrap {
        let stats = Arc::new(Stats::default());
        let processor = Arc::new(BlockProcessor::new(
            Arc::clone(&fx.ledger),
            Arc::clone(&stats),
            16 * 1024,
        ));
        LazyBootstrap::new(
            Arc::clone(&fx.ledger),
            processor,
            Arc::new(PullsCache::new(1024)),
            stats,
            config,
        )
    }

    fn admit(fx: &Fixture, block: &Block) {
        let mut txn = fx.store.write_txn().unwrap();
        assert!(fx.ledger.process(&mut txn, block).unwrap().is_progress());
        txn.commit().unwrap();
    }

    fn send(kp: &KeyPair, previous: BlockHash, to: Account, balance: u128) -> Block {
        let mut block = Block::Send(SendBlock {
            previous,
            destination: to,
            balance: Amount::raw(balance),
            signature: Signature::ZERO,
            work: 0,
        });
        block.sign(&kp.private);
        block
    }

    fn open(kp: &KeyPair, source: BlockHash) -> Block {
        let mut block = Block::Open(OpenBlock {
            source,
            representative: kp.account,
            account: kp.account,
            signature: Signature::ZERO,
            work: 0,
        });
        block.sign(&kp.private);
        block
    }

    fn receive(kp: &KeyPair, previous: BlockHash, source: BlockHash) -> Block {
        let mut block = Block::Receive(ReceiveBlock {
            previous,
            source,
            signature: Signature::ZERO,
            work: 0,
        });
        block.sign(&kp.private);
        block
    }

    /// Serves pulls out of another node's ledger.
    struct RemoteConnection {
        store: Arc<LedgerStore>,
        server: BootstrapServer,
    }

    impl crate::bootstrap::PullConnection for RemoteConnection {
        fn bulk_pull(
            &self,
            pull: &PullInfo,
            on_block: &mut dyn FnMut(Block) -> bool,
        ) -> Result<u64, PullError> {
            let txn = self.store.read_txn().map_err(|_| PullError::Network)?;
            let blocks = self
                .server
                .bulk_pull(&txn, pull.account_or_head, pull.end, pull.count)
                .map_err(|_| PullError::BadResponse)?;
            let mut delivered = 0u64;
            for block in blocks {
                delivered += 1;
                if on_block(block) {
                    break;
                }
            }
            Ok(delivered)
        }

        fn bulk_pull_account(
            &self,
            _account: &Account,
            _minimum: Amount,
            _on_pending: &mut dyn FnMut(BlockHash, Amount),
        ) -> Result<u64, PullError> {
            Err(PullError::BadResponse)
        }
    }

    struct RemotePool {
        connection: Arc<RemoteConnection>,
    }

    impl ConnectionPool for RemotePool {
        fn connection(&self, _timeout: Duration) -> Option<Arc<dyn crate::bootstrap::PullConnection>> {
            Some(Arc::clone(&self.connection) as Arc<dyn crate::bootstrap::PullConnection>)
        }
    }

    #[test]
    fn lazy_hash_bootstrap_pulls_transitive_graph() {
        // Remote: genesis sends twice to X, X pockets both. A fresh node
        // seeds from the newest receive and ends up with the whole graph.
        let remote = fixture();
        let gkey = dev_genesis_key();
        let x = KeyPair::from_seed(&[1u8; 32]);
        let g = remote.ledger.genesis().hash;
        let max = Amount::MAX.number();

        let send1 = send(&gkey, g, x.account, max - 100);
        let open1 = open(&x, send1.hash());
        let send2 = send(&gkey, send1.hash(), x.account, max - 200);
        let receive2 = receive(&x, open1.hash(), send2.hash());
        for block in [&send1, &open1, &send2, &receive2] {
            admit(&remote, block);
        }

        let local = fixture();
        let attempt = attempt_for(&local, BootstrapConfig::default());
        let pool = RemotePool {
            connection: Arc::new(RemoteConnection {
                store: Arc::clone(&remote.store),
                server: BootstrapServer::new(Arc::clone(&remote.ledger)),
            }),
        };

        attempt.lazy_start(HashOrAccount::from(receive2.hash()), true);
        attempt.run(&pool).unwrap();

        assert!(attempt.lazy_finished().unwrap());
        let txn = local.store.read_txn().unwrap();
        for block in [&send1, &open1, &send2, &receive2] {
            assert!(local.ledger.block_exists(&txn, &block.hash()).unwrap());
        }
        let info = local
            .ledger
            .account_info(&txn, &x.account)
            .unwrap()
            .unwrap();
        assert_eq!(info.balance, Amount::raw(200));
        // No duplicate writes: exactly the five blocks of both chains.
        assert_eq!(local.store.block_count(&txn).unwrap(), 5);
    }

    #[test]
    fn seed_already_in_storage_finishes_immediately() {
        let fx = fixture();
        let attempt = attempt_for(&fx, BootstrapConfig::default());
        attempt.lazy_start(HashOrAccount::from(fx.ledger.genesis().hash), true);
        assert!(attempt.lazy_finished().unwrap());
    }

    #[test]
    fn seed_cap_is_enforced() {
        let fx = fixture();
        let attempt = attempt_for(&fx, BootstrapConfig::default());
        for i in 0..2048u32 {
            let mut bytes = [0u8; 32];
            bytes[..4].copy_from_slice(&i.to_be_bytes());
            attempt.lazy_start(HashOrAccount::new(bytes), false);
        }
        let lazy = attempt.lock_lazy();
        assert_eq!(lazy.keys.len(), 1024);
        assert_eq!(lazy.pulls.len(), 1024);
    }

    #[test]
    fn state_block_with_unknown_previous_is_deferred() {
        let fx = fixture();
        let config = BootstrapConfig {
            disable_legacy_bootstrap: true,
            ..BootstrapConfig::default()
        };
        let attempt = attempt_for(&fx, config);
        let a = KeyPair::from_seed(&[1u8; 32]);
        let link = Link::new([0x66; 32]);

        let mut older = Block::State(StateBlock {
            account: a.account,
            previous: BlockHash::new([0x44; 32]),
            representative: a.account,
            balance: Amount::raw(100),
            link: Link::ZERO,
            signature: Signature::ZERO,
            work: 0,
        });
        older.sign(&a.private);

        // Newer block references the older one, but arrives first; its
        // subtype cannot be decided yet.
        let mut newer = Block::State(StateBlock {
            account: a.account,
            previous: older.hash(),
            representative: a.account,
            balance: Amount::raw(50),
            link,
            signature: Signature::ZERO,
            work: 0,
        });
        newer.sign(&a.private);
        attempt.process_block(&newer, None, 0, 128, 4);
        assert_eq!(attempt.backlog_len(), 1);

        // The predecessor arrives with a higher balance: the deferred
        // block was a send, so its link becomes a destination.
        attempt.process_block(&older, None, 1, 128, 4);
        assert_eq!(attempt.backlog_len(), 0);
        assert_eq!(attempt.destinations_len(), 1);
    }

    #[test]
    fn state_receive_resolves_link_as_source_pull() {
        let fx = fixture();
        let attempt = attempt_for(&fx, BootstrapConfig::default());
        let a = KeyPair::from_seed(&[1u8; 32]);
        let link = Link::new([0x77; 32]);

        // Open-subtype state block (zero previous): link is a source.
        let mut opener = Block::State(StateBlock {
            account: a.account,
            previous: BlockHash::ZERO,
            representative: a.account,
            balance: Amount::raw(10),
            link,
            signature: Signature::ZERO,
            work: 0,
        });
        opener.sign(&a.private);
        attempt.process_block(&opener, None, 0, 128, 4);

        let lazy = attempt.lock_lazy();
        assert!(lazy
            .pulls
            .iter()
            .any(|(start, _)| start.as_hash() == link.as_hash()));
    }

    #[test]
    fn requeue_increments_attempts_and_respects_limit() {
        let fx = fixture();
        let attempt = attempt_for(&fx, BootstrapConfig::default());
        let pull = PullInfo::new(HashOrAccount::new([0x99; 32]), 64, 2);

        attempt.requeue_pull(pull.clone(), false);
        assert_eq!(attempt.pulls_len(), 1);

        // Network errors do not consume attempts.
        let requeued = {
            let mut pulls = attempt.lock_pulls();
            pulls.pulls.pop_front().unwrap()
        };
        assert_eq!(requeued.attempts, 1);
        attempt.requeue_pull(requeued, true);
        let requeued = {
            let mut pulls = attempt.lock_pulls();
            pulls.pulls.pop_front().unwrap()
        };
        assert_eq!(requeued.attempts, 1);

        // Exhausting the limit drops the pull into the cache.
        let mut spent = requeued;
        spent.attempts = 5;
        let head = spent.head;
        attempt.requeue_pull(spent, false);
        assert_eq!(attempt.pulls_len(), 0);
        assert!(attempt.cache.take(&head).is_some());
    }

    #[test]
    fn requeue_with_unlimited_sentinel_never_expires() {
        let fx = fixture();
        let attempt = attempt_for(&fx, BootstrapConfig::default());
        let mut pull = PullInfo::new(HashOrAccount::new([0x98; 32]), 64, RETRY_UNLIMITED);
        pull.attempts = u32::MAX - 1;
        attempt.requeue_pull(pull, false);
        assert_eq!(attempt.pulls_len(), 1);
    }

    #[test]
    fn requeue_after_progress_reseeds_head() {
        let fx = fixture();
        let attempt = attempt_for(&fx, BootstrapConfig::default());
        let mut pull = PullInfo::new(HashOrAccount::new([0x97; 32]), 64, 1);
        pull.attempts = 10;
        pull.processed = 3;
        attempt.requeue_pull(pull, false);
        // Over the limit, but blocks were delivered: the head goes back
        // into the lazy queue for a later pull.
        assert_eq!(attempt.pulls_len(), 0);
        let lazy = attempt.lock_lazy();
        assert!(lazy
            .pulls
            .iter()
            .any(|(start, _)| *start == HashOrAccount::new([0x97; 32])));
    }

    #[test]
    fn batch_count_shrinks_on_duplicate_heavy_pulls() {
        let fx = fixture();
        let attempt = attempt_for(&fx, BootstrapConfig::default());
        assert_eq!(
            attempt.batch_count(),
            attempt.config.lazy_max_pull_blocks
        );

        // Lots of duplicates: total far above the fresh count.
        attempt.total_blocks.store(100_000, Ordering::Relaxed);
        {
            let mut lazy = attempt.lock_lazy();
            for i in 0..1000u32 {
                let mut bytes = [0u8; 32];
                bytes[..4].copy_from_slice(&i.to_be_bytes());
                blocks_insert(&mut lazy, &BlockHash::new(bytes));
            }
        }
        let shrunk = attempt.batch_count();
        assert!(shrunk < attempt.config.lazy_max_pull_blocks);
        assert!(shrunk >= attempt.config.lazy_min_pull_blocks);
    }

    #[test]
    fn pull_flush_deduplicates_and_caps() {
        let fx = fixture();
        let attempt = attempt_for(&fx, BootstrapConfig::default());
        // Seed more than the flush cap.
        for i in 0..200u32 {
            let mut bytes = [0u8; 32];
            bytes[..4].copy_from_slice(&i.to_be_bytes());
            attempt.lazy_start(HashOrAccount::new(bytes), false);
        }
        // One seed is already in storage and must not become a pull.
        attempt.lazy_start(HashOrAccount::from(fx.ledger.genesis().hash), false);

        let mut lock = attempt.lock_pulls();
        attempt.lazy_pull_flush(&mut lock).unwrap();
        let cap = attempt.config.target_blocks_per_connection * 3;
        assert_eq!(lock.pulls.len(), cap);
        assert!(lock
            .pulls
            .iter()
            .all(|pull| pull.head != fx.ledger.genesis().hash));
    }

    #[test]
    fn expiry_after_wallclock_cap() {
        let fx = fixture();
        let attempt = attempt_for(&fx, BootstrapConfig::default());
        assert!(!attempt.lazy_has_expired());
        attempt.force_started_at(Instant::now() - Duration::from_secs(31 * 60));
        assert!(attempt.lazy_has_expired());
    }
}
