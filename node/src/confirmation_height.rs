//! Confirmation-height tracking: cement a confirmed block and everything
//! it causally depends on.
//!
//! The causal closure of a block covers its own chain down to the current
//! cemented frontier and, for every receive or open in that range, the
//! pocketed send's chain, recursively. Updates for the accounts touched by
//! one commit land in a single write transaction; per-account height only
//! ever increases.
//!
//! Two walkers share the collection logic: the bounded walker commits
//! every `batch_write_size` cemented blocks, the unbounded walker holds
//! the whole closure and commits once. The mode is picked per call from
//! the closure size against `unbounded_cutoff`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use heed::RoTxn;
use strand_ledger::{Block, Ledger, StoredBlock};
use strand_store::{ConfirmationHeightInfo, Writer};
use strand_types::{Account, BlockHash};
use strand_utils::Stats;

use crate::config::ConfirmationConfig;
use crate::NodeError;

/// Which walker performed a cementation pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WalkerMode {
    Bounded,
    Unbounded,
}

/// One account's pending cementation, in commit order.
#[derive(Clone, Debug)]
struct AccountUpdate {
    account: Account,
    new_height: u64,
    frontier: BlockHash,
    /// Newly cemented hashes, oldest first.
    cemented: Vec<BlockHash>,
}

type CementedObserver = Box<dyn Fn(&BlockHash) + Send>;

pub struct ConfirmationHeightProcessor {
    ledger: Arc<Ledger>,
    stats: Arc<Stats>,
    config: ConfirmationConfig,
    observers: Mutex<Vec<CementedObserver>>,
}

impl ConfirmationHeightProcessor {
    pub fn new(ledger: Arc<Ledger>, stats: Arc<Stats>, config: ConfirmationConfig) -> Self {
        Self {
            ledger,
            stats,
            config,
            observers: Mutex::new(Vec::new()),
        }
    }

    /// Register a callback invoked once per newly cemented block, in chain
    /// order (genesis-ward first).
    pub fn on_cemented(&self, observer: impl Fn(&BlockHash) + Send + 'static) {
        self.lock_observers().push(Box::new(observer));
    }

    /// Cement `target` and its causal closure. Returns the number of
    /// newly cemented blocks and the walker mode used.
    pub fn process(&self, target: &BlockHash) -> Result<(u64, WalkerMode), NodeError> {
        let store = Arc::clone(self.ledger.store());

        let updates = {
            let txn = store.read_txn()?;
            self.collect_closure(&txn, target)?
        };
        let pending_total: usize = updates.iter().map(|u| u.cemented.len()).sum();
        if pending_total == 0 {
            return Ok((0, WalkerMode::Bounded));
        }

        let mode = if pending_total > self.config.unbounded_cutoff {
            WalkerMode::Unbounded
        } else {
            WalkerMode::Bounded
        };

        match mode {
            WalkerMode::Unbounded => {
                // Full closure already in memory; one commit.
                let _guard = store.write_queue().wait(Writer::ConfirmationHeight);
                let mut txn = store.write_txn()?;
                for update in &updates {
                    self.apply(&mut txn, update)?;
                }
                txn.commit().map_err(strand_store::StoreError::from)?;
                for update in &updates {
                    self.emit(update);
                }
                self.stats
                    .add("confirmation/blocks_confirmed_unbounded", pending_total as u64);
            }
            WalkerMode::Bounded => {
                // Commit per batch; an account's range may split across
                // batches, each leaving a consistent intermediate height.
                let mut batch: Vec<AccountUpdate> = Vec::new();
                let mut batch_len = 0usize;
                for update in &updates {
                    for chunk in update.cemented.chunks(self.config.batch_write_size.max(1)) {
                        let partial = AccountUpdate {
                            account: update.account,
                            new_height: self.height_of(&store, chunk.last().unwrap_or(&update.frontier))?,
                            frontier: *chunk.last().unwrap_or(&update.frontier),
                            cemented: chunk.to_vec(),
                        };
                        batch_len += partial.cemented.len();
                        batch.push(partial);
                        if batch_len >= self.config.batch_write_size {
                            self.commit_batch(&store, &mut batch)?;
                            batch_len = 0;
                        }
                    }
                }
                if !batch.is_empty() {
                    self.commit_batch(&store, &mut batch)?;
                }
                self.stats
                    .add("confirmation/blocks_confirmed_bounded", pending_total as u64);
            }
        }

        self.stats
            .add("confirmation/blocks_confirmed", pending_total as u64);
        tracing::debug!(%target, count = pending_total, ?mode, "cemented");
        Ok((pending_total as u64, mode))
    }

    fn commit_batch(
        &self,
        store: &strand_store::LedgerStore,
        batch: &mut Vec<AccountUpdate>,
    ) -> Result<(), NodeError> {
        let _guard = store.write_queue().wait(Writer::ConfirmationHeight);
        let mut txn = store.write_txn()?;
        for update in batch.iter() {
            self.apply(&mut txn, update)?;
        }
        txn.commit().map_err(strand_store::StoreError::from)?;
        for update in batch.iter() {
            self.emit(update);
        }
        batch.clear();
        Ok(())
    }

    fn apply(&self, txn: &mut heed::RwTxn, update: &AccountUpdate) -> Result<(), NodeError> {
        let store = self.ledger.store();
        let current = store
            .confirmation_height_get(txn, &update.account)?
            .unwrap_or_default();
        // Height is monotone; a concurrent pass may already have gone
        // past this update.
        if update.new_height <= current.height {
            return Ok(());
        }
        store.confirmation_height_put(
            txn,
            &update.account,
            &ConfirmationHeightInfo {
                height: update.new_height,
                frontier: update.frontier,
            },
        )?;
        Ok(())
    }

    fn emit(&self, update: &AccountUpdate) {
        let observers = self.lock_observers();
        for hash in &update.cemented {
            for observer in observers.iter() {
                observer(hash);
            }
        }
    }

    fn height_of(
        &self,
        store: &strand_store::LedgerStore,
        hash: &BlockHash,
    ) -> Result<u64, NodeError> {
        let txn = store.read_txn()?;
        Ok(self
            .ledger
            .get_block(&txn, hash)?
            .map(|b| b.sideband.height)
            .unwrap_or(0))
    }

    /// Collect the causal closure of `target` as an ordered list of
    /// account updates: every receive's source account appears before the
    /// account that pockets it, so committing in order keeps the
    /// send-before-receive invariant across partial commits.
    fn collect_closure(
        &self,
        txn: &RoTxn,
        target: &BlockHash,
    ) -> Result<Vec<AccountUpdate>, NodeError> {
        let mut planned: HashMap<Account, u64> = HashMap::new();
        let mut updates: Vec<AccountUpdate> = Vec::new();
        let mut stack: Vec<BlockHash> = vec![*target];

        while let Some(&top) = stack.last() {
            let Some(stored) = self.ledger.get_block(txn, &top)? else {
                // Unknown target; nothing to cement for it.
                stack.pop();
                continue;
            };
            let account = stored.sideband.account;
            let base = match planned.get(&account) {
                Some(height) => *height,
                None => self.ledger.confirmation_height(txn, &account)?.height,
            };
            if stored.sideband.height <= base {
                stack.pop();
                continue;
            }

            // Walk top..base+1, newest first, gathering uncemented
            // dependencies along the way.
            let mut range: Vec<BlockHash> = Vec::new();
            let mut dependencies: Vec<BlockHash> = Vec::new();
            let mut current = top;
            loop {
                let Some(block) = self.ledger.get_block(txn, &current)? else {
                    return Err(NodeError::Ledger(strand_ledger::LedgerError::Inconsistent(
                        format!("cementation walk hit missing block {current}"),
                    )));
                };
                if block.sideband.height <= base {
                    break;
                }
                range.push(current);
                if let Some(source) = self.pocketed_source(txn, &block)? {
                    if !self.is_planned_or_cemented(txn, &planned, &source)? {
                        dependencies.push(source);
                    }
                }
                let previous = block.block.previous();
                if previous.is_zero() {
                    break;
                }
                current = previous;
            }

            if dependencies.is_empty() {
                range.reverse();
                planned.insert(account, stored.sideband.height);
                updates.push(AccountUpdate {
                    account,
                    new_height: stored.sideband.height,
                    frontier: top,
                    cemented: range,
                });
                stack.pop();
            } else {
                // Cement the sources first; this target is revisited once
                // they are planned.
                stack.extend(dependencies);
            }
        }

        Ok(updates)
    }

    /// The send pocketed by this block, if it is a receive/open kind.
    fn pocketed_source(
        &self,
        txn: &RoTxn,
        stored: &StoredBlock,
    ) -> Result<Option<BlockHash>, NodeError> {
        match &stored.block {
            Block::Receive(receive) => Ok(Some(receive.source)),
            Block::Open(open) => {
                // The genesis open pockets nothing.
                if open.account == self.ledger.genesis().account {
                    Ok(None)
                } else {
                    Ok(Some(open.source))
                }
            }
            Block::State(state) => {
                if state.previous.is_zero() {
                    return Ok(Some(state.link.as_hash()));
                }
                let prev_balance = self
                    .ledger
                    .balance(txn, &state.previous)?
                    .unwrap_or(strand_types::Amount::ZERO);
                if stored.sideband.balance > prev_balance
                    && !strand_ledger::is_epoch_link(&state.link)
                {
                    Ok(Some(state.link.as_hash()))
                } else {
                    Ok(None)
                }
            }
            _ => Ok(None),
        }
    }

    fn is_planned_or_cemented(
        &self,
        txn: &RoTxn,
        planned: &HashMap<Account, u64>,
        hash: &BlockHash,
    ) -> Result<bool, NodeError> {
        let Some(stored) = self.ledger.get_block(txn, hash)? else {
            // A missing source cannot be cemented here; treat as already
            // handled so the walk terminates. The ledger rejected any
            // receive of a truly unknown source long before this point.
            return Ok(true);
        };
        let account = stored.sideband.account;
        let base = match planned.get(&account) {
            Some(height) => *height,
            None => self.ledger.confirmation_height(txn, &account)?.height,
        };
        Ok(stored.sideband.height <= base)
    }

    fn lock_observers(&self) -> std::sync::MutexGuard<'_, Vec<CementedObserver>> {
        self.observers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
