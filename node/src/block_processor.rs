//! Block processing pipeline.
//!
//! A single FIFO feeds blocks into the ledger. Gap results park the block
//! in the `unchecked` table keyed by the missing hash; every committed
//! block probes that table under its own hash and re-enqueues dependents,
//! draining chains that arrived out of order.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use serde::{Deserialize, Serialize};
use strand_ledger::{Block, Ledger, ProcessResult};
use strand_store::{UncheckedKey, Writer};
use strand_types::{Account, BlockHash};
use strand_utils::Stats;

use crate::NodeError;

/// A block queued for processing, with ingestion metadata.
#[derive(Clone, Debug)]
pub struct BlockItem {
    pub block: Block,
    /// Account hint from the pull that produced the block, if any.
    pub known_account: Option<Account>,
    /// Whether the block came from a confirmed source (e.g. a lazy pull
    /// seeded by a confirmed hash).
    pub verified: bool,
}

/// Unchecked-table record: the parked block plus its ingestion metadata.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct UncheckedInfo {
    block: Block,
    known_account: Option<Account>,
    verified: bool,
}

type Observer = Box<dyn Fn(&BlockHash, ProcessResult) + Send>;

pub struct BlockProcessor {
    ledger: Arc<Ledger>,
    stats: Arc<Stats>,
    queue: Mutex<VecDeque<BlockItem>>,
    condition: Condvar,
    stopped: AtomicBool,
    observers: Mutex<Vec<Observer>>,
    max_queue: usize,
}

impl BlockProcessor {
    pub fn new(ledger: Arc<Ledger>, stats: Arc<Stats>, max_queue: usize) -> Self {
        Self {
            ledger,
            stats,
            queue: Mutex::new(VecDeque::new()),
            condition: Condvar::new(),
            stopped: AtomicBool::new(false),
            observers: Mutex::new(Vec::new()),
            max_queue,
        }
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    /// Register a callback invoked for every processed block.
    pub fn on_processed(&self, observer: impl Fn(&BlockHash, ProcessResult) + Send + 'static) {
        self.lock_observers().push(Box::new(observer));
    }

    /// Enqueue a block. Returns `false` under backpressure (queue full).
    pub fn add(&self, item: BlockItem) -> bool {
        let mut queue = self.lock_queue();
        if queue.len() >= self.max_queue {
            return false;
        }
        queue.push_back(item);
        drop(queue);
        self.condition.notify_one();
        true
    }

    pub fn queue_len(&self) -> usize {
        self.lock_queue().len()
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.condition.notify_all();
    }

    /// Drain the queue now. One write transaction per drain; dependents
    /// released from `unchecked` are processed in the same pass. Returns
    /// how many blocks were processed, including released dependents.
    pub fn flush(&self) -> Result<usize, NodeError> {
        let mut batch: VecDeque<BlockItem> = {
            let mut queue = self.lock_queue();
            std::mem::take(&mut *queue)
        };
        if batch.is_empty() {
            return Ok(0);
        }

        let store = Arc::clone(self.ledger.store());
        let _guard = store.write_queue().wait(Writer::BlockProcessor);
        let mut txn = store.write_txn()?;
        let mut processed = 0usize;
        let mut events = Vec::new();

        while let Some(item) = batch.pop_front() {
            processed += 1;
            let hash = item.block.hash();
            let result = self.ledger.process(&mut txn, &item.block)?;
            self.stats.inc("block/processed");
            match result {
                ProcessResult::Progress => {
                    tracing::debug!(%hash, "block admitted");
                    // Release anything that was waiting on this hash.
                    for (key, bytes) in store.unchecked_dependents(&txn, &hash)? {
                        store.unchecked_del(&mut txn, &key)?;
                        match bincode::deserialize::<UncheckedInfo>(&bytes) {
                            Ok(info) => batch.push_front(BlockItem {
                                block: info.block,
                                known_account: info.known_account,
                                verified: info.verified,
                            }),
                            Err(e) => {
                                tracing::warn!(%hash, "dropping corrupt unchecked entry: {e}")
                            }
                        }
                    }
                }
                ProcessResult::GapPrevious => {
                    self.stats.inc("block/gap");
                    let dependency = item.block.previous();
                    self.park(&store, &mut txn, item, dependency)?;
                }
                ProcessResult::GapSource => {
                    self.stats.inc("block/gap");
                    let dependency = source_dependency(&item.block);
                    self.park(&store, &mut txn, item, dependency)?;
                }
                ProcessResult::Fork => {
                    // Fork resolution belongs to the voting layer; the
                    // core only reports it.
                    self.stats.inc("block/fork");
                    tracing::debug!(%hash, "fork detected");
                }
                other => {
                    tracing::debug!(%hash, ?other, "block dropped");
                }
            }
            events.push((hash, result));
        }

        txn.commit().map_err(strand_store::StoreError::from)?;

        let observers = self.lock_observers();
        for (hash, result) in &events {
            for observer in observers.iter() {
                observer(hash, *result);
            }
        }
        Ok(processed)
    }

    /// Block until the queue is non-empty or the processor stops. Returns
    /// `false` once stopped or on timeout with an empty queue.
    pub fn wait_for_work(&self, timeout: std::time::Duration) -> bool {
        let queue = self.lock_queue();
        if self.stopped.load(Ordering::SeqCst) {
            return false;
        }
        if !queue.is_empty() {
            return true;
        }
        let (queue, _) = self
            .condition
            .wait_timeout(queue, timeout)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        !self.stopped.load(Ordering::SeqCst) && !queue.is_empty()
    }

    fn park(
        &self,
        store: &strand_store::LedgerStore,
        txn: &mut heed::RwTxn,
        item: BlockItem,
        dependency: BlockHash,
    ) -> Result<(), NodeError> {
        let hash = item.block.hash();
        let info = UncheckedInfo {
            block: item.block,
            known_account: item.known_account,
            verified: item.verified,
        };
        store.unchecked_put(
            txn,
            &UncheckedKey::new(dependency, hash),
            &bincode::serialize(&info)?,
        )?;
        tracing::trace!(%hash, %dependency, "block parked as unchecked");
        Ok(())
    }

    fn lock_queue(&self) -> std::sync::MutexGuard<'_, VecDeque<BlockItem>> {
        self.queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_observers(&self) -> std::sync::MutexGuard<'_, Vec<Observer>> {
        self.observers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// The missing hash behind a `GapSource` outcome.
fn source_dependency(block: &Block) -> BlockHash {
    match block.source() {
        Some(source) => source,
        None => block.link().as_hash(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_ledger::{dev_genesis, dev_genesis_key, OpenBlock, SendBlock};
    use strand_store::LedgerStore;
    use strand_types::{Amount, KeyPair, Signature};

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<LedgerStore>,
        ledger: Arc<Ledger>,
        processor: BlockProcessor,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LedgerStore::open(dir.path(), 64 * 1024 * 1024).unwrap());
        let ledger = Arc::new(Ledger::new(Arc::clone(&store), dev_genesis()));
        let mut txn = store.write_txn().unwrap();
        ledger.initialize(&mut txn).unwrap();
        txn.commit().unwrap();
        let processor = BlockProcessor::new(Arc::clone(&ledger), Arc::new(Stats::default()), 1024);
        Fixture {
            _dir: dir,
            store,
            ledger,
            processor,
        }
    }

    fn send_block(kp: &KeyPair, previous: BlockHash, destination: Account, balance: Amount) -> Block {
        let mut block = Block::Send(SendBlock {
            previous,
            destination,
            balance,
            signature: Signature::ZERO,
            work: 0,
        });
        block.sign(&kp.private);
        block
    }

    fn open_block(kp: &KeyPair, source: BlockHash) -> Block {
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

    fn item(block: Block) -> BlockItem {
        BlockItem {
            block,
            known_account: None,
            verified: false,
        }
    }

    #[test]
    fn in_order_chain_is_admitted() {
        let fx = fixture();
        let gkey = dev_genesis_key();
        let dest = KeyPair::from_seed(&[1u8; 32]);
        let g = fx.ledger.genesis().hash;
        let remaining = Amount::raw(Amount::MAX.number() - 100);

        let send = send_block(&gkey, g, dest.account, remaining);
        let open = open_block(&dest, send.hash());
        assert!(fx.processor.add(item(send.clone())));
        assert!(fx.processor.add(item(open.clone())));
        fx.processor.flush().unwrap();

        let txn = fx.store.read_txn().unwrap();
        assert!(fx.ledger.block_exists(&txn, &send.hash()).unwrap());
        assert!(fx.ledger.block_exists(&txn, &open.hash()).unwrap());
    }

    #[test]
    fn gap_then_fill_drains_unchecked() {
        let fx = fixture();
        let gkey = dev_genesis_key();
        let dest = KeyPair::from_seed(&[1u8; 32]);
        let g = fx.ledger.genesis().hash;
        let max = Amount::MAX.number();

        let send1 = send_block(&gkey, g, dest.account, Amount::raw(max - 100));
        let send2 = send_block(&gkey, send1.hash(), dest.account, Amount::raw(max - 200));

        // send2 first: parks under send1's hash.
        fx.processor.add(item(send2.clone()));
        fx.processor.flush().unwrap();
        {
            let txn = fx.store.read_txn().unwrap();
            assert!(!fx.ledger.block_exists(&txn, &send2.hash()).unwrap());
            assert_eq!(fx.store.unchecked_count(&txn).unwrap(), 1);
        }

        // send1 arrives: both land in one flush.
        fx.processor.add(item(send1.clone()));
        fx.processor.flush().unwrap();
        let txn = fx.store.read_txn().unwrap();
        assert!(fx.ledger.block_exists(&txn, &send1.hash()).unwrap());
        assert!(fx.ledger.block_exists(&txn, &send2.hash()).unwrap());
        assert_eq!(fx.store.unchecked_count(&txn).unwrap(), 0);
    }

    #[test]
    fn gap_source_parks_under_source_hash() {
        let fx = fixture();
        let gkey = dev_genesis_key();
        let dest = KeyPair::from_seed(&[1u8; 32]);
        let g = fx.ledger.genesis().hash;

        let send = send_block(
            &gkey,
            g,
            dest.account,
            Amount::raw(Amount::MAX.number() - 100),
        );
        let open = open_block(&dest, send.hash());

        // Open first: its source is unknown.
        fx.processor.add(item(open.clone()));
        fx.processor.flush().unwrap();
        {
            let txn = fx.store.read_txn().unwrap();
            let parked = fx.store.unchecked_dependents(&txn, &send.hash()).unwrap();
            assert_eq!(parked.len(), 1);
        }

        fx.processor.add(item(send));
        fx.processor.flush().unwrap();
        let txn = fx.store.read_txn().unwrap();
        assert!(fx.ledger.block_exists(&txn, &open.hash()).unwrap());
    }

    #[test]
    fn recursive_drain_across_three_levels() {
        let fx = fixture();
        let gkey = dev_genesis_key();
        let dest = KeyPair::from_seed(&[1u8; 32]);
        let g = fx.ledger.genesis().hash;
        let max = Amount::MAX.number();

        let send1 = send_block(&gkey, g, dest.account, Amount::raw(max - 100));
        let send2 = send_block(&gkey, send1.hash(), dest.account, Amount::raw(max - 200));
        let send3 = send_block(&gkey, send2.hash(), dest.account, Amount::raw(max - 300));

        // Deepest first; each parks under its missing predecessor.
        for block in [send3.clone(), send2.clone()] {
            fx.processor.add(item(block));
            fx.processor.flush().unwrap();
        }
        fx.processor.add(item(send1.clone()));
        fx.processor.flush().unwrap();

        let txn = fx.store.read_txn().unwrap();
        for block in [&send1, &send2, &send3] {
            assert!(fx.ledger.block_exists(&txn, &block.hash()).unwrap());
        }
        assert_eq!(fx.store.unchecked_count(&txn).unwrap(), 0);
    }

    #[test]
    fn backpressure_when_queue_full() {
        let fx = fixture();
        let gkey = dev_genesis_key();
        let g = fx.ledger.genesis().hash;
        let small = BlockProcessor::new(Arc::clone(&fx.ledger), Arc::new(Stats::default()), 1);
        let send = send_block(
            &gkey,
            g,
            KeyPair::from_seed(&[1u8; 32]).account,
            Amount::raw(5),
        );
        assert!(small.add(item(send.clone())));
        assert!(!small.add(item(send)));
    }

    #[test]
    fn observers_see_results() {
        let fx = fixture();
        let gkey = dev_genesis_key();
        let g = fx.ledger.genesis().hash;
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            fx.processor.on_processed(move |hash, result| {
                seen.lock().unwrap().push((*hash, result));
            });
        }

        let send = send_block(
            &gkey,
            g,
            KeyPair::from_seed(&[1u8; 32]).account,
            Amount::raw(Amount::MAX.number() - 1),
        );
        fx.processor.add(item(send.clone()));
        fx.processor.flush().unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], (send.hash(), ProcessResult::Progress));
    }

    #[test]
    fn duplicate_flush_is_idempotent() {
        let fx = fixture();
        let gkey = dev_genesis_key();
        let g = fx.ledger.genesis().hash;
        let send = send_block(
            &gkey,
            g,
            KeyPair::from_seed(&[1u8; 32]).account,
            Amount::raw(Amount::MAX.number() - 1),
        );
        fx.processor.add(item(send.clone()));
        fx.processor.flush().unwrap();
        fx.processor.add(item(send.clone()));
        fx.processor.flush().unwrap();

        let txn = fx.store.read_txn().unwrap();
        assert!(fx.ledger.block_exists(&txn, &send.hash()).unwrap());
    }
}
