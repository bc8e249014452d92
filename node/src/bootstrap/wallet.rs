//! Wallet-lazy bootstrap: fetch the pending receives of locally owned
//! accounts.
//!
//! A FIFO of accounts, each answered by a `bulk_pull_account` above a
//! minimum amount. Discovered send hashes are handed to the caller
//! (typically seeding a lazy attempt), not processed here.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use strand_types::{Account, Amount, BlockHash};

use crate::bootstrap::ConnectionPool;

/// Wallclock cap on one wallet-lazy attempt.
const MAX_WALLET_TIME: Duration = Duration::from_secs(10 * 60);

type PendingSink = Box<dyn Fn(BlockHash, Amount) + Send + Sync>;

pub struct WalletBootstrap {
    accounts: Mutex<VecDeque<Account>>,
    condition: Condvar,
    stopped: AtomicBool,
    in_flight: Mutex<usize>,
    minimum_amount: Amount,
    on_pending: PendingSink,
}

impl WalletBootstrap {
    pub fn new(
        minimum_amount: Amount,
        on_pending: impl Fn(BlockHash, Amount) + Send + Sync + 'static,
    ) -> Self {
        tracing::info!("starting wallet bootstrap attempt");
        Self {
            accounts: Mutex::new(VecDeque::new()),
            condition: Condvar::new(),
            stopped: AtomicBool::new(false),
            in_flight: Mutex::new(0),
            minimum_amount,
            on_pending: Box::new(on_pending),
        }
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.condition.notify_all();
    }

    /// Seed the attempt with the wallet's accounts.
    pub fn wallet_start(&self, mut accounts: VecDeque<Account>) {
        let mut queue = self.lock_accounts();
        std::mem::swap(&mut *queue, &mut accounts);
        drop(queue);
        self.condition.notify_all();
    }

    /// Put an account back after a failed pull.
    pub fn requeue_pending(&self, account: Account) {
        let mut queue = self.lock_accounts();
        queue.push_front(account);
        drop(queue);
        self.condition.notify_all();
    }

    pub fn wallet_size(&self) -> usize {
        self.lock_accounts().len()
    }

    /// Still running and work remains (queued accounts or a pull in
    /// flight).
    pub fn wallet_finished(&self) -> bool {
        let running = !self.stopped.load(Ordering::SeqCst);
        let more_accounts = !self.lock_accounts().is_empty();
        let still_pulling = *self.lock_in_flight() > 0;
        running && (more_accounts || still_pulling)
    }

    /// Drain the account queue against the pool until done or the
    /// wallclock cap expires.
    pub fn run(&self, pool: &dyn ConnectionPool) {
        let start_time = Instant::now();
        while self.wallet_finished() && start_time.elapsed() < MAX_WALLET_TIME {
            let account = {
                let mut queue = self.lock_accounts();
                match queue.pop_front() {
                    Some(account) => account,
                    None => {
                        let _ = self
                            .condition
                            .wait_timeout(queue, Duration::from_secs(1))
                            .unwrap_or_else(|poisoned| poisoned.into_inner());
                        continue;
                    }
                }
            };
            self.request_pending(pool, account);
        }
        if !self.stopped.load(Ordering::SeqCst) {
            tracing::info!("completed wallet lazy pulls");
        }
        self.stop();
    }

    fn request_pending(&self, pool: &dyn ConnectionPool, account: Account) {
        let Some(connection) = pool.connection(Duration::from_secs(1)) else {
            self.requeue_pending(account);
            return;
        };
        *self.lock_in_flight() += 1;
        let mut on_pending = |hash: BlockHash, amount: Amount| {
            (self.on_pending)(hash, amount);
        };
        let result = connection.bulk_pull_account(&account, self.minimum_amount, &mut on_pending);
        *self.lock_in_flight() -= 1;
        if result.is_err() {
            self.requeue_pending(account);
        }
    }

    fn lock_accounts(&self) -> MutexGuard<'_, VecDeque<Account>> {
        self.accounts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, usize> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
