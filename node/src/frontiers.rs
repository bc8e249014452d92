//! Frontier prioritization: pick the accounts whose tails are furthest
//! behind their cemented height, so the voting layer confirms where it
//! matters most.
//!
//! Two capped collections, one for wallet-owned accounts and one for the
//! rest; an account never sits in both. Each is ordered by uncemented
//! count descending; inserting into a full collection evicts the lowest
//! entry only when the newcomer strictly exceeds it.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use strand_ledger::Ledger;
use strand_types::Account;

use crate::NodeError;

/// Map + ordered set updated together; the set yields eviction order.
#[derive(Default)]
struct PriorityCollection {
    by_account: HashMap<Account, u64>,
    ordered: BTreeSet<(u64, Account)>,
}

impl PriorityCollection {
    fn contains(&self, account: &Account) -> bool {
        self.by_account.contains_key(account)
    }

    fn len(&self) -> usize {
        self.by_account.len()
    }

    fn remove(&mut self, account: &Account) {
        if let Some(count) = self.by_account.remove(account) {
            self.ordered.remove(&(count, *account));
        }
    }

    /// Insert under the cap; when full, replace the lowest entry only if
    /// `count` strictly exceeds it.
    fn insert(&mut self, account: Account, count: u64, max_len: usize) -> bool {
        if let Some(existing) = self.by_account.get(&account).copied() {
            self.ordered.remove(&(existing, account));
            self.by_account.insert(account, count);
            self.ordered.insert((count, account));
            return true;
        }
        if self.by_account.len() >= max_len {
            let Some(&(lowest_count, lowest_account)) = self.ordered.iter().next() else {
                return false;
            };
            if count <= lowest_count {
                return false;
            }
            self.ordered.remove(&(lowest_count, lowest_account));
            self.by_account.remove(&lowest_account);
        }
        self.by_account.insert(account, count);
        self.ordered.insert((count, account));
        true
    }

    /// Highest-priority accounts, descending.
    fn top(&self, limit: usize) -> Vec<(Account, u64)> {
        self.ordered
            .iter()
            .rev()
            .take(limit)
            .map(|&(count, account)| (account, count))
            .collect()
    }
}

pub struct FrontierPrioritizer {
    wallet: PriorityCollection,
    other: PriorityCollection,
    max_len: usize,
}

impl FrontierPrioritizer {
    pub fn new(max_len: usize) -> Self {
        Self {
            wallet: PriorityCollection::default(),
            other: PriorityCollection::default(),
            max_len,
        }
    }

    /// Record one account's uncemented count. Moving between the wallet
    /// and non-wallet collections drops the stale entry first, so an
    /// account never appears in both.
    pub fn insert(&mut self, account: Account, uncemented: u64, is_wallet: bool) -> bool {
        if uncemented == 0 {
            self.wallet.remove(&account);
            self.other.remove(&account);
            return false;
        }
        if is_wallet {
            self.other.remove(&account);
            self.wallet.insert(account, uncemented, self.max_len)
        } else {
            self.wallet.remove(&account);
            self.other.insert(account, uncemented, self.max_len)
        }
    }

    /// Scan the ledger, refreshing both collections.
    pub fn prioritize(
        &mut self,
        ledger: &Ledger,
        wallet_accounts: &HashSet<Account>,
    ) -> Result<(), NodeError> {
        let store = Arc::clone(ledger.store());
        let txn = store.read_txn()?;
        let mut scan_error = None;
        store.account_for_each_from(&txn, &Account::ZERO, |account, info| {
            let height = match ledger.confirmation_height(&txn, &account) {
                Ok(info) => info.height,
                Err(e) => {
                    scan_error = Some(e);
                    return false;
                }
            };
            let uncemented = info.block_count.saturating_sub(height);
            self.insert(account, uncemented, wallet_accounts.contains(&account));
            true
        })?;
        if let Some(e) = scan_error {
            return Err(e.into());
        }
        Ok(())
    }

    pub fn wallet_len(&self) -> usize {
        self.wallet.len()
    }

    pub fn other_len(&self) -> usize {
        self.other.len()
    }

    pub fn contains(&self, account: &Account) -> bool {
        self.wallet.contains(account) || self.other.contains(account)
    }

    pub fn contains_in_both(&self, account: &Account) -> bool {
        self.wallet.contains(account) && self.other.contains(account)
    }

    /// Top candidates for election attention: wallet accounts first.
    pub fn next_candidates(&self, limit: usize) -> Vec<Account> {
        let mut out: Vec<Account> = self
            .wallet
            .top(limit)
            .into_iter()
            .map(|(account, _)| account)
            .collect();
        if out.len() < limit {
            out.extend(
                self.other
                    .top(limit - out.len())
                    .into_iter()
                    .map(|(account, _)| account),
            );
        }
        out
    }
}
