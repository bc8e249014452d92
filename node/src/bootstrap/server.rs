//! Serving side of bootstrap: `bulk_pull`, `bulk_pull_account`, and
//! `frontier_req` answered from the local ledger.
//!
//! Responses are computed against one snapshot read transaction, so a
//! stream never interleaves two ledger states.

use std::sync::Arc;

use heed::RoTxn;
use serde::{Deserialize, Serialize};
use strand_ledger::{Block, Ledger};
use strand_messages::BulkPullAccountFlags;
use strand_types::{Account, Amount, BlockHash, HashOrAccount};

use crate::NodeError;

/// One entry of a `bulk_pull_account` response, shaped by the request
/// flags. Serialized per-entry on the stream path.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PendingEntry {
    HashAndAmount {
        send_hash: BlockHash,
        amount: Amount,
    },
    AddressOnly {
        source: Account,
    },
    HashAmountAndAddress {
        send_hash: BlockHash,
        amount: Amount,
        source: Account,
    },
}

/// `bulk_pull_account` response: the account's frontier summary followed
/// by its pending entries.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkPullAccountResponse {
    pub frontier: BlockHash,
    pub balance: Amount,
    pub entries: Vec<PendingEntry>,
}

pub struct BootstrapServer {
    ledger: Arc<Ledger>,
}

impl BootstrapServer {
    pub fn new(ledger: Arc<Ledger>) -> Self {
        Self { ledger }
    }

    /// Walk blocks from `start` toward `end`, newest first.
    ///
    /// `start` may be an account (walk from its head) or a block hash.
    /// `end` is excluded from the stream; an `end` that is not an
    /// ancestor of `start` behaves as zero (walk to the open block).
    /// A non-zero `count` caps the stream.
    pub fn bulk_pull(
        &self,
        txn: &RoTxn,
        start: HashOrAccount,
        end: BlockHash,
        count: u32,
    ) -> Result<Vec<Block>, NodeError> {
        let head = match self.ledger.account_info(txn, &start.as_account())? {
            Some(info) => info.head,
            None => start.as_hash(),
        };

        let mut effective_end = end;
        if !end.is_zero() && !self.is_ancestor(txn, head, &end)? {
            effective_end = BlockHash::ZERO;
        }

        let mut blocks = Vec::new();
        let mut current = head;
        while !current.is_zero() && (effective_end.is_zero() || current != effective_end) {
            let Some(stored) = self.ledger.get_block(txn, &current)? else {
                break;
            };
            blocks.push(stored.block.clone());
            if count != 0 && blocks.len() >= count as usize {
                break;
            }
            current = stored.block.previous();
        }
        Ok(blocks)
    }

    fn is_ancestor(
        &self,
        txn: &RoTxn,
        mut from: BlockHash,
        target: &BlockHash,
    ) -> Result<bool, NodeError> {
        while !from.is_zero() {
            if from == *target {
                return Ok(true);
            }
            match self.ledger.get_block(txn, &from)? {
                Some(stored) => from = stored.block.previous(),
                None => return Ok(false),
            }
        }
        Ok(false)
    }

    /// Stream an account's receivable sends above `minimum`.
    pub fn bulk_pull_account(
        &self,
        txn: &RoTxn,
        account: &Account,
        minimum: Amount,
        flags: BulkPullAccountFlags,
    ) -> Result<BulkPullAccountResponse, NodeError> {
        let (frontier, balance) = match self.ledger.account_info(txn, account)? {
            Some(info) => (info.head, info.balance),
            None => (BlockHash::ZERO, Amount::ZERO),
        };
        let mut entries = Vec::new();
        for (key, info) in self.ledger.store().pending_for_account(txn, account)? {
            if info.amount < minimum {
                continue;
            }
            entries.push(match flags {
                BulkPullAccountFlags::PendingHashAndAmount => PendingEntry::HashAndAmount {
                    send_hash: key.send_hash,
                    amount: info.amount,
                },
                BulkPullAccountFlags::PendingAddressOnly => PendingEntry::AddressOnly {
                    source: info.source,
                },
                BulkPullAccountFlags::PendingHashAmountAndAddress => {
                    PendingEntry::HashAmountAndAddress {
                        send_hash: key.send_hash,
                        amount: info.amount,
                        source: info.source,
                    }
                }
            });
        }
        Ok(BulkPullAccountResponse {
            frontier,
            balance,
            entries,
        })
    }

    /// Walk the frontier table in account order from `start`, skipping
    /// accounts whose last modification is older than `age` seconds.
    /// The stream ends with the zero frontier pair.
    pub fn frontier_req(
        &self,
        txn: &RoTxn,
        start: Account,
        age: u32,
        count: u32,
        now: u64,
    ) -> Result<Vec<(Account, BlockHash)>, NodeError> {
        let mut out: Vec<(Account, BlockHash)> = Vec::new();
        let ledger = &self.ledger;
        let mut scan_error = None;
        ledger
            .store()
            .frontier_for_each_from(txn, &start, |account, head| {
                if count != 0 && out.len() >= count as usize {
                    return false;
                }
                match ledger.account_info(txn, &account) {
                    Ok(Some(info)) => {
                        let stale = now.saturating_sub(info.modified) > u64::from(age);
                        if !stale {
                            out.push((account, head));
                        }
                        true
                    }
                    Ok(None) => true,
                    Err(e) => {
                        scan_error = Some(e);
                        false
                    }
                }
            })?;
        if let Some(e) = scan_error {
            return Err(e.into());
        }
        out.push((Account::ZERO, BlockHash::ZERO));
        Ok(out)
    }
}
