//! Ledger application: admit blocks, answer chain queries, roll back
//! uncemented tails.

use std::sync::Arc;

use heed::{RoTxn, RwTxn};
use strand_store::{
    AccountInfo, ConfirmationHeightInfo, LedgerStore, PendingInfo, PendingKey,
};
use strand_types::{keys, Account, Amount, BlockHash, Link};

use crate::block::{Block, BlockSideband, StoredBlock};
use crate::genesis::Genesis;
use crate::LedgerError;

/// Outcome of [`Ledger::process`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessResult {
    /// Admitted and written.
    Progress,
    /// Already in the ledger.
    Old,
    /// `previous` is unknown.
    GapPrevious,
    /// The referenced source send is unknown.
    GapSource,
    /// Signature does not verify against the owning account.
    BadSignature,
    /// A send whose balance does not strictly decrease.
    NegativeSpend,
    /// A receive whose amount disagrees with the pocketed send, or a
    /// state block whose balance delta matches no subtype.
    BalanceMismatch,
    /// The referenced send is not receivable by this account.
    Unreceivable,
    /// Another block already occupies this chain position.
    Fork,
    /// An open block for the burn account.
    OpenedBurnAccount,
    /// The block names an account that does not own its `previous`.
    BlockPosition,
}

impl ProcessResult {
    pub fn is_progress(&self) -> bool {
        matches!(self, ProcessResult::Progress)
    }
}

/// On-disk layout version stamped into the meta table at initialization.
const SCHEMA_VERSION: u32 = 1;

const EPOCH_LINK_PREFIX: &[u8; 16] = b"strand epoch v1\0";

/// The sentinel link value marking an epoch upgrade block.
pub fn epoch_link() -> Link {
    let mut bytes = [0u8; 32];
    bytes[..16].copy_from_slice(EPOCH_LINK_PREFIX);
    Link::new(bytes)
}

pub fn is_epoch_link(link: &Link) -> bool {
    *link == epoch_link()
}

/// The account-chain ledger.
pub struct Ledger {
    store: Arc<LedgerStore>,
    genesis: Genesis,
}

impl Ledger {
    pub fn new(store: Arc<LedgerStore>, genesis: Genesis) -> Self {
        Self { store, genesis }
    }

    pub fn store(&self) -> &Arc<LedgerStore> {
        &self.store
    }

    pub fn genesis(&self) -> &Genesis {
        &self.genesis
    }

    /// Seed an empty store with the genesis block. The genesis is born
    /// cemented at height 1.
    pub fn initialize(&self, txn: &mut RwTxn) -> Result<(), LedgerError> {
        if self.store.block_exists(txn, &self.genesis.hash)? {
            return Ok(());
        }
        let stored = StoredBlock {
            block: self.genesis.block.clone(),
            sideband: BlockSideband {
                account: self.genesis.account,
                height: 1,
                balance: self.genesis.balance,
                representative: self.genesis.account,
                timestamp: unix_seconds(),
            },
        };
        self.store
            .block_put(txn, &self.genesis.hash, &stored.to_bytes()?)?;
        self.store.account_put(
            txn,
            &self.genesis.account,
            &AccountInfo {
                head: self.genesis.hash,
                representative: self.genesis.account,
                balance: self.genesis.balance,
                block_count: 1,
                modified: unix_seconds(),
            },
        )?;
        self.store
            .frontier_put(txn, &self.genesis.account, &self.genesis.hash)?;
        self.store.confirmation_height_put(
            txn,
            &self.genesis.account,
            &ConfirmationHeightInfo {
                height: 1,
                frontier: self.genesis.hash,
            },
        )?;
        self.store
            .meta_put(txn, "schema_version", &SCHEMA_VERSION.to_be_bytes())?;
        tracing::info!(genesis = %self.genesis.hash, "ledger initialized");
        Ok(())
    }

    // ── Queries ─────────────────────────────────────────────────────────

    pub fn block_exists(&self, txn: &RoTxn, hash: &BlockHash) -> Result<bool, LedgerError> {
        Ok(self.store.block_exists(txn, hash)?)
    }

    pub fn get_block(&self, txn: &RoTxn, hash: &BlockHash) -> Result<Option<StoredBlock>, LedgerError> {
        match self.store.block_get(txn, hash)? {
            Some(bytes) => Ok(Some(StoredBlock::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Balance of the chain after the given block.
    pub fn balance(&self, txn: &RoTxn, hash: &BlockHash) -> Result<Option<Amount>, LedgerError> {
        Ok(self.get_block(txn, hash)?.map(|b| b.sideband.balance))
    }

    /// The account whose chain contains the given block.
    pub fn account_of(&self, txn: &RoTxn, hash: &BlockHash) -> Result<Option<Account>, LedgerError> {
        Ok(self.get_block(txn, hash)?.map(|b| b.sideband.account))
    }

    pub fn account_info(
        &self,
        txn: &RoTxn,
        account: &Account,
    ) -> Result<Option<AccountInfo>, LedgerError> {
        Ok(self.store.account_get(txn, account)?)
    }

    pub fn confirmation_height(
        &self,
        txn: &RoTxn,
        account: &Account,
    ) -> Result<ConfirmationHeightInfo, LedgerError> {
        Ok(self
            .store
            .confirmation_height_get(txn, account)?
            .unwrap_or_default())
    }

    // ── Admission ───────────────────────────────────────────────────────

    /// Validate `block` and, on `Progress`, write it and every dependent
    /// table update inside the caller's write transaction.
    pub fn process(&self, txn: &mut RwTxn, block: &Block) -> Result<ProcessResult, LedgerError> {
        let hash = block.hash();
        if self.store.block_exists(txn, &hash)? {
            return Ok(ProcessResult::Old);
        }
        match block {
            Block::Open(_) => self.process_open(txn, block, &hash),
            Block::Send(_) => self.process_send(txn, block, &hash),
            Block::Receive(_) => self.process_receive(txn, block, &hash),
            Block::Change(_) => self.process_change(txn, block, &hash),
            Block::State(_) => self.process_state(txn, block, &hash),
        }
    }

    fn process_open(
        &self,
        txn: &mut RwTxn,
        block: &Block,
        hash: &BlockHash,
    ) -> Result<ProcessResult, LedgerError> {
        let Block::Open(open) = block else { unreachable!() };
        let account = open.account;
        if account.is_zero() {
            return Ok(ProcessResult::OpenedBurnAccount);
        }
        if !keys::verify_signature(hash.as_bytes(), &open.signature, &account) {
            return Ok(ProcessResult::BadSignature);
        }
        if self.store.account_get(txn, &account)?.is_some() {
            return Ok(ProcessResult::Fork);
        }
        if !self.store.block_exists(txn, &open.source)? {
            return Ok(ProcessResult::GapSource);
        }
        let pending_key = PendingKey::new(account, open.source);
        let Some(pending) = self.store.pending_get(txn, &pending_key)? else {
            return Ok(ProcessResult::Unreceivable);
        };
        self.store.pending_del(txn, &pending_key)?;
        self.write_block(
            txn,
            block,
            hash,
            account,
            1,
            pending.amount,
            open.representative,
        )?;
        Ok(ProcessResult::Progress)
    }

    fn process_send(
        &self,
        txn: &mut RwTxn,
        block: &Block,
        hash: &BlockHash,
    ) -> Result<ProcessResult, LedgerError> {
        let Block::Send(send) = block else { unreachable!() };
        let Some(prev) = self.get_block(txn, &send.previous)? else {
            return Ok(ProcessResult::GapPrevious);
        };
        let account = prev.sideband.account;
        if !keys::verify_signature(hash.as_bytes(), &send.signature, &account) {
            return Ok(ProcessResult::BadSignature);
        }
        let Some(info) = self.store.account_get(txn, &account)? else {
            return Ok(ProcessResult::GapPrevious);
        };
        if info.head != send.previous {
            return Ok(ProcessResult::Fork);
        }
        if send.balance >= prev.sideband.balance {
            return Ok(ProcessResult::NegativeSpend);
        }
        let amount = prev.sideband.balance.saturating_sub(send.balance);
        self.store.pending_put(
            txn,
            &PendingKey::new(send.destination, *hash),
            &PendingInfo {
                source: account,
                amount,
            },
        )?;
        self.write_block(
            txn,
            block,
            hash,
            account,
            prev.sideband.height + 1,
            send.balance,
            prev.sideband.representative,
        )?;
        Ok(ProcessResult::Progress)
    }

    fn process_receive(
        &self,
        txn: &mut RwTxn,
        block: &Block,
        hash: &BlockHash,
    ) -> Result<ProcessResult, LedgerError> {
        let Block::Receive(receive) = block else { unreachable!() };
        let Some(prev) = self.get_block(txn, &receive.previous)? else {
            return Ok(ProcessResult::GapPrevious);
        };
        let account = prev.sideband.account;
        if !keys::verify_signature(hash.as_bytes(), &receive.signature, &account) {
            return Ok(ProcessResult::BadSignature);
        }
        let Some(info) = self.store.account_get(txn, &account)? else {
            return Ok(ProcessResult::GapPrevious);
        };
        if info.head != receive.previous {
            return Ok(ProcessResult::Fork);
        }
        if !self.store.block_exists(txn, &receive.source)? {
            return Ok(ProcessResult::GapSource);
        }
        let pending_key = PendingKey::new(account, receive.source);
        let Some(pending) = self.store.pending_get(txn, &pending_key)? else {
            return Ok(ProcessResult::Unreceivable);
        };
        let Some(balance) = prev.sideband.balance.checked_add(pending.amount) else {
            return Ok(ProcessResult::BalanceMismatch);
        };
        self.store.pending_del(txn, &pending_key)?;
        self.write_block(
            txn,
            block,
            hash,
            account,
            prev.sideband.height + 1,
            balance,
            prev.sideband.representative,
        )?;
        Ok(ProcessResult::Progress)
    }

    fn process_change(
        &self,
        txn: &mut RwTxn,
        block: &Block,
        hash: &BlockHash,
    ) -> Result<ProcessResult, LedgerError> {
        let Block::Change(change) = block else { unreachable!() };
        let Some(prev) = self.get_block(txn, &change.previous)? else {
            return Ok(ProcessResult::GapPrevious);
        };
        let account = prev.sideband.account;
        if !keys::verify_signature(hash.as_bytes(), &change.signature, &account) {
            return Ok(ProcessResult::BadSignature);
        }
        let Some(info) = self.store.account_get(txn, &account)? else {
            return Ok(ProcessResult::GapPrevious);
        };
        if info.head != change.previous {
            return Ok(ProcessResult::Fork);
        }
        self.write_block(
            txn,
            block,
            hash,
            account,
            prev.sideband.height + 1,
            prev.sideband.balance,
            change.representative,
        )?;
        Ok(ProcessResult::Progress)
    }

    fn process_state(
        &self,
        txn: &mut RwTxn,
        block: &Block,
        hash: &BlockHash,
    ) -> Result<ProcessResult, LedgerError> {
        let Block::State(state) = block else { unreachable!() };
        let account = state.account;
        if !keys::verify_signature(hash.as_bytes(), &state.signature, &account) {
            return Ok(ProcessResult::BadSignature);
        }

        if state.previous.is_zero() {
            // Open subtype.
            if account.is_zero() {
                return Ok(ProcessResult::OpenedBurnAccount);
            }
            if self.store.account_get(txn, &account)?.is_some() {
                return Ok(ProcessResult::Fork);
            }
            if state.link.is_zero() || is_epoch_link(&state.link) {
                return Ok(ProcessResult::BalanceMismatch);
            }
            let source = state.link.as_hash();
            if !self.store.block_exists(txn, &source)? {
                return Ok(ProcessResult::GapSource);
            }
            let pending_key = PendingKey::new(account, source);
            let Some(pending) = self.store.pending_get(txn, &pending_key)? else {
                return Ok(ProcessResult::Unreceivable);
            };
            if state.balance != pending.amount {
                return Ok(ProcessResult::BalanceMismatch);
            }
            self.store.pending_del(txn, &pending_key)?;
            self.write_block(txn, block, hash, account, 1, state.balance, state.representative)?;
            return Ok(ProcessResult::Progress);
        }

        let Some(prev) = self.get_block(txn, &state.previous)? else {
            return Ok(ProcessResult::GapPrevious);
        };
        if prev.sideband.account != account {
            return Ok(ProcessResult::BlockPosition);
        }
        let Some(info) = self.store.account_get(txn, &account)? else {
            return Ok(ProcessResult::GapPrevious);
        };
        if info.head != state.previous {
            return Ok(ProcessResult::Fork);
        }

        let prev_balance = prev.sideband.balance;
        if state.balance < prev_balance {
            // Send subtype: link is the destination.
            let amount = prev_balance.saturating_sub(state.balance);
            self.store.pending_put(
                txn,
                &PendingKey::new(state.link.as_account(), *hash),
                &PendingInfo {
                    source: account,
                    amount,
                },
            )?;
        } else if state.balance > prev_balance {
            // Receive subtype: link is the source send.
            if state.link.is_zero() {
                return Ok(ProcessResult::BalanceMismatch);
            }
            let source = state.link.as_hash();
            if !self.store.block_exists(txn, &source)? {
                return Ok(ProcessResult::GapSource);
            }
            let pending_key = PendingKey::new(account, source);
            let Some(pending) = self.store.pending_get(txn, &pending_key)? else {
                return Ok(ProcessResult::Unreceivable);
            };
            let delta = state.balance.saturating_sub(prev_balance);
            if delta != pending.amount {
                return Ok(ProcessResult::BalanceMismatch);
            }
            self.store.pending_del(txn, &pending_key)?;
        } else {
            // Equal balance: representative change or epoch marker.
            if !state.link.is_zero() && !is_epoch_link(&state.link) {
                return Ok(ProcessResult::BalanceMismatch);
            }
        }

        self.write_block(
            txn,
            block,
            hash,
            account,
            prev.sideband.height + 1,
            state.balance,
            state.representative,
        )?;
        Ok(ProcessResult::Progress)
    }

    fn write_block(
        &self,
        txn: &mut RwTxn,
        block: &Block,
        hash: &BlockHash,
        account: Account,
        height: u64,
        balance: Amount,
        representative: Account,
    ) -> Result<(), LedgerError> {
        let now = unix_seconds();
        let stored = StoredBlock {
            block: block.clone(),
            sideband: BlockSideband {
                account,
                height,
                balance,
                representative,
                timestamp: now,
            },
        };
        self.store.block_put(txn, hash, &stored.to_bytes()?)?;
        self.store.account_put(
            txn,
            &account,
            &AccountInfo {
                head: *hash,
                representative,
                balance,
                block_count: height,
                modified: now,
            },
        )?;
        self.store.frontier_put(txn, &account, hash)?;
        Ok(())
    }

    // ── Rollback ────────────────────────────────────────────────────────

    /// Unwind the owning chain from its head down to and including `hash`.
    ///
    /// Returns `true` ("refused") without mutating anything when the target
    /// is at or below the cemented height, when it is unknown, or when a
    /// send in the unwound range has already been pocketed elsewhere.
    pub fn rollback(&self, txn: &mut RwTxn, hash: &BlockHash) -> Result<bool, LedgerError> {
        let Some(target) = self.get_block(txn, hash)? else {
            return Ok(true);
        };
        let account = target.sideband.account;
        let cemented = self.confirmation_height(txn, &account)?.height;
        if target.sideband.height <= cemented {
            return Ok(true);
        }
        let Some(info) = self.store.account_get(txn, &account)? else {
            return Ok(true);
        };

        // Collect head..=target, then verify every unwound send is still
        // unpocketed before touching any table.
        let mut chain = Vec::new();
        let mut current = info.head;
        loop {
            let Some(stored) = self.get_block(txn, &current)? else {
                return Err(LedgerError::Inconsistent(format!(
                    "chain walk hit missing block {current}"
                )));
            };
            let previous = stored.block.previous();
            let at_target = current == *hash;
            chain.push((current, stored));
            if at_target {
                break;
            }
            if previous.is_zero() {
                return Err(LedgerError::Inconsistent(format!(
                    "rollback target {hash} not on its account chain"
                )));
            }
            current = previous;
        }
        for (block_hash, stored) in &chain {
            if let Some(destination) = send_destination(&stored.block, stored.sideband.balance, self, txn)? {
                let key = PendingKey::new(destination, *block_hash);
                if self.store.pending_get(txn, &key)?.is_none() {
                    return Ok(true);
                }
            }
        }

        for (block_hash, stored) in &chain {
            self.rollback_one(txn, block_hash, stored)?;
        }

        let (_, oldest) = &chain[chain.len() - 1];
        let previous = oldest.block.previous();
        if previous.is_zero() {
            self.store.account_del(txn, &account)?;
            self.store.frontier_del(txn, &account)?;
            self.store.confirmation_height_del(txn, &account)?;
        } else {
            let prev = self.get_block(txn, &previous)?.ok_or_else(|| {
                LedgerError::Inconsistent(format!("rollback lost predecessor {previous}"))
            })?;
            self.store.account_put(
                txn,
                &account,
                &AccountInfo {
                    head: previous,
                    representative: prev.sideband.representative,
                    balance: prev.sideband.balance,
                    block_count: prev.sideband.height,
                    modified: unix_seconds(),
                },
            )?;
            self.store.frontier_put(txn, &account, &previous)?;
        }
        tracing::debug!(%hash, count = chain.len(), "rolled back chain tail");
        Ok(false)
    }

    fn rollback_one(
        &self,
        txn: &mut RwTxn,
        hash: &BlockHash,
        stored: &StoredBlock,
    ) -> Result<(), LedgerError> {
        let account = stored.sideband.account;
        if let Some(destination) =
            send_destination(&stored.block, stored.sideband.balance, self, txn)?
        {
            self.store
                .pending_del(txn, &PendingKey::new(destination, *hash))?;
        }
        if let Some(source) = pocketed_source(&stored.block, stored.sideband.balance, self, txn)? {
            let amount = self.received_amount(txn, stored)?;
            let source_account = self.account_of(txn, &source)?.ok_or_else(|| {
                LedgerError::Inconsistent(format!("pocketed source {source} missing"))
            })?;
            self.store.pending_put(
                txn,
                &PendingKey::new(account, source),
                &PendingInfo {
                    source: source_account,
                    amount,
                },
            )?;
        }
        self.store.block_del(txn, hash)?;
        Ok(())
    }

    /// Value pocketed by a receive-kind block.
    fn received_amount(&self, txn: &RoTxn, stored: &StoredBlock) -> Result<Amount, LedgerError> {
        let previous = stored.block.previous();
        if previous.is_zero() {
            return Ok(stored.sideband.balance);
        }
        let prev = self.get_block(txn, &previous)?.ok_or_else(|| {
            LedgerError::Inconsistent(format!("predecessor {previous} missing"))
        })?;
        Ok(stored.sideband.balance.saturating_sub(prev.sideband.balance))
    }
}

/// The destination when `block` is a send (legacy or state subtype).
fn send_destination(
    block: &Block,
    balance_after: Amount,
    ledger: &Ledger,
    txn: &RoTxn,
) -> Result<Option<Account>, LedgerError> {
    match block {
        Block::Send(send) => Ok(Some(send.destination)),
        Block::State(state) if !state.previous.is_zero() => {
            let prev_balance = ledger
                .balance(txn, &state.previous)?
                .unwrap_or(Amount::ZERO);
            if balance_after < prev_balance {
                Ok(Some(state.link.as_account()))
            } else {
                Ok(None)
            }
        }
        _ => Ok(None),
    }
}

/// The source send when `block` pockets one (receive/open, legacy or state).
fn pocketed_source(
    block: &Block,
    balance_after: Amount,
    ledger: &Ledger,
    txn: &RoTxn,
) -> Result<Option<BlockHash>, LedgerError> {
    match block {
        Block::Receive(receive) => Ok(Some(receive.source)),
        Block::Open(open) => Ok(Some(open.source)),
        Block::State(state) if state.previous.is_zero() => Ok(Some(state.link.as_hash())),
        Block::State(state) => {
            let prev_balance = ledger
                .balance(txn, &state.previous)?
                .unwrap_or(Amount::ZERO);
            if balance_after > prev_balance && !is_epoch_link(&state.link) {
                Ok(Some(state.link.as_hash()))
            } else {
                Ok(None)
            }
        }
        _ => Ok(None),
    }
}

fn unix_seconds() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
