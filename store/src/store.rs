//! The LMDB environment and its tables.

use std::ops::Bound;
use std::path::Path;
use std::sync::Arc;

use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions, RoTxn, RwTxn};

use strand_types::{Account, Amount, BlockHash, Endpoint};

use crate::info::{AccountInfo, ConfirmationHeightInfo, PendingInfo, PendingKey, UncheckedKey};
use crate::write_queue::WriteQueue;
use crate::StoreError;

const MAX_DBS: u32 = 16;

/// Every table of the ledger, backed by one LMDB environment.
///
/// All accessors take the transaction explicitly. A write transaction
/// spanning several `*_put` calls commits them atomically; dropping it
/// without commit aborts everything.
pub struct LedgerStore {
    env: Arc<Env>,
    blocks_db: Database<Bytes, Bytes>,
    accounts_db: Database<Bytes, Bytes>,
    pending_db: Database<Bytes, Bytes>,
    confirmation_height_db: Database<Bytes, Bytes>,
    frontiers_db: Database<Bytes, Bytes>,
    peers_db: Database<Bytes, Bytes>,
    unchecked_db: Database<Bytes, Bytes>,
    online_weight_db: Database<Bytes, Bytes>,
    meta_db: Database<Bytes, Bytes>,
    write_queue: WriteQueue,
}

/// Smallest byte string strictly greater than every string with `prefix`.
fn increment_prefix(prefix: &mut Vec<u8>) {
    while let Some(last) = prefix.last_mut() {
        if *last < 0xFF {
            *last += 1;
            return;
        }
        prefix.pop();
    }
}

impl LedgerStore {
    /// Open or create the environment at `path`.
    pub fn open(path: &Path, map_size: usize) -> Result<Self, StoreError> {
        std::fs::create_dir_all(path)?;

        let env = unsafe {
            EnvOpenOptions::new()
                .max_dbs(MAX_DBS)
                .map_size(map_size)
                .open(path)?
        };

        let mut wtxn = env.write_txn()?;
        let blocks_db = env.create_database(&mut wtxn, Some("blocks"))?;
        let accounts_db = env.create_database(&mut wtxn, Some("accounts"))?;
        let pending_db = env.create_database(&mut wtxn, Some("pending"))?;
        let confirmation_height_db =
            env.create_database(&mut wtxn, Some("confirmation_height"))?;
        let frontiers_db = env.create_database(&mut wtxn, Some("frontiers"))?;
        let peers_db = env.create_database(&mut wtxn, Some("peers"))?;
        let unchecked_db = env.create_database(&mut wtxn, Some("unchecked"))?;
        let online_weight_db = env.create_database(&mut wtxn, Some("online_weight"))?;
        let meta_db = env.create_database(&mut wtxn, Some("meta"))?;
        wtxn.commit()?;

        Ok(Self {
            env: Arc::new(env),
            blocks_db,
            accounts_db,
            pending_db,
            confirmation_height_db,
            frontiers_db,
            peers_db,
            unchecked_db,
            online_weight_db,
            meta_db,
            write_queue: WriteQueue::new(),
        })
    }

    /// Begin a snapshot read transaction.
    pub fn read_txn(&self) -> Result<RoTxn<'_>, StoreError> {
        Ok(self.env.read_txn()?)
    }

    /// Begin a write transaction. Callers on exclusive-write paths must
    /// hold a [`WriteGuard`](crate::WriteGuard) first.
    pub fn write_txn(&self) -> Result<RwTxn<'_>, StoreError> {
        Ok(self.env.write_txn()?)
    }

    /// The queue serializing exclusive writers.
    pub fn write_queue(&self) -> &WriteQueue {
        &self.write_queue
    }

    // ── blocks ──────────────────────────────────────────────────────────

    pub fn block_put(
        &self,
        txn: &mut RwTxn,
        hash: &BlockHash,
        bytes: &[u8],
    ) -> Result<(), StoreError> {
        self.blocks_db.put(txn, hash.as_bytes(), bytes)?;
        Ok(())
    }

    pub fn block_get(&self, txn: &RoTxn, hash: &BlockHash) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .blocks_db
            .get(txn, hash.as_bytes().as_slice())?
            .map(|b| b.to_vec()))
    }

    pub fn block_exists(&self, txn: &RoTxn, hash: &BlockHash) -> Result<bool, StoreError> {
        Ok(self.blocks_db.get(txn, hash.as_bytes().as_slice())?.is_some())
    }

    pub fn block_del(&self, txn: &mut RwTxn, hash: &BlockHash) -> Result<(), StoreError> {
        self.blocks_db.delete(txn, hash.as_bytes().as_slice())?;
        Ok(())
    }

    pub fn block_count(&self, txn: &RoTxn) -> Result<u64, StoreError> {
        Ok(self.blocks_db.len(txn)?)
    }

    // ── accounts ────────────────────────────────────────────────────────

    pub fn account_put(
        &self,
        txn: &mut RwTxn,
        account: &Account,
        info: &AccountInfo,
    ) -> Result<(), StoreError> {
        let bytes = bincode::serialize(info)?;
        self.accounts_db.put(txn, account.as_bytes(), &bytes)?;
        Ok(())
    }

    pub fn account_get(
        &self,
        txn: &RoTxn,
        account: &Account,
    ) -> Result<Option<AccountInfo>, StoreError> {
        match self.accounts_db.get(txn, account.as_bytes().as_slice())? {
            Some(bytes) => Ok(Some(bincode::deserialize(bytes)?)),
            None => Ok(None),
        }
    }

    pub fn account_del(&self, txn: &mut RwTxn, account: &Account) -> Result<(), StoreError> {
        self.accounts_db.delete(txn, account.as_bytes().as_slice())?;
        Ok(())
    }

    pub fn account_count(&self, txn: &RoTxn) -> Result<u64, StoreError> {
        Ok(self.accounts_db.len(txn)?)
    }

    /// Visit accounts in key order starting at `start` (inclusive). The
    /// callback returns `false` to stop the scan.
    pub fn account_for_each_from(
        &self,
        txn: &RoTxn,
        start: &Account,
        mut f: impl FnMut(Account, AccountInfo) -> bool,
    ) -> Result<(), StoreError> {
        let bounds = (
            Bound::Included(start.as_bytes().as_slice()),
            Bound::Unbounded,
        );
        for entry in self.accounts_db.range(txn, &bounds)? {
            let (key, value) = entry?;
            let account = decode_account_key(key, "accounts")?;
            let info: AccountInfo = bincode::deserialize(value)?;
            if !f(account, info) {
                break;
            }
        }
        Ok(())
    }

    // ── pending ─────────────────────────────────────────────────────────

    pub fn pending_put(
        &self,
        txn: &mut RwTxn,
        key: &PendingKey,
        info: &PendingInfo,
    ) -> Result<(), StoreError> {
        let bytes = bincode::serialize(info)?;
        self.pending_db.put(txn, &key.to_bytes(), &bytes)?;
        Ok(())
    }

    pub fn pending_get(
        &self,
        txn: &RoTxn,
        key: &PendingKey,
    ) -> Result<Option<PendingInfo>, StoreError> {
        match self.pending_db.get(txn, key.to_bytes().as_slice())? {
            Some(bytes) => Ok(Some(bincode::deserialize(bytes)?)),
            None => Ok(None),
        }
    }

    pub fn pending_del(&self, txn: &mut RwTxn, key: &PendingKey) -> Result<(), StoreError> {
        self.pending_db.delete(txn, key.to_bytes().as_slice())?;
        Ok(())
    }

    /// All receivable sends addressed to `destination`.
    pub fn pending_for_account(
        &self,
        txn: &RoTxn,
        destination: &Account,
    ) -> Result<Vec<(PendingKey, PendingInfo)>, StoreError> {
        let prefix = destination.as_bytes().to_vec();
        let mut upper = prefix.clone();
        increment_prefix(&mut upper);
        let bounds = (
            Bound::Included(prefix.as_slice()),
            Bound::Excluded(upper.as_slice()),
        );
        let mut out = Vec::new();
        for entry in self.pending_db.range(txn, &bounds)? {
            let (key, value) = entry?;
            let key = PendingKey::from_bytes(key).ok_or(StoreError::Corrupt {
                table: "pending",
                reason: format!("key length {}", key.len()),
            })?;
            out.push((key, bincode::deserialize(value)?));
        }
        Ok(out)
    }

    // ── confirmation height ─────────────────────────────────────────────

    pub fn confirmation_height_put(
        &self,
        txn: &mut RwTxn,
        account: &Account,
        info: &ConfirmationHeightInfo,
    ) -> Result<(), StoreError> {
        self.confirmation_height_db
            .put(txn, account.as_bytes(), &info.to_bytes())?;
        Ok(())
    }

    pub fn confirmation_height_get(
        &self,
        txn: &RoTxn,
        account: &Account,
    ) -> Result<Option<ConfirmationHeightInfo>, StoreError> {
        match self
            .confirmation_height_db
            .get(txn, account.as_bytes().as_slice())?
        {
            Some(bytes) => {
                ConfirmationHeightInfo::from_bytes(bytes)
                    .map(Some)
                    .ok_or(StoreError::Corrupt {
                        table: "confirmation_height",
                        reason: format!("value length {}", bytes.len()),
                    })
            }
            None => Ok(None),
        }
    }

    pub fn confirmation_height_del(
        &self,
        txn: &mut RwTxn,
        account: &Account,
    ) -> Result<(), StoreError> {
        self.confirmation_height_db
            .delete(txn, account.as_bytes().as_slice())?;
        Ok(())
    }

    // ── frontiers ───────────────────────────────────────────────────────

    pub fn frontier_put(
        &self,
        txn: &mut RwTxn,
        account: &Account,
        head: &BlockHash,
    ) -> Result<(), StoreError> {
        self.frontiers_db
            .put(txn, account.as_bytes(), head.as_bytes())?;
        Ok(())
    }

    pub fn frontier_get(
        &self,
        txn: &RoTxn,
        account: &Account,
    ) -> Result<Option<BlockHash>, StoreError> {
        match self.frontiers_db.get(txn, account.as_bytes().as_slice())? {
            Some(bytes) => {
                let arr: [u8; 32] = bytes.try_into().map_err(|_| StoreError::Corrupt {
                    table: "frontiers",
                    reason: format!("value length {}", bytes.len()),
                })?;
                Ok(Some(BlockHash::new(arr)))
            }
            None => Ok(None),
        }
    }

    pub fn frontier_del(&self, txn: &mut RwTxn, account: &Account) -> Result<(), StoreError> {
        self.frontiers_db.delete(txn, account.as_bytes().as_slice())?;
        Ok(())
    }

    /// Visit frontiers in account order starting at `start` (inclusive).
    pub fn frontier_for_each_from(
        &self,
        txn: &RoTxn,
        start: &Account,
        mut f: impl FnMut(Account, BlockHash) -> bool,
    ) -> Result<(), StoreError> {
        let bounds = (
            Bound::Included(start.as_bytes().as_slice()),
            Bound::Unbounded,
        );
        for entry in self.frontiers_db.range(txn, &bounds)? {
            let (key, value) = entry?;
            let account = decode_account_key(key, "frontiers")?;
            let arr: [u8; 32] = value.try_into().map_err(|_| StoreError::Corrupt {
                table: "frontiers",
                reason: format!("value length {}", value.len()),
            })?;
            if !f(account, BlockHash::new(arr)) {
                break;
            }
        }
        Ok(())
    }

    // ── peers ───────────────────────────────────────────────────────────

    pub fn peer_put(
        &self,
        txn: &mut RwTxn,
        endpoint: &Endpoint,
        last_seen: u64,
    ) -> Result<(), StoreError> {
        self.peers_db
            .put(txn, &endpoint.to_bytes(), &last_seen.to_be_bytes())?;
        Ok(())
    }

    pub fn peer_del(&self, txn: &mut RwTxn, endpoint: &Endpoint) -> Result<(), StoreError> {
        self.peers_db.delete(txn, endpoint.to_bytes().as_slice())?;
        Ok(())
    }

    pub fn peer_count(&self, txn: &RoTxn) -> Result<u64, StoreError> {
        Ok(self.peers_db.len(txn)?)
    }

    pub fn peers_all(&self, txn: &RoTxn) -> Result<Vec<(Endpoint, u64)>, StoreError> {
        let mut out = Vec::new();
        for entry in self.peers_db.iter(txn)? {
            let (key, value) = entry?;
            let key: [u8; 18] = key.try_into().map_err(|_| StoreError::Corrupt {
                table: "peers",
                reason: format!("key length {}", key.len()),
            })?;
            let ts: [u8; 8] = value.try_into().map_err(|_| StoreError::Corrupt {
                table: "peers",
                reason: format!("value length {}", value.len()),
            })?;
            out.push((Endpoint::from_bytes(&key), u64::from_be_bytes(ts)));
        }
        Ok(out)
    }

    // ── unchecked ───────────────────────────────────────────────────────

    pub fn unchecked_put(
        &self,
        txn: &mut RwTxn,
        key: &UncheckedKey,
        bytes: &[u8],
    ) -> Result<(), StoreError> {
        self.unchecked_db.put(txn, &key.to_bytes(), bytes)?;
        Ok(())
    }

    pub fn unchecked_del(&self, txn: &mut RwTxn, key: &UncheckedKey) -> Result<(), StoreError> {
        self.unchecked_db.delete(txn, key.to_bytes().as_slice())?;
        Ok(())
    }

    pub fn unchecked_count(&self, txn: &RoTxn) -> Result<u64, StoreError> {
        Ok(self.unchecked_db.len(txn)?)
    }

    /// All blocks parked under the given missing dependency.
    pub fn unchecked_dependents(
        &self,
        txn: &RoTxn,
        dependency: &BlockHash,
    ) -> Result<Vec<(UncheckedKey, Vec<u8>)>, StoreError> {
        let prefix = dependency.as_bytes().to_vec();
        let mut upper = prefix.clone();
        increment_prefix(&mut upper);
        let bounds = (
            Bound::Included(prefix.as_slice()),
            Bound::Excluded(upper.as_slice()),
        );
        let mut out = Vec::new();
        for entry in self.unchecked_db.range(txn, &bounds)? {
            let (key, value) = entry?;
            let key = UncheckedKey::from_bytes(key).ok_or(StoreError::Corrupt {
                table: "unchecked",
                reason: format!("key length {}", key.len()),
            })?;
            out.push((key, value.to_vec()));
        }
        Ok(out)
    }

    // ── online weight ───────────────────────────────────────────────────

    pub fn online_weight_put(
        &self,
        txn: &mut RwTxn,
        timestamp: u64,
        weight: Amount,
    ) -> Result<(), StoreError> {
        self.online_weight_db
            .put(txn, &timestamp.to_be_bytes(), &weight.to_be_bytes())?;
        Ok(())
    }

    pub fn online_weight_all(&self, txn: &RoTxn) -> Result<Vec<(u64, Amount)>, StoreError> {
        let mut out = Vec::new();
        for entry in self.online_weight_db.iter(txn)? {
            let (key, value) = entry?;
            let ts: [u8; 8] = key.try_into().map_err(|_| StoreError::Corrupt {
                table: "online_weight",
                reason: format!("key length {}", key.len()),
            })?;
            let w: [u8; 16] = value.try_into().map_err(|_| StoreError::Corrupt {
                table: "online_weight",
                reason: format!("value length {}", value.len()),
            })?;
            out.push((u64::from_be_bytes(ts), Amount::from_be_bytes(w)));
        }
        Ok(out)
    }

    /// Drop samples older than `cutoff`.
    pub fn online_weight_trim(&self, txn: &mut RwTxn, cutoff: u64) -> Result<usize, StoreError> {
        let all = {
            let mut keys = Vec::new();
            for entry in self.online_weight_db.iter(txn)? {
                let (key, _) = entry?;
                let ts: [u8; 8] = key.try_into().map_err(|_| StoreError::Corrupt {
                    table: "online_weight",
                    reason: format!("key length {}", key.len()),
                })?;
                let ts = u64::from_be_bytes(ts);
                if ts < cutoff {
                    keys.push(ts);
                }
            }
            keys
        };
        for ts in &all {
            self.online_weight_db.delete(txn, &ts.to_be_bytes())?;
        }
        Ok(all.len())
    }

    // ── meta ────────────────────────────────────────────────────────────

    pub fn meta_put(&self, txn: &mut RwTxn, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.meta_db.put(txn, key.as_bytes(), value)?;
        Ok(())
    }

    pub fn meta_get(&self, txn: &RoTxn, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.meta_db.get(txn, key.as_bytes())?.map(|b| b.to_vec()))
    }
}

fn decode_account_key(key: &[u8], table: &'static str) -> Result<Account, StoreError> {
    let arr: [u8; 32] = key.try_into().map_err(|_| StoreError::Corrupt {
        table,
        reason: format!("key length {}", key.len()),
    })?;
    Ok(Account::from_bytes(arr))
}
