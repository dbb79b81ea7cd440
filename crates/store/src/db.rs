//! # Settlement Database
//!
//! Persistence untuk seluruh record settlement: reward events, frozen
//! batches, claim epochs, leaves, salts, dan receipts.
//!
//! ## Layout
//!
//! | Database | Key | Value |
//! |----------|-----|-------|
//! | `reward_events` | event uuid (16B) | `RewardEvent` |
//! | `reward_batches` | week_key ‖ `#` ‖ generation BE | `RewardBatch` |
//! | `claim_epochs` | epoch u64 BE | `ClaimEpoch` |
//! | `claim_leaves` | epoch BE ‖ user_key (40B) | `ClaimLeaf` |
//! | `claim_salts` | epoch BE ‖ user_key (40B) | `[u8; 32]` |
//! | `claim_receipts` | epoch BE ‖ user_key (40B) | `ClaimReceipt` |
//! | `meta` | misc | misc |
//!
//! ## Invariants
//!
//! - `insert_receipt` memakai `NO_OVERWRITE`: duplikat → `KeyExist` →
//!   `ALREADY_CLAIMED`. Tidak ada silent overwrite.
//! - `mark_on_chain` hanya transisi false→true; tidak ada API untuk
//!   membalik, dan tx_sig yang sudah tercatat tidak pernah ditimpa.
//! - `store_epoch_build` menulis epoch + seluruh leaves dalam SATU
//!   write transaction; tidak ada epoch tanpa leaves yang bisa terbaca.
//! - `delete_week` menolak jika ada epoch on-chain untuk week tersebut,
//!   dan seluruh delete terjadi dalam satu transaction.

use std::path::Path;

use lmdb::{Cursor, Database, DatabaseFlags, Environment, Transaction, WriteFlags};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use merx_common::{
    ClaimEpoch, ClaimLeaf, ClaimReceipt, EpochVersion, RewardBatch, RewardEvent, SettlementError,
    UserKey, WeekKey,
};

// ════════════════════════════════════════════════════════════════════════════
// ERROR TYPE
// ════════════════════════════════════════════════════════════════════════════

/// Persistence failure.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("lmdb error: {0}")]
    Lmdb(#[from] lmdb::Error),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<bincode::Error> for StoreError {
    fn from(e: bincode::Error) -> Self {
        Self::Codec(e.to_string())
    }
}

impl From<StoreError> for SettlementError {
    fn from(e: StoreError) -> Self {
        SettlementError::Store {
            message: e.to_string(),
        }
    }
}

/// What a week reset deleted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResetCounts {
    pub events: u64,
    pub batches: u64,
    pub epochs: u64,
    pub leaves: u64,
    pub salts: u64,
}

// ════════════════════════════════════════════════════════════════════════════
// KEY ENCODING
// ════════════════════════════════════════════════════════════════════════════

fn epoch_user_key(epoch: u64, user_key: &UserKey) -> [u8; 40] {
    let mut key = [0u8; 40];
    key[..8].copy_from_slice(&epoch.to_be_bytes());
    key[8..].copy_from_slice(user_key.as_bytes());
    key
}

fn batch_key(week_key: &WeekKey, generation: u32) -> Vec<u8> {
    let mut key = Vec::with_capacity(week_key.as_str().len() + 5);
    key.extend_from_slice(week_key.as_str().as_bytes());
    key.push(b'#');
    key.extend_from_slice(&generation.to_be_bytes());
    key
}

// ════════════════════════════════════════════════════════════════════════════
// DATABASE
// ════════════════════════════════════════════════════════════════════════════

/// LMDB environment plus named databases. Cheap to share behind `Arc`;
/// LMDB serializes writers itself.
pub struct SettlementDb {
    env: Environment,
    db_events: Database,
    db_batches: Database,
    db_epochs: Database,
    db_leaves: Database,
    db_salts: Database,
    db_receipts: Database,
    #[allow(dead_code)]
    db_meta: Database,
}

impl SettlementDb {
    /// Open the environment at `path`, creating named databases.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let p = path.as_ref();
        std::fs::create_dir_all(p)?;

        let env = Environment::new()
            .set_max_dbs(8)
            .set_map_size(1_000_000_000usize)
            .open(p)?;

        let db_events = env.create_db(Some("reward_events"), DatabaseFlags::empty())?;
        let db_batches = env.create_db(Some("reward_batches"), DatabaseFlags::empty())?;
        let db_epochs = env.create_db(Some("claim_epochs"), DatabaseFlags::empty())?;
        let db_leaves = env.create_db(Some("claim_leaves"), DatabaseFlags::empty())?;
        let db_salts = env.create_db(Some("claim_salts"), DatabaseFlags::empty())?;
        let db_receipts = env.create_db(Some("claim_receipts"), DatabaseFlags::empty())?;
        let db_meta = env.create_db(Some("meta"), DatabaseFlags::empty())?;

        info!(path = %p.display(), "settlement db opened");

        Ok(Self {
            env,
            db_events,
            db_batches,
            db_epochs,
            db_leaves,
            db_salts,
            db_receipts,
            db_meta,
        })
    }

    // ------------------------
    // reward events
    // ------------------------

    /// Append one reward event. Concurrent producers each run their own
    /// short write transaction; no ledger-wide lock in process.
    pub fn put_event(&self, event: &RewardEvent) -> Result<(), StoreError> {
        let blob = bincode::serialize(event)?;
        let mut wtxn = self.env.begin_rw_txn()?;
        wtxn.put(self.db_events, event.id.as_bytes(), &blob, WriteFlags::empty())?;
        wtxn.commit()?;
        Ok(())
    }

    pub fn get_event(&self, id: &Uuid) -> Result<Option<RewardEvent>, StoreError> {
        let rtxn = self.env.begin_ro_txn()?;
        match rtxn.get(self.db_events, id.as_bytes()) {
            Ok(val) => Ok(Some(bincode::deserialize(val)?)),
            Err(lmdb::Error::NotFound) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// All events earned in a stats week, in insertion-independent order.
    pub fn events_for_source_week(&self, week_key: &WeekKey) -> Result<Vec<RewardEvent>, StoreError> {
        let rtxn = self.env.begin_ro_txn()?;
        let mut cursor = rtxn.open_ro_cursor(self.db_events)?;
        let mut out = Vec::new();
        for (_key, val) in cursor.iter() {
            let event: RewardEvent = bincode::deserialize(val)?;
            if event.source_week_key == *week_key {
                out.push(event);
            }
        }
        Ok(out)
    }

    /// Stamp events as consumed by a batch generation, in one
    /// transaction.
    pub fn mark_events_attached(
        &self,
        ids: &[Uuid],
        generation: u32,
    ) -> Result<(), StoreError> {
        let mut wtxn = self.env.begin_rw_txn()?;
        for id in ids {
            let existing = match wtxn.get(self.db_events, id.as_bytes()) {
                Ok(val) => bincode::deserialize::<RewardEvent>(val)?,
                Err(lmdb::Error::NotFound) => continue,
                Err(e) => return Err(e.into()),
            };
            let mut updated = existing;
            updated.batch_generation = Some(generation);
            let blob = bincode::serialize(&updated)?;
            wtxn.put(self.db_events, id.as_bytes(), &blob, WriteFlags::empty())?;
        }
        wtxn.commit()?;
        Ok(())
    }

    // ------------------------
    // reward batches
    // ------------------------

    pub fn put_batch(&self, batch: &RewardBatch) -> Result<(), StoreError> {
        let blob = bincode::serialize(batch)?;
        let key = batch_key(&batch.week_key, batch.generation);
        let mut wtxn = self.env.begin_rw_txn()?;
        wtxn.put(self.db_batches, &key, &blob, WriteFlags::empty())?;
        wtxn.commit()?;
        Ok(())
    }

    pub fn get_batch(
        &self,
        week_key: &WeekKey,
        generation: u32,
    ) -> Result<Option<RewardBatch>, StoreError> {
        let rtxn = self.env.begin_ro_txn()?;
        match rtxn.get(self.db_batches, &batch_key(week_key, generation)) {
            Ok(val) => Ok(Some(bincode::deserialize(val)?)),
            Err(lmdb::Error::NotFound) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// All generations frozen for a payout week, ascending.
    pub fn batches_for_week(&self, week_key: &WeekKey) -> Result<Vec<RewardBatch>, StoreError> {
        let rtxn = self.env.begin_ro_txn()?;
        let mut cursor = rtxn.open_ro_cursor(self.db_batches)?;
        let mut out = Vec::new();
        for (_key, val) in cursor.iter() {
            let batch: RewardBatch = bincode::deserialize(val)?;
            if batch.week_key == *week_key {
                out.push(batch);
            }
        }
        out.sort_by_key(|b| b.generation);
        Ok(out)
    }

    pub fn latest_batch_generation(&self, week_key: &WeekKey) -> Result<Option<u32>, StoreError> {
        Ok(self
            .batches_for_week(week_key)?
            .last()
            .map(|b| b.generation))
    }

    // ------------------------
    // claim epochs + leaves
    // ------------------------

    /// Persist a freshly built epoch and all its leaves atomically.
    /// Pre-existing leaves of the same epoch (a pre-publication rebuild)
    /// are removed in the same transaction.
    pub fn store_epoch_build(
        &self,
        epoch: &ClaimEpoch,
        leaves: &[ClaimLeaf],
    ) -> Result<(), StoreError> {
        let epoch_blob = bincode::serialize(epoch)?;
        let mut wtxn = self.env.begin_rw_txn()?;

        // Drop leaves of a previous build of this epoch number.
        let mut stale = Vec::new();
        {
            let mut cursor = wtxn.open_rw_cursor(self.db_leaves)?;
            for (key, _val) in cursor.iter() {
                if key.len() == 40 && key[..8] == epoch.epoch.to_be_bytes() {
                    stale.push(key.to_vec());
                }
            }
        }
        for key in stale {
            wtxn.del(self.db_leaves, &key, None)?;
        }

        wtxn.put(
            self.db_epochs,
            &epoch.epoch.to_be_bytes(),
            &epoch_blob,
            WriteFlags::empty(),
        )?;
        for leaf in leaves {
            let key = epoch_user_key(leaf.epoch, &leaf.user_key);
            let blob = bincode::serialize(leaf)?;
            wtxn.put(self.db_leaves, &key, &blob, WriteFlags::empty())?;
        }
        wtxn.commit()?;
        Ok(())
    }

    pub fn get_epoch(&self, epoch: u64) -> Result<Option<ClaimEpoch>, StoreError> {
        let rtxn = self.env.begin_ro_txn()?;
        match rtxn.get(self.db_epochs, &epoch.to_be_bytes()) {
            Ok(val) => Ok(Some(bincode::deserialize(val)?)),
            Err(lmdb::Error::NotFound) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Highest epoch number in the store, if any. Always a query; never
    /// cached, so concurrent operators cannot observe a stale value.
    pub fn latest_epoch(&self) -> Result<Option<ClaimEpoch>, StoreError> {
        let rtxn = self.env.begin_ro_txn()?;
        let mut cursor = rtxn.open_ro_cursor(self.db_epochs)?;
        let mut latest: Option<ClaimEpoch> = None;
        for (_key, val) in cursor.iter() {
            let epoch: ClaimEpoch = bincode::deserialize(val)?;
            if latest.as_ref().map_or(true, |l| epoch.epoch > l.epoch) {
                latest = Some(epoch);
            }
        }
        Ok(latest)
    }

    pub fn epoch_for_week(
        &self,
        week_key: &WeekKey,
        version: EpochVersion,
    ) -> Result<Option<ClaimEpoch>, StoreError> {
        let rtxn = self.env.begin_ro_txn()?;
        let mut cursor = rtxn.open_ro_cursor(self.db_epochs)?;
        let mut found: Option<ClaimEpoch> = None;
        for (_key, val) in cursor.iter() {
            let epoch: ClaimEpoch = bincode::deserialize(val)?;
            if epoch.week_key == *week_key && epoch.version == version {
                // Deterministic selection: highest epoch number wins.
                if found.as_ref().map_or(true, |f| epoch.epoch > f.epoch) {
                    found = Some(epoch);
                }
            }
        }
        Ok(found)
    }

    pub fn epochs_for_week(&self, week_key: &WeekKey) -> Result<Vec<ClaimEpoch>, StoreError> {
        let rtxn = self.env.begin_ro_txn()?;
        let mut cursor = rtxn.open_ro_cursor(self.db_epochs)?;
        let mut out = Vec::new();
        for (_key, val) in cursor.iter() {
            let epoch: ClaimEpoch = bincode::deserialize(val)?;
            if epoch.week_key == *week_key {
                out.push(epoch);
            }
        }
        out.sort_by_key(|e| e.epoch);
        Ok(out)
    }

    /// Epochs whose root is committed on-chain (the claimable set).
    pub fn published_epochs(&self) -> Result<Vec<ClaimEpoch>, StoreError> {
        let rtxn = self.env.begin_ro_txn()?;
        let mut cursor = rtxn.open_ro_cursor(self.db_epochs)?;
        let mut out = Vec::new();
        for (_key, val) in cursor.iter() {
            let epoch: ClaimEpoch = bincode::deserialize(val)?;
            if epoch.set_on_chain {
                out.push(epoch);
            }
        }
        out.sort_by_key(|e| e.epoch);
        Ok(out)
    }

    /// Epochs whose root is not yet committed on-chain.
    pub fn unpublished_epochs(&self) -> Result<Vec<ClaimEpoch>, StoreError> {
        let rtxn = self.env.begin_ro_txn()?;
        let mut cursor = rtxn.open_ro_cursor(self.db_epochs)?;
        let mut out = Vec::new();
        for (_key, val) in cursor.iter() {
            let epoch: ClaimEpoch = bincode::deserialize(val)?;
            if !epoch.set_on_chain {
                out.push(epoch);
            }
        }
        out.sort_by_key(|e| e.epoch);
        Ok(out)
    }

    /// One-way false→true transition. A second call is a no-op that
    /// keeps the originally recorded tx_sig; there is no reverse API.
    pub fn mark_on_chain(
        &self,
        epoch_number: u64,
        tx_sig: Option<String>,
    ) -> Result<ClaimEpoch, SettlementError> {
        let mut wtxn = self.env.begin_rw_txn().map_err(StoreError::from)?;
        let mut epoch: ClaimEpoch = match wtxn.get(self.db_epochs, &epoch_number.to_be_bytes()) {
            Ok(val) => bincode::deserialize(val).map_err(StoreError::from)?,
            Err(lmdb::Error::NotFound) => {
                return Err(SettlementError::EpochNotFound {
                    epoch: epoch_number,
                })
            }
            Err(e) => return Err(StoreError::from(e).into()),
        };

        if epoch.set_on_chain {
            // Idempotent; recorded tx_sig is never overwritten.
            return Ok(epoch);
        }

        epoch.set_on_chain = true;
        epoch.on_chain_tx_sig = tx_sig;
        let blob = bincode::serialize(&epoch).map_err(StoreError::from)?;
        wtxn.put(
            self.db_epochs,
            &epoch_number.to_be_bytes(),
            &blob,
            WriteFlags::empty(),
        )
        .map_err(StoreError::from)?;
        wtxn.commit().map_err(StoreError::from)?;
        Ok(epoch)
    }

    pub fn get_leaf(
        &self,
        epoch: u64,
        user_key: &UserKey,
    ) -> Result<Option<ClaimLeaf>, StoreError> {
        let rtxn = self.env.begin_ro_txn()?;
        match rtxn.get(self.db_leaves, &epoch_user_key(epoch, user_key)) {
            Ok(val) => Ok(Some(bincode::deserialize(val)?)),
            Err(lmdb::Error::NotFound) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn leaves_for_epoch(&self, epoch: u64) -> Result<Vec<ClaimLeaf>, StoreError> {
        let rtxn = self.env.begin_ro_txn()?;
        let mut cursor = rtxn.open_ro_cursor(self.db_leaves)?;
        let mut out = Vec::new();
        for (key, val) in cursor.iter() {
            if key.len() == 40 && key[..8] == epoch.to_be_bytes() {
                out.push(bincode::deserialize::<ClaimLeaf>(val)?);
            }
        }
        out.sort_by_key(|l| l.index);
        Ok(out)
    }

    // ------------------------
    // claim salts
    // ------------------------

    pub fn get_salt(
        &self,
        epoch: u64,
        user_key: &UserKey,
    ) -> Result<Option<[u8; 32]>, StoreError> {
        let rtxn = self.env.begin_ro_txn()?;
        match rtxn.get(self.db_salts, &epoch_user_key(epoch, user_key)) {
            Ok(val) => Ok(Some(bincode::deserialize(val)?)),
            Err(lmdb::Error::NotFound) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn put_salt(
        &self,
        epoch: u64,
        user_key: &UserKey,
        salt: &[u8; 32],
    ) -> Result<(), StoreError> {
        let blob = bincode::serialize(salt)?;
        let mut wtxn = self.env.begin_rw_txn()?;
        wtxn.put(
            self.db_salts,
            &epoch_user_key(epoch, user_key),
            &blob,
            WriteFlags::empty(),
        )?;
        wtxn.commit()?;
        Ok(())
    }

    // ------------------------
    // claim receipts
    // ------------------------

    /// Insert a receipt under the uniqueness constraint.
    ///
    /// This is the sole linearization point of claim settlement:
    /// concurrent confirmations race here, exactly one insert succeeds,
    /// every loser gets `ALREADY_CLAIMED`.
    pub fn insert_receipt(&self, receipt: &ClaimReceipt) -> Result<(), SettlementError> {
        let blob = bincode::serialize(receipt).map_err(StoreError::from)?;
        let key = epoch_user_key(receipt.epoch, &receipt.user_key);
        let mut wtxn = self.env.begin_rw_txn().map_err(StoreError::from)?;
        match wtxn.put(self.db_receipts, &key, &blob, WriteFlags::NO_OVERWRITE) {
            Ok(()) => {}
            Err(lmdb::Error::KeyExist) => {
                return Err(SettlementError::AlreadyClaimed {
                    epoch: receipt.epoch,
                    user_key_hex: receipt.user_key.to_hex(),
                })
            }
            Err(e) => return Err(StoreError::from(e).into()),
        }
        wtxn.commit().map_err(StoreError::from)?;
        Ok(())
    }

    pub fn get_receipt(
        &self,
        epoch: u64,
        user_key: &UserKey,
    ) -> Result<Option<ClaimReceipt>, StoreError> {
        let rtxn = self.env.begin_ro_txn()?;
        match rtxn.get(self.db_receipts, &epoch_user_key(epoch, user_key)) {
            Ok(val) => Ok(Some(bincode::deserialize(val)?)),
            Err(lmdb::Error::NotFound) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn receipts_for_user(&self, user_key: &UserKey) -> Result<Vec<ClaimReceipt>, StoreError> {
        let rtxn = self.env.begin_ro_txn()?;
        let mut cursor = rtxn.open_ro_cursor(self.db_receipts)?;
        let mut out = Vec::new();
        for (key, val) in cursor.iter() {
            if key.len() == 40 && &key[8..] == user_key.as_bytes() {
                out.push(bincode::deserialize::<ClaimReceipt>(val)?);
            }
        }
        out.sort_by_key(|r| r.epoch);
        Ok(out)
    }

    // ------------------------
    // destructive reset (development tooling)
    // ------------------------

    /// Delete every record tied to a week, in one transaction.
    ///
    /// Refused outright when any epoch for the week is on-chain;
    /// real-world payouts cannot be undone locally. Receipts are never
    /// deleted (a receipt implies an on-chain epoch, which blocks the
    /// reset anyway).
    pub fn delete_week(&self, week_key: &WeekKey) -> Result<ResetCounts, SettlementError> {
        let epochs = self.epochs_for_week(week_key).map_err(SettlementError::from)?;
        if let Some(on_chain) = epochs.iter().find(|e| e.set_on_chain) {
            return Err(SettlementError::ResetForbidden {
                week_key: week_key.to_string(),
                reason: format!("epoch {} is on-chain", on_chain.epoch),
            });
        }

        let mut counts = ResetCounts::default();
        let epoch_numbers: Vec<u64> = epochs.iter().map(|e| e.epoch).collect();
        let mut wtxn = self.env.begin_rw_txn().map_err(StoreError::from)?;

        // Events earned in this stats week.
        let mut event_keys = Vec::new();
        {
            let mut cursor = wtxn.open_rw_cursor(self.db_events).map_err(StoreError::from)?;
            for (key, val) in cursor.iter() {
                let event: RewardEvent = bincode::deserialize(val).map_err(StoreError::from)?;
                if event.source_week_key == *week_key {
                    event_keys.push(key.to_vec());
                }
            }
        }
        for key in &event_keys {
            wtxn.del(self.db_events, key, None).map_err(StoreError::from)?;
        }
        counts.events = event_keys.len() as u64;

        // Batches settling this payout week.
        let mut batch_keys = Vec::new();
        {
            let mut cursor = wtxn.open_rw_cursor(self.db_batches).map_err(StoreError::from)?;
            for (key, val) in cursor.iter() {
                let batch: RewardBatch = bincode::deserialize(val).map_err(StoreError::from)?;
                if batch.week_key == *week_key {
                    batch_keys.push(key.to_vec());
                }
            }
        }
        for key in &batch_keys {
            wtxn.del(self.db_batches, key, None).map_err(StoreError::from)?;
        }
        counts.batches = batch_keys.len() as u64;

        // Epochs, then leaves and salts keyed by those epoch numbers.
        for number in &epoch_numbers {
            wtxn.del(self.db_epochs, &number.to_be_bytes(), None)
                .map_err(StoreError::from)?;
            counts.epochs += 1;
        }
        for (db, slot) in [(self.db_leaves, 0usize), (self.db_salts, 1)] {
            let mut keys = Vec::new();
            {
                let mut cursor = wtxn.open_rw_cursor(db).map_err(StoreError::from)?;
                for (key, _val) in cursor.iter() {
                    if key.len() == 40
                        && epoch_numbers.iter().any(|n| key[..8] == n.to_be_bytes())
                    {
                        keys.push(key.to_vec());
                    }
                }
            }
            for key in &keys {
                wtxn.del(db, key, None).map_err(StoreError::from)?;
            }
            if slot == 0 {
                counts.leaves = keys.len() as u64;
            } else {
                counts.salts = keys.len() as u64;
            }
        }

        wtxn.commit().map_err(StoreError::from)?;
        warn!(week = %week_key, ?counts, "week reset executed");
        Ok(counts)
    }
}

// ════════════════════════════════════════════════════════════════════════════
// UNIT TESTS
// ════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use merx_common::{BatchStatus, RewardKind};
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn uk(byte: u8) -> UserKey {
        UserKey::from_bytes([byte; 32])
    }

    fn week(s: &str) -> WeekKey {
        WeekKey::parse(s).expect("week key")
    }

    fn open_db() -> (tempfile::TempDir, SettlementDb) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = SettlementDb::open(dir.path()).expect("open");
        (dir, db)
    }

    fn sample_epoch(number: u64, week_key: &str, on_chain: bool) -> ClaimEpoch {
        ClaimEpoch {
            epoch: number,
            week_key: week(week_key),
            version: EpochVersion::V2,
            root: [number as u8; 32],
            leaf_count: 1,
            total_atomic: 1000,
            build_hash: [0xBB; 32],
            batch_generation: 0,
            set_on_chain: on_chain,
            on_chain_tx_sig: on_chain.then(|| "sig".to_string()),
            created_at: 1000,
        }
    }

    fn sample_leaf(epoch: u64, user: UserKey, amount: u64, index: u32) -> ClaimLeaf {
        ClaimLeaf {
            epoch,
            user_key: user,
            amount_atomic: amount,
            index,
            salt: Some([0x55; 32]),
            proof: vec![[0x44; 32]],
        }
    }

    fn sample_receipt(epoch: u64, user: UserKey) -> ClaimReceipt {
        ClaimReceipt {
            epoch,
            user_key: user,
            tx_sig: format!("tx-{epoch}-{}", user.to_hex()),
            claimed_to: user,
            amount_atomic: 1000,
            confirmed_at: 2000,
        }
    }

    // ── 1. EVENT ROUND TRIP AND WEEK SCAN ───────────────────────────────

    #[test]
    fn event_round_trip_and_scan() {
        let (_dir, db) = open_db();
        let ev1 = RewardEvent::new(uk(1), RewardKind::Rating, 100, week("2026-01-19"), 10)
            .expect("event");
        let ev2 = RewardEvent::new(uk(2), RewardKind::Comment, 50, week("2026-01-26"), 11)
            .expect("event");
        db.put_event(&ev1).expect("put 1");
        db.put_event(&ev2).expect("put 2");

        assert_eq!(db.get_event(&ev1.id).expect("get"), Some(ev1.clone()));
        let scanned = db.events_for_source_week(&week("2026-01-19")).expect("scan");
        assert_eq!(scanned, vec![ev1]);
    }

    #[test]
    fn mark_events_attached_stamps_generation() {
        let (_dir, db) = open_db();
        let ev = RewardEvent::new(uk(1), RewardKind::Vote, 10, week("2026-01-19"), 10)
            .expect("event");
        db.put_event(&ev).expect("put");
        db.mark_events_attached(&[ev.id], 0).expect("attach");
        let stored = db.get_event(&ev.id).expect("get").expect("exists");
        assert_eq!(stored.batch_generation, Some(0));
    }

    // ── 2. BATCH GENERATIONS ────────────────────────────────────────────

    #[test]
    fn batch_generations_are_separate_rows() {
        let (_dir, db) = open_db();
        let mut totals = BTreeMap::new();
        totals.insert(uk(1), 100u64);
        for generation in 0..2 {
            let batch = RewardBatch {
                week_key: week("2026-01-19"),
                generation,
                status: BatchStatus::Frozen,
                source_week_key: week("2026-01-19"),
                totals_by_user: totals.clone(),
                total_amount: 100,
                event_count: 1,
                created_at: 10,
            };
            db.put_batch(&batch).expect("put");
        }
        assert_eq!(
            db.batches_for_week(&week("2026-01-19")).expect("scan").len(),
            2
        );
        assert_eq!(
            db.latest_batch_generation(&week("2026-01-19")).expect("latest"),
            Some(1)
        );
    }

    // ── 3. EPOCH BUILD IS ATOMIC AND REBUILD REPLACES LEAVES ────────────

    #[test]
    fn store_epoch_build_replaces_stale_leaves() {
        let (_dir, db) = open_db();
        let epoch = sample_epoch(1, "2026-01-19", false);
        db.store_epoch_build(
            &epoch,
            &[sample_leaf(1, uk(1), 100, 0), sample_leaf(1, uk(2), 200, 1)],
        )
        .expect("build 1");

        // Rebuild with a different leaf set: user 2 dropped.
        db.store_epoch_build(&epoch, &[sample_leaf(1, uk(1), 150, 0)])
            .expect("build 2");

        let leaves = db.leaves_for_epoch(1).expect("leaves");
        assert_eq!(leaves.len(), 1);
        assert_eq!(leaves[0].amount_atomic, 150);
        assert!(db.get_leaf(1, &uk(2)).expect("get").is_none());
    }

    #[test]
    fn latest_and_unpublished_epoch_queries() {
        let (_dir, db) = open_db();
        db.store_epoch_build(&sample_epoch(1, "2026-01-12", true), &[])
            .expect("e1");
        db.store_epoch_build(&sample_epoch(2, "2026-01-19", false), &[])
            .expect("e2");

        assert_eq!(db.latest_epoch().expect("latest").expect("some").epoch, 2);
        let unpublished = db.unpublished_epochs().expect("unpublished");
        assert_eq!(unpublished.len(), 1);
        assert_eq!(unpublished[0].epoch, 2);
    }

    // ── 4. MARK ON-CHAIN IS ONE-WAY ─────────────────────────────────────

    #[test]
    fn mark_on_chain_is_one_way_and_keeps_first_sig() {
        let (_dir, db) = open_db();
        db.store_epoch_build(&sample_epoch(3, "2026-01-19", false), &[])
            .expect("epoch");

        let marked = db
            .mark_on_chain(3, Some("first-sig".into()))
            .expect("mark");
        assert!(marked.set_on_chain);
        assert_eq!(marked.on_chain_tx_sig.as_deref(), Some("first-sig"));

        // Second mark no-ops; the recorded signature survives.
        let again = db
            .mark_on_chain(3, Some("second-sig".into()))
            .expect("idempotent");
        assert_eq!(again.on_chain_tx_sig.as_deref(), Some("first-sig"));
    }

    #[test]
    fn mark_on_chain_unknown_epoch() {
        let (_dir, db) = open_db();
        let err = db.mark_on_chain(99, None).expect_err("missing");
        assert_eq!(err.code(), "EPOCH_NOT_FOUND");
    }

    // ── 5. RECEIPT UNIQUENESS ───────────────────────────────────────────

    #[test]
    fn insert_receipt_rejects_duplicate() {
        let (_dir, db) = open_db();
        let receipt = sample_receipt(1, uk(1));
        db.insert_receipt(&receipt).expect("first");

        let err = db.insert_receipt(&receipt).expect_err("duplicate");
        assert_eq!(err.code(), "ALREADY_CLAIMED");

        // A different user in the same epoch is unaffected.
        db.insert_receipt(&sample_receipt(1, uk(2))).expect("other user");
    }

    #[test]
    fn concurrent_receipt_inserts_have_one_winner() {
        let (_dir, db) = open_db();
        let db = Arc::new(db);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let db = db.clone();
            handles.push(std::thread::spawn(move || {
                db.insert_receipt(&sample_receipt(7, uk(7)))
            }));
        }
        let results: Vec<_> = handles
            .into_iter()
            .map(|h| h.join().expect("thread"))
            .collect();

        let wins = results.iter().filter(|r| r.is_ok()).count();
        let losses = results
            .iter()
            .filter(|r| matches!(r, Err(e) if e.code() == "ALREADY_CLAIMED"))
            .count();
        assert_eq!(wins, 1);
        assert_eq!(losses, 7);
    }

    // ── 6. WEEK RESET ───────────────────────────────────────────────────

    #[test]
    fn delete_week_removes_everything_for_the_week() {
        let (_dir, db) = open_db();
        let ev = RewardEvent::new(uk(1), RewardKind::Rating, 100, week("2026-01-19"), 10)
            .expect("event");
        db.put_event(&ev).expect("event");
        let mut totals = BTreeMap::new();
        totals.insert(uk(1), 100u64);
        db.put_batch(&RewardBatch {
            week_key: week("2026-01-19"),
            generation: 0,
            status: BatchStatus::Frozen,
            source_week_key: week("2026-01-19"),
            totals_by_user: totals,
            total_amount: 100,
            event_count: 1,
            created_at: 10,
        })
        .expect("batch");
        db.store_epoch_build(
            &sample_epoch(5, "2026-01-19", false),
            &[sample_leaf(5, uk(1), 100_000, 0)],
        )
        .expect("epoch");
        db.put_salt(5, &uk(1), &[9u8; 32]).expect("salt");

        let counts = db.delete_week(&week("2026-01-19")).expect("reset");
        assert_eq!(
            counts,
            ResetCounts {
                events: 1,
                batches: 1,
                epochs: 1,
                leaves: 1,
                salts: 1
            }
        );
        assert!(db.get_epoch(5).expect("get").is_none());
        assert!(db.get_event(&ev.id).expect("get").is_none());
    }

    #[test]
    fn delete_week_refuses_on_chain_epoch() {
        let (_dir, db) = open_db();
        db.store_epoch_build(&sample_epoch(6, "2026-01-19", true), &[])
            .expect("epoch");
        let err = db.delete_week(&week("2026-01-19")).expect_err("refused");
        assert_eq!(err.code(), "RESET_FORBIDDEN");
        // Nothing was deleted.
        assert!(db.get_epoch(6).expect("get").is_some());
    }
}
