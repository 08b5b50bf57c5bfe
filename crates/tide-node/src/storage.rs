//! RocksDB-backed persistent escrow storage.
//!
//! Stores the global history, per-identity histories, the slope-change
//! schedule, locks, asset balances and aggregate metadata in separate column
//! families. Every save is one atomic [`WriteBatch`].
//!
//! Saves are incremental: a [`StateDelta`] names the global points from the
//! first epoch touched, the appended user points, and the locks and schedule
//! entries written since the previous save.

use std::collections::BTreeMap;
use std::path::Path;

use rocksdb::{ColumnFamilyDescriptor, DB, IteratorMode, Options, WriteBatch};
use tracing::debug;

use tide_core::error::EscrowError;
use tide_core::types::{Address, BlockContext, LockedBalance, Point};
use tide_escrow::{EscrowSnapshot, StateDelta};

// --- Column family names ---

const CF_GLOBAL_POINTS: &str = "global_points";
const CF_USER_POINTS: &str = "user_points";
const CF_USER_EPOCHS: &str = "user_epochs";
const CF_SLOPE_CHANGES: &str = "slope_changes";
const CF_LOCKS: &str = "locks";
const CF_BALANCES: &str = "balances";
const CF_METADATA: &str = "metadata";

/// All column family names.
const ALL_CFS: &[&str] = &[
    CF_GLOBAL_POINTS,
    CF_USER_POINTS,
    CF_USER_EPOCHS,
    CF_SLOPE_CHANGES,
    CF_LOCKS,
    CF_BALANCES,
    CF_METADATA,
];

// --- Metadata keys ---

const META_EPOCH: &[u8] = b"epoch";
const META_TOTAL_LOCKED: &[u8] = b"total_locked";
const META_LAST_TIMESTAMP: &[u8] = b"last_timestamp";
const META_LAST_HEIGHT: &[u8] = b"last_height";
const META_ALLOWED_CALLERS: &[u8] = b"allowed_callers";

/// Everything read back by [`RocksStore::load`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredState {
    pub snapshot: EscrowSnapshot,
    /// Non-zero asset balances, custody included.
    pub balances: BTreeMap<Address, u128>,
    /// Block context of the last save.
    pub last_block: BlockContext,
    pub allowed_callers: Vec<Address>,
}

fn storage_err(e: impl std::fmt::Display) -> EscrowError {
    EscrowError::Storage(e.to_string())
}

/// RocksDB-backed persistent escrow storage.
pub struct RocksStore {
    db: DB,
}

impl RocksStore {
    /// Open or create a RocksDB database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, EscrowError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = ALL_CFS
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&db_opts, path.as_ref(), cf_descriptors)
            .map_err(storage_err)?;
        Ok(Self { db })
    }

    /// True until the first [`save`](Self::save).
    pub fn is_empty(&self) -> Result<bool, EscrowError> {
        let cf = self.cf_handle(CF_METADATA)?;
        Ok(self.db.get_cf(&cf, META_EPOCH).map_err(storage_err)?.is_none())
    }

    /// Stored global epoch (0 for an empty store).
    pub fn epoch(&self) -> Result<u64, EscrowError> {
        self.get_meta_u64(META_EPOCH)
    }

    /// Stored informational total of locked tokens.
    pub fn total_locked(&self) -> Result<u128, EscrowError> {
        let cf = self.cf_handle(CF_METADATA)?;
        match self.db.get_cf(&cf, META_TOTAL_LOCKED).map_err(storage_err)? {
            Some(bytes) => Ok(u128::from_le_bytes(fixed(&bytes, "total_locked")?)),
            None => Ok(0),
        }
    }

    /// Stored epoch of `who` (0 if it never checkpointed).
    pub fn user_epoch(&self, who: &Address) -> Result<u64, EscrowError> {
        let cf = self.cf_handle(CF_USER_EPOCHS)?;
        match self.db.get_cf(&cf, who.as_bytes()).map_err(storage_err)? {
            Some(bytes) => Ok(u64::from_le_bytes(fixed(&bytes, "user epoch")?).saturating_sub(1)),
            None => Ok(0),
        }
    }

    /// Block context of the last save, if any.
    pub fn last_block(&self) -> Result<Option<BlockContext>, EscrowError> {
        if self.is_empty()? {
            return Ok(None);
        }
        Ok(Some(BlockContext::new(
            self.get_meta_u64(META_LAST_TIMESTAMP)?,
            self.get_meta_u64(META_LAST_HEIGHT)?,
        )))
    }

    /// Persist `delta`, `balances` and `allowed_callers` as of `at` in one batch.
    ///
    /// Only the keys in `delta` are written; pass
    /// `StateDelta::from(&snapshot)` to rewrite the whole escrow.
    pub fn save(
        &self,
        delta: &StateDelta,
        balances: &BTreeMap<Address, u128>,
        allowed_callers: &[Address],
        at: BlockContext,
    ) -> Result<(), EscrowError> {
        let mut batch = WriteBatch::default();

        let cf_points = self.cf_handle(CF_GLOBAL_POINTS)?;
        for (epoch, point) in &delta.points {
            batch.put_cf(&cf_points, epoch.to_be_bytes(), encode(point)?);
        }

        let cf_users = self.cf_handle(CF_USER_POINTS)?;
        let cf_user_epochs = self.cf_handle(CF_USER_EPOCHS)?;
        for (who, appended) in &delta.user_points {
            for (epoch, point) in appended {
                batch.put_cf(&cf_users, Self::user_key(who, *epoch), encode(point)?);
            }
            if let Some((last, _)) = appended.last() {
                batch.put_cf(&cf_user_epochs, who.as_bytes(), (last + 1).to_le_bytes());
            }
        }

        let cf_slopes = self.cf_handle(CF_SLOPE_CHANGES)?;
        for (ts, change) in &delta.slope_changes {
            batch.put_cf(&cf_slopes, ts.to_be_bytes(), change.to_le_bytes());
        }

        let cf_locks = self.cf_handle(CF_LOCKS)?;
        for (who, lock) in &delta.locked {
            batch.put_cf(&cf_locks, who.as_bytes(), encode(lock)?);
        }

        // Balances are rewritten in full; drained accounts are deleted.
        let cf_balances = self.cf_handle(CF_BALANCES)?;
        for item in self.db.iterator_cf(&cf_balances, IteratorMode::Start) {
            let (key, _) = item.map_err(storage_err)?;
            let who = Address(fixed(&key, "balance key")?);
            if !balances.contains_key(&who) {
                batch.delete_cf(&cf_balances, key);
            }
        }
        for (who, amount) in balances {
            batch.put_cf(&cf_balances, who.as_bytes(), amount.to_le_bytes());
        }

        let cf_meta = self.cf_handle(CF_METADATA)?;
        batch.put_cf(&cf_meta, META_EPOCH, delta.epoch.to_le_bytes());
        batch.put_cf(&cf_meta, META_TOTAL_LOCKED, delta.supply.to_le_bytes());
        batch.put_cf(&cf_meta, META_LAST_TIMESTAMP, at.timestamp.to_le_bytes());
        batch.put_cf(&cf_meta, META_LAST_HEIGHT, at.height.to_le_bytes());
        batch.put_cf(&cf_meta, META_ALLOWED_CALLERS, encode(&allowed_callers.to_vec())?);

        self.db.write(batch).map_err(storage_err)?;
        debug!(
            epoch = delta.epoch,
            points = delta.points.len(),
            identities = delta.user_points.len(),
            "escrow state saved"
        );
        Ok(())
    }

    /// Read back the complete state, or `None` for an empty store.
    pub fn load(&self) -> Result<Option<StoredState>, EscrowError> {
        let Some(last_block) = self.last_block()? else {
            return Ok(None);
        };

        let mut snapshot = EscrowSnapshot {
            supply: self.total_locked()?,
            ..EscrowSnapshot::default()
        };

        let cf_points = self.cf_handle(CF_GLOBAL_POINTS)?;
        for item in self.db.iterator_cf(&cf_points, IteratorMode::Start) {
            let (_, value) = item.map_err(storage_err)?;
            snapshot.points.push(decode(&value)?);
        }

        // Keys sort by address, then big-endian epoch.
        let cf_users = self.cf_handle(CF_USER_POINTS)?;
        for item in self.db.iterator_cf(&cf_users, IteratorMode::Start) {
            let (key, value) = item.map_err(storage_err)?;
            let who = Address(fixed(key.get(..20).unwrap_or(&[]), "user point key")?);
            let point: Point = decode(&value)?;
            snapshot.user_points.entry(who).or_default().push(point);
        }

        let cf_slopes = self.cf_handle(CF_SLOPE_CHANGES)?;
        for item in self.db.iterator_cf(&cf_slopes, IteratorMode::Start) {
            let (key, value) = item.map_err(storage_err)?;
            let ts = u64::from_be_bytes(fixed(&key, "slope change key")?);
            let delta = i128::from_le_bytes(fixed(&value, "slope change")?);
            snapshot.slope_changes.insert(ts, delta);
        }

        let cf_locks = self.cf_handle(CF_LOCKS)?;
        for item in self.db.iterator_cf(&cf_locks, IteratorMode::Start) {
            let (key, value) = item.map_err(storage_err)?;
            let lock: LockedBalance = decode(&value)?;
            snapshot.locked.insert(Address(fixed(&key, "lock key")?), lock);
        }

        let mut balances = BTreeMap::new();
        let cf_balances = self.cf_handle(CF_BALANCES)?;
        for item in self.db.iterator_cf(&cf_balances, IteratorMode::Start) {
            let (key, value) = item.map_err(storage_err)?;
            balances.insert(
                Address(fixed(&key, "balance key")?),
                u128::from_le_bytes(fixed(&value, "balance")?),
            );
        }

        let cf_meta = self.cf_handle(CF_METADATA)?;
        let allowed_callers = match self.db.get_cf(&cf_meta, META_ALLOWED_CALLERS).map_err(storage_err)? {
            Some(bytes) => decode(&bytes)?,
            None => Vec::new(),
        };

        Ok(Some(StoredState {
            snapshot,
            balances,
            last_block,
            allowed_callers,
        }))
    }

    /// Flush all in-memory buffers to disk.
    pub fn flush(&self) -> Result<(), EscrowError> {
        self.db.flush().map_err(storage_err)
    }

    fn get_meta_u64(&self, key: &[u8]) -> Result<u64, EscrowError> {
        let cf = self.cf_handle(CF_METADATA)?;
        match self.db.get_cf(&cf, key).map_err(storage_err)? {
            Some(bytes) => Ok(u64::from_le_bytes(fixed(&bytes, "metadata value")?)),
            None => Ok(0),
        }
    }

    /// Get a column family handle.
    fn cf_handle(&self, name: &str) -> Result<&rocksdb::ColumnFamily, EscrowError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| EscrowError::Storage(format!("missing column family: {name}")))
    }

    /// Address followed by the big-endian epoch, so histories iterate in order.
    fn user_key(who: &Address, epoch: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(28);
        key.extend_from_slice(who.as_bytes());
        key.extend_from_slice(&epoch.to_be_bytes());
        key
    }
}

fn fixed<const N: usize>(bytes: &[u8], what: &str) -> Result<[u8; N], EscrowError> {
    bytes
        .try_into()
        .map_err(|_| EscrowError::Storage(format!("invalid {what} length: {}", bytes.len())))
}

fn encode<T: bincode::Encode>(value: &T) -> Result<Vec<u8>, EscrowError> {
    bincode::encode_to_vec(value, bincode::config::standard()).map_err(storage_err)
}

fn decode<T: bincode::Decode<()>>(bytes: &[u8]) -> Result<T, EscrowError> {
    let (value, _) = bincode::decode_from_slice(bytes, bincode::config::standard()).map_err(storage_err)?;
    Ok(value)
}
