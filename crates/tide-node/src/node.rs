//! Ledger composition.
//!
//! [`LedgerNode`] wires the escrow to its collaborators: an in-memory asset
//! ledger restored from storage, a clock positioned at the requested block,
//! the configured owner and the caller allowlist. Every committed mutation
//! is persisted to the [`RocksStore`] before returning. Opening and querying
//! never write: a fresh ledger reaches disk with its first mutation.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use tide_core::error::EscrowError;
use tide_core::memory::{ManualClock, MemoryAssetLedger, SingleOwner};
use tide_core::traits::BlockClock;
use tide_core::types::{Address, BlockContext, Caller};
use tide_escrow::{Allowlist, VotingEscrow};

use crate::config::LedgerConfig;
use crate::error::NodeError;
use crate::storage::RocksStore;

/// Label of the account that holds escrowed tokens.
pub const CUSTODY_LABEL: &str = "tide-escrow";

/// A persistent escrow with in-process collaborators.
pub struct LedgerNode {
    config: LedgerConfig,
    store: RocksStore,
    ledger: Arc<MemoryAssetLedger>,
    clock: Arc<ManualClock>,
    allowlist: Arc<Allowlist>,
    escrow: VotingEscrow,
    /// Held across a mutation and its save.
    write: Mutex<()>,
}

impl LedgerNode {
    /// Open the ledger stored under `config.db_path()`.
    ///
    /// The clock is placed at `timestamp` (default: wall clock) and `height`
    /// (default: extrapolated from the last saved block). Neither may be
    /// earlier than the last saved state.
    pub fn open(
        config: LedgerConfig,
        timestamp: Option<u64>,
        height: Option<u64>,
    ) -> Result<Self, NodeError> {
        let store = RocksStore::open(config.db_path())?;
        let stored = store.load()?;
        let at = resolve_context(
            stored.as_ref().map(|s| s.last_block),
            timestamp,
            height,
            wall_clock(),
            config.block_time_secs,
        )?;

        let clock = Arc::new(ManualClock::with_block_time(at, config.block_time_secs));
        let access = Arc::new(SingleOwner(config.owner_address()));
        let custody = Address::from_label(CUSTODY_LABEL);
        let allowlist: Arc<Allowlist> = Arc::new(config.allowed_addresses().into_iter().collect());

        let (ledger, escrow) = match stored {
            Some(state) => {
                for addr in state.allowed_callers {
                    allowlist.allow(addr);
                }
                let epoch = state.snapshot.epoch();
                let ledger = Arc::new(MemoryAssetLedger::with_balances(custody, state.balances));
                let escrow = VotingEscrow::restore(state.snapshot, ledger.clone(), clock.clone(), access);
                info!(epoch, timestamp = at.timestamp, height = at.height, "ledger restored");
                (ledger, escrow)
            }
            None => {
                let ledger = Arc::new(MemoryAssetLedger::new(custody));
                let escrow = VotingEscrow::new(ledger.clone(), clock.clone(), access);
                info!(timestamp = at.timestamp, height = at.height, "new ledger created");
                (ledger, escrow)
            }
        };
        let escrow = escrow
            .with_metadata(config.metadata())
            .with_caller_authorization(allowlist.clone());

        Ok(Self {
            config,
            store,
            ledger,
            clock,
            allowlist,
            escrow,
            write: Mutex::new(()),
        })
    }

    pub fn escrow(&self) -> &VotingEscrow {
        &self.escrow
    }

    pub fn ledger(&self) -> &MemoryAssetLedger {
        &self.ledger
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn context(&self) -> BlockContext {
        self.clock.context()
    }

    /// Contract addresses currently admitted.
    pub fn allowed_callers(&self) -> Vec<Address> {
        self.allowlist.addresses()
    }

    /// Credit fresh tokens to `to` on the asset ledger.
    pub fn mint(&self, to: &Address, amount: u128) -> Result<(), NodeError> {
        let _write = self.write.lock();
        self.ledger.mint(to, amount);
        info!(%to, amount, "minted");
        self.persist()
    }

    pub fn create_lock(&self, caller: Caller, value: u128, unlock_time: u64) -> Result<(), NodeError> {
        self.commit(|e| e.create_lock(caller, value, unlock_time))
    }

    pub fn increase_amount(&self, caller: Caller, value: u128) -> Result<(), NodeError> {
        self.commit(|e| e.increase_amount(caller, value))
    }

    pub fn increase_unlock_time(&self, caller: Caller, unlock_time: u64) -> Result<(), NodeError> {
        self.commit(|e| e.increase_unlock_time(caller, unlock_time))
    }

    pub fn deposit_for(&self, caller: Caller, who: Address, value: u128) -> Result<(), NodeError> {
        self.commit(|e| e.deposit_for(caller, who, value))
    }

    pub fn withdraw(&self, caller: Caller) -> Result<(), NodeError> {
        self.commit(|e| e.withdraw(caller))
    }

    pub fn checkpoint(&self) -> Result<(), NodeError> {
        self.commit(VotingEscrow::checkpoint)
    }

    /// Admit `contract` as a caller. Owner only.
    pub fn allow_caller(&self, admin: &Address, contract: Address) -> Result<(), NodeError> {
        let allowlist = self.allowlist.clone();
        self.commit(|e| {
            e.set_caller_authorization(admin, allowlist.clone())?;
            allowlist.allow(contract);
            Ok(())
        })
    }

    fn commit<R>(
        &self,
        op: impl FnOnce(&VotingEscrow) -> Result<R, EscrowError>,
    ) -> Result<R, NodeError> {
        let _write = self.write.lock();
        let out = op(&self.escrow)?;
        for event in self.escrow.drain_events() {
            info!(?event, "escrow event");
        }
        self.persist()?;
        Ok(out)
    }

    /// Write the pending escrow changes. They stay pending if the save fails.
    fn persist(&self) -> Result<(), NodeError> {
        let at = self.clock.context();
        let delta = self.escrow.pending_changes();
        self.store.save(
            &delta,
            &self.ledger.balances(),
            &self.allowlist.addresses(),
            at,
        )?;
        self.escrow.mark_persisted();
        debug!(height = at.height, points = delta.points.len(), "ledger persisted");
        Ok(())
    }
}

/// Current UNIX time in seconds.
pub fn wall_clock() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

/// Pick the block context for a run, keeping time and height monotonic
/// relative to `last`.
pub fn resolve_context(
    last: Option<BlockContext>,
    timestamp: Option<u64>,
    height: Option<u64>,
    wall: u64,
    block_time_secs: u64,
) -> Result<BlockContext, NodeError> {
    let timestamp = timestamp.unwrap_or(wall);
    let Some(last) = last else {
        return Ok(BlockContext::new(timestamp, height.unwrap_or(0)));
    };
    if timestamp < last.timestamp {
        return Err(NodeError::ClockRegression {
            last: last.timestamp,
            requested: timestamp,
        });
    }
    let height = height
        .unwrap_or_else(|| last.height + (timestamp - last.timestamp) / block_time_secs.max(1));
    if height < last.height {
        return Err(NodeError::HeightRegression {
            last: last.height,
            requested: height,
        });
    }
    Ok(BlockContext::new(timestamp, height))
}
