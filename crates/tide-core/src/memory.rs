//! In-memory collaborators for tests and the single-process CLI.
//!
//! [`MemoryAssetLedger`] keeps token balances in a `HashMap` behind a lock and
//! holds escrowed tokens in a dedicated custody account. [`ManualClock`] is a
//! settable clock that derives block height from elapsed time.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::error::TransferError;
use crate::traits::{AccessControl, AssetLedger, BlockClock};
use crate::types::{Address, BlockContext};

/// Fungible-token balances with an escrow custody account.
pub struct MemoryAssetLedger {
    custody: Address,
    balances: RwLock<HashMap<Address, u128>>,
}

impl MemoryAssetLedger {
    /// Create an empty ledger whose escrowed tokens sit at `custody`.
    pub fn new(custody: Address) -> Self {
        Self {
            custody,
            balances: RwLock::new(HashMap::new()),
        }
    }

    /// Rebuild a ledger from persisted balances.
    pub fn with_balances(custody: Address, balances: BTreeMap<Address, u128>) -> Self {
        Self {
            custody,
            balances: RwLock::new(balances.into_iter().collect()),
        }
    }

    /// Credit `amount` new tokens to `to`.
    pub fn mint(&self, to: &Address, amount: u128) {
        let mut balances = self.balances.write();
        let entry = balances.entry(*to).or_insert(0);
        *entry = entry.saturating_add(amount);
    }

    pub fn balance_of(&self, who: &Address) -> u128 {
        self.balances.read().get(who).copied().unwrap_or(0)
    }

    /// Tokens currently held in escrow custody.
    pub fn custody_balance(&self) -> u128 {
        self.balance_of(&self.custody)
    }

    pub fn custody(&self) -> Address {
        self.custody
    }

    /// All non-zero balances, ordered by address.
    pub fn balances(&self) -> BTreeMap<Address, u128> {
        self.balances
            .read()
            .iter()
            .filter(|(_, v)| **v > 0)
            .map(|(k, v)| (*k, *v))
            .collect()
    }

    fn move_tokens(&self, from: &Address, to: &Address, amount: u128) -> Result<(), TransferError> {
        let mut balances = self.balances.write();
        let have = balances.get(from).copied().unwrap_or(0);
        if have < amount {
            return Err(TransferError::InsufficientBalance {
                account: *from,
                have,
                need: amount,
            });
        }
        balances.insert(*from, have - amount);
        let dest = balances.entry(*to).or_insert(0);
        *dest = dest.saturating_add(amount);
        Ok(())
    }
}

impl AssetLedger for MemoryAssetLedger {
    fn transfer_in(&self, from: &Address, amount: u128) -> Result<(), TransferError> {
        self.move_tokens(from, &self.custody, amount)
    }

    fn transfer_out(&self, to: &Address, amount: u128) -> Result<(), TransferError> {
        self.move_tokens(&self.custody, to, amount)
    }
}

/// Default block interval assumed by [`ManualClock::advance`].
pub const DEFAULT_BLOCK_TIME_SECS: u64 = 12;

/// A clock moved explicitly by the caller.
pub struct ManualClock {
    timestamp: AtomicU64,
    height: AtomicU64,
    block_time: u64,
}

impl ManualClock {
    pub fn new(ctx: BlockContext) -> Self {
        Self::with_block_time(ctx, DEFAULT_BLOCK_TIME_SECS)
    }

    pub fn with_block_time(ctx: BlockContext, block_time: u64) -> Self {
        Self {
            timestamp: AtomicU64::new(ctx.timestamp),
            height: AtomicU64::new(ctx.height),
            block_time: block_time.max(1),
        }
    }

    /// Move time forward by `secs`, producing one block per `block_time`.
    pub fn advance(&self, secs: u64) {
        self.timestamp.fetch_add(secs, Ordering::SeqCst);
        self.height.fetch_add(secs / self.block_time, Ordering::SeqCst);
    }

    /// Move to an explicit position.
    pub fn set(&self, ctx: BlockContext) {
        self.timestamp.store(ctx.timestamp, Ordering::SeqCst);
        self.height.store(ctx.height, Ordering::SeqCst);
    }
}

impl BlockClock for ManualClock {
    fn context(&self) -> BlockContext {
        BlockContext {
            timestamp: self.timestamp.load(Ordering::SeqCst),
            height: self.height.load(Ordering::SeqCst),
        }
    }
}

/// Access control with a single administrator.
#[derive(Debug, Clone, Copy)]
pub struct SingleOwner(pub Address);

impl AccessControl for SingleOwner {
    fn is_owner(&self, who: &Address) -> bool {
        *who == self.0
    }
}
