//! Shared fixtures for scenario and property tests.

use std::sync::Arc;

use tide_core::memory::{ManualClock, MemoryAssetLedger, SingleOwner};
use tide_core::traits::{AssetLedger, BlockClock};
use tide_core::types::{Address, BlockContext, Caller, Point};
use tide_escrow::VotingEscrow;

/// Start time; not week-aligned.
pub const T0: u64 = 1_700_000_000;
/// Starting block height.
pub const H0: u64 = 18_000_000;
/// One whole token at 18 decimals.
pub const UNIT: u128 = 1_000_000_000_000_000_000;

pub fn addr(label: &str) -> Address {
    Address::from_label(label)
}

pub fn direct(label: &str) -> Caller {
    Caller::direct(addr(label))
}

pub fn admin() -> Address {
    addr("admin")
}

/// An escrow over an in-memory ledger and a manual clock.
pub struct Harness {
    pub escrow: VotingEscrow,
    pub ledger: Arc<MemoryAssetLedger>,
    pub clock: Arc<ManualClock>,
}

impl Harness {
    /// Fresh escrow at (`T0`, `H0`) with every label in `funded` holding
    /// `1_000_000 * UNIT`.
    pub fn new(funded: &[&str]) -> Self {
        Self::with_asset(funded, None)
    }

    /// Like [`new`](Self::new) but routes transfers through `asset` when given.
    pub fn with_asset(funded: &[&str], asset: Option<Arc<dyn AssetLedger>>) -> Self {
        let ledger = Arc::new(MemoryAssetLedger::new(addr("custody")));
        for label in funded {
            ledger.mint(&addr(label), 1_000_000 * UNIT);
        }
        let clock = Arc::new(ManualClock::new(BlockContext::new(T0, H0)));
        let asset = asset.unwrap_or_else(|| ledger.clone() as Arc<dyn AssetLedger>);
        let escrow = VotingEscrow::new(asset, clock.clone(), Arc::new(SingleOwner(admin())));
        Self { escrow, ledger, clock }
    }

    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    pub fn advance(&self, secs: u64) {
        self.clock.advance(secs);
    }

    /// Sum of the voting weights of `labels` at `t`.
    pub fn sum_of_balances(&self, labels: &[&str], t: u64) -> u128 {
        labels
            .iter()
            .map(|l| self.escrow.balance_of_at_time(&addr(l), t))
            .sum()
    }
}

/// Panics unless `points` have non-decreasing `ts` and `blk`.
pub fn assert_monotonic(points: &[Point]) {
    for pair in points.windows(2) {
        assert!(pair[0].ts <= pair[1].ts, "timestamps go backwards: {pair:?}");
        assert!(pair[0].blk <= pair[1].blk, "heights go backwards: {pair:?}");
    }
}

/// All stored user points of `who`, sentinel excluded.
pub fn user_history(escrow: &VotingEscrow, who: &Address) -> Vec<Point> {
    (1..=escrow.user_point_epoch(who))
        .filter_map(|e| escrow.user_point_history(who, e))
        .collect()
}

/// All global points.
pub fn global_history(escrow: &VotingEscrow) -> Vec<Point> {
    (0..=escrow.epoch())
        .filter_map(|e| escrow.point_history(e))
        .collect()
}
