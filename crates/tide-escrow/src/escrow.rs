//! The vote-escrow state machine.
//!
//! Every lifecycle operation reads the identity's current lock, validates the
//! requested transition, records the new lock, runs the checkpoint engine and
//! finally moves tokens through the [`AssetLedger`]. State changes are
//! journaled; if the transfer fails they are rolled back so the operation
//! leaves no trace.
//!
//! All state sits behind one `ReentrantMutex`, which gives every operation a
//! single total order. A mutating call made from inside an asset transfer
//! (same thread, lock already held) passes the mutex but is refused by the
//! `entered` flag; nested read-only queries are allowed.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::ReentrantMutex;
use tide_core::constants::{MAXTIME, week_floor};
use tide_core::error::{AuthError, EscrowError, LockError};
use tide_core::traits::{AccessControl, AssetLedger, BlockClock, CallerAuthorization};
use tide_core::types::{Address, BlockContext, Caller, EscrowMetadata, LockedBalance, Point};
use tracing::{debug, info, warn};

use crate::authorization::RejectContractCallers;
use crate::checkpoint::{CheckpointSummary, LockChange, checkpoint};
use crate::events::{DepositKind, EscrowEvent};
use crate::history::History;
use crate::query;
use crate::snapshot::{EscrowSnapshot, StateDelta};

struct EscrowState {
    history: History,
    locked: HashMap<Address, LockedBalance>,
    /// Total locked tokens. Informational only.
    supply: u128,
    authorization: Arc<dyn CallerAuthorization>,
    future_authorization: Option<Arc<dyn CallerAuthorization>>,
    events: Vec<EscrowEvent>,
    /// Locks changed since the last [`VotingEscrow::mark_persisted`].
    written_locks: BTreeSet<Address>,
}

impl EscrowState {
    fn new(history: History) -> Self {
        Self {
            history,
            locked: HashMap::new(),
            supply: 0,
            authorization: Arc::new(RejectContractCallers),
            future_authorization: None,
            events: Vec::new(),
            written_locks: BTreeSet::new(),
        }
    }

    fn locked(&self, who: &Address) -> LockedBalance {
        self.locked.get(who).copied().unwrap_or_default()
    }

    /// Contract callers must pass the installed predicate.
    fn ensure_caller_allowed(&self, caller: &Caller) -> Result<(), AuthError> {
        if caller.is_contract() && !self.authorization.check(&caller.sender) {
            return Err(AuthError::ContractCallerNotAllowed(caller.sender));
        }
        Ok(())
    }
}

struct EscrowCell {
    state: RefCell<EscrowState>,
    entered: Cell<bool>,
}

/// Non-reentrancy guard; clears the flag on drop.
struct EntryGuard<'a> {
    entered: &'a Cell<bool>,
}

impl<'a> EntryGuard<'a> {
    fn enter(entered: &'a Cell<bool>) -> Result<Self, EscrowError> {
        if entered.get() {
            return Err(EscrowError::Reentrant);
        }
        entered.set(true);
        Ok(Self { entered })
    }
}

impl Drop for EntryGuard<'_> {
    fn drop(&mut self) {
        self.entered.set(false);
    }
}

enum Transfer {
    In { from: Address, amount: u128 },
    Out { to: Address, amount: u128 },
}

/// A vote-escrow ledger.
pub struct VotingEscrow {
    cell: ReentrantMutex<EscrowCell>,
    asset: Arc<dyn AssetLedger>,
    clock: Arc<dyn BlockClock>,
    access: Arc<dyn AccessControl>,
    metadata: EscrowMetadata,
}

impl VotingEscrow {
    /// Create an empty escrow whose genesis sample is taken from `clock`.
    pub fn new(
        asset: Arc<dyn AssetLedger>,
        clock: Arc<dyn BlockClock>,
        access: Arc<dyn AccessControl>,
    ) -> Self {
        let history = History::new(clock.context());
        Self::from_state(EscrowState::new(history), asset, clock, access)
    }

    /// Rebuild an escrow from a persisted snapshot.
    pub fn restore(
        snapshot: EscrowSnapshot,
        asset: Arc<dyn AssetLedger>,
        clock: Arc<dyn BlockClock>,
        access: Arc<dyn AccessControl>,
    ) -> Self {
        let history = History::from_parts(
            snapshot.points,
            snapshot.user_points,
            snapshot.slope_changes,
            clock.context(),
        );
        let mut state = EscrowState::new(history);
        state.locked = snapshot.locked.into_iter().collect();
        state.supply = snapshot.supply;
        Self::from_state(state, asset, clock, access)
    }

    fn from_state(
        state: EscrowState,
        asset: Arc<dyn AssetLedger>,
        clock: Arc<dyn BlockClock>,
        access: Arc<dyn AccessControl>,
    ) -> Self {
        Self {
            cell: ReentrantMutex::new(EscrowCell {
                state: RefCell::new(state),
                entered: Cell::new(false),
            }),
            asset,
            clock,
            access,
            metadata: EscrowMetadata::default(),
        }
    }

    pub fn with_metadata(mut self, metadata: EscrowMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Install a caller predicate at construction time, bypassing the admin gate.
    pub fn with_caller_authorization(mut self, predicate: Arc<dyn CallerAuthorization>) -> Self {
        self.cell.get_mut().state.get_mut().authorization = predicate;
        self
    }

    pub fn metadata(&self) -> &EscrowMetadata {
        &self.metadata
    }

    pub fn clock(&self) -> &Arc<dyn BlockClock> {
        &self.clock
    }

    // ------------------------------------------------------------------
    // Lifecycle operations
    // ------------------------------------------------------------------

    /// Lock `value` tokens of the caller until `unlock_time`, rounded down to
    /// a whole week.
    pub fn create_lock(&self, caller: Caller, value: u128, unlock_time: u64) -> Result<(), EscrowError> {
        let cell = self.cell.lock();
        let _entry = EntryGuard::enter(&cell.entered)?;
        let at = self.clock.context();
        let who = caller.sender;
        let unlock_time = week_floor(unlock_time);

        let old = {
            let state = cell.state.borrow();
            state.ensure_caller_allowed(&caller)?;
            let old = state.locked(&who);
            if value == 0 {
                return Err(LockError::ZeroValue.into());
            }
            if old.amount != 0 {
                return Err(LockError::WithdrawOldTokensFirst.into());
            }
            check_unlock_time(unlock_time, at.timestamp)?;
            old
        };

        self.deposit(&cell, who, who, value, unlock_time, old, DepositKind::CreateLock, at)
    }

    /// Add `value` tokens to the caller's running lock without changing its end.
    pub fn increase_amount(&self, caller: Caller, value: u128) -> Result<(), EscrowError> {
        let cell = self.cell.lock();
        let _entry = EntryGuard::enter(&cell.entered)?;
        let at = self.clock.context();
        let who = caller.sender;

        let old = {
            let state = cell.state.borrow();
            state.ensure_caller_allowed(&caller)?;
            let old = state.locked(&who);
            ensure_can_add(value, &old, at.timestamp)?;
            old
        };

        self.deposit(&cell, who, who, value, 0, old, DepositKind::IncreaseLockAmount, at)
    }

    /// Move the end of the caller's running lock to `unlock_time`, rounded
    /// down to a whole week.
    pub fn increase_unlock_time(&self, caller: Caller, unlock_time: u64) -> Result<(), EscrowError> {
        let cell = self.cell.lock();
        let _entry = EntryGuard::enter(&cell.entered)?;
        let at = self.clock.context();
        let who = caller.sender;
        let unlock_time = week_floor(unlock_time);

        let old = {
            let state = cell.state.borrow();
            state.ensure_caller_allowed(&caller)?;
            let old = state.locked(&who);
            if old.amount <= 0 {
                return Err(LockError::NoExistingLock.into());
            }
            if old.end <= at.timestamp {
                return Err(LockError::LockExpired { end: old.end }.into());
            }
            if unlock_time <= old.end {
                return Err(LockError::UnlockTimeNotIncreased {
                    current_end: old.end,
                    requested: unlock_time,
                }
                .into());
            }
            check_unlock_time(unlock_time, at.timestamp)?;
            old
        };

        self.deposit(&cell, who, who, 0, unlock_time, old, DepositKind::IncreaseUnlockTime, at)
    }

    /// Add `value` tokens, paid by the caller, to the running lock of `who`.
    ///
    /// Anyone may top up an existing lock; the caller predicate is not consulted.
    pub fn deposit_for(&self, caller: Caller, who: Address, value: u128) -> Result<(), EscrowError> {
        let cell = self.cell.lock();
        let _entry = EntryGuard::enter(&cell.entered)?;
        let at = self.clock.context();

        let old = {
            let state = cell.state.borrow();
            let old = state.locked(&who);
            ensure_can_add(value, &old, at.timestamp)?;
            old
        };

        self.deposit(&cell, caller.sender, who, value, 0, old, DepositKind::DepositFor, at)
    }

    /// Return all tokens of the caller's expired lock.
    pub fn withdraw(&self, caller: Caller) -> Result<(), EscrowError> {
        let cell = self.cell.lock();
        let _entry = EntryGuard::enter(&cell.entered)?;
        let at = self.clock.context();
        let who = caller.sender;

        let (old, prev_supply) = {
            let state = cell.state.borrow();
            let old = state.locked(&who);
            if old.amount <= 0 {
                return Err(LockError::NoExistingLock.into());
            }
            if at.timestamp < old.end {
                return Err(LockError::LockNotExpired { end: old.end, now: at.timestamp }.into());
            }
            (old, state.supply)
        };

        let value = old.amount as u128;
        let supply = prev_supply.saturating_sub(value);
        let change = LockChange { who, old, new: LockedBalance::EMPTY };
        let events = vec![
            EscrowEvent::Withdraw { provider: who, value, ts: at.timestamp },
            EscrowEvent::Supply { prev_supply, supply },
        ];
        let summary = self.execute(
            &cell,
            change,
            supply,
            at,
            Some(Transfer::Out { to: who, amount: value }),
            events,
        )?;
        info!(%who, value, epoch = summary.epoch, "withdraw");
        Ok(())
    }

    /// Bring the global curve up to date without touching any lock.
    pub fn checkpoint(&self) -> Result<(), EscrowError> {
        let cell = self.cell.lock();
        let _entry = EntryGuard::enter(&cell.entered)?;
        let at = self.clock.context();
        let summary = checkpoint(&mut cell.state.borrow_mut().history, None, at);
        debug!(epoch = summary.epoch, "global checkpoint");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Administration
    // ------------------------------------------------------------------

    /// Stage a new caller predicate. Takes effect on
    /// [`apply_caller_authorization`](Self::apply_caller_authorization).
    pub fn commit_caller_authorization(
        &self,
        admin: &Address,
        predicate: Arc<dyn CallerAuthorization>,
    ) -> Result<(), EscrowError> {
        let cell = self.cell.lock();
        let _entry = EntryGuard::enter(&cell.entered)?;
        self.ensure_owner(admin)?;
        let mut state = cell.state.borrow_mut();
        state.future_authorization = Some(predicate);
        state.events.push(EscrowEvent::CallerAuthorizationCommitted { by: *admin });
        Ok(())
    }

    /// Activate the staged caller predicate.
    pub fn apply_caller_authorization(&self, admin: &Address) -> Result<(), EscrowError> {
        let cell = self.cell.lock();
        let _entry = EntryGuard::enter(&cell.entered)?;
        self.ensure_owner(admin)?;
        let mut state = cell.state.borrow_mut();
        let predicate = state
            .future_authorization
            .take()
            .ok_or(AuthError::NothingCommitted)?;
        state.authorization = predicate;
        state.events.push(EscrowEvent::CallerAuthorizationApplied { by: *admin });
        info!(%admin, "caller authorization applied");
        Ok(())
    }

    /// Commit and apply a caller predicate in one step.
    pub fn set_caller_authorization(
        &self,
        admin: &Address,
        predicate: Arc<dyn CallerAuthorization>,
    ) -> Result<(), EscrowError> {
        self.commit_caller_authorization(admin, predicate)?;
        self.apply_caller_authorization(admin)
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Current voting weight of `who`.
    pub fn balance_of(&self, who: &Address) -> u128 {
        self.balance_of_at_time(who, self.clock.now())
    }

    pub fn balance_of_at_time(&self, who: &Address, t: u64) -> u128 {
        self.read(|s| query::balance_at_time(&s.history, who, t))
    }

    pub fn balance_of_at_block(&self, who: &Address, block: u64) -> Result<u128, EscrowError> {
        let at = self.clock.context();
        self.read(|s| query::balance_at_block(&s.history, who, block, at))
            .map_err(EscrowError::from)
    }

    /// Current total voting weight.
    pub fn total_supply(&self) -> u128 {
        self.total_supply_at_time(self.clock.now())
    }

    pub fn total_supply_at_time(&self, t: u64) -> u128 {
        self.read(|s| query::total_supply_at_time(&s.history, t))
    }

    pub fn total_supply_at_block(&self, block: u64) -> Result<u128, EscrowError> {
        let at = self.clock.context();
        self.read(|s| query::total_supply_at_block(&s.history, block, at))
            .map_err(EscrowError::from)
    }

    /// Slope of the latest point of `who`.
    pub fn get_last_user_slope(&self, who: &Address) -> i128 {
        self.read(|s| {
            let epoch = s.history.user_epoch(who);
            s.history.user_point(who, epoch).map(|p| p.slope).unwrap_or(0)
        })
    }

    /// Timestamp of the `idx`-th point of `who` (0 if absent).
    pub fn user_point_history_ts(&self, who: &Address, idx: u64) -> u64 {
        self.read(|s| s.history.user_point(who, idx).map(|p| p.ts).unwrap_or(0))
    }

    pub fn user_point_history(&self, who: &Address, idx: u64) -> Option<Point> {
        self.read(|s| s.history.user_point(who, idx))
    }

    pub fn user_point_epoch(&self, who: &Address) -> u64 {
        self.read(|s| s.history.user_epoch(who))
    }

    pub fn locked(&self, who: &Address) -> LockedBalance {
        self.read(|s| s.locked(who))
    }

    pub fn locked_end(&self, who: &Address) -> u64 {
        self.locked(who).end
    }

    /// Current global epoch.
    pub fn epoch(&self) -> u64 {
        self.read(|s| s.history.epoch())
    }

    pub fn point_history(&self, epoch: u64) -> Option<Point> {
        self.read(|s| s.history.point(epoch))
    }

    pub fn slope_change(&self, ts: u64) -> i128 {
        self.read(|s| s.history.slope_change(ts))
    }

    /// Total tokens currently held in locks (expired ones included).
    pub fn total_locked(&self) -> u128 {
        self.read(|s| s.supply)
    }

    /// Take the events of all operations committed since the last call.
    pub fn drain_events(&self) -> Vec<EscrowEvent> {
        let cell = self.cell.lock();
        std::mem::take(&mut cell.state.borrow_mut().events)
    }

    /// Copy of the complete persisted state.
    pub fn snapshot(&self) -> EscrowSnapshot {
        self.read(|s| EscrowSnapshot {
            points: s.history.points().to_vec(),
            user_points: s.history.user_histories(),
            slope_changes: s.history.slope_schedule(),
            locked: s.locked.iter().map(|(k, v)| (*k, *v)).collect(),
            supply: s.supply,
        })
    }

    /// Everything written since the last
    /// [`mark_persisted`](Self::mark_persisted), with current values.
    pub fn pending_changes(&self) -> StateDelta {
        self.read(|s| {
            let mut delta = StateDelta {
                locked: s.written_locks.iter().map(|who| (*who, s.locked(who))).collect(),
                epoch: s.history.epoch(),
                supply: s.supply,
                ..StateDelta::default()
            };
            s.history.written(&mut delta);
            delta
        })
    }

    /// Forget the changes reported by [`pending_changes`](Self::pending_changes).
    pub fn mark_persisted(&self) {
        let cell = self.cell.lock();
        let mut state = cell.state.borrow_mut();
        state.written_locks.clear();
        state.history.clear_written();
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn read<R>(&self, f: impl FnOnce(&EscrowState) -> R) -> R {
        let cell = self.cell.lock();
        let state = cell.state.borrow();
        f(&state)
    }

    fn ensure_owner(&self, who: &Address) -> Result<(), AuthError> {
        if !self.access.is_owner(who) {
            return Err(AuthError::NotOwner(*who));
        }
        Ok(())
    }

    /// Credit `value` tokens paid by `payer` to the lock of `who`, optionally
    /// moving its end to `unlock_time` (0 keeps the current end).
    #[allow(clippy::too_many_arguments)]
    fn deposit(
        &self,
        cell: &EscrowCell,
        payer: Address,
        who: Address,
        value: u128,
        unlock_time: u64,
        old: LockedBalance,
        kind: DepositKind,
        at: BlockContext,
    ) -> Result<(), EscrowError> {
        let value_i = i128::try_from(value).map_err(|_| LockError::AmountOverflow)?;
        let amount = old
            .amount
            .checked_add(value_i)
            .ok_or(LockError::AmountOverflow)?;
        let end = if unlock_time != 0 { unlock_time } else { old.end };
        let new = LockedBalance { amount, end };

        let prev_supply = cell.state.borrow().supply;
        // Bias never exceeds amount, so bounding the locked total by
        // `i128::MAX` bounds every sum on the global curve.
        let supply = prev_supply
            .checked_add(value)
            .filter(|s| *s <= i128::MAX as u128)
            .ok_or(LockError::AmountOverflow)?;

        let transfer = (value != 0).then_some(Transfer::In { from: payer, amount: value });
        let events = vec![
            EscrowEvent::Deposit {
                provider: who,
                value,
                locktime: end,
                kind,
                ts: at.timestamp,
            },
            EscrowEvent::Supply { prev_supply, supply },
        ];

        let summary = self.execute(cell, LockChange { who, old, new }, supply, at, transfer, events)?;
        info!(%who, %payer, value, end, ?kind, epoch = summary.epoch, "deposit");
        Ok(())
    }

    /// Record `change`, checkpoint, then transfer. Rolls everything back if
    /// the transfer fails.
    fn execute(
        &self,
        cell: &EscrowCell,
        change: LockChange,
        supply: u128,
        at: BlockContext,
        transfer: Option<Transfer>,
        events: Vec<EscrowEvent>,
    ) -> Result<CheckpointSummary, EscrowError> {
        let (prev_lock, prev_supply, summary) = {
            let mut state = cell.state.borrow_mut();
            let prev_lock = state.locked.insert(change.who, change.new);
            let prev_supply = std::mem::replace(&mut state.supply, supply);
            state.history.begin();
            let summary = checkpoint(&mut state.history, Some(&change), at);
            (prev_lock, prev_supply, summary)
        };

        // No borrow is held here: the ledger may call back into read-only queries.
        let result = match transfer {
            Some(Transfer::In { from, amount }) => self.asset.transfer_in(&from, amount),
            Some(Transfer::Out { to, amount }) => self.asset.transfer_out(&to, amount),
            None => Ok(()),
        };

        let mut state = cell.state.borrow_mut();
        if let Err(err) = result {
            state.history.rollback();
            match prev_lock {
                Some(lock) => {
                    state.locked.insert(change.who, lock);
                }
                None => {
                    state.locked.remove(&change.who);
                }
            }
            state.supply = prev_supply;
            warn!(who = %change.who, %err, "asset transfer failed, operation rolled back");
            return Err(err.into());
        }

        state.history.commit();
        state.written_locks.insert(change.who);
        state.events.extend(events);
        Ok(summary)
    }
}

/// `value > 0` and `lock` is running at `now`.
fn ensure_can_add(value: u128, lock: &LockedBalance, now: u64) -> Result<(), LockError> {
    if value == 0 {
        return Err(LockError::ZeroValue);
    }
    if lock.amount <= 0 {
        return Err(LockError::NoExistingLock);
    }
    if lock.end <= now {
        return Err(LockError::LockExpired { end: lock.end });
    }
    Ok(())
}

/// A week-rounded `unlock_time` must be in the future and within [`MAXTIME`].
fn check_unlock_time(unlock_time: u64, now: u64) -> Result<(), LockError> {
    if unlock_time <= now {
        return Err(LockError::UnlockTimeNotInFuture { unlock_time, now });
    }
    let max = now + MAXTIME;
    if unlock_time > max {
        return Err(LockError::UnlockTimeTooFar { unlock_time, max });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{OnceLock, Weak};

    use mockall::mock;
    use tide_core::constants::WEEK;
    use tide_core::error::TransferError;
    use tide_core::memory::{ManualClock, MemoryAssetLedger, SingleOwner};

    use crate::authorization::Allowlist;

    const T0: u64 = 1_700_000_000;
    const UNIT: u128 = 1_000_000_000_000_000_000;

    mock! {
        pub Asset {}
        impl AssetLedger for Asset {
            fn transfer_in(&self, from: &Address, amount: u128) -> Result<(), TransferError>;
            fn transfer_out(&self, to: &Address, amount: u128) -> Result<(), TransferError>;
        }
    }

    fn addr(label: &str) -> Address {
        Address::from_label(label)
    }

    struct Fixture {
        escrow: VotingEscrow,
        ledger: Arc<MemoryAssetLedger>,
        clock: Arc<ManualClock>,
    }

    fn fixture() -> Fixture {
        let ledger = Arc::new(MemoryAssetLedger::new(addr("escrow")));
        let clock = Arc::new(ManualClock::new(BlockContext::new(T0, 1_000_000)));
        for who in ["alice", "bob"] {
            ledger.mint(&addr(who), 1_000_000 * UNIT);
        }
        let escrow = VotingEscrow::new(
            ledger.clone(),
            clock.clone(),
            Arc::new(SingleOwner(addr("admin"))),
        );
        Fixture { escrow, ledger, clock }
    }

    fn alice() -> Caller {
        Caller::direct(addr("alice"))
    }

    #[test]
    fn create_lock_gives_weight_below_amount() {
        let f = fixture();
        let amount = 1_000 * UNIT;
        f.escrow.create_lock(alice(), amount, T0 + MAXTIME).unwrap();

        let end = week_floor(T0 + MAXTIME);
        assert_eq!(f.escrow.locked(&addr("alice")), LockedBalance::new(amount as i128, end));

        let slope = amount / MAXTIME as u128;
        let weight = f.escrow.balance_of(&addr("alice"));
        assert_eq!(weight, slope * (end - T0) as u128);
        assert!(weight < amount);
        assert!(weight > amount * 99 / 100);
        assert_eq!(f.escrow.total_supply(), weight);
        assert_eq!(f.ledger.custody_balance(), amount);
        assert_eq!(f.escrow.total_locked(), amount);
    }

    #[test]
    fn create_lock_preconditions() {
        let f = fixture();
        let e = &f.escrow;
        assert_eq!(e.create_lock(alice(), 0, T0 + WEEK * 2), Err(LockError::ZeroValue.into()));
        assert!(matches!(
            e.create_lock(alice(), UNIT, T0),
            Err(EscrowError::Lock(LockError::UnlockTimeNotInFuture { .. }))
        ));
        // Rounds down to the current week.
        assert!(matches!(
            e.create_lock(alice(), UNIT, week_floor(T0) + WEEK - 1),
            Err(EscrowError::Lock(LockError::UnlockTimeNotInFuture { .. }))
        ));
        assert!(matches!(
            e.create_lock(alice(), UNIT, T0 + MAXTIME + WEEK),
            Err(EscrowError::Lock(LockError::UnlockTimeTooFar { .. }))
        ));

        e.create_lock(alice(), UNIT, T0 + 4 * WEEK).unwrap();
        assert_eq!(
            e.create_lock(alice(), UNIT, T0 + 8 * WEEK),
            Err(LockError::WithdrawOldTokensFirst.into())
        );
        assert_eq!(e.user_point_epoch(&addr("alice")), 1);
    }

    #[test]
    fn locked_total_is_capped_at_curve_range() {
        let f = fixture();
        let big = i128::MAX as u128;
        f.ledger.mint(&addr("alice"), big);
        f.ledger.mint(&addr("bob"), big);
        f.escrow.create_lock(alice(), big, T0 + MAXTIME).unwrap();

        let before = f.escrow.snapshot();
        let bob = Caller::direct(addr("bob"));
        assert_eq!(
            f.escrow.create_lock(bob, big, T0 + MAXTIME),
            Err(LockError::AmountOverflow.into())
        );
        assert_eq!(
            f.escrow.deposit_for(bob, addr("alice"), 1),
            Err(LockError::AmountOverflow.into())
        );
        assert_eq!(f.escrow.snapshot(), before);
        assert_eq!(f.escrow.user_point_epoch(&addr("bob")), 0);
        assert_eq!(f.escrow.total_locked(), big);
        assert_eq!(f.escrow.total_supply(), f.escrow.balance_of(&addr("alice")));
    }

    #[test]
    fn pending_changes_cover_only_touched_keys() {
        let f = fixture();
        let bob = Caller::direct(addr("bob"));
        f.escrow.create_lock(alice(), UNIT, T0 + 10 * WEEK).unwrap();
        f.escrow.create_lock(bob, UNIT, T0 + 20 * WEEK).unwrap();

        let first = f.escrow.pending_changes();
        assert_eq!(first.points.first().map(|(e, _)| *e), Some(0));
        assert_eq!(first.locked.len(), 2);
        assert_eq!(first.user_points[&addr("alice")].len(), 2);
        f.escrow.mark_persisted();
        assert!(f.escrow.pending_changes().is_empty());

        f.clock.advance(WEEK / 2);
        let epoch = f.escrow.epoch();
        f.escrow.increase_unlock_time(alice(), T0 + 15 * WEEK).unwrap();
        let delta = f.escrow.pending_changes();
        assert_eq!(delta.locked.keys().copied().collect::<Vec<_>>(), vec![addr("alice")]);
        assert_eq!(delta.user_points.len(), 1);
        let latest = f.escrow.user_point_history(&addr("alice"), 2).unwrap();
        assert_eq!(delta.user_points[&addr("alice")], vec![(2, latest)]);
        let old_end = week_floor(T0 + 10 * WEEK);
        let new_end = week_floor(T0 + 15 * WEEK);
        assert_eq!(delta.slope_changes.keys().copied().collect::<Vec<_>>(), vec![old_end, new_end]);
        assert_eq!(delta.slope_changes[&old_end], 0);
        assert!(delta.points.iter().all(|(e, _)| *e > epoch));
        assert_eq!(delta.epoch, f.escrow.epoch());
    }

    #[test]
    fn rejected_operation_adds_no_pending_lock() {
        let mut asset = MockAsset::new();
        asset.expect_transfer_in().returning(|_, _| Err(TransferError::Rejected("paused".into())));
        let clock = Arc::new(ManualClock::new(BlockContext::new(T0, 1)));
        let escrow = VotingEscrow::new(Arc::new(asset), clock, Arc::new(SingleOwner(addr("admin"))));
        escrow.mark_persisted();

        assert!(escrow.create_lock(alice(), UNIT, T0 + 4 * WEEK).is_err());
        let delta = escrow.pending_changes();
        assert!(delta.locked.is_empty());
        assert!(delta.user_points.is_empty());
    }

    #[test]
    fn increase_amount_requires_running_lock() {
        let f = fixture();
        assert_eq!(
            f.escrow.increase_amount(alice(), UNIT),
            Err(LockError::NoExistingLock.into())
        );

        f.escrow.create_lock(alice(), UNIT, T0 + 2 * WEEK).unwrap();
        let end = f.escrow.locked_end(&addr("alice"));
        f.escrow.increase_amount(alice(), 2 * UNIT).unwrap();
        assert_eq!(f.escrow.locked(&addr("alice")), LockedBalance::new(3 * UNIT as i128, end));

        f.clock.advance(3 * WEEK);
        assert_eq!(
            f.escrow.increase_amount(alice(), UNIT),
            Err(LockError::LockExpired { end }.into())
        );
    }

    #[test]
    fn increase_unlock_time_must_extend() {
        let f = fixture();
        f.escrow.create_lock(alice(), 100 * UNIT, T0 + 10 * WEEK).unwrap();
        let end = f.escrow.locked_end(&addr("alice"));
        let before = f.escrow.balance_of(&addr("alice"));

        assert!(matches!(
            f.escrow.increase_unlock_time(alice(), end),
            Err(EscrowError::Lock(LockError::UnlockTimeNotIncreased { .. }))
        ));
        assert!(matches!(
            f.escrow.increase_unlock_time(alice(), T0 + MAXTIME + WEEK),
            Err(EscrowError::Lock(LockError::UnlockTimeTooFar { .. }))
        ));

        f.escrow.increase_unlock_time(alice(), end + 5 * WEEK).unwrap();
        assert_eq!(f.escrow.locked_end(&addr("alice")), end + 5 * WEEK);
        assert!(f.escrow.balance_of(&addr("alice")) > before);
        assert_eq!(f.escrow.slope_change(end), 0);
        assert_eq!(
            f.escrow.slope_change(end + 5 * WEEK),
            -f.escrow.get_last_user_slope(&addr("alice"))
        );
        // No tokens moved.
        assert_eq!(f.ledger.custody_balance(), 100 * UNIT);
    }

    #[test]
    fn withdraw_round_trip() {
        let f = fixture();
        let supply_before = f.escrow.total_supply();
        let start_balance = f.ledger.balance_of(&addr("alice"));

        f.escrow.create_lock(alice(), 1_000 * UNIT, T0 + 4 * WEEK).unwrap();
        assert!(matches!(
            f.escrow.withdraw(alice()),
            Err(EscrowError::Lock(LockError::LockNotExpired { .. }))
        ));

        f.clock.advance(4 * WEEK + 1);
        f.escrow.withdraw(alice()).unwrap();

        assert_eq!(f.escrow.balance_of(&addr("alice")), 0);
        assert_eq!(f.escrow.locked(&addr("alice")), LockedBalance::EMPTY);
        assert_eq!(f.escrow.total_supply(), supply_before);
        assert_eq!(f.escrow.total_locked(), 0);
        assert_eq!(f.ledger.balance_of(&addr("alice")), start_balance);
        assert_eq!(f.escrow.user_point_epoch(&addr("alice")), 2);
    }

    #[test]
    fn withdraw_without_lock_is_rejected() {
        let f = fixture();
        assert_eq!(f.escrow.withdraw(alice()), Err(LockError::NoExistingLock.into()));
        assert_eq!(f.escrow.user_point_epoch(&addr("alice")), 0);
    }

    #[test]
    fn deposit_for_is_paid_by_caller() {
        let f = fixture();
        f.escrow.create_lock(alice(), 10 * UNIT, T0 + 10 * WEEK).unwrap();
        let bob_before = f.ledger.balance_of(&addr("bob"));

        f.escrow
            .deposit_for(Caller::direct(addr("bob")), addr("alice"), 5 * UNIT)
            .unwrap();
        assert_eq!(f.escrow.locked(&addr("alice")).amount, 15 * UNIT as i128);
        assert_eq!(f.ledger.balance_of(&addr("bob")), bob_before - 5 * UNIT);
        assert_eq!(f.escrow.user_point_epoch(&addr("bob")), 0);

        assert_eq!(
            f.escrow.deposit_for(Caller::direct(addr("bob")), addr("carol"), UNIT),
            Err(LockError::NoExistingLock.into())
        );
    }

    #[test]
    fn deposit_for_skips_caller_predicate() {
        let f = fixture();
        f.escrow.create_lock(alice(), UNIT, T0 + 10 * WEEK).unwrap();
        f.ledger.mint(&addr("vault"), UNIT);
        let caller = Caller::contract(addr("vault"), addr("bob"));
        f.escrow.deposit_for(caller, addr("alice"), UNIT).unwrap();
    }

    #[test]
    fn contract_callers_need_authorization() {
        let f = fixture();
        let vault = addr("vault");
        f.ledger.mint(&vault, 10 * UNIT);
        let caller = Caller::contract(vault, addr("bob"));

        assert_eq!(
            f.escrow.create_lock(caller, UNIT, T0 + 2 * WEEK),
            Err(AuthError::ContractCallerNotAllowed(vault).into())
        );

        let list = Arc::new(Allowlist::new());
        list.allow(vault);
        assert_eq!(
            f.escrow.set_caller_authorization(&addr("bob"), list.clone()),
            Err(AuthError::NotOwner(addr("bob")).into())
        );
        f.escrow.set_caller_authorization(&addr("admin"), list.clone()).unwrap();
        f.escrow.create_lock(caller, UNIT, T0 + 2 * WEEK).unwrap();

        list.revoke(&vault);
        assert!(f.escrow.increase_amount(caller, UNIT).is_err());
    }

    #[test]
    fn two_step_authorization() {
        let f = fixture();
        assert_eq!(
            f.escrow.apply_caller_authorization(&addr("admin")),
            Err(AuthError::NothingCommitted.into())
        );
        let vault = addr("vault");
        let list: Arc<Allowlist> = Arc::new([vault].into_iter().collect());
        f.escrow.commit_caller_authorization(&addr("admin"), list).unwrap();

        f.ledger.mint(&vault, UNIT);
        let caller = Caller::contract(vault, addr("bob"));
        assert!(f.escrow.create_lock(caller, UNIT, T0 + 2 * WEEK).is_err());

        f.escrow.apply_caller_authorization(&addr("admin")).unwrap();
        f.escrow.create_lock(caller, UNIT, T0 + 2 * WEEK).unwrap();

        let events = f.escrow.drain_events();
        assert!(events.contains(&EscrowEvent::CallerAuthorizationCommitted { by: addr("admin") }));
        assert!(events.contains(&EscrowEvent::CallerAuthorizationApplied { by: addr("admin") }));
    }

    #[test]
    fn failed_transfer_rolls_back() {
        let clock = Arc::new(ManualClock::new(BlockContext::new(T0, 1)));
        let mut asset = MockAsset::new();
        asset
            .expect_transfer_in()
            .times(1)
            .returning(|_, _| Err(TransferError::Rejected("paused".into())));
        let escrow = VotingEscrow::new(
            Arc::new(asset),
            clock.clone(),
            Arc::new(SingleOwner(addr("admin"))),
        );
        let before = escrow.snapshot();

        let err = escrow.create_lock(alice(), UNIT, T0 + 4 * WEEK).unwrap_err();
        assert_eq!(err, TransferError::Rejected("paused".into()).into());
        assert_eq!(escrow.snapshot(), before);
        assert!(escrow.drain_events().is_empty());
    }

    #[test]
    fn failed_top_up_keeps_previous_lock() {
        let clock = Arc::new(ManualClock::new(BlockContext::new(T0, 1)));
        let mut asset = MockAsset::new();
        let mut seq = mockall::Sequence::new();
        asset
            .expect_transfer_in()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        asset
            .expect_transfer_in()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|from, need| {
                Err(TransferError::InsufficientBalance { account: *from, have: 0, need })
            });
        let escrow = VotingEscrow::new(
            Arc::new(asset),
            clock.clone(),
            Arc::new(SingleOwner(addr("admin"))),
        );

        escrow.create_lock(alice(), UNIT, T0 + 4 * WEEK).unwrap();
        clock.advance(WEEK);
        let before = escrow.snapshot();
        assert!(escrow.increase_amount(alice(), UNIT).is_err());
        assert_eq!(escrow.snapshot(), before);
        assert_eq!(escrow.locked(&addr("alice")).amount, UNIT as i128);
    }

    /// Calls back into the escrow from inside a transfer.
    struct ReentrantAsset {
        escrow: OnceLock<Weak<VotingEscrow>>,
        nested_read: OnceLock<u128>,
        nested_write: OnceLock<Result<(), EscrowError>>,
    }

    impl AssetLedger for ReentrantAsset {
        fn transfer_in(&self, from: &Address, _amount: u128) -> Result<(), TransferError> {
            let escrow = self
                .escrow
                .get()
                .and_then(Weak::upgrade)
                .ok_or_else(|| TransferError::Rejected("no escrow".into()))?;
            let _ = self.nested_read.set(escrow.balance_of(from));
            let _ = self
                .nested_write
                .set(escrow.increase_amount(Caller::direct(*from), 1));
            Ok(())
        }

        fn transfer_out(&self, _to: &Address, _amount: u128) -> Result<(), TransferError> {
            Ok(())
        }
    }

    #[test]
    fn reentrant_mutation_is_rejected() {
        let asset = Arc::new(ReentrantAsset {
            escrow: OnceLock::new(),
            nested_read: OnceLock::new(),
            nested_write: OnceLock::new(),
        });
        let clock = Arc::new(ManualClock::new(BlockContext::new(T0, 1)));
        let escrow = Arc::new(VotingEscrow::new(
            asset.clone(),
            clock,
            Arc::new(SingleOwner(addr("admin"))),
        ));
        let _ = asset.escrow.set(Arc::downgrade(&escrow));

        escrow.create_lock(alice(), 1_000 * UNIT, T0 + 10 * WEEK).unwrap();

        assert_eq!(asset.nested_write.get(), Some(&Err(EscrowError::Reentrant)));
        // The nested read saw the already-checkpointed state.
        assert_eq!(asset.nested_read.get(), Some(&escrow.balance_of(&addr("alice"))));
        assert_eq!(escrow.locked(&addr("alice")).amount, 1_000 * UNIT as i128);
    }

    #[test]
    fn same_instant_operations_share_global_epoch() {
        let f = fixture();
        f.escrow.create_lock(alice(), 10 * UNIT, T0 + 10 * WEEK).unwrap();
        let epoch = f.escrow.epoch();
        f.escrow.increase_amount(alice(), UNIT).unwrap();
        f.escrow.increase_amount(alice(), UNIT).unwrap();
        assert_eq!(f.escrow.epoch(), epoch);
        assert_eq!(f.escrow.user_point_epoch(&addr("alice")), 3);
        assert_eq!(f.escrow.user_point_history_ts(&addr("alice"), 3), T0);
    }

    #[test]
    fn global_checkpoint_is_idempotent_within_instant() {
        let f = fixture();
        f.clock.advance(3 * WEEK);
        f.escrow.checkpoint().unwrap();
        let epoch = f.escrow.epoch();
        f.escrow.checkpoint().unwrap();
        assert_eq!(f.escrow.epoch(), epoch);
    }

    #[test]
    fn events_follow_committed_operations() {
        let f = fixture();
        f.escrow.create_lock(alice(), 7 * UNIT, T0 + 3 * WEEK).unwrap();
        let events = f.escrow.drain_events();
        assert_eq!(
            events,
            vec![
                EscrowEvent::Deposit {
                    provider: addr("alice"),
                    value: 7 * UNIT,
                    locktime: week_floor(T0 + 3 * WEEK),
                    kind: DepositKind::CreateLock,
                    ts: T0,
                },
                EscrowEvent::Supply { prev_supply: 0, supply: 7 * UNIT },
            ]
        );
        assert!(f.escrow.drain_events().is_empty());
    }

    #[test]
    fn snapshot_restore_preserves_queries() {
        let f = fixture();
        f.escrow.create_lock(alice(), 50 * UNIT, T0 + 20 * WEEK).unwrap();
        f.clock.advance(2 * WEEK);
        f.escrow
            .create_lock(Caller::direct(addr("bob")), 30 * UNIT, T0 + 40 * WEEK)
            .unwrap();

        let snapshot = f.escrow.snapshot();
        let restored = VotingEscrow::restore(
            snapshot.clone(),
            f.ledger.clone(),
            f.clock.clone(),
            Arc::new(SingleOwner(addr("admin"))),
        );
        assert_eq!(restored.snapshot(), snapshot);
        assert_eq!(restored.total_supply(), f.escrow.total_supply());
        assert_eq!(
            restored.balance_of_at_block(&addr("alice"), 1_000_000).unwrap(),
            f.escrow.balance_of_at_block(&addr("alice"), 1_000_000).unwrap()
        );
    }

    #[test]
    fn future_block_query_fails() {
        let f = fixture();
        assert!(f.escrow.total_supply_at_block(2_000_000).is_err());
        assert_eq!(f.escrow.total_supply_at_block(1_000_000).unwrap(), 0);
    }

    #[test]
    fn metadata_defaults() {
        let f = fixture();
        assert_eq!(f.escrow.metadata().symbol, "veTIDE");
        let custom = EscrowMetadata { symbol: "veX".into(), ..EscrowMetadata::default() };
        let e = VotingEscrow::new(
            f.ledger.clone(),
            f.clock.clone(),
            Arc::new(SingleOwner(addr("admin"))),
        )
        .with_metadata(custom);
        assert_eq!(e.metadata().symbol, "veX");
    }
}
