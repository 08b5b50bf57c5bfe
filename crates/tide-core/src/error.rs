//! Error types for the Tide ledger.
use thiserror::Error;

use crate::types::Address;

/// Lifecycle precondition violations. No state is changed when one is returned.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    #[error("value must be greater than zero")] ZeroValue,
    #[error("no existing lock found")] NoExistingLock,
    #[error("cannot add to expired lock (expired at {end}); withdraw first")] LockExpired { end: u64 },
    #[error("the lock didn't expire (ends at {end}, now {now})")] LockNotExpired { end: u64, now: u64 },
    #[error("withdraw old tokens first")] WithdrawOldTokensFirst,
    #[error("can only lock until time in the future: {unlock_time} <= {now}")] UnlockTimeNotInFuture { unlock_time: u64, now: u64 },
    #[error("voting lock can be 4 years max: {unlock_time} > {max}")] UnlockTimeTooFar { unlock_time: u64, max: u64 },
    #[error("can only increase lock duration: {requested} <= {current_end}")] UnlockTimeNotIncreased { current_end: u64, requested: u64 },
    #[error("amount overflow")] AmountOverflow,
}

/// Authorization failures. Retrying requires a configuration change.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("smart contract depositors not allowed: {0}")] ContractCallerNotAllowed(Address),
    #[error("admin only: {0}")] NotOwner(Address),
    #[error("no caller authorization committed")] NothingCommitted,
}

/// Failures reported by the external asset ledger.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("insufficient balance for {account}: have {have}, need {need}")] InsufficientBalance { account: Address, have: u128, need: u128 },
    #[error("transfer rejected: {0}")] Rejected(String),
}

/// Invalid read-only queries.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    #[error("block {requested} is in the future (current {current})")] FutureBlock { requested: u64, current: u64 },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EscrowError {
    #[error(transparent)] Lock(#[from] LockError),
    #[error(transparent)] Auth(#[from] AuthError),
    #[error(transparent)] Transfer(#[from] TransferError),
    #[error(transparent)] Query(#[from] QueryError),
    #[error("reentrant call rejected")] Reentrant,
    #[error("storage: {0}")] Storage(String),
}
