//! Events emitted by committed escrow operations.

use serde::{Deserialize, Serialize};
use tide_core::types::Address;

/// Which lifecycle operation produced a deposit.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum DepositKind {
    DepositFor,
    CreateLock,
    IncreaseLockAmount,
    IncreaseUnlockTime,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum EscrowEvent {
    Deposit {
        provider: Address,
        value: u128,
        locktime: u64,
        kind: DepositKind,
        ts: u64,
    },
    Withdraw {
        provider: Address,
        value: u128,
        ts: u64,
    },
    /// Total locked amount before and after an operation.
    Supply { prev_supply: u128, supply: u128 },
    CallerAuthorizationCommitted { by: Address },
    CallerAuthorizationApplied { by: Address },
}
