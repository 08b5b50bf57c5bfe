//! Trait interfaces for the collaborators of the escrow.
//!
//! The escrow core never moves tokens, reads the chain, or decides who is an
//! administrator on its own. These traits define those contracts:
//! - [`AssetLedger`] — custody of the underlying fungible token
//! - [`BlockClock`] — current timestamp and block height
//! - [`CallerAuthorization`] — allow-list consulted for contract callers
//! - [`AccessControl`] — administrative gate

use crate::error::TransferError;
use crate::types::{Address, BlockContext};

/// Transfers of the underlying locked asset.
///
/// Implementations use interior mutability; both calls must either fully
/// succeed or leave balances untouched.
pub trait AssetLedger: Send + Sync {
    /// Move `amount` from `from` into escrow custody.
    fn transfer_in(&self, from: &Address, amount: u128) -> Result<(), TransferError>;

    /// Release `amount` from escrow custody to `to`.
    fn transfer_out(&self, to: &Address, amount: u128) -> Result<(), TransferError>;
}

/// Source of "now": wall-clock seconds and block height.
pub trait BlockClock: Send + Sync {
    fn context(&self) -> BlockContext;

    /// Current timestamp.
    ///
    /// Default implementation reads [`context`](Self::context).
    fn now(&self) -> u64 {
        self.context().timestamp
    }
}

/// Predicate deciding whether a non-originator caller may lock tokens.
pub trait CallerAuthorization: Send + Sync {
    fn check(&self, caller: &Address) -> bool;
}

/// Gate for administrative operations.
pub trait AccessControl: Send + Sync {
    fn is_owner(&self, who: &Address) -> bool;
}

impl<F> CallerAuthorization for F
where
    F: Fn(&Address) -> bool + Send + Sync,
{
    fn check(&self, caller: &Address) -> bool {
        self(caller)
    }
}
