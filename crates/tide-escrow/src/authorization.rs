//! Caller-authorization predicates for contract-style callers.
//!
//! [`RejectContractCallers`] is the default: every caller that is not the
//! transaction originator is refused. [`Allowlist`] admits an explicit set
//! of contract addresses and can be edited while installed.

use std::collections::HashSet;

use parking_lot::RwLock;
use tide_core::traits::CallerAuthorization;
use tide_core::types::Address;

/// Refuses every contract caller.
#[derive(Debug, Default, Clone, Copy)]
pub struct RejectContractCallers;

impl CallerAuthorization for RejectContractCallers {
    fn check(&self, _caller: &Address) -> bool {
        false
    }
}

/// Admits the listed contract addresses.
#[derive(Debug, Default)]
pub struct Allowlist {
    allowed: RwLock<HashSet<Address>>,
}

impl Allowlist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if `addr` was not already listed.
    pub fn allow(&self, addr: Address) -> bool {
        self.allowed.write().insert(addr)
    }

    /// Returns `true` if `addr` was listed.
    pub fn revoke(&self, addr: &Address) -> bool {
        self.allowed.write().remove(addr)
    }

    pub fn contains(&self, addr: &Address) -> bool {
        self.allowed.read().contains(addr)
    }

    /// Listed addresses in ascending order.
    pub fn addresses(&self) -> Vec<Address> {
        let mut out: Vec<Address> = self.allowed.read().iter().copied().collect();
        out.sort_unstable();
        out
    }

    pub fn len(&self) -> usize {
        self.allowed.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.allowed.read().is_empty()
    }
}

impl FromIterator<Address> for Allowlist {
    fn from_iter<I: IntoIterator<Item = Address>>(iter: I) -> Self {
        Self {
            allowed: RwLock::new(iter.into_iter().collect()),
        }
    }
}

impl CallerAuthorization for Allowlist {
    fn check(&self, caller: &Address) -> bool {
        self.contains(caller)
    }
}
