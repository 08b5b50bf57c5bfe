//! Core ledger types: identities, curve samples, lock state.
//!
//! Curve values (`bias`, `slope`, lock amounts) are `i128` so that deltas can
//! be formed without casts; stored values are always clamped to be
//! non-negative. Timestamps and block heights are `u64`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::constants::{DEFAULT_DECIMALS, ESCROW_VERSION, MAXTIME};

/// A 20-byte identity (account or contract).
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct Address(pub [u8; 20]);

impl Address {
    /// The zero address.
    pub const ZERO: Self = Self([0u8; 20]);

    /// Derive a stable address from a human-readable label (BLAKE3, truncated).
    ///
    /// # Examples
    ///
    /// ```
    /// use tide_core::types::Address;
    /// assert_eq!(Address::from_label("alice"), Address::from_label("alice"));
    /// assert_ne!(Address::from_label("alice"), Address::from_label("bob"));
    /// ```
    pub fn from_label(label: &str) -> Self {
        let digest = blake3::hash(label.as_bytes());
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&digest.as_bytes()[..20]);
        Self(bytes)
    }

    /// Return the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Check if this is the zero address.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 20]
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

/// Error returned when parsing an [`Address`] from hex.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid address: expected 40 hex characters")]
pub struct ParseAddressError;

impl FromStr for Address {
    type Err = ParseAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(raw).map_err(|_| ParseAddressError)?;
        let bytes: [u8; 20] = bytes.try_into().map_err(|_| ParseAddressError)?;
        Ok(Self(bytes))
    }
}

impl From<[u8; 20]> for Address {
    fn from(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }
}

/// The chain position at which an operation executes.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct BlockContext {
    /// Unix seconds.
    pub timestamp: u64,
    /// Block height.
    pub height: u64,
}

impl BlockContext {
    pub fn new(timestamp: u64, height: u64) -> Self {
        Self { timestamp, height }
    }
}

/// Who is calling a mutating entry point.
///
/// `origin` is the identity that initiated the whole transaction; `sender`
/// is the immediate caller. They differ when a contract acts on someone's
/// behalf.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Caller {
    pub sender: Address,
    pub origin: Address,
}

impl Caller {
    /// A caller acting for itself.
    pub fn direct(addr: Address) -> Self {
        Self { sender: addr, origin: addr }
    }

    /// A contract `sender` invoked inside a transaction started by `origin`.
    pub fn contract(sender: Address, origin: Address) -> Self {
        Self { sender, origin }
    }

    /// Whether the immediate caller is not the transaction originator.
    pub fn is_contract(&self) -> bool {
        self.sender != self.origin
    }
}

/// A sample of a linear weight curve:
/// `weight(t) = max(0, bias - slope * (t - ts))`.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct Point {
    pub bias: i128,
    pub slope: i128,
    /// Timestamp of the sample.
    pub ts: u64,
    /// Block height of the sample.
    pub blk: u64,
}

impl Point {
    /// The curve contributed by `lock` as observed at `now`.
    ///
    /// Zero when the lock is empty or already expired. The returned point has
    /// `ts == now`; the caller stamps the block height.
    pub fn for_lock(lock: &LockedBalance, now: u64) -> Self {
        if lock.end > now && lock.amount > 0 {
            let slope = lock.amount / MAXTIME as i128;
            Self {
                bias: slope * (lock.end - now) as i128,
                slope,
                ts: now,
                blk: 0,
            }
        } else {
            Self { ts: now, ..Self::default() }
        }
    }

    /// Weight remaining at `t`. Times before the sample are treated as the
    /// sample time itself.
    ///
    /// # Examples
    ///
    /// ```
    /// use tide_core::types::Point;
    /// let p = Point { bias: 100, slope: 2, ts: 10, blk: 0 };
    /// assert_eq!(p.value_at(10), 100);
    /// assert_eq!(p.value_at(40), 40);
    /// assert_eq!(p.value_at(1_000), 0);
    /// ```
    pub fn value_at(&self, t: u64) -> i128 {
        let elapsed = t.saturating_sub(self.ts) as i128;
        self.bias
            .saturating_sub(self.slope.saturating_mul(elapsed))
            .max(0)
    }

    /// Clamp bias and slope at zero.
    pub fn clamp(&mut self) {
        self.bias = self.bias.max(0);
        self.slope = self.slope.max(0);
    }
}

/// An identity's current lock. `end == 0` means no lock.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct LockedBalance {
    pub amount: i128,
    pub end: u64,
}

impl LockedBalance {
    pub const EMPTY: Self = Self { amount: 0, end: 0 };

    pub fn new(amount: i128, end: u64) -> Self {
        Self { amount, end }
    }

    /// Whether anything is locked (regardless of expiry).
    pub fn is_locked(&self) -> bool {
        self.amount > 0
    }

    /// Whether the lock is still running at `now`.
    pub fn is_active(&self, now: u64) -> bool {
        self.amount > 0 && self.end > now
    }
}

/// Display metadata for the non-transferable voting token.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct EscrowMetadata {
    pub name: String,
    pub symbol: String,
    pub version: String,
    pub decimals: u8,
}

impl Default for EscrowMetadata {
    fn default() -> Self {
        Self {
            name: "Vote-escrowed Tide".to_string(),
            symbol: "veTIDE".to_string(),
            version: ESCROW_VERSION.to_string(),
            decimals: DEFAULT_DECIMALS,
        }
    }
}
