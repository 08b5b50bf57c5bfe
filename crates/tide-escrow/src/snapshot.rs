//! Complete persisted state of an escrow.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tide_core::types::{Address, LockedBalance, Point};

/// Everything needed to rebuild a [`VotingEscrow`](crate::VotingEscrow).
///
/// Maps are ordered so that two snapshots of the same state compare equal.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct EscrowSnapshot {
    /// Global history, index = epoch.
    pub points: Vec<Point>,
    /// Per-identity histories, sentinel at index 0.
    pub user_points: BTreeMap<Address, Vec<Point>>,
    pub slope_changes: BTreeMap<u64, i128>,
    pub locked: BTreeMap<Address, LockedBalance>,
    /// Informational total of locked tokens.
    pub supply: u128,
}

impl EscrowSnapshot {
    /// Current global epoch, 0 for an empty snapshot.
    pub fn epoch(&self) -> u64 {
        self.points.len().saturating_sub(1) as u64
    }

    /// Current epoch of `who`.
    pub fn user_epoch(&self, who: &Address) -> u64 {
        self.user_points
            .get(who)
            .map(|h| h.len().saturating_sub(1) as u64)
            .unwrap_or(0)
    }
}

/// State written since it was last persisted.
///
/// Produced by [`VotingEscrow::pending_changes`](crate::VotingEscrow::pending_changes);
/// a whole [`EscrowSnapshot`] converts into a delta that rewrites everything.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StateDelta {
    /// Global points from the first epoch touched onward.
    pub points: Vec<(u64, Point)>,
    /// Appended user points by identity, sentinel included for new identities.
    pub user_points: BTreeMap<Address, Vec<(u64, Point)>>,
    pub slope_changes: BTreeMap<u64, i128>,
    pub locked: BTreeMap<Address, LockedBalance>,
    /// Current global epoch.
    pub epoch: u64,
    pub supply: u128,
}

impl StateDelta {
    /// True when no escrow state changed.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
            && self.user_points.is_empty()
            && self.slope_changes.is_empty()
            && self.locked.is_empty()
    }
}

impl From<&EscrowSnapshot> for StateDelta {
    fn from(snapshot: &EscrowSnapshot) -> Self {
        let numbered = |points: &[Point]| -> Vec<(u64, Point)> {
            points.iter().enumerate().map(|(i, p)| (i as u64, *p)).collect()
        };
        Self {
            points: numbered(&snapshot.points),
            user_points: snapshot
                .user_points
                .iter()
                .map(|(who, h)| (*who, numbered(h)))
                .collect(),
            slope_changes: snapshot.slope_changes.clone(),
            locked: snapshot.locked.clone(),
            epoch: snapshot.epoch(),
            supply: snapshot.supply,
        }
    }
}
