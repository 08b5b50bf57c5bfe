//! The checkpoint engine.
//!
//! Brings the global supply curve up to "now" one week boundary at a time,
//! applying the scheduled slope changes met on the way, then folds in a
//! single identity's lock transition and records the new user point.
//!
//! Every intermediate week boundary becomes a global history point. The
//! final sample, taken exactly at "now", is committed after the identity
//! delta is folded in; several checkpoints at the same timestamp collapse
//! into one global epoch.

use tide_core::constants::{BLOCK_SLOPE_PRECISION, MAX_WEEK_STEPS, WEEK, week_floor};
use tide_core::types::{Address, BlockContext, LockedBalance, Point};
use tracing::{debug, warn};

use crate::history::History;

/// One identity's lock moving from `old` to `new`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LockChange {
    pub who: Address,
    pub old: LockedBalance,
    pub new: LockedBalance,
}

/// What a checkpoint wrote.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CheckpointSummary {
    /// Global epoch after the checkpoint.
    pub epoch: u64,
    /// User epoch written, if an identity was folded in.
    pub user_epoch: Option<u64>,
    /// Week-boundary points appended before the final sample.
    pub weeks_materialized: usize,
    /// The walk hit [`MAX_WEEK_STEPS`] before reaching "now".
    pub truncated: bool,
}

/// Advance the global curve to `at` and fold in `change`, if any.
///
/// The clock is assumed monotonic: `at.timestamp` is never earlier than the
/// last committed global point.
pub fn checkpoint(
    history: &mut History,
    change: Option<&LockChange>,
    at: BlockContext,
) -> CheckpointSummary {
    let now = at.timestamp;

    let mut u_old = Point::default();
    let mut u_new = Point::default();
    let mut old_dslope: i128 = 0;
    let mut new_dslope: i128 = 0;

    if let Some(c) = change {
        u_old = Point::for_lock(&c.old, now);
        u_new = Point::for_lock(&c.new, now);

        old_dslope = history.slope_change(c.old.end);
        if c.new.end != 0 {
            new_dslope = if c.new.end == c.old.end {
                old_dslope
            } else {
                history.slope_change(c.new.end)
            };
        }
    }

    let initial = history.last_point();
    let mut last = initial;
    let mut last_checkpoint = initial.ts;

    // Blocks per second since the last point, scaled by BLOCK_SLOPE_PRECISION.
    let block_slope: u128 = if now > initial.ts {
        BLOCK_SLOPE_PRECISION * at.height.saturating_sub(initial.blk) as u128
            / (now - initial.ts) as u128
    } else {
        0
    };

    let mut t_i = week_floor(last_checkpoint);
    let mut reached_now = false;
    let mut materialized = 0usize;

    for _ in 0..MAX_WEEK_STEPS {
        t_i += WEEK;
        let mut d_slope = 0;
        if t_i > now {
            t_i = now;
        } else {
            d_slope = history.slope_change(t_i);
        }

        last.bias = last
            .bias
            .saturating_sub(last.slope.saturating_mul(t_i.saturating_sub(last_checkpoint) as i128));
        last.slope = last.slope.saturating_add(d_slope);
        last.clamp();

        last_checkpoint = t_i;
        last.ts = t_i;
        last.blk = initial.blk
            + (block_slope * t_i.saturating_sub(initial.ts) as u128 / BLOCK_SLOPE_PRECISION)
                as u64;

        if t_i == now {
            last.blk = at.height;
            reached_now = true;
            break;
        }
        history.push_point(last);
        materialized += 1;
    }

    if !reached_now {
        warn!(
            from = initial.ts,
            to = last.ts,
            now,
            "checkpoint walk truncated after {} weeks",
            MAX_WEEK_STEPS
        );
    }

    if let Some(c) = change {
        last.slope = last.slope.saturating_add(u_new.slope - u_old.slope);
        last.bias = last.bias.saturating_add(u_new.bias - u_old.bias);
        last.clamp();
        debug!(who = %c.who, bias = last.bias, slope = last.slope, "folded lock change into global curve");
    }

    // A same-timestamp checkpoint overwrites the previous sample instead of
    // opening a new epoch. Genesis is never overwritten.
    let same_instant = materialized == 0 && initial.ts == now && history.epoch() > 0;
    if !reached_now || same_instant {
        history.replace_last_point(last);
    } else {
        history.push_point(last);
    }

    let mut user_epoch = None;
    if let Some(c) = change {
        if c.old.end > now {
            // Cancel the old expiry; it was scheduled as -u_old.slope.
            old_dslope += u_old.slope;
            if c.new.end == c.old.end {
                old_dslope -= u_new.slope;
            }
            history.set_slope_change(c.old.end, old_dslope);
        }

        if c.new.end > now && c.new.end > c.old.end {
            new_dslope -= u_new.slope;
            history.set_slope_change(c.new.end, new_dslope);
        }

        let mut point = u_new;
        point.ts = now;
        point.blk = at.height;
        user_epoch = Some(history.push_user_point(c.who, point));
    }

    let summary = CheckpointSummary {
        epoch: history.epoch(),
        user_epoch,
        weeks_materialized: materialized,
        truncated: !reached_now,
    };
    debug!(?summary, now, height = at.height, "checkpoint");
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use tide_core::constants::MAXTIME;

    const SLOPE: i128 = 1_000;

    fn alice() -> Address {
        Address::from_label("alice")
    }

    fn amount() -> i128 {
        SLOPE * MAXTIME as i128
    }

    fn create(history: &mut History, end: u64, at: BlockContext) -> CheckpointSummary {
        let change = LockChange {
            who: alice(),
            old: LockedBalance::EMPTY,
            new: LockedBalance::new(amount(), end),
        };
        checkpoint(history, Some(&change), at)
    }

    #[test]
    fn global_checkpoint_without_locks_stays_zero() {
        let mut h = History::new(BlockContext::new(0, 0));
        let s = checkpoint(&mut h, None, BlockContext::new(3 * WEEK + 5, 100));
        assert_eq!(s.weeks_materialized, 3);
        assert_eq!(s.epoch, 4);
        assert!(h.points().iter().all(|p| p.bias == 0 && p.slope == 0));
        assert_eq!(h.last_point().ts, 3 * WEEK + 5);
        assert_eq!(h.last_point().blk, 100);
    }

    #[test]
    fn create_lock_sets_curve_and_schedule() {
        let start = 10 * WEEK + 100;
        let end = 20 * WEEK;
        let mut h = History::new(BlockContext::new(start, 1_000));
        let s = create(&mut h, end, BlockContext::new(start, 1_000));

        assert_eq!(s.epoch, 1);
        assert_eq!(s.user_epoch, Some(1));
        let last = h.last_point();
        assert_eq!(last.slope, SLOPE);
        assert_eq!(last.bias, SLOPE * (end - start) as i128);
        assert_eq!(h.slope_change(end), -SLOPE);

        let user = h.user_point(&alice(), 1).unwrap();
        assert_eq!(user.bias, last.bias);
        assert_eq!((user.ts, user.blk), (start, 1_000));
    }

    #[test]
    fn walk_applies_expiry_slope_change() {
        let end = 2 * WEEK;
        let mut h = History::new(BlockContext::new(0, 0));
        create(&mut h, end, BlockContext::new(0, 0));

        checkpoint(&mut h, None, BlockContext::new(3 * WEEK, 300));
        let at_expiry = h.points().iter().find(|p| p.ts == end).copied().unwrap();
        assert_eq!(at_expiry.bias, 0);
        assert_eq!(at_expiry.slope, 0);
        assert_eq!(h.last_point().bias, 0);
    }

    #[test]
    fn weekly_points_decay_linearly() {
        let end = 4 * WEEK;
        let mut h = History::new(BlockContext::new(0, 0));
        create(&mut h, end, BlockContext::new(0, 0));
        checkpoint(&mut h, None, BlockContext::new(2 * WEEK + 1, 0));

        let week1 = h.points().iter().find(|p| p.ts == WEEK).copied().unwrap();
        assert_eq!(week1.bias, SLOPE * (3 * WEEK) as i128);
        assert_eq!(week1.slope, SLOPE);
    }

    #[test]
    fn same_timestamp_changes_share_a_global_epoch() {
        let start = 5 * WEEK;
        let end = 30 * WEEK;
        let at = BlockContext::new(start + 10, 50);
        let mut h = History::new(BlockContext::new(start, 40));

        let first = create(&mut h, end, at);
        let change = LockChange {
            who: alice(),
            old: LockedBalance::new(amount(), end),
            new: LockedBalance::new(2 * amount(), end),
        };
        let second = checkpoint(&mut h, Some(&change), at);

        assert_eq!(first.epoch, second.epoch);
        assert_eq!(second.user_epoch, Some(2));
        assert_eq!(h.last_point().slope, 2 * SLOPE);
        assert_eq!(h.slope_change(end), -2 * SLOPE);
    }

    #[test]
    fn repeated_global_checkpoint_is_idempotent() {
        let mut h = History::new(BlockContext::new(0, 0));
        let at = BlockContext::new(WEEK / 2, 10);
        let first = checkpoint(&mut h, None, at);
        let second = checkpoint(&mut h, None, at);
        assert_eq!(first.epoch, second.epoch);
        assert_eq!(second.weeks_materialized, 0);
    }

    #[test]
    fn extending_moves_scheduled_slope() {
        let mut h = History::new(BlockContext::new(0, 0));
        create(&mut h, 10 * WEEK, BlockContext::new(0, 0));

        let change = LockChange {
            who: alice(),
            old: LockedBalance::new(amount(), 10 * WEEK),
            new: LockedBalance::new(amount(), 20 * WEEK),
        };
        checkpoint(&mut h, Some(&change), BlockContext::new(WEEK, 10));

        assert_eq!(h.slope_change(10 * WEEK), 0);
        assert_eq!(h.slope_change(20 * WEEK), -SLOPE);
        assert_eq!(h.last_point().bias, SLOPE * (19 * WEEK) as i128);
    }

    #[test]
    fn block_height_is_interpolated_for_weekly_points() {
        let now = 2 * WEEK + 50;
        let mut h = History::new(BlockContext::new(0, 0));
        checkpoint(&mut h, None, BlockContext::new(now, now));

        assert_eq!(h.point(1).unwrap().blk, WEEK);
        assert_eq!(h.point(2).unwrap().blk, 2 * WEEK);
        assert_eq!(h.point(3).unwrap().blk, now);
    }

    #[test]
    fn walk_truncates_after_max_weeks() {
        let mut h = History::new(BlockContext::new(0, 0));
        let at = BlockContext::new(300 * WEEK, 9_000);

        let s = checkpoint(&mut h, None, at);
        assert!(s.truncated);
        assert_eq!(s.epoch, MAX_WEEK_STEPS as u64);
        assert_eq!(h.last_point().ts, MAX_WEEK_STEPS as u64 * WEEK);

        let s = checkpoint(&mut h, None, at);
        assert!(!s.truncated);
        assert_eq!(h.last_point().ts, 300 * WEEK);
        assert_eq!(s.epoch, 300);
    }

    #[test]
    fn withdrawal_change_leaves_no_schedule() {
        let mut h = History::new(BlockContext::new(0, 0));
        create(&mut h, WEEK, BlockContext::new(0, 0));
        let change = LockChange {
            who: alice(),
            old: LockedBalance::new(amount(), WEEK),
            new: LockedBalance::EMPTY,
        };
        let s = checkpoint(&mut h, Some(&change), BlockContext::new(2 * WEEK, 20));
        assert_eq!(s.user_epoch, Some(2));
        let p = h.user_point(&alice(), 2).unwrap();
        assert_eq!((p.bias, p.slope), (0, 0));
        assert_eq!(h.last_point().bias, 0);
    }
}
