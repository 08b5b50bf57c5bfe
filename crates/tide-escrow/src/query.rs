//! Historical queries over the point histories.
//!
//! Epoch lookup is a bounded binary search over a history sequence whose
//! `blk` and `ts` fields are non-decreasing. Block-height queries translate
//! the target block into an estimated timestamp by interpolating between the
//! two global samples that bracket it (or between the latest sample and
//! "now"), then evaluate the curve at that time.

use tide_core::constants::{MAX_SEARCH_ITERATIONS, MAX_WEEK_STEPS, WEEK, week_floor};
use tide_core::error::QueryError;
use tide_core::types::{Address, BlockContext, Point};

use crate::history::History;

/// Greatest epoch `e <= max_epoch` such that `points[e].blk <= block`.
///
/// Returns 0 when the target precedes every sample. `max_epoch` is clamped
/// to the last index of `points`.
///
/// # Examples
///
/// ```
/// use tide_core::types::Point;
/// use tide_escrow::query::find_epoch;
///
/// let points: Vec<Point> = [0u64, 10, 20, 30]
///     .iter()
///     .map(|&blk| Point { blk, ..Point::default() })
///     .collect();
/// assert_eq!(find_epoch(&points, 25, 3), 2);
/// assert_eq!(find_epoch(&points, 30, 3), 3);
/// assert_eq!(find_epoch(&points, 99, 1), 1);
/// ```
pub fn find_epoch(points: &[Point], block: u64, max_epoch: u64) -> u64 {
    search(points, max_epoch, |p| p.blk <= block)
}

/// Greatest epoch `e <= max_epoch` such that `points[e].ts <= ts`.
pub fn find_epoch_by_time(points: &[Point], ts: u64, max_epoch: u64) -> u64 {
    search(points, max_epoch, |p| p.ts <= ts)
}

fn search(points: &[Point], max_epoch: u64, at_or_before: impl Fn(&Point) -> bool) -> u64 {
    if points.is_empty() {
        return 0;
    }
    let mut min = 0u64;
    let mut max = max_epoch.min((points.len() - 1) as u64);
    for _ in 0..MAX_SEARCH_ITERATIONS {
        if min >= max {
            break;
        }
        let mid = (min + max).div_ceil(2);
        if at_or_before(&points[mid as usize]) {
            min = mid;
        } else {
            max = mid - 1;
        }
    }
    min
}

/// Estimated timestamp of `block`, interpolated from the global history.
pub fn estimate_block_time(history: &History, block: u64, at: BlockContext) -> u64 {
    let max_epoch = history.epoch();
    let epoch = find_epoch(history.points(), block, max_epoch);
    let p0 = history.points()[epoch as usize];

    let (d_block, d_t) = if epoch < max_epoch {
        let p1 = history.points()[epoch as usize + 1];
        (p1.blk.saturating_sub(p0.blk), p1.ts.saturating_sub(p0.ts))
    } else {
        (
            at.height.saturating_sub(p0.blk),
            at.timestamp.saturating_sub(p0.ts),
        )
    };

    let mut block_time = p0.ts;
    if d_block != 0 {
        block_time += (d_t as u128 * block.saturating_sub(p0.blk) as u128 / d_block as u128) as u64;
    }
    block_time
}

/// Voting weight of `who` at time `t`, from its latest point at or before `t`.
pub fn balance_at_time(history: &History, who: &Address, t: u64) -> u128 {
    let points = history.user_points(who);
    if points.is_empty() {
        return 0;
    }
    let epoch = find_epoch_by_time(points, t, history.user_epoch(who));
    points[epoch as usize].value_at(t) as u128
}

/// Voting weight of `who` at a past `block`.
pub fn balance_at_block(
    history: &History,
    who: &Address,
    block: u64,
    at: BlockContext,
) -> Result<u128, QueryError> {
    ensure_past(block, at)?;
    let points = history.user_points(who);
    if points.is_empty() {
        return Ok(0);
    }
    let epoch = find_epoch(points, block, history.user_epoch(who));
    let upoint = points[epoch as usize];
    let block_time = estimate_block_time(history, block, at);
    Ok(upoint.value_at(block_time) as u128)
}

/// Replay the global curve from `point` to `t`, applying scheduled slope
/// changes at every week boundary on the way.
pub fn supply_at(history: &History, point: Point, t: u64) -> u128 {
    let mut last = point;
    let mut t_i = week_floor(last.ts);
    for _ in 0..MAX_WEEK_STEPS {
        t_i += WEEK;
        let mut d_slope = 0;
        if t_i > t {
            t_i = t;
        } else {
            d_slope = history.slope_change(t_i);
        }
        last.bias = last
            .bias
            .saturating_sub(last.slope.saturating_mul(t_i.saturating_sub(last.ts) as i128));
        if t_i == t {
            break;
        }
        last.slope = last.slope.saturating_add(d_slope);
        last.ts = t_i;
    }
    last.bias.max(0) as u128
}

/// Total voting weight at time `t`. Zero before the genesis sample.
pub fn total_supply_at_time(history: &History, t: u64) -> u128 {
    let epoch = find_epoch_by_time(history.points(), t, history.epoch());
    let point = history.points()[epoch as usize];
    if point.ts > t {
        return 0;
    }
    supply_at(history, point, t)
}

/// Total voting weight at a past `block`.
pub fn total_supply_at_block(
    history: &History,
    block: u64,
    at: BlockContext,
) -> Result<u128, QueryError> {
    ensure_past(block, at)?;
    let epoch = find_epoch(history.points(), block, history.epoch());
    let point = history.points()[epoch as usize];
    let t = estimate_block_time(history, block, at);
    Ok(supply_at(history, point, t))
}

fn ensure_past(block: u64, at: BlockContext) -> Result<(), QueryError> {
    if block > at.height {
        return Err(QueryError::FutureBlock {
            requested: block,
            current: at.height,
        });
    }
    Ok(())
}
