//! Protocol constants. All time values are Unix seconds.

/// One day in seconds.
pub const DAY: u64 = 86_400;

/// Length of the slope-change bucket. Lock expiries are rounded down to a
/// multiple of this value.
pub const WEEK: u64 = 7 * DAY;

/// Maximum lock duration (4 years of 365 days).
///
/// Also the divisor turning a locked amount into a per-second decay slope:
/// `slope = amount / MAXTIME`.
pub const MAXTIME: u64 = 4 * 365 * DAY;

/// Fixed-point scale used when estimating block height from elapsed time.
pub const BLOCK_SLOPE_PRECISION: u128 = 1_000_000_000_000_000_000;

/// Upper bound on week boundaries replayed by one checkpoint or supply walk.
///
/// 255 weeks is roughly five years. Longer gaps with no checkpoint leave
/// the intervening weekly samples unreconstructed.
pub const MAX_WEEK_STEPS: usize = 255;

/// Upper bound on binary-search iterations over a history sequence.
pub const MAX_SEARCH_ITERATIONS: usize = 128;

/// Version string reported by [`EscrowMetadata`](crate::types::EscrowMetadata).
pub const ESCROW_VERSION: &str = "tide-ve-1";

/// Default display decimals of the voting token.
pub const DEFAULT_DECIMALS: u8 = 18;

/// Round a timestamp down to the start of its week.
///
/// # Examples
///
/// ```
/// use tide_core::constants::{week_floor, WEEK};
/// assert_eq!(week_floor(0), 0);
/// assert_eq!(week_floor(WEEK - 1), 0);
/// assert_eq!(week_floor(3 * WEEK + 17), 3 * WEEK);
/// ```
pub fn week_floor(ts: u64) -> u64 {
    (ts / WEEK) * WEEK
}
