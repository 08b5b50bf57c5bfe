//! Append-only point histories and the slope-change schedule.
//!
//! The global history is a `Vec<Point>` indexed by epoch; index 0 is the
//! genesis sample taken when the escrow was created. Each identity has its
//! own `Vec<Point>` whose index 0 is an empty sentinel, so the first real
//! user point lives at user epoch 1.
//!
//! Mutations can be recorded in a [`Journal`] and undone, which is how a
//! lifecycle operation whose asset transfer fails leaves no trace.
//! Independently, every written key is marked dirty until
//! [`History::clear_written`], so storage can persist only what changed.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tide_core::types::{Address, BlockContext, Point};

use crate::snapshot::StateDelta;

/// Undo record for the mutations made since [`History::begin`].
#[derive(Clone, Debug)]
struct Journal {
    /// Global history length when the journal started.
    points_len: usize,
    /// Value of the last global point when the journal started.
    last_point: Point,
    /// Prior schedule values, in write order.
    slope_changes: Vec<(u64, Option<i128>)>,
    /// Prior user history lengths (0 if the identity had none), in write order.
    user_points: Vec<(Address, usize)>,
}

/// Keys written since the last [`History::clear_written`].
#[derive(Clone, Debug, Default)]
struct Written {
    /// First global epoch that was appended or overwritten.
    points_from: Option<usize>,
    /// First user epoch appended per identity.
    user_points_from: HashMap<Address, usize>,
    slope_changes: BTreeSet<u64>,
}

/// Global and per-identity curve histories plus the slope-change schedule.
#[derive(Clone, Debug)]
pub struct History {
    points: Vec<Point>,
    user_points: HashMap<Address, Vec<Point>>,
    /// Week-aligned timestamp → slope delta added to the running global
    /// slope when the clock crosses that timestamp (normally negative).
    slope_changes: HashMap<u64, i128>,
    journal: Option<Journal>,
    written: Written,
}

impl History {
    /// Start a history whose genesis sample is taken at `genesis`.
    pub fn new(genesis: BlockContext) -> Self {
        Self {
            points: vec![Point {
                bias: 0,
                slope: 0,
                ts: genesis.timestamp,
                blk: genesis.height,
            }],
            user_points: HashMap::new(),
            slope_changes: HashMap::new(),
            journal: None,
            written: Written {
                points_from: Some(0),
                ..Written::default()
            },
        }
    }

    /// Rebuild from persisted parts. An empty global history gets a genesis
    /// sample at `genesis`.
    pub fn from_parts(
        points: Vec<Point>,
        user_points: BTreeMap<Address, Vec<Point>>,
        slope_changes: BTreeMap<u64, i128>,
        genesis: BlockContext,
    ) -> Self {
        let mut history = Self::new(genesis);
        if !points.is_empty() {
            history.points = points;
            history.written = Written::default();
        }
        history.user_points = user_points.into_iter().collect();
        history.slope_changes = slope_changes.into_iter().collect();
        history
    }

    /// Current global epoch.
    pub fn epoch(&self) -> u64 {
        (self.points.len() - 1) as u64
    }

    pub fn points(&self) -> &[Point] {
        &self.points
    }

    pub fn point(&self, epoch: u64) -> Option<Point> {
        self.points.get(epoch as usize).copied()
    }

    /// The most recently committed global point.
    pub fn last_point(&self) -> Point {
        self.points[self.points.len() - 1]
    }

    /// Current epoch of `who`; 0 if it never checkpointed.
    pub fn user_epoch(&self, who: &Address) -> u64 {
        self.user_points
            .get(who)
            .map(|h| (h.len() - 1) as u64)
            .unwrap_or(0)
    }

    /// The history of `who`, sentinel included. Empty if it never checkpointed.
    pub fn user_points(&self, who: &Address) -> &[Point] {
        self.user_points.get(who).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn user_point(&self, who: &Address, epoch: u64) -> Option<Point> {
        self.user_points(who).get(epoch as usize).copied()
    }

    /// Scheduled slope delta at `ts` (0 when nothing is scheduled).
    pub fn slope_change(&self, ts: u64) -> i128 {
        self.slope_changes.get(&ts).copied().unwrap_or(0)
    }

    /// Number of identities with a history.
    pub fn identity_count(&self) -> usize {
        self.user_points.len()
    }

    /// All user histories, ordered by address.
    pub fn user_histories(&self) -> BTreeMap<Address, Vec<Point>> {
        self.user_points
            .iter()
            .map(|(k, v)| (*k, v.clone()))
            .collect()
    }

    /// The full schedule, ordered by timestamp.
    pub fn slope_schedule(&self) -> BTreeMap<u64, i128> {
        self.slope_changes.iter().map(|(k, v)| (*k, *v)).collect()
    }

    // --- Mutations (Checkpoint Engine only) ---

    pub(crate) fn push_point(&mut self, point: Point) {
        self.points.push(point);
        self.mark_point(self.points.len() - 1);
    }

    /// Overwrite the most recent global point.
    pub(crate) fn replace_last_point(&mut self, point: Point) {
        let last = self.points.len() - 1;
        self.points[last] = point;
        self.mark_point(last);
    }

    fn mark_point(&mut self, epoch: usize) {
        let from = self.written.points_from.get_or_insert(epoch);
        *from = (*from).min(epoch);
    }

    pub(crate) fn set_slope_change(&mut self, ts: u64, delta: i128) {
        self.written.slope_changes.insert(ts);
        let prev = self.slope_changes.insert(ts, delta);
        if let Some(journal) = self.journal.as_mut() {
            journal.slope_changes.push((ts, prev));
        }
    }

    /// Append a user point and return the new user epoch.
    pub(crate) fn push_user_point(&mut self, who: Address, point: Point) -> u64 {
        let history = self.user_points.entry(who).or_default();
        if let Some(journal) = self.journal.as_mut() {
            journal.user_points.push((who, history.len()));
        }
        let from = self.written.user_points_from.entry(who).or_insert(history.len());
        *from = (*from).min(history.len());
        if history.is_empty() {
            history.push(Point::default());
        }
        history.push(point);
        (history.len() - 1) as u64
    }

    // --- Written keys ---

    /// Fill `delta` with the current value of every key written since the
    /// last [`clear_written`](Self::clear_written). Keys undone by a rollback
    /// are reported with their restored value.
    pub(crate) fn written(&self, delta: &mut StateDelta) {
        if let Some(from) = self.written.points_from {
            delta.points = self
                .points
                .iter()
                .enumerate()
                .skip(from)
                .map(|(epoch, p)| (epoch as u64, *p))
                .collect();
        }
        for (who, &from) in &self.written.user_points_from {
            let appended: Vec<(u64, Point)> = self
                .user_points(who)
                .iter()
                .enumerate()
                .skip(from)
                .map(|(epoch, p)| (epoch as u64, *p))
                .collect();
            if !appended.is_empty() {
                delta.user_points.insert(*who, appended);
            }
        }
        delta.slope_changes = self
            .written
            .slope_changes
            .iter()
            .map(|ts| (*ts, self.slope_change(*ts)))
            .collect();
    }

    pub(crate) fn clear_written(&mut self) {
        self.written = Written::default();
    }

    // --- Journal ---

    /// Start recording mutations so they can be undone.
    pub(crate) fn begin(&mut self) {
        self.journal = Some(Journal {
            points_len: self.points.len(),
            last_point: self.last_point(),
            slope_changes: Vec::new(),
            user_points: Vec::new(),
        });
    }

    /// Keep everything written since [`begin`](Self::begin).
    pub(crate) fn commit(&mut self) {
        self.journal = None;
    }

    /// Undo everything written since [`begin`](Self::begin). No-op without a journal.
    pub(crate) fn rollback(&mut self) {
        let Some(journal) = self.journal.take() else {
            return;
        };

        self.points.truncate(journal.points_len);
        self.replace_last_point(journal.last_point);

        for (ts, prev) in journal.slope_changes.into_iter().rev() {
            match prev {
                Some(v) => {
                    self.slope_changes.insert(ts, v);
                }
                None => {
                    self.slope_changes.remove(&ts);
                }
            }
        }

        for (who, prev_len) in journal.user_points.into_iter().rev() {
            if prev_len == 0 {
                self.user_points.remove(&who);
            } else if let Some(history) = self.user_points.get_mut(&who) {
                history.truncate(prev_len);
            }
        }
    }
}
