//! Window grids over the time axis.

use crate::point::TimeBounds;
use rill_common::{Result, RillError};

/// A window grid: edges at `k * every + offset` for all integers `k`.
///
/// `every == i64::MAX` denotes a single window spanning the whole read
/// bounds. The offset is reduced modulo `every` at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    every: i64,
    offset: i64,
}

impl Window {
    /// Validate and normalize a window description.
    pub fn new(every: i64, offset: i64) -> Result<Self> {
        if every <= 0 {
            return Err(RillError::InvalidArgument(format!(
                "window every must be positive, got {every}"
            )));
        }
        let offset = if every == i64::MAX {
            0
        } else {
            offset.rem_euclid(every)
        };
        Ok(Self { every, offset })
    }

    /// Whether the grid degenerates to one window over the bounds.
    pub fn is_unbounded(&self) -> bool {
        self.every == i64::MAX
    }

    /// Grid period in nanoseconds.
    pub fn every(&self) -> i64 {
        self.every
    }

    /// Unclipped start edge of the window containing `t`.
    pub fn start_of(&self, t: i64) -> i64 {
        debug_assert!(!self.is_unbounded());
        t.checked_sub(self.offset)
            .map(|shifted| shifted.div_euclid(self.every) * self.every + self.offset)
            .unwrap_or(i64::MIN)
    }

    /// The clipped window grid covering `bounds`.
    ///
    /// Every returned interval is truncated to the bounds: a sample at `t`
    /// belongs to grid slot `i` iff
    /// `max(bounds.start, edge_i) <= t < min(bounds.stop, edge_{i+1})`.
    pub fn grid(&self, bounds: TimeBounds) -> WindowGrid {
        if self.is_unbounded() {
            return WindowGrid {
                bounds,
                first_start: bounds.start,
                every: i64::MAX,
                len: 1,
            };
        }
        let first_start = self.start_of(bounds.start);
        // Number of grid slots whose [start, start+every) intersects bounds.
        let span = (bounds.stop - 1).saturating_sub(first_start);
        let len = (span / self.every + 1) as usize;
        WindowGrid {
            bounds,
            first_start,
            every: self.every,
            len,
        }
    }
}

/// Materialized description of the clipped grid for one read call.
#[derive(Debug, Clone, Copy)]
pub struct WindowGrid {
    bounds: TimeBounds,
    first_start: i64,
    every: i64,
    len: usize,
}

impl WindowGrid {
    /// Number of windows in the grid.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the grid is empty (never true for valid bounds).
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Clipped `[start, stop)` of window `i`.
    pub fn window(&self, i: usize) -> (i64, i64) {
        if self.every == i64::MAX {
            return (self.bounds.start, self.bounds.stop);
        }
        let raw_start = self.first_start + self.every * i as i64;
        let raw_stop = raw_start.saturating_add(self.every);
        (
            raw_start.max(self.bounds.start),
            raw_stop.min(self.bounds.stop),
        )
    }

    /// Grid slot containing timestamp `t`, which must lie in the bounds.
    pub fn index_of(&self, t: i64) -> usize {
        if self.every == i64::MAX {
            return 0;
        }
        ((t - self.first_start) / self.every) as usize
    }
}
