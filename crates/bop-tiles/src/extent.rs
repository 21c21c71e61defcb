//! Bounding rectangle of the tiles in a grid.
//!
//! Each axis keeps one counter per occupied column (or row): the number of
//! tiles in it. Counters live in an offset-indexed array that grows under
//! the write side of a lock; ordinary increments only take the read side.
//! The extent changes only when a counter goes from zero to one or back.

use std::sync::atomic::{AtomicI32, AtomicU32, AtomicUsize, Ordering};

use parking_lot::RwLock;
use tracing::error;

use crate::geometry::Rect;

const INITIAL_CAPACITY: usize = 64;

#[derive(Debug, Default)]
struct AxisBuffer {
    /// Value stored at slot 0.
    offset: i32,
    counters: Vec<AtomicU32>,
}

impl AxisBuffer {
    fn slot(&self, index: i32) -> Option<&AtomicU32> {
        let slot = i64::from(index) - i64::from(self.offset);
        usize::try_from(slot).ok().and_then(|slot| self.counters.get(slot))
    }

    /// Regrows the array so `index` has a slot.
    fn grow_to(&mut self, index: i32) {
        if self.counters.is_empty() {
            let half = (INITIAL_CAPACITY / 2) as i32;
            self.offset = index.saturating_sub(half);
            self.counters = (0..INITIAL_CAPACITY).map(|_| AtomicU32::new(0)).collect();
            return;
        }
        let len = self.counters.len() as i64;
        let first = i64::from(self.offset);
        let idx = i64::from(index);
        let (new_first, new_len) = if idx < first {
            let grow = (first - idx).max(len);
            (first - grow, len + grow)
        } else {
            let grow = (idx - (first + len) + 1).max(len);
            (first, len + grow)
        };
        let new_first = new_first.max(i64::from(i32::MIN));
        let mut counters: Vec<AtomicU32> = (0..new_len).map(|_| AtomicU32::new(0)).collect();
        for (i, counter) in self.counters.iter().enumerate() {
            let dst = (first + i as i64 - new_first) as usize;
            counters[dst] = AtomicU32::new(counter.load(Ordering::Relaxed));
        }
        self.offset = new_first as i32;
        self.counters = counters;
    }
}

#[derive(Debug)]
struct AxisCounters {
    buffer: RwLock<AxisBuffer>,
    occupied: AtomicUsize,
    min: AtomicI32,
    max: AtomicI32,
}

impl AxisCounters {
    fn new() -> Self {
        Self {
            buffer: RwLock::new(AxisBuffer::default()),
            occupied: AtomicUsize::new(0),
            min: AtomicI32::new(i32::MAX),
            max: AtomicI32::new(i32::MIN),
        }
    }

    fn bump(&self, counter: &AtomicU32, index: i32) -> bool {
        if counter.fetch_add(1, Ordering::AcqRel) != 0 {
            return false;
        }
        self.occupied.fetch_add(1, Ordering::AcqRel);
        let old_min = self.min.fetch_min(index, Ordering::AcqRel);
        let old_max = self.max.fetch_max(index, Ordering::AcqRel);
        index < old_min || index > old_max
    }

    /// Returns whether the axis range changed.
    fn add(&self, index: i32) -> bool {
        {
            let buffer = self.buffer.read();
            if let Some(counter) = buffer.slot(index) {
                return self.bump(counter, index);
            }
        }
        let mut buffer = self.buffer.write();
        if buffer.slot(index).is_none() {
            buffer.grow_to(index);
        }
        match buffer.slot(index) {
            Some(counter) => self.bump(counter, index),
            None => false,
        }
    }

    /// Returns whether the axis range changed.
    fn remove(&self, index: i32) -> bool {
        let needs_rescan = {
            let buffer = self.buffer.read();
            let Some(counter) = buffer.slot(index) else {
                error!(index, "extent counter removed for an untracked index");
                debug_assert!(false, "extent counter removed for an untracked index");
                return false;
            };
            let previous = counter.fetch_sub(1, Ordering::AcqRel);
            if previous == 0 {
                counter.fetch_add(1, Ordering::AcqRel);
                error!(index, "extent counter underflow");
                debug_assert!(false, "extent counter underflow");
                return false;
            }
            if previous > 1 {
                return false;
            }
            self.occupied.fetch_sub(1, Ordering::AcqRel);
            index == self.min.load(Ordering::Acquire) || index == self.max.load(Ordering::Acquire)
        };
        if needs_rescan {
            self.rescan();
        }
        needs_rescan
    }

    fn rescan(&self) {
        let buffer = self.buffer.write();
        let (mut min, mut max) = (i32::MAX, i32::MIN);
        for (i, counter) in buffer.counters.iter().enumerate() {
            if counter.load(Ordering::Acquire) > 0 {
                let index = buffer.offset + i as i32;
                min = min.min(index);
                max = max.max(index);
            }
        }
        self.min.store(min, Ordering::Release);
        self.max.store(max, Ordering::Release);
    }

    fn clear(&self) {
        let mut buffer = self.buffer.write();
        *buffer = AxisBuffer::default();
        self.occupied.store(0, Ordering::Release);
        self.min.store(i32::MAX, Ordering::Release);
        self.max.store(i32::MIN, Ordering::Release);
    }

    fn range(&self) -> Option<(i32, i32)> {
        let min = self.min.load(Ordering::Acquire);
        let max = self.max.load(Ordering::Acquire);
        (min <= max).then_some((min, max))
    }
}

/// Tracks the tile-aligned bounding rectangle of a grid.
#[derive(Debug)]
pub struct ExtentManager {
    cols: AxisCounters,
    rows: AxisCounters,
    extent: RwLock<Rect>,
}

impl Default for ExtentManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ExtentManager {
    pub fn new() -> Self {
        Self {
            cols: AxisCounters::new(),
            rows: AxisCounters::new(),
            extent: RwLock::new(Rect::empty()),
        }
    }

    pub fn notify_tile_added(&self, col: i32, row: i32) {
        let changed = self.cols.add(col) | self.rows.add(row);
        if changed {
            self.update_extent();
        }
    }

    pub fn notify_tile_removed(&self, col: i32, row: i32) {
        let changed = self.cols.remove(col) | self.rows.remove(row);
        if changed {
            self.update_extent();
        }
    }

    /// Resets the counters to exactly the given tiles.
    pub fn replace_tile_stats(&self, tiles: impl IntoIterator<Item = (i32, i32)>) {
        self.cols.clear();
        self.rows.clear();
        for (col, row) in tiles {
            self.cols.add(col);
            self.rows.add(row);
        }
        self.update_extent();
    }

    pub fn clear(&self) {
        self.cols.clear();
        self.rows.clear();
        *self.extent.write() = Rect::empty();
    }

    pub fn extent(&self) -> Rect {
        *self.extent.read()
    }

    fn update_extent(&self) {
        let mut extent = self.extent.write();
        *extent = match (self.cols.range(), self.rows.range()) {
            (Some((c0, c1)), Some((r0, r1))) => Rect::of_tile_span(c0, r0, c1, r1),
            _ => Rect::empty(),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlapping_adds_and_removes_compose() {
        let extent = ExtentManager::new();
        extent.notify_tile_added(0, 0);
        extent.notify_tile_added(0, 1);
        extent.notify_tile_added(2, 0);
        assert_eq!(extent.extent(), Rect::new(0, 0, 192, 128));

        extent.notify_tile_removed(0, 1);
        assert_eq!(extent.extent(), Rect::new(0, 0, 192, 64));
        extent.notify_tile_removed(2, 0);
        assert_eq!(extent.extent(), Rect::new(0, 0, 64, 64));
        extent.notify_tile_removed(0, 0);
        assert!(extent.extent().is_empty());
    }

    #[test]
    fn counters_grow_in_both_directions() {
        let extent = ExtentManager::new();
        extent.notify_tile_added(0, 0);
        extent.notify_tile_added(-500, 900);
        extent.notify_tile_added(700, -300);
        assert_eq!(
            extent.extent(),
            Rect::of_tile_span(-500, -300, 700, 900)
        );
        extent.notify_tile_removed(-500, 900);
        assert_eq!(extent.extent(), Rect::of_tile_span(0, -300, 700, 0));
    }

    #[test]
    fn replace_resets_to_given_tiles() {
        let extent = ExtentManager::new();
        extent.notify_tile_added(10, 10);
        extent.replace_tile_stats([(1, 2), (3, 4)]);
        assert_eq!(extent.extent(), Rect::of_tile_span(1, 2, 3, 4));
        extent.clear();
        assert!(extent.extent().is_empty());
    }
}
