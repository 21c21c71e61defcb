use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};

use parking_lot::Mutex;

use super::migration::JobCoordinator;

pub(crate) const NULL_HASH: u64 = 0;
pub(crate) const NULL_VALUE: usize = 0;
/// Marks a source cell whose value now lives in the migration destination.
pub(crate) const REDIRECT: usize = 1;

pub const INITIAL_SIZE: u64 = 8;
pub const TABLE_MIGRATION_UNIT_SIZE: u64 = 32;
pub const LINEAR_SEARCH_LIMIT: u64 = 128;
pub const CELLS_IN_USE_SAMPLE: u64 = LINEAR_SEARCH_LIMIT;

pub(crate) struct Cell {
    pub(crate) hash: AtomicU64,
    pub(crate) value: AtomicUsize,
}

/// Four cells plus their delta links.
///
/// `deltas[0..4]` hold the first link of the bucket homed at each cell,
/// `deltas[4..8]` hold the next link of the chain passing through each cell.
pub(crate) struct CellGroup {
    deltas: [AtomicU8; 8],
    cells: [Cell; 4],
}

impl CellGroup {
    fn new() -> Self {
        Self {
            deltas: Default::default(),
            cells: std::array::from_fn(|_| Cell {
                hash: AtomicU64::new(NULL_HASH),
                value: AtomicUsize::new(NULL_VALUE),
            }),
        }
    }
}

pub(crate) enum InsertResult<'a> {
    AlreadyFound(&'a Cell),
    InsertedNew(&'a Cell),
    /// No free cell within the probe limit; carries the index after the last
    /// probed cell, used to sample occupancy for the next table size.
    Overflow(u64),
}

pub(crate) struct Table {
    pub(crate) size_mask: u64,
    groups: Box<[CellGroup]>,
    /// Serializes creation of this table's migration job.
    pub(crate) migration_lock: Mutex<()>,
    pub(crate) coordinator: JobCoordinator,
}

impl Table {
    pub(crate) fn new(size: u64) -> Box<Table> {
        debug_assert!(size.is_power_of_two() && size >= 4);
        let groups = (0..size >> 2).map(|_| CellGroup::new()).collect();
        Box::new(Table {
            size_mask: size - 1,
            groups,
            migration_lock: Mutex::new(()),
            coordinator: JobCoordinator::new(),
        })
    }

    #[inline]
    pub(crate) fn size(&self) -> u64 {
        self.size_mask + 1
    }

    pub(crate) fn num_migration_units(&self) -> u64 {
        self.size_mask / TABLE_MIGRATION_UNIT_SIZE + 1
    }

    #[inline]
    fn group(&self, idx: u64) -> &CellGroup {
        &self.groups[((idx & self.size_mask) >> 2) as usize]
    }

    #[inline]
    pub(crate) fn cell(&self, idx: u64) -> &Cell {
        &self.group(idx).cells[(idx & 3) as usize]
    }

    #[inline]
    fn link(&self, idx: u64, subsequent: bool) -> &AtomicU8 {
        let offset = if subsequent { 4 } else { 0 };
        &self.group(idx).deltas[(idx & 3) as usize + offset]
    }

    /// Follows the delta chain of `hash`'s bucket.
    pub(crate) fn find(&self, hash: u64) -> Option<&Cell> {
        debug_assert_ne!(hash, NULL_HASH);
        let mut idx = hash & self.size_mask;
        // The home cell may belong to another bucket; check it anyway.
        let cell = self.cell(idx);
        let probe = cell.hash.load(Ordering::Relaxed);
        if probe == hash {
            return Some(cell);
        }
        if probe == NULL_HASH {
            return None;
        }

        let mut delta = self.link(idx, false).load(Ordering::Relaxed);
        while delta != 0 {
            idx = (idx + delta as u64) & self.size_mask;
            let cell = self.cell(idx);
            // A concurrent insert may not have published its hash yet; the
            // chain is followed regardless.
            if cell.hash.load(Ordering::Relaxed) == hash {
                return Some(cell);
            }
            delta = self.link(idx, true).load(Ordering::Relaxed);
        }
        None
    }

    /// Reserves a cell for `hash` or finds the one already holding it.
    pub(crate) fn insert_or_find(&self, hash: u64) -> InsertResult<'_> {
        debug_assert_ne!(hash, NULL_HASH);
        let mut idx = hash;

        let cell = self.cell(idx);
        let mut probe = cell.hash.load(Ordering::Relaxed);
        if probe == NULL_HASH {
            match cell.hash.compare_exchange(
                NULL_HASH,
                hash,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return InsertResult::InsertedNew(cell),
                Err(actual) => probe = actual,
            }
        }
        if probe == hash {
            return InsertResult::AlreadyFound(cell);
        }

        let max_idx = idx.wrapping_add(self.size_mask);
        let mut subsequent = false;
        'follow: loop {
            let prev_link = self.link(idx, subsequent);
            subsequent = true;
            let delta = prev_link.load(Ordering::Relaxed);
            if delta != 0 {
                idx = idx.wrapping_add(delta as u64);
                let cell = self.cell(idx);
                let mut probe = cell.hash.load(Ordering::Relaxed);
                while probe == NULL_HASH {
                    // Linked but the hash store is not visible yet.
                    std::hint::spin_loop();
                    probe = cell.hash.load(Ordering::Acquire);
                }
                if probe == hash {
                    return InsertResult::AlreadyFound(cell);
                }
                continue 'follow;
            }

            // End of the bucket's chain: linear probe for a free cell or a
            // late-arriving cell of the same bucket.
            let prev_link_idx = idx;
            let mut remaining = max_idx.wrapping_sub(idx).min(LINEAR_SEARCH_LIMIT);
            while remaining > 0 {
                remaining -= 1;
                idx = idx.wrapping_add(1);
                let cell = self.cell(idx);
                let mut probe = cell.hash.load(Ordering::Relaxed);
                if probe == NULL_HASH {
                    match cell.hash.compare_exchange(
                        NULL_HASH,
                        hash,
                        Ordering::Relaxed,
                        Ordering::Relaxed,
                    ) {
                        Ok(_) => {
                            let delta = idx.wrapping_sub(prev_link_idx) as u8;
                            prev_link.store(delta, Ordering::Relaxed);
                            return InsertResult::InsertedNew(cell);
                        }
                        Err(actual) => probe = actual,
                    }
                }
                let diff = probe ^ hash;
                if diff == 0 {
                    return InsertResult::AlreadyFound(cell);
                }
                if diff & self.size_mask == 0 {
                    // Same bucket, inserted by another thread that has not
                    // linked it yet. Link it on its behalf and keep following.
                    let delta = idx.wrapping_sub(prev_link_idx) as u8;
                    prev_link.store(delta, Ordering::Relaxed);
                    continue 'follow;
                }
            }
            return InsertResult::Overflow(idx.wrapping_add(1));
        }
    }

    /// Estimates the live cell count around `overflow_idx` and proposes a
    /// destination size of twice that, never below [`INITIAL_SIZE`].
    ///
    /// Returns `None` when a redirect is seen, meaning a migration is already
    /// under way.
    pub(crate) fn next_table_size(&self, overflow_idx: u64) -> Option<u64> {
        let mut idx = overflow_idx.wrapping_sub(CELLS_IN_USE_SAMPLE);
        let mut in_use = 0u64;
        for _ in 0..CELLS_IN_USE_SAMPLE {
            let value = self.cell(idx).value.load(Ordering::Relaxed);
            if value == REDIRECT {
                return None;
            }
            if value != NULL_VALUE {
                in_use += 1;
            }
            idx = idx.wrapping_add(1);
        }
        let ratio = in_use as f64 / CELLS_IN_USE_SAMPLE as f64;
        let estimated = (self.size() as f64 * ratio * 2.0) as u64;
        Some(crate::hash::round_up_power_of_two(estimated).max(INITIAL_SIZE))
    }

    /// Calls `visit` for every cell holding a hash.
    pub(crate) fn for_each_cell(&self, mut visit: impl FnMut(&Cell)) {
        for group in self.groups.iter() {
            for cell in &group.cells {
                if cell.hash.load(Ordering::Relaxed) != NULL_HASH {
                    visit(cell);
                }
            }
        }
    }
}
