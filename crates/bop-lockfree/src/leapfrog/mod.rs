//! Leapfrog-probed concurrent hash map.
//!
//! Keys are non-zero `u64`s; they are stored as their [`avalanche`] hash and
//! recovered with [`deavalanche`] during iteration. Each slot owns one strong
//! count of an `Arc<V>`. Values that leave the map (replaced or erased) are
//! handed out as fresh clones while the table's own count is released through
//! [`Qsbr`], because a concurrent reader may still be between loading the raw
//! pointer and bumping its count.
//!
//! Tables move through three states:
//!
//! ```text
//!  Active --(probe limit hit)--> Migrating --(last worker publishes)--> Retired
//!                                    |                                     |
//!                          redirect markers in source           reclaimed via QSBR
//! ```

mod migration;
mod table;

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crate::hash::{avalanche, deavalanche};
use crate::qsbr::{Qsbr, QsbrGuard};
use migration::begin_table_migration;
use table::{Cell, INITIAL_SIZE, InsertResult, NULL_HASH, NULL_VALUE, REDIRECT, Table};

pub use table::{
    CELLS_IN_USE_SAMPLE, INITIAL_SIZE as INITIAL_TABLE_SIZE, LINEAR_SEARCH_LIMIT,
    TABLE_MIGRATION_UNIT_SIZE,
};

/// A table-owned strong count released after its grace period.
struct RetiredValue<V>(*const V);

// SAFETY: the pointer came from `Arc::into_raw` of an `Arc<V>` with
// `V: Send + Sync`, so releasing it on another thread is sound.
unsafe impl<V: Send + Sync> Send for RetiredValue<V> {}

impl<V> Drop for RetiredValue<V> {
    fn drop(&mut self) {
        // SAFETY: each retired pointer carries exactly one strong count.
        unsafe { drop(Arc::from_raw(self.0)) };
    }
}

/// Lock-free map from non-zero `u64` keys to `Arc<V>`.
pub struct ConcurrentMap<V: Send + Sync + 'static> {
    root: AtomicPtr<Table>,
    len: AtomicUsize,
    qsbr: Qsbr,
    _values: PhantomData<Arc<V>>,
}

// SAFETY: all shared state is reached through atomics; values are `Arc<V>`
// with `V: Send + Sync`.
unsafe impl<V: Send + Sync + 'static> Send for ConcurrentMap<V> {}
unsafe impl<V: Send + Sync + 'static> Sync for ConcurrentMap<V> {}

impl<V: Send + Sync + 'static> ConcurrentMap<V> {
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_SIZE as usize)
    }

    /// Creates a map whose first table holds `capacity` cells (rounded up to a
    /// power of two, at least 8).
    pub fn with_capacity(capacity: usize) -> Self {
        let size = crate::hash::round_up_power_of_two(capacity as u64).max(INITIAL_SIZE);
        Self {
            root: AtomicPtr::new(Box::into_raw(Table::new(size))),
            len: AtomicUsize::new(0),
            qsbr: Qsbr::new(),
            _values: PhantomData,
        }
    }

    pub fn get(&self, key: u64) -> Option<Arc<V>> {
        let _guard = self.qsbr.pin();
        let hash = hash_key(key);
        loop {
            let table_ptr = self.root.load(Ordering::Acquire);
            // SAFETY: pinned; retired tables outlive the guard.
            let table = unsafe { &*table_ptr };
            let cell = table.find(hash)?;
            let value = cell.value.load(Ordering::Acquire);
            match value {
                NULL_VALUE => return None,
                REDIRECT => table.coordinator.participate(&self.root, &self.qsbr),
                // SAFETY: pinned, so the slot's strong count is still alive.
                raw => return Some(unsafe { clone_raw::<V>(raw) }),
            }
        }
    }

    pub fn contains_key(&self, key: u64) -> bool {
        self.get(key).is_some()
    }

    /// Finds the slot for `key`, reserving one if absent. The returned
    /// mutator keeps the caller pinned until dropped.
    pub fn insert_or_find(&self, key: u64) -> Mutator<'_, V> {
        let guard = self.qsbr.pin();
        let hash = hash_key(key);
        loop {
            let table_ptr = self.root.load(Ordering::Acquire);
            // SAFETY: pinned.
            let table = unsafe { &*table_ptr };
            match table.insert_or_find(hash) {
                InsertResult::InsertedNew(cell) => {
                    return Mutator::new(self, guard, table_ptr, cell, NULL_VALUE);
                }
                InsertResult::AlreadyFound(cell) => {
                    let value = cell.value.load(Ordering::Acquire);
                    if value != REDIRECT {
                        return Mutator::new(self, guard, table_ptr, cell, value);
                    }
                }
                InsertResult::Overflow(overflow_idx) => {
                    begin_table_migration(table_ptr, overflow_idx);
                }
            }
            table.coordinator.participate(&self.root, &self.qsbr);
        }
    }

    /// Finds the slot for `key` without reserving one.
    pub fn find(&self, key: u64) -> Option<Mutator<'_, V>> {
        let guard = self.qsbr.pin();
        let hash = hash_key(key);
        loop {
            let table_ptr = self.root.load(Ordering::Acquire);
            // SAFETY: pinned.
            let table = unsafe { &*table_ptr };
            let cell = table.find(hash)?;
            let value = cell.value.load(Ordering::Acquire);
            if value != REDIRECT {
                return Some(Mutator::new(self, guard, table_ptr, cell, value));
            }
            table.coordinator.participate(&self.root, &self.qsbr);
        }
    }

    /// Stores `value` under `key`, returning the previous value.
    pub fn assign(&self, key: u64, value: Arc<V>) -> Option<Arc<V>> {
        let mut mutator = self.insert_or_find(key);
        let mut desired = value;
        loop {
            match mutator.exchange_value(desired) {
                Ok(previous) => return previous,
                // A racing write landed first; ours is ordered after it.
                Err(rejected) => desired = rejected,
            }
        }
    }

    /// Returns the value under `key`, inserting `make()` if absent. The flag
    /// is `true` when this call inserted.
    pub fn get_or_insert_with<F>(&self, key: u64, make: F) -> (Arc<V>, bool)
    where
        F: FnOnce() -> V,
    {
        let mut mutator = self.insert_or_find(key);
        if let Some(existing) = mutator.value() {
            return (existing, false);
        }
        let fresh = Arc::new(make());
        loop {
            if mutator.insert_value(fresh.clone()).is_ok() {
                return (fresh, true);
            }
            if let Some(existing) = mutator.value() {
                return (existing, false);
            }
        }
    }

    pub fn erase(&self, key: u64) -> Option<Arc<V>> {
        let mut mutator = self.find(key)?;
        loop {
            if mutator.value == NULL_VALUE {
                return None;
            }
            if let Some(previous) = mutator.erase_value() {
                return Some(previous);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn migration_in_progress(&self) -> bool {
        let _guard = self.qsbr.pin();
        // SAFETY: pinned.
        unsafe { &*self.root.load(Ordering::Acquire) }
            .coordinator
            .is_active()
    }

    /// Current capacity of the root table.
    pub fn capacity(&self) -> usize {
        let _guard = self.qsbr.pin();
        // SAFETY: pinned.
        unsafe { &*self.root.load(Ordering::Acquire) }.size() as usize
    }

    /// Copies out every entry. Weakly consistent: entries inserted or erased
    /// concurrently may or may not be observed. Helps finish any in-flight
    /// migration first.
    pub fn snapshot(&self) -> Vec<(u64, Arc<V>)> {
        let _guard = self.qsbr.pin();
        'retry: loop {
            let table_ptr = self.root.load(Ordering::Acquire);
            // SAFETY: pinned.
            let table = unsafe { &*table_ptr };
            if table.coordinator.is_active() {
                table.coordinator.participate(&self.root, &self.qsbr);
                continue;
            }
            let mut entries = Vec::with_capacity(self.len());
            let mut redirected = false;
            table.for_each_cell(|cell| {
                let value = cell.value.load(Ordering::Acquire);
                match value {
                    NULL_VALUE => {}
                    REDIRECT => redirected = true,
                    raw => {
                        let key = deavalanche(cell.hash.load(Ordering::Relaxed));
                        // SAFETY: pinned.
                        entries.push((key, unsafe { clone_raw::<V>(raw) }));
                    }
                }
            });
            if redirected {
                table.coordinator.participate(&self.root, &self.qsbr);
                continue 'retry;
            }
            return entries;
        }
    }

    /// Erases every entry present at the time of the call.
    pub fn clear(&self) -> Vec<Arc<V>> {
        self.snapshot()
            .into_iter()
            .filter_map(|(key, _)| self.erase(key))
            .collect()
    }

    /// Forces reclamation of retired values and tables where possible.
    pub fn reclaim(&self) -> usize {
        self.qsbr.try_reclaim()
    }

    fn retire_value(&self, raw: usize) -> Arc<V> {
        // SAFETY: the caller just unlinked `raw` while pinned, so its
        // strong count is alive; the clone handed out is independent of the
        // table's count, which is released after the grace period.
        let out = unsafe { clone_raw::<V>(raw) };
        self.qsbr.defer(RetiredValue(raw as *const V));
        out
    }
}

impl<V: Send + Sync + 'static> Default for ConcurrentMap<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Send + Sync + 'static> Drop for ConcurrentMap<V> {
    fn drop(&mut self) {
        let root = *self.root.get_mut();
        // SAFETY: `&mut self` excludes all other threads; every operation that
        // starts a migration helps finish it before returning.
        let table = unsafe { Box::from_raw(root) };
        debug_assert!(!table.coordinator.is_active());
        table.for_each_cell(|cell| {
            let value = cell.value.load(Ordering::Relaxed);
            if value != NULL_VALUE && value != REDIRECT {
                // SAFETY: the root owns one strong count per live slot.
                unsafe { drop(Arc::from_raw(value as *const V)) };
            }
        });
    }
}

impl<V: Send + Sync + 'static> fmt::Debug for ConcurrentMap<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcurrentMap")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("qsbr", &self.qsbr)
            .finish()
    }
}

/// Cursor on one slot, obtained from [`ConcurrentMap::insert_or_find`] or
/// [`ConcurrentMap::find`]. Exchanges and erases reuse the slot without
/// re-hashing, following redirects if a migration moves it.
pub struct Mutator<'a, V: Send + Sync + 'static> {
    map: &'a ConcurrentMap<V>,
    _guard: QsbrGuard<'a>,
    table: *mut Table,
    cell: *const Cell,
    value: usize,
}

impl<'a, V: Send + Sync + 'static> Mutator<'a, V> {
    fn new(
        map: &'a ConcurrentMap<V>,
        guard: QsbrGuard<'a>,
        table: *mut Table,
        cell: &Cell,
        value: usize,
    ) -> Self {
        Self {
            map,
            _guard: guard,
            table,
            cell: cell as *const Cell,
            value,
        }
    }

    /// Value last observed in the slot.
    pub fn value(&self) -> Option<Arc<V>> {
        match self.value {
            NULL_VALUE => None,
            // SAFETY: the mutator is pinned.
            raw => Some(unsafe { clone_raw::<V>(raw) }),
        }
    }

    /// Replaces the slot's value. `Ok` carries the previous value; `Err`
    /// hands `desired` back when a racing write or erase landed first, in
    /// which case the mutator now observes that write.
    pub fn exchange_value(&mut self, desired: Arc<V>) -> Result<Option<Arc<V>>, Arc<V>> {
        self.store(desired, false).map(|previous| {
            previous.map(|raw| self.map.retire_value(raw))
        })
    }

    /// Stores `desired` only if the slot is empty.
    pub fn insert_value(&mut self, desired: Arc<V>) -> Result<(), Arc<V>> {
        self.store(desired, true).map(|previous| debug_assert!(previous.is_none()))
    }

    /// Empties the slot. Returns `None` if it was already empty or a racing
    /// write landed first.
    pub fn erase_value(&mut self) -> Option<Arc<V>> {
        loop {
            if self.value == NULL_VALUE {
                return None;
            }
            let cell = self.cell();
            match cell.value.compare_exchange(
                self.value,
                NULL_VALUE,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(previous) => {
                    self.value = NULL_VALUE;
                    self.map.len.fetch_sub(1, Ordering::Relaxed);
                    return Some(self.map.retire_value(previous));
                }
                Err(actual) if actual != REDIRECT => {
                    self.value = actual;
                    return None;
                }
                Err(_) => {}
            }

            let hash = cell.hash.load(Ordering::Relaxed);
            loop {
                self.table_ref()
                    .coordinator
                    .participate(&self.map.root, &self.map.qsbr);
                self.table = self.map.root.load(Ordering::Acquire);
                match self.table_ref().find(hash) {
                    None => {
                        self.value = NULL_VALUE;
                        return None;
                    }
                    Some(cell) => {
                        self.cell = cell as *const Cell;
                        self.value = cell.value.load(Ordering::Acquire);
                        if self.value != REDIRECT {
                            break;
                        }
                    }
                }
            }
        }
    }

    fn store(&mut self, desired: Arc<V>, only_if_empty: bool) -> Result<Option<usize>, Arc<V>> {
        let desired_raw = Arc::into_raw(desired) as usize;
        loop {
            if only_if_empty && self.value != NULL_VALUE {
                // SAFETY: `desired_raw` was never published.
                return Err(unsafe { Arc::from_raw(desired_raw as *const V) });
            }
            let expected = self.value;
            let cell = self.cell();
            match cell.value.compare_exchange(
                expected,
                desired_raw,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.value = desired_raw;
                    if expected == NULL_VALUE {
                        self.map.len.fetch_add(1, Ordering::Relaxed);
                        return Ok(None);
                    }
                    return Ok(Some(expected));
                }
                Err(actual) if actual != REDIRECT => {
                    self.value = actual;
                    // SAFETY: `desired_raw` was never published.
                    return Err(unsafe { Arc::from_raw(desired_raw as *const V) });
                }
                Err(_) => {}
            }

            // Redirected: find the slot again in the newest table.
            let hash = cell.hash.load(Ordering::Relaxed);
            loop {
                self.table_ref()
                    .coordinator
                    .participate(&self.map.root, &self.map.qsbr);
                self.table = self.map.root.load(Ordering::Acquire);
                self.value = NULL_VALUE;
                match self.table_ref().insert_or_find(hash) {
                    InsertResult::AlreadyFound(cell) => {
                        self.cell = cell as *const Cell;
                        self.value = cell.value.load(Ordering::Acquire);
                        if self.value != REDIRECT {
                            break;
                        }
                    }
                    InsertResult::InsertedNew(cell) => {
                        self.cell = cell as *const Cell;
                        break;
                    }
                    InsertResult::Overflow(overflow_idx) => {
                        begin_table_migration(self.table, overflow_idx);
                    }
                }
            }
        }
    }

    #[inline]
    fn cell(&self) -> &'a Cell {
        // SAFETY: the cell belongs to a table kept alive by the pin.
        unsafe { &*self.cell }
    }

    #[inline]
    fn table_ref(&self) -> &'a Table {
        // SAFETY: as above.
        unsafe { &*self.table }
    }
}

#[inline]
fn hash_key(key: u64) -> u64 {
    debug_assert_ne!(key, 0, "key 0 is reserved");
    let hash = avalanche(key);
    debug_assert_ne!(hash, NULL_HASH);
    hash
}

/// Clones the `Arc<V>` behind a raw slot value without consuming its count.
///
/// # Safety
/// `raw` must come from `Arc::into_raw` and its count must be alive.
#[inline]
unsafe fn clone_raw<V>(raw: usize) -> Arc<V> {
    let ptr = raw as *const V;
    Arc::increment_strong_count(ptr);
    Arc::from_raw(ptr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_assign_erase() {
        let map: ConcurrentMap<String> = ConcurrentMap::new();
        assert!(map.get(7).is_none());
        assert!(map.assign(7, Arc::new("seven".into())).is_none());
        assert_eq!(map.get(7).as_deref().map(String::as_str), Some("seven"));
        let previous = map.assign(7, Arc::new("SEVEN".into()));
        assert_eq!(previous.as_deref().map(String::as_str), Some("seven"));
        assert_eq!(map.len(), 1);
        let erased = map.erase(7);
        assert_eq!(erased.as_deref().map(String::as_str), Some("SEVEN"));
        assert!(map.get(7).is_none());
        assert!(map.erase(7).is_none());
        assert!(map.is_empty());
    }

    #[test]
    fn grows_through_migrations() {
        let map: ConcurrentMap<u64> = ConcurrentMap::new();
        for key in 1..=5_000u64 {
            map.assign(key, Arc::new(key * 3));
        }
        assert!(map.capacity() >= 5_000);
        assert!(!map.migration_in_progress());
        for key in 1..=5_000u64 {
            assert_eq!(map.get(key).map(|v| *v), Some(key * 3), "key {key}");
        }
        assert_eq!(map.len(), 5_000);
    }

    #[test]
    fn snapshot_recovers_keys() {
        let map: ConcurrentMap<u64> = ConcurrentMap::new();
        for key in [1u64, 99, 1 << 40, u64::MAX] {
            map.assign(key, Arc::new(key));
        }
        let mut keys: Vec<u64> = map
            .snapshot()
            .into_iter()
            .map(|(key, value)| {
                assert_eq!(key, *value);
                key
            })
            .collect();
        keys.sort_unstable();
        assert_eq!(keys, vec![1, 99, 1 << 40, u64::MAX]);
    }

    #[test]
    fn get_or_insert_with_inserts_once() {
        let map: ConcurrentMap<u32> = ConcurrentMap::new();
        let (first, inserted) = map.get_or_insert_with(5, || 10);
        assert!(inserted);
        let (second, inserted) = map.get_or_insert_with(5, || 20);
        assert!(!inserted);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(*second, 10);
    }

    #[test]
    fn mutator_exchange_and_erase_reuse_slot() {
        let map: ConcurrentMap<u32> = ConcurrentMap::new();
        let mut mutator = map.insert_or_find(11);
        assert!(mutator.value().is_none());
        assert!(matches!(mutator.exchange_value(Arc::new(1)), Ok(None)));
        let previous = mutator.exchange_value(Arc::new(2)).expect("no racing writer");
        assert_eq!(previous.map(|v| *v), Some(1));
        assert_eq!(mutator.erase_value().map(|v| *v), Some(2));
        assert!(mutator.erase_value().is_none());
        drop(mutator);
        assert!(map.get(11).is_none());
    }

    #[test]
    fn values_are_released() {
        let tracker = Arc::new(0u8);
        {
            let map: ConcurrentMap<Arc<u8>> = ConcurrentMap::new();
            for key in 1..=100u64 {
                map.assign(key, Arc::new(tracker.clone()));
            }
            for key in 1..=50u64 {
                map.erase(key);
            }
            map.clear();
        }
        assert_eq!(Arc::strong_count(&tracker), 1);
    }

    #[test]
    fn deleted_cells_are_purged_by_migration() {
        let map: ConcurrentMap<u64> = ConcurrentMap::new();
        for round in 0..20u64 {
            for key in 1..=64u64 {
                map.assign(round * 1000 + key, Arc::new(key));
            }
            for key in 1..=64u64 {
                map.erase(round * 1000 + key);
            }
        }
        assert!(map.is_empty());
        assert!(map.capacity() <= 4096, "capacity {}", map.capacity());
    }
}
