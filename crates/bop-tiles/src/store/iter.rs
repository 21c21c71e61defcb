use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use crate::tile_data::TileData;

/// Every registered [`TileData`], keyed by registration id so that key
/// order is insertion order.
///
/// Iterators work on a snapshot of upgraded handles: the registry lock is
/// never held while a handle may drop, since dropping the last handle
/// unregisters the data.
#[derive(Debug)]
pub(crate) struct Registry {
    entries: RwLock<BTreeMap<u64, Weak<TileData>>>,
    next_id: AtomicU64,
    /// Id of the last data handed out by a clock iterator.
    clock: Mutex<u64>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            clock: Mutex::new(0),
        }
    }

    pub(crate) fn register(&self, data: &Arc<TileData>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        data.set_id(id);
        self.entries.write().insert(id, Arc::downgrade(data));
        id
    }

    pub(crate) fn unregister(&self, id: u64) -> bool {
        self.entries.write().remove(&id).is_some()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.read().len()
    }

    fn collect<'a>(iter: impl Iterator<Item = (&'a u64, &'a Weak<TileData>)>) -> Vec<Arc<TileData>> {
        iter.filter_map(|(_, weak)| weak.upgrade()).collect()
    }

    pub(crate) fn forward(&self) -> Vec<Arc<TileData>> {
        let entries = self.entries.read();
        Self::collect(entries.iter())
    }

    pub(crate) fn reverse(&self) -> Vec<Arc<TileData>> {
        let entries = self.entries.read();
        Self::collect(entries.iter().rev())
    }

    /// Round-robin iterator resuming after the data the previous clock
    /// iterator stopped at.
    pub(crate) fn clock(&self) -> ClockIter<'_> {
        let cursor = *self.clock.lock();
        let items = {
            let entries = self.entries.read();
            let mut items = Self::collect(entries.range(cursor + 1..));
            items.extend(Self::collect(entries.range(..=cursor)));
            items
        };
        ClockIter {
            registry: self,
            items: items.into_iter(),
            last: None,
        }
    }
}

/// Clock cursor over the registry. The position of the last yielded item is
/// saved when the iterator drops.
pub struct ClockIter<'a> {
    registry: &'a Registry,
    items: std::vec::IntoIter<Arc<TileData>>,
    last: Option<u64>,
}

impl Iterator for ClockIter<'_> {
    type Item = Arc<TileData>;

    fn next(&mut self) -> Option<Arc<TileData>> {
        let item = self.items.next()?;
        self.last = Some(item.id());
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.items.size_hint()
    }
}

impl Drop for ClockIter<'_> {
    fn drop(&mut self) {
        if let Some(last) = self.last {
            *self.registry.clock.lock() = last;
        }
    }
}
