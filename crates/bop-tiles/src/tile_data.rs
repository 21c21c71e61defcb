//! Pixel buffers shared between tiles and undo history.
//!
//! A [`TileData`] lives behind an `Arc`; the strong count is the reference
//! count that controls destruction. The *users* count is separate: it counts
//! tiles and committed history entries that logically share this version and
//! decides copy-on-write.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use bop_lockfree::LocklessStack;
use parking_lot::{ArcRwLockReadGuard, ArcRwLockWriteGuard, RawRwLock, RwLock};
use tracing::{error, trace};

use crate::codec::tile_data_size;
use crate::error::{TileError, TileResult};
use crate::store::StoreInner;
use crate::swap::SwapChunk;

/// Result of one eviction attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Eviction {
    Evicted,
    Skipped,
    Failed,
}

/// Buffer state guarded by the per-data lock. Exactly one of `data` and
/// `chunk` is set once the data is registered.
#[derive(Debug)]
pub(crate) struct TileBuffer {
    pub(crate) data: Option<Box<[u8]>>,
    pub(crate) chunk: Option<SwapChunk>,
}

pub struct TileData {
    id: AtomicU64,
    pixel_size: usize,
    buffer: Arc<RwLock<TileBuffer>>,
    users: AtomicUsize,
    mementoed: AtomicUsize,
    age: AtomicU32,
    /// Set while the data sits in another data's clone stack. Pooled data is
    /// not registered and is accounted as pool memory.
    pooled: AtomicBool,
    clones: LocklessStack<Arc<TileData>>,
    store: Weak<StoreInner>,
}

impl TileData {
    pub(crate) fn new(store: Weak<StoreInner>, pixel_size: usize, data: Box<[u8]>) -> Self {
        debug_assert_eq!(data.len(), tile_data_size(pixel_size));
        Self {
            id: AtomicU64::new(0),
            pixel_size,
            buffer: Arc::new(RwLock::new(TileBuffer {
                data: Some(data),
                chunk: None,
            })),
            users: AtomicUsize::new(0),
            mementoed: AtomicUsize::new(0),
            age: AtomicU32::new(0),
            pooled: AtomicBool::new(false),
            clones: LocklessStack::new(),
            store,
        }
    }

    /// A data that belongs to no store: never swapped, never pooled.
    pub fn standalone(pixel_size: usize, pixel: &[u8]) -> Arc<Self> {
        Arc::new(Self::new(Weak::new(), pixel_size, filled_buffer(pixel_size, pixel)))
    }

    pub fn id(&self) -> u64 {
        self.id.load(Ordering::Relaxed)
    }

    pub(crate) fn set_id(&self, id: u64) {
        self.id.store(id, Ordering::Relaxed);
    }

    pub fn pixel_size(&self) -> usize {
        self.pixel_size
    }

    /// Bytes of the pixel buffer.
    pub fn size(&self) -> usize {
        tile_data_size(self.pixel_size)
    }

    pub fn users(&self) -> usize {
        self.users.load(Ordering::Acquire)
    }

    /// Committed history entries among the users.
    pub fn mementoed(&self) -> usize {
        self.mementoed.load(Ordering::Acquire)
    }

    /// Only undo history still uses this version.
    pub fn is_only_historical(&self) -> bool {
        let mementoed = self.mementoed();
        mementoed > 0 && self.users() <= mementoed
    }

    pub fn age(&self) -> u32 {
        self.age.load(Ordering::Relaxed)
    }

    pub fn touch(&self) {
        self.age.store(0, Ordering::Relaxed);
    }

    pub fn mark_old(&self) {
        let _ = self
            .age
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |age| age.checked_add(1));
    }

    pub fn clones_count(&self) -> usize {
        self.clones.len()
    }

    pub(crate) fn is_pooled(&self) -> bool {
        self.pooled.load(Ordering::Acquire)
    }

    pub(crate) fn set_pooled(&self, pooled: bool) {
        self.pooled.store(pooled, Ordering::Release);
    }

    pub(crate) fn store(&self) -> Option<Arc<StoreInner>> {
        self.store.upgrade()
    }

    /// Whether the buffer is in memory right now.
    pub fn is_resident(&self) -> bool {
        self.buffer.read().data.is_some()
    }

    /// Registers a new user of this version.
    pub fn acquire(self: &Arc<Self>) -> TileDataUser {
        self.users.fetch_add(1, Ordering::AcqRel);
        TileDataUser {
            data: self.clone(),
            historical: false,
        }
    }

    /// Registers a committed history entry as a user.
    pub(crate) fn acquire_for_history(self: &Arc<Self>) -> TileDataUser {
        self.mementoed.fetch_add(1, Ordering::AcqRel);
        self.users.fetch_add(1, Ordering::AcqRel);
        TileDataUser {
            data: self.clone(),
            historical: true,
        }
    }

    /// Locks the buffer for reading, swapping it in first if needed.
    pub fn read(self: &Arc<Self>) -> TileResult<TileDataReadGuard> {
        let guard = self.buffer.read_arc();
        if guard.data.is_some() {
            return Ok(TileDataReadGuard {
                guard,
                data: self.clone(),
            });
        }
        drop(guard);
        let mut guard = self.buffer.write_arc();
        if guard.data.is_none() {
            self.swap_in_locked(&mut guard)?;
        }
        Ok(TileDataReadGuard {
            guard: ArcRwLockWriteGuard::downgrade(guard),
            data: self.clone(),
        })
    }

    /// Read lock only if the buffer is resident and nobody writes it.
    pub(crate) fn try_read_resident(self: &Arc<Self>) -> Option<TileDataReadGuard> {
        let guard = self.buffer.try_read_arc()?;
        guard.data.as_ref()?;
        Some(TileDataReadGuard {
            guard,
            data: self.clone(),
        })
    }

    /// Locks the buffer for writing in place, swapping it in first if needed.
    ///
    /// Pre-made clones are dropped: they would no longer match the buffer.
    /// Callers are responsible for copy-on-write; [`Tile::write`] does it.
    ///
    /// [`Tile::write`]: crate::tile::Tile::write
    pub fn write(self: &Arc<Self>) -> TileResult<TileDataWriteGuard> {
        let mut guard = self.buffer.write_arc();
        if guard.data.is_none() {
            self.swap_in_locked(&mut guard)?;
        }
        if !self.clones.is_empty() {
            self.clones.clear();
        }
        Ok(TileDataWriteGuard {
            guard,
            data: self.clone(),
        })
    }

    fn swap_in_locked(&self, guard: &mut TileBuffer) -> TileResult<()> {
        let Some(chunk) = guard.chunk else {
            error!(id = self.id(), "tile data has neither buffer nor swap chunk");
            return Err(TileError::internal("tile data lost its buffer"));
        };
        let Some(store) = self.store() else {
            return Err(TileError::invalid_state("tile data store is gone"));
        };
        store.check_free_memory();
        let mut buffer = vec![0u8; self.size()].into_boxed_slice();
        if let Err(err) = store.swapped.swap_in(&chunk, self.pixel_size, &mut buffer) {
            error!(id = self.id(), ?chunk, error = %err, "swap-in failed");
            store.metrics.record_error(&err);
            return Err(err);
        }
        store.swapped.forget(chunk);
        guard.chunk = None;
        guard.data = Some(buffer);
        store.note_swapped_in(self.size());
        trace!(id = self.id(), "tile data swapped in");
        Ok(())
    }

    /// Compresses the buffer to swap and releases it. Never blocks: a
    /// locked or already swapped buffer is skipped.
    pub(crate) fn try_evict(&self, store: &StoreInner) -> Eviction {
        let Some(mut guard) = self.buffer.try_write() else {
            return Eviction::Skipped;
        };
        let Some(data) = guard.data.as_ref() else {
            return Eviction::Skipped;
        };
        match store.swapped.swap_out(self.id(), self.pixel_size, data) {
            Ok(chunk) => {
                guard.chunk = Some(chunk);
                guard.data = None;
                drop(guard);
                store.note_swapped_out(self.size());
                trace!(id = self.id(), "tile data swapped out");
                Eviction::Evicted
            }
            Err(err) => {
                drop(guard);
                store.note_swap_failure(self.id(), &err);
                Eviction::Failed
            }
        }
    }

    /// Copy of this version, as a new unregistered data of the same store.
    pub(crate) fn clone_unregistered(self: &Arc<Self>) -> TileResult<TileData> {
        let source = self.read()?;
        Ok(TileData::new(
            self.store.clone(),
            self.pixel_size,
            Box::from(&source[..]),
        ))
    }

    /// Copy-on-write source: pops a pre-made clone or deep copies.
    pub fn duplicate(self: &Arc<Self>) -> TileResult<Arc<TileData>> {
        match self.store() {
            Some(store) => store.duplicate(self),
            None => {
                let source = self.read()?;
                Ok(Arc::new(TileData::new(
                    Weak::new(),
                    self.pixel_size,
                    Box::from(&source[..]),
                )))
            }
        }
    }

    pub(crate) fn pop_clone(&self) -> Option<Arc<TileData>> {
        self.clones.pop()
    }

    pub(crate) fn push_clone(&self, clone: Arc<TileData>) {
        self.clones.push(clone);
    }

    /// Drops up to `count` pre-made clones; returns how many were dropped.
    pub(crate) fn free_clones(&self, count: usize) -> usize {
        let mut freed = 0;
        while freed < count {
            if self.clones.pop().is_none() {
                break;
            }
            freed += 1;
        }
        freed
    }
}

impl Drop for TileData {
    fn drop(&mut self) {
        let Some(store) = self.store.upgrade() else {
            return;
        };
        let size = self.size();
        if *self.pooled.get_mut() {
            store.note_pool_release(size);
            return;
        }
        let id = *self.id.get_mut();
        if id == 0 {
            // Never registered: not accounted anywhere.
            return;
        }
        store.unregister(id);
        let mut buffer = self.buffer.write();
        if buffer.data.take().is_some() {
            store.note_resident_release(size);
        } else if let Some(chunk) = buffer.chunk.take() {
            store.swapped.forget(chunk);
            store.note_swapped_release();
        }
    }
}

impl fmt::Debug for TileData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TileData")
            .field("id", &self.id())
            .field("pixel_size", &self.pixel_size)
            .field("users", &self.users())
            .field("mementoed", &self.mementoed())
            .field("age", &self.age())
            .field("clones", &self.clones_count())
            .finish()
    }
}

/// A counted user of a [`TileData`]. Dropping it releases the user.
pub struct TileDataUser {
    data: Arc<TileData>,
    historical: bool,
}

impl TileDataUser {
    pub fn data(&self) -> &Arc<TileData> {
        &self.data
    }
}

impl Drop for TileDataUser {
    fn drop(&mut self) {
        let previous = self.data.users.fetch_sub(1, Ordering::AcqRel);
        if previous == 0 {
            error!(id = self.data.id(), "tile data users underflow");
            debug_assert!(false, "tile data users underflow");
            self.data.users.store(0, Ordering::Release);
        }
        if self.historical {
            self.data.mementoed.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl fmt::Debug for TileDataUser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TileDataUser")
            .field("data", &self.data)
            .field("historical", &self.historical)
            .finish()
    }
}

/// Shared access to a resident tile buffer.
pub struct TileDataReadGuard {
    guard: ArcRwLockReadGuard<RawRwLock, TileBuffer>,
    data: Arc<TileData>,
}

impl TileDataReadGuard {
    pub fn tile_data(&self) -> &Arc<TileData> {
        &self.data
    }
}

impl Deref for TileDataReadGuard {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.guard.data.as_deref().unwrap_or_default()
    }
}

/// Exclusive access to a resident tile buffer.
pub struct TileDataWriteGuard {
    guard: ArcRwLockWriteGuard<RawRwLock, TileBuffer>,
    data: Arc<TileData>,
}

impl TileDataWriteGuard {
    pub fn tile_data(&self) -> &Arc<TileData> {
        &self.data
    }
}

impl Deref for TileDataWriteGuard {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.guard.data.as_deref().unwrap_or_default()
    }
}

impl DerefMut for TileDataWriteGuard {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.guard.data.as_deref_mut().unwrap_or_default()
    }
}

/// A tile buffer filled with `pixel`.
pub(crate) fn filled_buffer(pixel_size: usize, pixel: &[u8]) -> Box<[u8]> {
    debug_assert_eq!(pixel.len(), pixel_size);
    let mut buffer = vec![0u8; tile_data_size(pixel_size)].into_boxed_slice();
    fill_pixels(&mut buffer, pixel);
    buffer
}

/// Repeats `pixel` over `dst`.
pub(crate) fn fill_pixels(dst: &mut [u8], pixel: &[u8]) {
    if pixel.iter().all(|&b| b == pixel[0]) {
        dst.fill(pixel[0]);
        return;
    }
    for chunk in dst.chunks_exact_mut(pixel.len()) {
        chunk.copy_from_slice(pixel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn users_track_acquire_and_release() {
        let data = TileData::standalone(4, &[1, 2, 3, 4]);
        let a = data.acquire();
        let b = data.acquire();
        assert_eq!(data.users(), 2);
        let history = data.acquire_for_history();
        assert_eq!((data.users(), data.mementoed()), (3, 1));
        drop(a);
        drop(b);
        assert!(data.is_only_historical());
        drop(history);
        assert_eq!((data.users(), data.mementoed()), (0, 0));
    }

    #[test]
    fn standalone_duplicate_is_a_deep_copy() {
        let data = TileData::standalone(2, &[5, 6]);
        let copy = data.duplicate().unwrap();
        copy.write().unwrap()[0] = 99;
        assert_eq!(data.read().unwrap()[0], 5);
        assert_eq!(copy.read().unwrap()[..3], [99, 6, 5]);
    }

    #[test]
    fn write_lock_discards_stale_clones() {
        let data = TileData::standalone(1, &[0]);
        data.push_clone(TileData::standalone(1, &[0]));
        assert_eq!(data.clones_count(), 1);
        data.write().unwrap()[0] = 1;
        assert_eq!(data.clones_count(), 0);
    }

    #[test]
    fn age_saturates_and_resets() {
        let data = TileData::standalone(1, &[0]);
        data.mark_old();
        data.mark_old();
        assert_eq!(data.age(), 2);
        data.touch();
        assert_eq!(data.age(), 0);
    }

    #[test]
    fn fill_repeats_multibyte_pixels() {
        let mut dst = [0u8; 6];
        fill_pixels(&mut dst, &[1, 2, 3]);
        assert_eq!(dst, [1, 2, 3, 1, 2, 3]);
    }
}
