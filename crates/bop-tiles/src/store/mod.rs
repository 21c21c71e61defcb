//! The tile data store: registry of every in-memory [`TileData`], arbiter of
//! cloning and swapping, and owner of the pooler and swapper threads.

mod iter;
mod limits;
mod pooler;
mod swapper;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, instrument, trace, warn};

pub use iter::ClockIter;
pub(crate) use iter::Registry;
pub use limits::StoreLimits;
pub use pooler::PoolerCycle;
pub use swapper::SwapperCycle;

use crate::config::TileStoreConfig;
use crate::error::{TileError, TileResult};
use crate::swap::{SwapStoreSnapshot, SwappedStore};
use crate::tile_data::{filled_buffer, Eviction, TileData, TileDataReadGuard};

/// Point-in-time view of the store counters.
#[derive(Debug, Clone, Default)]
pub struct TileStoreSnapshot {
    /// Registered data, resident or swapped.
    pub tiles_in_memory: usize,
    pub resident_bytes: u64,
    pub pool_bytes: u64,
    pub swapped_tiles: u64,
    pub clones_served: u64,
    pub deep_copies: u64,
    pub swap_failures: u64,
    pub emergency_passes: u64,
    pub pooler_cycles: u64,
    pub swapper_cycles: u64,
    pub last_error: Option<String>,
    pub swap: SwapStoreSnapshot,
}

#[derive(Debug, Default)]
pub(crate) struct StoreMetrics {
    clones_served: AtomicU64,
    deep_copies: AtomicU64,
    swap_failures: AtomicU64,
    emergency_passes: AtomicU64,
    pooler_cycles: AtomicU64,
    swapper_cycles: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl StoreMetrics {
    pub(crate) fn record_error(&self, err: &TileError) {
        *self.last_error.lock() = Some(err.to_string());
    }
}

pub(crate) struct StoreInner {
    pub(crate) config: TileStoreConfig,
    pub(crate) limits: StoreLimits,
    pub(crate) swapped: SwappedStore,
    pub(crate) registry: Registry,
    pub(crate) metrics: StoreMetrics,
    resident_bytes: AtomicU64,
    pool_bytes: AtomicU64,
    swapped_tiles: AtomicU64,
    emergency_lock: Mutex<()>,
    this: Weak<StoreInner>,
}

impl StoreInner {
    fn new(config: TileStoreConfig) -> TileResult<Arc<Self>> {
        let swapped = SwappedStore::new(&config)?;
        let limits = StoreLimits::from_config(&config);
        Ok(Arc::new_cyclic(|this| Self {
            config,
            limits,
            swapped,
            registry: Registry::new(),
            metrics: StoreMetrics::default(),
            resident_bytes: AtomicU64::new(0),
            pool_bytes: AtomicU64::new(0),
            swapped_tiles: AtomicU64::new(0),
            emergency_lock: Mutex::new(()),
            this: this.clone(),
        }))
    }

    pub(crate) fn resident_bytes(&self) -> u64 {
        self.resident_bytes.load(Ordering::Acquire)
    }

    pub(crate) fn pool_bytes(&self) -> u64 {
        self.pool_bytes.load(Ordering::Acquire)
    }

    fn register(&self, data: &Arc<TileData>) {
        self.registry.register(data);
        self.resident_bytes
            .fetch_add(data.size() as u64, Ordering::AcqRel);
    }

    pub(crate) fn allocate(&self, pixel_size: usize, pixel: &[u8]) -> Arc<TileData> {
        self.check_free_memory();
        let data = Arc::new(TileData::new(
            self.this.clone(),
            pixel_size,
            filled_buffer(pixel_size, pixel),
        ));
        self.register(&data);
        data
    }

    pub(crate) fn duplicate(&self, source: &Arc<TileData>) -> TileResult<Arc<TileData>> {
        if let Some(clone) = source.pop_clone() {
            clone.set_pooled(false);
            self.pool_bytes
                .fetch_sub(clone.size() as u64, Ordering::AcqRel);
            self.register(&clone);
            self.metrics.clones_served.fetch_add(1, Ordering::Relaxed);
            trace!(source = source.id(), clone = clone.id(), "clone served from pool");
            return Ok(clone);
        }
        self.check_free_memory();
        let copy = Arc::new(source.clone_unregistered()?);
        self.register(&copy);
        self.metrics.deep_copies.fetch_add(1, Ordering::Relaxed);
        Ok(copy)
    }

    /// Pushes one pre-made clone onto `data`'s stack. Returns `false` when the
    /// buffer is swapped out or locked for writing.
    pub(crate) fn make_pool_clone(&self, data: &Arc<TileData>) -> TileResult<bool> {
        let Some(source) = data.try_read_resident() else {
            return Ok(false);
        };
        let clone = TileData::new(self.this.clone(), data.pixel_size(), Box::from(&source[..]));
        clone.set_pooled(true);
        self.pool_bytes
            .fetch_add(clone.size() as u64, Ordering::AcqRel);
        // Pushed under the source read lock so a concurrent writer clears it.
        data.push_clone(Arc::new(clone));
        drop(source);
        Ok(true)
    }

    /// Backpressure check run before any new buffer is allocated. Evicts
    /// synchronously when the emergency ceiling is crossed.
    pub(crate) fn check_free_memory(&self) {
        if self.resident_bytes() + self.pool_bytes() <= self.limits.emergency_threshold {
            return;
        }
        let Some(_guard) = self.emergency_lock.try_lock() else {
            return;
        };
        self.metrics.emergency_passes.fetch_add(1, Ordering::Relaxed);
        if self.pool_bytes() > 0 {
            for data in self.registry.forward() {
                data.free_clones(usize::MAX);
            }
        }
        let mut cycle = SwapperCycle::default();
        swapper::pass(
            self,
            swapper::PassKind::Aggressive,
            self.limits.hard_limit,
            &mut cycle,
        );
        let resident = self.resident_bytes();
        if resident > self.limits.emergency_threshold {
            warn!(
                resident,
                ceiling = self.limits.emergency_threshold,
                failures = cycle.failures,
                "memory ceiling not honored"
            );
        } else {
            debug!(resident, evicted = cycle.evicted, "emergency swap pass");
        }
    }

    pub(crate) fn unregister(&self, id: u64) {
        self.registry.unregister(id);
    }

    pub(crate) fn note_swapped_in(&self, size: usize) {
        self.resident_bytes.fetch_add(size as u64, Ordering::AcqRel);
        self.swapped_tiles.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn note_swapped_out(&self, size: usize) {
        self.resident_bytes.fetch_sub(size as u64, Ordering::AcqRel);
        self.swapped_tiles.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn note_swap_failure(&self, id: u64, err: &TileError) {
        warn!(id, error = %err, "swap write failed, tile stays resident");
        self.metrics.swap_failures.fetch_add(1, Ordering::Relaxed);
        self.metrics.record_error(err);
    }

    pub(crate) fn note_pool_release(&self, size: usize) {
        self.pool_bytes.fetch_sub(size as u64, Ordering::AcqRel);
    }

    pub(crate) fn note_resident_release(&self, size: usize) {
        self.resident_bytes.fetch_sub(size as u64, Ordering::AcqRel);
    }

    pub(crate) fn note_swapped_release(&self) {
        self.swapped_tiles.fetch_sub(1, Ordering::AcqRel);
    }

    fn snapshot(&self) -> TileStoreSnapshot {
        TileStoreSnapshot {
            tiles_in_memory: self.registry.len(),
            resident_bytes: self.resident_bytes(),
            pool_bytes: self.pool_bytes(),
            swapped_tiles: self.swapped_tiles.load(Ordering::Acquire),
            clones_served: self.metrics.clones_served.load(Ordering::Relaxed),
            deep_copies: self.metrics.deep_copies.load(Ordering::Relaxed),
            swap_failures: self.metrics.swap_failures.load(Ordering::Relaxed),
            emergency_passes: self.metrics.emergency_passes.load(Ordering::Relaxed),
            pooler_cycles: self.metrics.pooler_cycles.load(Ordering::Relaxed),
            swapper_cycles: self.metrics.swapper_cycles.load(Ordering::Relaxed),
            last_error: self.metrics.last_error.lock().clone(),
            swap: self.swapped.metrics(),
        }
    }
}

/// A background thread woken by a kick or by its poll interval elapsing.
struct Worker {
    name: &'static str,
    kick: Sender<()>,
    shutdown: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    fn spawn<F>(
        name: &'static str,
        store: Arc<StoreInner>,
        initial: Duration,
        mut step: F,
    ) -> TileResult<Self>
    where
        F: FnMut(&StoreInner, Duration) -> Duration + Send + 'static,
    {
        let (kick, rx) = bounded(1);
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = shutdown.clone();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || Self::run(name, rx, flag, store, initial, &mut step))?;
        debug!(worker = name, "store worker started");
        Ok(Self {
            name,
            kick,
            shutdown,
            handle: Mutex::new(Some(handle)),
        })
    }

    fn run<F>(
        name: &'static str,
        rx: Receiver<()>,
        shutdown: Arc<AtomicBool>,
        store: Arc<StoreInner>,
        initial: Duration,
        step: &mut F,
    ) where
        F: FnMut(&StoreInner, Duration) -> Duration,
    {
        let mut interval = initial;
        loop {
            match rx.recv_timeout(interval) {
                Ok(()) | Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            if shutdown.load(Ordering::Acquire) {
                break;
            }
            interval = step(&store, interval);
        }
        debug!(worker = name, "store worker stopped");
    }

    fn kick(&self) {
        let _ = self.kick.try_send(());
    }

    fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        self.kick();
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                warn!(worker = self.name, "store worker panicked");
            }
        }
    }
}

/// Registry of tile data with its pooler and swapper threads.
///
/// Dropping the store stops both threads and waits for them.
pub struct TileDataStore {
    inner: Arc<StoreInner>,
    pooler: Option<Worker>,
    swapper: Option<Worker>,
}

impl TileDataStore {
    #[instrument(skip(config), fields(memory_limit = config.memory_limit_bytes))]
    pub fn new(config: TileStoreConfig) -> TileResult<Arc<Self>> {
        config.validate()?;
        let inner = StoreInner::new(config)?;

        let pooler = if inner.config.pooler.enabled {
            let min = inner.config.pooler.min_interval;
            let max = inner.config.pooler.max_interval;
            Some(Worker::spawn(
                "bop-tiles-pooler",
                inner.clone(),
                min,
                move |store, interval| {
                    let cycle = pooler::run_cycle(store);
                    store.metrics.pooler_cycles.fetch_add(1, Ordering::Relaxed);
                    if cycle.is_productive() {
                        trace!(?cycle, "pooler cycle");
                    }
                    pooler::next_interval(interval, cycle.is_productive(), min, max)
                },
            )?)
        } else {
            None
        };

        let swapper = if inner.config.swapper.enabled {
            let every = inner.config.swapper.interval;
            Some(Worker::spawn(
                "bop-tiles-swapper",
                inner.clone(),
                every,
                move |store, _| {
                    swapper::run_cycle(store);
                    store.metrics.swapper_cycles.fetch_add(1, Ordering::Relaxed);
                    every
                },
            )?)
        } else {
            None
        };

        debug!(limits = ?inner.limits, "tile data store started");
        Ok(Arc::new(Self {
            inner,
            pooler,
            swapper,
        }))
    }

    pub fn config(&self) -> &TileStoreConfig {
        &self.inner.config
    }

    pub fn limits(&self) -> StoreLimits {
        self.inner.limits
    }

    /// A fresh registered data filled with `pixel`.
    pub fn allocate(&self, pixel_size: usize, pixel: &[u8]) -> TileResult<Arc<TileData>> {
        if pixel_size == 0 || pixel.len() != pixel_size {
            return Err(TileError::PixelSizeMismatch {
                expected: pixel_size,
                found: pixel.len(),
            });
        }
        Ok(self.inner.allocate(pixel_size, pixel))
    }

    /// Copy of `source`: a pre-made clone when one is ready, otherwise a
    /// synchronous deep copy.
    pub fn duplicate(&self, source: &Arc<TileData>) -> TileResult<Arc<TileData>> {
        self.inner.duplicate(source)
    }

    /// Read lock on `data` with its buffer guaranteed resident.
    pub fn ensure_loaded(&self, data: &Arc<TileData>) -> TileResult<TileDataReadGuard> {
        data.read()
    }

    /// Non-blocking eviction of one data. Fails when it is locked, already
    /// swapped, or the swap write fails.
    pub fn try_evict(&self, data: &Arc<TileData>) -> bool {
        data.try_evict(&self.inner) == Eviction::Evicted
    }

    /// Evicts everything that is resident and not locked.
    pub fn debug_swap_all(&self) -> usize {
        let evicted = swapper::evict_all(&self.inner);
        debug!(evicted, "forced swap of all tile data");
        evicted
    }

    /// Registered data count.
    pub fn num_tiles(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn iter_forward(&self) -> impl Iterator<Item = Arc<TileData>> {
        self.inner.registry.forward().into_iter()
    }

    pub fn iter_reverse(&self) -> impl Iterator<Item = Arc<TileData>> {
        self.inner.registry.reverse().into_iter()
    }

    /// Clock iterator resuming where the previous one stopped.
    pub fn clock_iter(&self) -> ClockIter<'_> {
        self.inner.registry.clock()
    }

    /// Runs one pooler cycle on the calling thread.
    pub fn run_pooler_cycle(&self) -> PoolerCycle {
        let cycle = pooler::run_cycle(&self.inner);
        self.inner
            .metrics
            .pooler_cycles
            .fetch_add(1, Ordering::Relaxed);
        cycle
    }

    /// Runs one swapper cycle on the calling thread.
    pub fn run_swapper_cycle(&self) -> SwapperCycle {
        let cycle = swapper::run_cycle(&self.inner);
        self.inner
            .metrics
            .swapper_cycles
            .fetch_add(1, Ordering::Relaxed);
        cycle
    }

    pub fn kick_pooler(&self) {
        if let Some(worker) = &self.pooler {
            worker.kick();
        }
    }

    pub fn kick_swapper(&self) {
        if let Some(worker) = &self.swapper {
            worker.kick();
        }
    }

    pub fn metrics(&self) -> TileStoreSnapshot {
        self.inner.snapshot()
    }

    pub fn sanity_check(&self) -> TileResult<()> {
        self.inner.swapped.sanity_check()
    }

    /// Stops the background threads. Idempotent.
    pub fn shutdown(&self) {
        if let Some(worker) = &self.pooler {
            worker.shutdown();
        }
        if let Some(worker) = &self.swapper {
            worker.shutdown();
        }
    }
}

impl Drop for TileDataStore {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for TileDataStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TileDataStore")
            .field("limits", &self.inner.limits)
            .field("tiles", &self.num_tiles())
            .field("resident_bytes", &self.inner.resident_bytes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn quiet_store(dir: &TempDir) -> Arc<TileDataStore> {
        let mut config = TileStoreConfig::for_testing(dir.path());
        config.pooler.enabled = false;
        config.swapper.enabled = false;
        TileDataStore::new(config).expect("store")
    }

    #[test]
    fn allocate_and_drop_balance_accounting() {
        let dir = TempDir::new().expect("tempdir");
        let store = quiet_store(&dir);
        let data = store.allocate(4, &[1, 2, 3, 4]).unwrap();
        assert_eq!(store.num_tiles(), 1);
        assert_eq!(store.metrics().resident_bytes, 64 * 64 * 4);
        assert_eq!(&data.read().unwrap()[..8], &[1, 2, 3, 4, 1, 2, 3, 4]);
        drop(data);
        let snapshot = store.metrics();
        assert_eq!(snapshot.tiles_in_memory, 0);
        assert_eq!(snapshot.resident_bytes, 0);
    }

    #[test]
    fn allocate_rejects_wrong_pixel() {
        let dir = TempDir::new().expect("tempdir");
        let store = quiet_store(&dir);
        let err = store.allocate(4, &[1, 2]).unwrap_err();
        assert!(matches!(err, TileError::PixelSizeMismatch { expected: 4, found: 2 }));
    }

    #[test]
    fn duplicate_prefers_pooled_clone() {
        let dir = TempDir::new().expect("tempdir");
        let store = quiet_store(&dir);
        let data = store.allocate(1, &[7]).unwrap();
        assert!(store.inner.make_pool_clone(&data).unwrap());
        assert_eq!(store.metrics().pool_bytes, 64 * 64);

        let clone = store.duplicate(&data).unwrap();
        let snapshot = store.metrics();
        assert_eq!(snapshot.clones_served, 1);
        assert_eq!(snapshot.pool_bytes, 0);
        assert_eq!(snapshot.tiles_in_memory, 2);
        assert_ne!(clone.id(), data.id());

        let copy = store.duplicate(&data).unwrap();
        assert_eq!(store.metrics().deep_copies, 1);
        assert_eq!(copy.read().unwrap()[100], 7);
    }

    #[test]
    fn evicted_data_swaps_back_in() {
        let dir = TempDir::new().expect("tempdir");
        let store = quiet_store(&dir);
        let data = store.allocate(2, &[9, 1]).unwrap();
        data.write().unwrap()[0] = 42;
        assert!(store.try_evict(&data));
        assert!(!data.is_resident());
        assert!(!store.try_evict(&data));
        let snapshot = store.metrics();
        assert_eq!((snapshot.resident_bytes, snapshot.swapped_tiles), (0, 1));

        let guard = store.ensure_loaded(&data).unwrap();
        assert_eq!(&guard[..4], &[42, 1, 9, 1]);
        drop(guard);
        assert_eq!(store.metrics().swapped_tiles, 0);
    }

    #[test]
    fn locked_data_is_not_evicted() {
        let dir = TempDir::new().expect("tempdir");
        let store = quiet_store(&dir);
        let data = store.allocate(1, &[0]).unwrap();
        let guard = data.read().unwrap();
        assert!(!store.try_evict(&data));
        drop(guard);
        assert!(store.try_evict(&data));
    }

    #[test]
    fn dropping_swapped_data_releases_its_chunk() {
        let dir = TempDir::new().expect("tempdir");
        let store = quiet_store(&dir);
        let capacity = store.config().swap_capacity_bytes;
        let data = store.allocate(4, &[3, 3, 3, 3]).unwrap();
        store.debug_swap_all();
        assert!(store.metrics().swap.free_space < capacity);
        drop(data);
        let snapshot = store.metrics();
        assert_eq!(snapshot.swap.free_space, capacity);
        assert_eq!(snapshot.swapped_tiles, 0);
        store.sanity_check().unwrap();
    }

    #[test]
    fn pooler_cycle_serves_shared_hot_data() {
        let dir = TempDir::new().expect("tempdir");
        let store = quiet_store(&dir);
        let data = store.allocate(1, &[0]).unwrap();
        let users: Vec<_> = (0..3).map(|_| data.acquire()).collect();
        let cycle = store.run_pooler_cycle();
        assert_eq!(cycle.beggars, 1);
        assert_eq!(cycle.clones_made, 2);
        assert_eq!(data.clones_count(), 2);

        drop(users);
        let cycle = store.run_pooler_cycle();
        assert_eq!(cycle.clones_freed, 2);
        assert_eq!(store.metrics().pool_bytes, 0);
    }

    #[test]
    fn shutdown_is_idempotent() {
        let dir = TempDir::new().expect("tempdir");
        let store = TileDataStore::new(TileStoreConfig::for_testing(dir.path())).unwrap();
        store.kick_pooler();
        store.kick_swapper();
        store.shutdown();
        store.shutdown();
    }
}
