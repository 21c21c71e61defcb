//! Quiescent-state based reclamation.
//!
//! Readers bracket every raw pointer access with [`Qsbr::pin`]. Writers first
//! unlink a shared object and then hand it to [`Qsbr::defer`]; the object is
//! dropped only once the global epoch has advanced twice past the epoch it was
//! retired in.
//!
//! ```text
//!   epoch e      epoch e+1      epoch e+2
//!  ---------|--------------|--------------|---->
//!   retire X    slot(e-1)      slot(e)
//!               drained        drained   => X unreachable, drop it
//! ```
//!
//! Pinned readers are counted in one of two slots selected by the parity of
//! the epoch they observed. The epoch may only advance from `e` to `e+1` when
//! the slot of `e-1` is empty, so after two advances every reader that could
//! have loaded a pointer to `X` before it was unlinked has unpinned.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use tracing::trace;

/// Number of deferrals between opportunistic reclamation attempts.
const RECLAIM_BATCH: usize = 64;

struct Retired {
    epoch: u64,
    object: Box<dyn Send>,
}

/// Epoch based deferred reclamation domain.
pub struct Qsbr {
    epoch: CachePadded<AtomicU64>,
    readers: [CachePadded<AtomicUsize>; 2],
    pending: Mutex<Vec<Retired>>,
    pending_len: AtomicUsize,
    deferred_total: AtomicUsize,
}

impl Qsbr {
    pub fn new() -> Self {
        Self {
            epoch: CachePadded::new(AtomicU64::new(0)),
            readers: [
                CachePadded::new(AtomicUsize::new(0)),
                CachePadded::new(AtomicUsize::new(0)),
            ],
            pending: Mutex::new(Vec::new()),
            pending_len: AtomicUsize::new(0),
            deferred_total: AtomicUsize::new(0),
        }
    }

    /// Enters a read-side critical section. Objects deferred while the guard
    /// is alive are not dropped until it is released.
    #[inline]
    pub fn pin(&self) -> QsbrGuard<'_> {
        loop {
            let epoch = self.epoch.load(Ordering::SeqCst);
            let slot = (epoch & 1) as usize;
            self.readers[slot].fetch_add(1, Ordering::SeqCst);
            if self.epoch.load(Ordering::SeqCst) == epoch {
                return QsbrGuard { qsbr: self, slot };
            }
            self.readers[slot].fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Queues `object` to be dropped after every current reader has unpinned.
    ///
    /// The caller must have made `object` unreachable for new readers before
    /// calling this.
    pub fn defer<T: Send + 'static>(&self, object: T) {
        let epoch = self.epoch.load(Ordering::SeqCst);
        self.pending.lock().push(Retired {
            epoch,
            object: Box::new(object),
        });
        self.pending_len.fetch_add(1, Ordering::Relaxed);
        let total = self.deferred_total.fetch_add(1, Ordering::Relaxed) + 1;
        if total % RECLAIM_BATCH == 0 {
            self.try_reclaim();
        }
    }

    /// Advances the epoch where possible and drops every object whose grace
    /// period has elapsed. Returns the number of objects dropped.
    pub fn try_reclaim(&self) -> usize {
        self.try_advance();
        self.try_advance();
        let current = self.epoch.load(Ordering::SeqCst);

        let ready: Vec<Retired> = {
            let mut pending = self.pending.lock();
            if pending.is_empty() {
                return 0;
            }
            let (ready, keep): (Vec<_>, Vec<_>) = std::mem::take(&mut *pending)
                .into_iter()
                .partition(|retired| retired.epoch + 2 <= current);
            *pending = keep;
            ready
        };

        let reclaimed = ready.len();
        if reclaimed > 0 {
            self.pending_len.fetch_sub(reclaimed, Ordering::Relaxed);
            trace!(reclaimed, epoch = current, "qsbr reclaimed deferred objects");
        }
        // Dropped outside the pending lock; destructors may defer again.
        drop(ready);
        reclaimed
    }

    /// Number of objects waiting for their grace period.
    pub fn pending(&self) -> usize {
        self.pending_len.load(Ordering::Relaxed)
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    fn try_advance(&self) -> bool {
        let epoch = self.epoch.load(Ordering::SeqCst);
        let stale = ((epoch + 1) & 1) as usize;
        if self.readers[stale].load(Ordering::SeqCst) != 0 {
            return false;
        }
        self.epoch
            .compare_exchange(epoch, epoch + 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

impl Default for Qsbr {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Qsbr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Qsbr")
            .field("epoch", &self.epoch())
            .field("pending", &self.pending())
            .finish()
    }
}

/// Read-side critical section. Unpins on drop.
pub struct QsbrGuard<'a> {
    qsbr: &'a Qsbr,
    slot: usize,
}

impl Drop for QsbrGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        self.qsbr.readers[self.slot].fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;

    struct Flag(Arc<AtomicBool>);

    impl Drop for Flag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn deferred_object_waits_for_pinned_reader() {
        let qsbr = Qsbr::new();
        let dropped = Arc::new(AtomicBool::new(false));

        let guard = qsbr.pin();
        qsbr.defer(Flag(dropped.clone()));
        qsbr.try_reclaim();
        qsbr.try_reclaim();
        assert!(!dropped.load(Ordering::SeqCst));
        assert_eq!(qsbr.pending(), 1);

        drop(guard);
        qsbr.try_reclaim();
        qsbr.try_reclaim();
        assert!(dropped.load(Ordering::SeqCst));
        assert_eq!(qsbr.pending(), 0);
    }

    #[test]
    fn unpinned_domain_reclaims_immediately() {
        let qsbr = Qsbr::new();
        let dropped = Arc::new(AtomicBool::new(false));
        qsbr.defer(Flag(dropped.clone()));
        assert_eq!(qsbr.try_reclaim(), 1);
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[test]
    fn pending_objects_are_dropped_with_the_domain() {
        let dropped = Arc::new(AtomicBool::new(false));
        {
            let qsbr = Qsbr::new();
            let guard = qsbr.pin();
            qsbr.defer(Flag(dropped.clone()));
            drop(guard);
            assert!(!dropped.load(Ordering::SeqCst));
        }
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[test]
    fn nested_pins_are_counted() {
        let qsbr = Qsbr::new();
        let outer = qsbr.pin();
        let inner = qsbr.pin();
        drop(inner);
        let dropped = Arc::new(AtomicBool::new(false));
        qsbr.defer(Flag(dropped.clone()));
        qsbr.try_reclaim();
        assert!(!dropped.load(Ordering::SeqCst));
        drop(outer);
        qsbr.try_reclaim();
        assert!(dropped.load(Ordering::SeqCst));
    }
}
