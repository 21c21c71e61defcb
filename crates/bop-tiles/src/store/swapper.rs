//! Eviction passes.
//!
//! A pass walks the store's clock iterator and swaps data out until resident
//! memory drops to its target. Data touched since it was last seen
//! (`age == 0`) gets a second chance: it is marked old and only evicted if
//! the first sweep did not free enough.

use std::sync::Arc;

use tracing::debug;

use super::StoreInner;
use crate::tile_data::{Eviction, TileData};

/// Which data a pass may evict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PassKind {
    /// Only data referenced solely by undo history.
    Soft,
    /// Anything that is not locked.
    Aggressive,
}

/// Outcome of one swapper cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SwapperCycle {
    pub evicted: usize,
    pub failures: usize,
}

impl SwapperCycle {
    fn record(&mut self, eviction: Eviction) {
        match eviction {
            Eviction::Evicted => self.evicted += 1,
            Eviction::Failed => self.failures += 1,
            Eviction::Skipped => {}
        }
    }
}

pub(crate) fn run_cycle(store: &StoreInner) -> SwapperCycle {
    let mut cycle = SwapperCycle::default();
    let limits = store.limits;
    if store.resident_bytes() > limits.soft_threshold {
        pass(store, PassKind::Soft, limits.soft_limit, &mut cycle);
    }
    if store.resident_bytes() > limits.hard_threshold {
        pass(store, PassKind::Aggressive, limits.hard_limit, &mut cycle);
    }
    if cycle.evicted > 0 || cycle.failures > 0 {
        debug!(
            evicted = cycle.evicted,
            failures = cycle.failures,
            resident = store.resident_bytes(),
            "swapper cycle"
        );
    }
    cycle
}

pub(crate) fn pass(store: &StoreInner, kind: PassKind, target: u64, cycle: &mut SwapperCycle) {
    let mut young: Vec<Arc<TileData>> = Vec::new();
    for data in store.registry.clock() {
        if store.resident_bytes() <= target {
            return;
        }
        if kind == PassKind::Soft && !data.is_only_historical() {
            continue;
        }
        if data.age() == 0 {
            data.mark_old();
            young.push(data);
            continue;
        }
        cycle.record(data.try_evict(store));
    }
    for data in young {
        if store.resident_bytes() <= target {
            return;
        }
        cycle.record(data.try_evict(store));
    }
}

/// Evicts every data that is resident and unlocked, ignoring age.
pub(crate) fn evict_all(store: &StoreInner) -> usize {
    store
        .registry
        .forward()
        .iter()
        .filter(|data| data.try_evict(store) == Eviction::Evicted)
        .count()
}
