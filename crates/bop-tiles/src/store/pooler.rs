//! Clone pool maintenance.
//!
//! Each cycle classifies every registered data:
//!
//! * a *beggar* was touched since the last cycle (`age == 0`) and holds fewer
//!   clones than `min(users - 1, max_clones)`;
//! * a *donor* was not touched (`age > 0`) and still holds clones.
//!
//! Clones beyond what a data can use are freed first. Beggars are then
//! served from the pool budget, reclaiming donors' clones when the budget
//! would be exceeded.

use std::sync::Arc;
use std::time::Duration;

use tracing::{trace, warn};

use super::StoreInner;
use crate::tile_data::TileData;

/// Outcome of one pooler cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolerCycle {
    pub beggars: usize,
    pub donors: usize,
    pub clones_made: usize,
    pub clones_freed: usize,
}

impl PoolerCycle {
    pub fn is_productive(&self) -> bool {
        self.clones_made > 0 || self.clones_freed > 0
    }
}

pub(crate) fn run_cycle(store: &StoreInner) -> PoolerCycle {
    let max_clones = store.config.pooler.max_clones;
    let mut cycle = PoolerCycle::default();
    let mut beggars: Vec<(Arc<TileData>, usize)> = Vec::new();
    let mut donors: Vec<Arc<TileData>> = Vec::new();

    for data in store.registry.forward() {
        let wanted = data.users().saturating_sub(1).min(max_clones);
        let mut have = data.clones_count();
        if have > wanted {
            let freed = data.free_clones(have - wanted);
            cycle.clones_freed += freed;
            have -= freed;
        }
        if data.age() == 0 {
            if wanted > have {
                beggars.push((data.clone(), wanted - have));
            }
        } else if have > 0 {
            donors.push(data.clone());
        }
        data.mark_old();
    }
    cycle.beggars = beggars.len();
    cycle.donors = donors.len();

    if beggars.is_empty() {
        return cycle;
    }

    let needed: u64 = beggars
        .iter()
        .map(|(data, deficit)| (data.size() * deficit) as u64)
        .sum();
    let mut donors = donors.into_iter();
    while store.pool_bytes() + needed > store.limits.pool_limit {
        let Some(donor) = donors.next() else {
            break;
        };
        cycle.clones_freed += donor.free_clones(usize::MAX);
    }

    'beggars: for (data, deficit) in beggars {
        for _ in 0..deficit {
            if store.pool_bytes() + data.size() as u64 > store.limits.pool_limit {
                trace!(pool = store.pool_bytes(), "clone pool budget exhausted");
                break 'beggars;
            }
            match store.make_pool_clone(&data) {
                Ok(true) => cycle.clones_made += 1,
                // Swapped out or being written; try next cycle.
                Ok(false) => continue 'beggars,
                Err(err) => {
                    warn!(id = data.id(), error = %err, "failed to pre-clone tile data");
                    store.metrics.record_error(&err);
                    continue 'beggars;
                }
            }
        }
    }
    cycle
}

/// Next poll interval: back to `min` after a productive cycle, otherwise
/// doubled up to `max`.
pub(crate) fn next_interval(current: Duration, productive: bool, min: Duration, max: Duration) -> Duration {
    if productive {
        min
    } else {
        current.saturating_mul(2).clamp(min, max)
    }
}
