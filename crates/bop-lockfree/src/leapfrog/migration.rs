//! Cooperative table migration.
//!
//! A migration copies every live cell of one or more source tables into a
//! larger destination. Any thread that runs into a redirect marker or an
//! overflow joins the job through the source table's [`JobCoordinator`],
//! claims migration units of [`TABLE_MIGRATION_UNIT_SIZE`] cells, and goes
//! back to its own operation once the job has ended.
//!
//! `worker_status` packs the worker count (in steps of two) with an end flag in
//! bit 0. The last worker to leave publishes the destination as the new root,
//! or, when the destination itself overflowed, chains a new migration with a
//! doubled destination that also drains the failed one.

use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicPtr, AtomicU64, AtomicUsize, Ordering};

use crossbeam_utils::Backoff;
use tracing::{debug, error};

use super::table::{
    InsertResult, NULL_HASH, NULL_VALUE, REDIRECT, TABLE_MIGRATION_UNIT_SIZE, Table,
};
use crate::qsbr::Qsbr;

const JOB_NONE: usize = 0;
const JOB_END: usize = 1;

/// Single-slot job queue attached to a table.
pub(crate) struct JobCoordinator {
    job: AtomicUsize,
}

impl JobCoordinator {
    pub(crate) fn new() -> Self {
        Self {
            job: AtomicUsize::new(JOB_NONE),
        }
    }

    pub(crate) fn has_job(&self) -> bool {
        self.job.load(Ordering::Acquire) != JOB_NONE
    }

    pub(crate) fn is_active(&self) -> bool {
        let job = self.job.load(Ordering::Acquire);
        job != JOB_NONE && job != JOB_END
    }

    fn load(&self) -> usize {
        self.job.load(Ordering::Acquire)
    }

    fn publish(&self, migration: *mut TableMigration) {
        self.job.store(migration as usize, Ordering::Release);
    }

    fn end(&self) {
        self.job.store(JOB_END, Ordering::Release);
    }

    /// Runs published jobs until the coordinator is ended.
    ///
    /// The caller must be pinned in `qsbr`.
    pub(crate) fn participate(&self, root: &AtomicPtr<Table>, qsbr: &Qsbr) {
        let mut previous = JOB_NONE;
        let backoff = Backoff::new();
        loop {
            let job = self.load();
            if job == JOB_END {
                return;
            }
            if job == JOB_NONE || job == previous {
                // Other workers are finishing the job we already helped with.
                backoff.snooze();
                continue;
            }
            // SAFETY: published jobs are reclaimed through `qsbr` only after
            // they are replaced or ended, and the caller is pinned.
            let migration = unsafe { &*(job as *const TableMigration) };
            migration.run(root, qsbr);
            previous = job;
            backoff.reset();
        }
    }
}

struct Source {
    table: AtomicPtr<Table>,
    next_index: AtomicU64,
}

impl Source {
    fn new(table: *mut Table) -> Self {
        Self {
            table: AtomicPtr::new(table),
            next_index: AtomicU64::new(0),
        }
    }
}

pub(crate) struct TableMigration {
    sources: Box<[Source]>,
    destination: *mut Table,
    worker_status: AtomicU64,
    overflowed: AtomicBool,
    units_remaining: AtomicI64,
}

/// Owns the source tables that are still attached to a finished migration.
struct RetiredMigration(*mut TableMigration);

// SAFETY: the migration and its tables are unreachable once retired.
unsafe impl Send for RetiredMigration {}

impl Drop for RetiredMigration {
    fn drop(&mut self) {
        // SAFETY: created by `Box::into_raw` and retired exactly once.
        unsafe { drop(Box::from_raw(self.0)) };
    }
}

struct RetiredTable(*mut Table);

// SAFETY: see `RetiredMigration`.
unsafe impl Send for RetiredTable {}

impl Drop for RetiredTable {
    fn drop(&mut self) {
        // SAFETY: created by `Box::into_raw` and retired exactly once.
        unsafe { drop(Box::from_raw(self.0)) };
    }
}

impl Drop for TableMigration {
    fn drop(&mut self) {
        for source in self.sources.iter() {
            let table = source.table.swap(ptr::null_mut(), Ordering::Relaxed);
            if !table.is_null() {
                // SAFETY: sources still attached here are owned by this migration.
                unsafe { drop(Box::from_raw(table)) };
            }
        }
    }
}

impl TableMigration {
    fn new(sources: Vec<Source>, destination: Box<Table>) -> Box<Self> {
        let units: u64 = sources
            .iter()
            .map(|source| {
                // SAFETY: source tables are live for the lifetime of the job.
                unsafe { &*source.table.load(Ordering::Relaxed) }.num_migration_units()
            })
            .sum();
        Box::new(Self {
            sources: sources.into_boxed_slice(),
            destination: Box::into_raw(destination),
            worker_status: AtomicU64::new(0),
            overflowed: AtomicBool::new(false),
            units_remaining: AtomicI64::new(units as i64),
        })
    }

    fn destination(&self) -> &Table {
        // SAFETY: the destination outlives the job: it becomes the new root or
        // a source of the follow-up migration.
        unsafe { &*self.destination }
    }

    fn run(&self, root: &AtomicPtr<Table>, qsbr: &Qsbr) {
        let mut status = self.worker_status.load(Ordering::Relaxed);
        loop {
            if status & 1 != 0 {
                return;
            }
            match self.worker_status.compare_exchange_weak(
                status,
                status + 2,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => status = actual,
            }
        }

        'sources: for source in self.sources.iter() {
            // SAFETY: attached sources stay alive while workers are inside `run`.
            let table = unsafe { &*source.table.load(Ordering::Relaxed) };
            loop {
                if self.worker_status.load(Ordering::Relaxed) & 1 != 0 {
                    break 'sources;
                }
                let start = source
                    .next_index
                    .fetch_add(TABLE_MIGRATION_UNIT_SIZE, Ordering::Relaxed);
                if start >= table.size() {
                    break;
                }
                if !self.migrate_range(table, start) {
                    // This unit can never complete, so no worker can declare
                    // success; the last one out handles the overflow.
                    self.overflowed.store(true, Ordering::Relaxed);
                    self.worker_status.fetch_or(1, Ordering::Relaxed);
                    break 'sources;
                }
                let previous = self.units_remaining.fetch_sub(1, Ordering::Relaxed);
                debug_assert!(previous > 0);
                if previous == 1 {
                    self.worker_status.fetch_or(1, Ordering::Relaxed);
                    break 'sources;
                }
            }
        }

        let status = self.worker_status.fetch_sub(2, Ordering::AcqRel);
        if status >= 4 {
            return;
        }
        debug_assert_eq!(status, 3);
        self.finish(root, qsbr);
    }

    fn finish(&self, root: &AtomicPtr<Table>, qsbr: &Qsbr) {
        let first = self.sources[0].table.load(Ordering::Relaxed);
        // SAFETY: the first source is the table this job was published on.
        let origin = unsafe { &*first };

        if !self.overflowed.load(Ordering::Relaxed) {
            root.store(self.destination, Ordering::Release);
            origin.coordinator.end();
            debug!(
                size = self.destination().size(),
                sources = self.sources.len(),
                "leapfrog migration published"
            );
        } else {
            let _lock = origin.migration_lock.lock();
            if origin.coordinator.load() == self as *const Self as usize {
                let next_size = self.destination().size() * 2;
                let mut sources: Vec<Source> = self
                    .sources
                    .iter()
                    .map(|source| Source::new(source.table.swap(ptr::null_mut(), Ordering::Relaxed)))
                    .collect();
                sources.push(Source::new(self.destination));
                let next = TableMigration::new(sources, Table::new(next_size));
                debug!(size = next_size, "leapfrog migration overflowed; restarting larger");
                origin.coordinator.publish(Box::into_raw(next));
            } else {
                error!("leapfrog migration overflowed but a newer job is already published");
                qsbr.defer(RetiredTable(self.destination));
            }
        }

        qsbr.defer(RetiredMigration(self as *const Self as *mut Self));
    }

    /// Moves one unit of `source` into the destination. Returns `false` when
    /// the destination overflows.
    fn migrate_range(&self, source: &Table, start: u64) -> bool {
        let end = (start + TABLE_MIGRATION_UNIT_SIZE).min(source.size());
        let destination = self.destination();
        for idx in start..end {
            let src = source.cell(idx);
            loop {
                let hash = src.hash.load(Ordering::Relaxed);
                if hash == NULL_HASH {
                    match src.value.compare_exchange(
                        NULL_VALUE,
                        REDIRECT,
                        Ordering::Relaxed,
                        Ordering::Relaxed,
                    ) {
                        Ok(_) | Err(REDIRECT) => break,
                        // Claimed concurrently; re-read the hash.
                        Err(_) => continue,
                    }
                }

                let mut value = src.value.load(Ordering::Acquire);
                if value == NULL_VALUE {
                    match src.value.compare_exchange(
                        NULL_VALUE,
                        REDIRECT,
                        Ordering::Relaxed,
                        Ordering::Relaxed,
                    ) {
                        Ok(_) | Err(REDIRECT) => break,
                        Err(actual) => value = actual,
                    }
                } else if value == REDIRECT {
                    break;
                }

                let dst = match destination.insert_or_find(hash) {
                    InsertResult::InsertedNew(cell) => cell,
                    InsertResult::AlreadyFound(cell) => {
                        // Each hash lives in one source and is migrated by one
                        // thread.
                        debug_assert!(false, "hash {hash:#x} migrated twice");
                        error!(hash, "duplicate hash found during migration");
                        cell
                    }
                    InsertResult::Overflow(_) => return false,
                };

                loop {
                    dst.value.store(value, Ordering::Release);
                    match src.value.compare_exchange(
                        value,
                        REDIRECT,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => break,
                        Err(actual) => {
                            debug_assert_ne!(actual, REDIRECT);
                            // Late write or erase on the source; carry it over.
                            value = actual;
                        }
                    }
                }
                break;
            }
        }
        true
    }
}

/// Publishes a migration of `table` to `next_size` unless one exists already.
pub(crate) fn begin_table_migration_to_size(table: *mut Table, next_size: u64) {
    // SAFETY: the caller is pinned and `table` was loaded from the root.
    let source = unsafe { &*table };
    if source.coordinator.has_job() {
        return;
    }
    let _lock = source.migration_lock.lock();
    if source.coordinator.has_job() {
        return;
    }
    let migration = TableMigration::new(vec![Source::new(table)], Table::new(next_size));
    debug!(from = source.size(), to = next_size, "leapfrog migration started");
    source.coordinator.publish(Box::into_raw(migration));
}

pub(crate) fn begin_table_migration(table: *mut Table, overflow_idx: u64) {
    // SAFETY: as above.
    let source = unsafe { &*table };
    if let Some(next_size) = source.next_table_size(overflow_idx) {
        begin_table_migration_to_size(table, next_size);
    }
}
