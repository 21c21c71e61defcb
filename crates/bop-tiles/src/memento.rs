//! Undo history.
//!
//! Writes register the tile's new version as a *pending* change. A commit
//! folds the pending set into a revision: each change becomes a
//! [`MementoItem`] linked to the tile's previous committed item (its
//! parent), which is looked up in the heads table and then replaced by the
//! new item. Rolling back reinstates parents; rolling forward reapplies the
//! undone items and commits them again.
//!
//! ```text
//!  heads[(c,r)] --> item@rev3 --parent--> item@rev1 --parent--> (default)
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, instrument, warn};

use crate::geometry::Rect;
use crate::tile::Tile;
use crate::tile_data::{TileData, TileDataUser};
use crate::tile_index::{tile_key, TileIndex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Changed,
    Deleted,
}

/// A registered change not yet folded into history. It keeps the version
/// alive without counting as one of its users.
#[derive(Debug, Clone)]
struct PendingChange {
    col: i32,
    row: i32,
    kind: ChangeKind,
    data: Arc<TileData>,
}

/// One tile's version at a committed revision.
pub struct MementoItem {
    col: i32,
    row: i32,
    kind: ChangeKind,
    data: TileDataUser,
    parent: Mutex<Option<Arc<MementoItem>>>,
}

impl MementoItem {
    fn committed(change: &PendingChange) -> Self {
        Self {
            col: change.col,
            row: change.row,
            kind: change.kind,
            data: change.data.acquire_for_history(),
            parent: Mutex::new(None),
        }
    }

    fn placeholder(col: i32, row: i32, default_data: &Arc<TileData>) -> Self {
        Self {
            col,
            row,
            kind: ChangeKind::Deleted,
            data: default_data.acquire_for_history(),
            parent: Mutex::new(None),
        }
    }

    pub fn col(&self) -> i32 {
        self.col
    }

    pub fn row(&self) -> i32 {
        self.row
    }

    pub fn kind(&self) -> ChangeKind {
        self.kind
    }

    pub fn tile_data(&self) -> &Arc<TileData> {
        self.data.data()
    }

    pub fn parent(&self) -> Option<Arc<MementoItem>> {
        self.parent.lock().clone()
    }

    fn set_parent(&self, parent: Option<Arc<MementoItem>>) {
        *self.parent.lock() = parent;
    }
}

impl Drop for MementoItem {
    // Long chains are released iteratively.
    fn drop(&mut self) {
        let mut next = self.parent.get_mut().take();
        while let Some(item) = next {
            next = Arc::into_inner(item).and_then(|mut item| item.parent.get_mut().take());
        }
    }
}

impl fmt::Debug for MementoItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MementoItem")
            .field("col", &self.col)
            .field("row", &self.row)
            .field("kind", &self.kind)
            .field("data", &self.tile_data().id())
            .field("has_parent", &self.parent.lock().is_some())
            .finish()
    }
}

#[derive(Debug, Default)]
struct MementoState {
    extent: Rect,
    old_default_pixel: Option<Vec<u8>>,
    new_default_pixel: Option<Vec<u8>>,
}

/// Handle naming one revision boundary, held by undo/redo machinery.
#[derive(Debug)]
pub struct Memento {
    id: u64,
    state: Mutex<MementoState>,
}

impl Memento {
    fn new(id: u64) -> Self {
        Self {
            id,
            state: Mutex::new(MementoState::default()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Union of the tiles changed under this memento.
    pub fn extent(&self) -> Rect {
        self.state.lock().extent
    }

    pub fn old_default_pixel(&self) -> Option<Vec<u8>> {
        self.state.lock().old_default_pixel.clone()
    }

    pub fn new_default_pixel(&self) -> Option<Vec<u8>> {
        self.state.lock().new_default_pixel.clone()
    }

    pub(crate) fn save_old_default_pixel(&self, pixel: &[u8]) {
        self.state.lock().old_default_pixel = Some(pixel.to_vec());
    }

    pub(crate) fn save_new_default_pixel(&self, pixel: &[u8]) {
        self.state.lock().new_default_pixel = Some(pixel.to_vec());
    }

    fn update_extent(&self, col: i32, row: i32) {
        let mut state = self.state.lock();
        state.extent = state.extent.united(&Rect::of_tile(col, row));
    }
}

#[derive(Debug)]
struct Revision {
    memento: Option<Arc<Memento>>,
    items: Vec<Arc<MementoItem>>,
}

#[derive(Debug, Default)]
struct HistoryState {
    revisions: Vec<Revision>,
    /// Undone revisions, most recent first.
    cancelled: VecDeque<Revision>,
    current: Option<Arc<Memento>>,
}

impl HistoryState {
    fn position(&self, memento: &Arc<Memento>) -> Option<usize> {
        self.revisions.iter().position(|revision| {
            revision
                .memento
                .as_ref()
                .is_some_and(|m| Arc::ptr_eq(m, memento))
        })
    }
}

/// Revision history of one tile grid.
pub struct MementoManager {
    pending: DashMap<u64, PendingChange>,
    heads: DashMap<u64, Arc<MementoItem>>,
    default_data: RwLock<Arc<TileData>>,
    history: Mutex<HistoryState>,
    blocked: AtomicUsize,
    next_memento_id: AtomicU64,
}

/// Suppresses registration while history is being replayed.
struct RegistrationBlock<'a>(&'a AtomicUsize);

impl<'a> RegistrationBlock<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for RegistrationBlock<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl MementoManager {
    pub fn new(default_data: &Arc<TileData>) -> Self {
        Self {
            pending: DashMap::new(),
            heads: DashMap::new(),
            default_data: RwLock::new(default_data.clone()),
            history: Mutex::new(HistoryState::default()),
            blocked: AtomicUsize::new(0),
            next_memento_id: AtomicU64::new(1),
        }
    }

    /// Data recorded for deleted tiles and for tiles with no history yet.
    pub fn set_default_tile_data(&self, data: &Arc<TileData>) {
        *self.default_data.write() = data.clone();
    }

    fn default_data(&self) -> Arc<TileData> {
        self.default_data.read().clone()
    }

    fn registration_blocked(&self) -> bool {
        self.blocked.load(Ordering::Acquire) > 0
    }

    fn register(&self, change: PendingChange) {
        if self.registration_blocked() {
            return;
        }
        let (col, row) = (change.col, change.row);
        let fresh = self.pending.insert(tile_key(col, row), change).is_none();
        if fresh {
            if let Some(memento) = self.current_memento() {
                memento.update_extent(col, row);
            }
        }
    }

    /// Records `data` as the pending version of tile `(col, row)`, replacing
    /// an earlier registration in the same transaction.
    pub fn register_tile_change(&self, col: i32, row: i32, data: &Arc<TileData>) {
        self.register(PendingChange {
            col,
            row,
            kind: ChangeKind::Changed,
            data: data.clone(),
        });
    }

    pub fn register_tile_deleted(&self, col: i32, row: i32) {
        self.register(PendingChange {
            col,
            row,
            kind: ChangeKind::Deleted,
            data: self.default_data(),
        });
    }

    /// Head of `key`, creating a deleted placeholder when the tile has no
    /// history yet.
    fn head_lazy(&self, col: i32, row: i32) -> Arc<MementoItem> {
        self.heads
            .entry(tile_key(col, row))
            .or_insert_with(|| Arc::new(MementoItem::placeholder(col, row, &self.default_data())))
            .clone()
    }

    /// Folds pending changes into a new revision. A named transaction
    /// closes even when nothing changed.
    pub fn commit(&self) {
        let mut history = self.history.lock();
        self.commit_locked(&mut history);
    }

    fn commit_locked(&self, history: &mut HistoryState) {
        let keys: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        let mut items = Vec::with_capacity(keys.len());
        for key in keys {
            let Some((_, change)) = self.pending.remove(&key) else {
                continue;
            };
            let parent = self.head_lazy(change.col, change.row);
            let item = Arc::new(MementoItem::committed(&change));
            item.set_parent(Some(parent));
            self.heads.insert(key, item.clone());
            items.push(item);
        }
        let memento = history.current.take();
        if items.is_empty() && memento.is_none() {
            return;
        }
        debug!(
            items = items.len(),
            memento = memento.as_ref().map(|m| m.id()),
            "history commit"
        );
        history.revisions.push(Revision { memento, items });
    }

    /// Opens a named transaction. Pending anonymous changes are committed
    /// first and the redo stack is discarded.
    pub fn get_memento(&self) -> Arc<Memento> {
        let mut history = self.history.lock();
        if history.current.is_some() {
            error!("nested named transaction requested");
            debug_assert!(false, "nested named transaction requested");
        }
        history.cancelled.clear();
        self.commit_locked(&mut history);
        let memento = Arc::new(Memento::new(
            self.next_memento_id.fetch_add(1, Ordering::Relaxed),
        ));
        history.current = Some(memento.clone());
        memento
    }

    pub fn current_memento(&self) -> Option<Arc<Memento>> {
        self.history.lock().current.clone()
    }

    pub fn has_current_memento(&self) -> bool {
        self.history.lock().current.is_some()
    }

    /// The version committed before the open transaction, as a detached
    /// tile. `None` when no named transaction is open.
    pub fn get_committed_tile(&self, col: i32, row: i32) -> Option<Arc<Tile>> {
        self.get_committed_tile_with_flag(col, row).map(|(tile, _)| tile)
    }

    /// Like [`get_committed_tile`](Self::get_committed_tile); the flag tells
    /// whether the committed version is a real tile rather than a deletion
    /// or the default data.
    pub fn get_committed_tile_with_flag(&self, col: i32, row: i32) -> Option<(Arc<Tile>, bool)> {
        if !self.has_current_memento() {
            return None;
        }
        let (data, exists) = match self.heads.get(&tile_key(col, row)) {
            Some(head) => (head.tile_data().clone(), head.kind() == ChangeKind::Changed),
            None => (self.default_data(), false),
        };
        Some((Arc::new(Tile::new(col, row, &data, None)), exists))
    }

    /// Undoes the latest revision on `index`. Open changes are committed
    /// first.
    #[instrument(skip_all)]
    pub fn rollback(&self, index: &TileIndex) {
        let mut history = self.history.lock();
        self.commit_locked(&mut history);
        let Some(revision) = history.revisions.pop() else {
            return;
        };
        let _block = RegistrationBlock::new(&self.blocked);
        for item in revision.items.iter().rev() {
            let Some(parent) = item.parent() else {
                error!(col = item.col, row = item.row, "history item without parent");
                debug_assert!(false, "history item without parent");
                index.delete_tile(item.col, item.row);
                continue;
            };
            match parent.kind() {
                ChangeKind::Changed => {
                    index.add_tile_with_data(item.col, item.row, parent.tile_data());
                }
                ChangeKind::Deleted => {
                    index.delete_tile(item.col, item.row);
                }
            }
            self.heads.insert(tile_key(item.col, item.row), parent);
        }
        debug!(items = revision.items.len(), "history rollback");
        history.cancelled.push_front(revision);
    }

    /// Redoes the most recently undone revision on `index`.
    #[instrument(skip_all)]
    pub fn rollforward(&self, index: &TileIndex) {
        let mut history = self.history.lock();
        let Some(revision) = history.cancelled.pop_front() else {
            return;
        };
        {
            let _block = RegistrationBlock::new(&self.blocked);
            for item in &revision.items {
                let parent_changed = item
                    .parent()
                    .is_some_and(|parent| parent.kind() == ChangeKind::Changed);
                if parent_changed {
                    index.delete_tile(item.col, item.row);
                }
                if item.kind == ChangeKind::Changed {
                    index.add_tile_with_data(item.col, item.row, item.tile_data());
                }
            }
        }
        for item in &revision.items {
            self.pending.insert(
                tile_key(item.col, item.row),
                PendingChange {
                    col: item.col,
                    row: item.row,
                    kind: item.kind,
                    data: item.tile_data().clone(),
                },
            );
        }
        debug!(items = revision.items.len(), "history rollforward");
        history.current = revision.memento;
        drop(revision.items);
        self.commit_locked(&mut history);
    }

    /// Forgets every revision older than `oldest`. Items of the boundary
    /// revision keep their parent but lose the grandparent.
    #[instrument(skip_all, fields(memento = oldest.id()))]
    pub fn purge_history(&self, oldest: &Arc<Memento>) {
        let mut history = self.history.lock();
        if history
            .current
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, oldest))
        {
            self.commit_locked(&mut history);
        }
        let Some(position) = history.position(oldest) else {
            warn!("purge requested for a memento that is not in history");
            return;
        };
        let purged: Vec<Revision> = history.revisions.drain(..position).collect();
        if let Some(boundary) = history.revisions.first() {
            for item in &boundary.items {
                if let Some(parent) = item.parent() {
                    parent.set_parent(None);
                }
            }
        }
        debug!(purged = purged.len(), "history purged");
    }

    pub fn revision_count(&self) -> usize {
        self.history.lock().revisions.len()
    }

    pub fn redo_count(&self) -> usize {
        self.history.lock().cancelled.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Logs the history layout at debug level.
    pub fn debug_print_info(&self) {
        let history = self.history.lock();
        debug!(
            revisions = history.revisions.len(),
            cancelled = history.cancelled.len(),
            pending = self.pending.len(),
            heads = self.heads.len(),
            current = history.current.as_ref().map(|m| m.id()),
            "memento manager"
        );
        for (idx, revision) in history.revisions.iter().enumerate() {
            debug!(
                idx,
                memento = revision.memento.as_ref().map(|m| m.id()),
                items = revision.items.len(),
                "revision"
            );
        }
    }
}

impl fmt::Debug for MementoManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MementoManager")
            .field("pending", &self.pending.len())
            .field("heads", &self.heads.len())
            .field("revisions", &self.revision_count())
            .field("redo", &self.redo_count())
            .finish()
    }
}
