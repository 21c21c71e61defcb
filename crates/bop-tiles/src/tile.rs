use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::error::TileResult;
use crate::geometry::Rect;
use crate::memento::MementoManager;
use crate::tile_data::{TileData, TileDataReadGuard, TileDataUser, TileDataWriteGuard};

/// One grid cell. Owns a user of its current [`TileData`]; the data it
/// points to changes when a write forces a copy.
pub struct Tile {
    col: i32,
    row: i32,
    data: Mutex<TileDataUser>,
    memento: Option<Arc<MementoManager>>,
}

impl Tile {
    pub fn new(
        col: i32,
        row: i32,
        data: &Arc<TileData>,
        memento: Option<Arc<MementoManager>>,
    ) -> Self {
        Self {
            col,
            row,
            data: Mutex::new(data.acquire()),
            memento,
        }
    }

    pub fn col(&self) -> i32 {
        self.col
    }

    pub fn row(&self) -> i32 {
        self.row
    }

    /// Canvas rectangle covered by this tile.
    pub fn extent(&self) -> Rect {
        Rect::of_tile(self.col, self.row)
    }

    /// Current data version.
    pub fn tile_data(&self) -> Arc<TileData> {
        self.data.lock().data().clone()
    }

    /// Read access to the current version.
    pub fn read(&self) -> TileResult<TileDataReadGuard> {
        let data = self.tile_data();
        data.touch();
        data.read()
    }

    /// Write access. A version shared with another tile or with history is
    /// copied first and the copy is recorded as this tile's change.
    pub fn write(&self) -> TileResult<TileDataWriteGuard> {
        let mut slot = self.data.lock();
        if slot.data().users() > 1 {
            let copy = slot.data().duplicate()?;
            trace!(
                col = self.col,
                row = self.row,
                from = slot.data().id(),
                to = copy.id(),
                "copy on write"
            );
            *slot = copy.acquire();
            if let Some(memento) = &self.memento {
                memento.register_tile_change(self.col, self.row, &copy);
            }
        }
        let data = slot.data().clone();
        data.touch();
        let guard = data.write()?;
        drop(slot);
        Ok(guard)
    }

    /// Records the current version as this tile's pending change.
    pub(crate) fn register_change(&self) {
        if let Some(memento) = &self.memento {
            let slot = self.data.lock();
            memento.register_tile_change(self.col, self.row, slot.data());
        }
    }

    /// Replaces the current version without touching history.
    pub(crate) fn set_data(&self, data: &Arc<TileData>) {
        *self.data.lock() = data.acquire();
    }
}

impl fmt::Debug for Tile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tile")
            .field("col", &self.col)
            .field("row", &self.row)
            .field("data", &self.tile_data().id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_version_is_copied_on_write() {
        let shared = TileData::standalone(1, &[4]);
        let a = Tile::new(0, 0, &shared, None);
        let b = Tile::new(1, 0, &shared, None);
        assert_eq!(shared.users(), 2);

        a.write().unwrap()[0] = 9;
        assert!(!Arc::ptr_eq(&a.tile_data(), &b.tile_data()));
        assert_eq!(a.read().unwrap()[0], 9);
        assert_eq!(b.read().unwrap()[0], 4);
        assert_eq!(shared.users(), 1);
    }

    #[test]
    fn sole_user_writes_in_place() {
        let data = TileData::standalone(1, &[0]);
        let tile = Tile::new(3, -2, &data, None);
        tile.write().unwrap()[1] = 5;
        assert!(Arc::ptr_eq(&tile.tile_data(), &data));
        assert_eq!(tile.extent(), Rect::new(192, -128, 64, 64));
    }
}
