use std::fmt;
use std::sync::Arc;

use bop_lockfree::ConcurrentMap;
use parking_lot::RwLock;

use crate::memento::MementoManager;
use crate::tile::Tile;
use crate::tile_data::{TileData, TileDataUser};

/// Map key of tile `(col, row)`. Flipping the sign bits keeps `(0, 0)` away
/// from the map's reserved zero key; only `(i32::MIN, i32::MIN)` maps to it.
#[inline]
pub fn tile_key(col: i32, row: i32) -> u64 {
    (((row as u32 as u64) << 32) | col as u32 as u64) ^ 0x8000_0000_8000_0000
}

/// Sparse grid of tiles over the lock-free map. Missing tiles read as the
/// default data.
pub struct TileIndex {
    tiles: ConcurrentMap<Tile>,
    default_data: RwLock<TileDataUser>,
    memento: Option<Arc<MementoManager>>,
}

impl TileIndex {
    pub fn new(default_data: &Arc<TileData>, memento: Option<Arc<MementoManager>>) -> Self {
        Self {
            tiles: ConcurrentMap::new(),
            default_data: RwLock::new(default_data.acquire()),
            memento,
        }
    }

    pub fn default_tile_data(&self) -> Arc<TileData> {
        self.default_data.read().data().clone()
    }

    pub fn set_default_tile_data(&self, data: &Arc<TileData>) {
        *self.default_data.write() = data.acquire();
    }

    pub fn tile_exists(&self, col: i32, row: i32) -> bool {
        self.tiles.contains_key(tile_key(col, row))
    }

    pub fn get_existing(&self, col: i32, row: i32) -> Option<Arc<Tile>> {
        self.tiles.get(tile_key(col, row))
    }

    /// The tile at `(col, row)`, created over the default data when absent.
    /// The flag is `true` when this call created it; a created tile is
    /// registered as a change.
    pub fn get_tile_lazy(&self, col: i32, row: i32) -> (Arc<Tile>, bool) {
        let key = tile_key(col, row);
        if let Some(tile) = self.tiles.get(key) {
            return (tile, false);
        }
        let default = self.default_tile_data();
        let (tile, created) = self
            .tiles
            .get_or_insert_with(key, || Tile::new(col, row, &default, self.memento.clone()));
        if created {
            tile.register_change();
        }
        (tile, created)
    }

    /// The tile at `(col, row)`, or a detached tile over the default data
    /// that is never inserted.
    pub fn get_read_only_tile_lazy(&self, col: i32, row: i32) -> Arc<Tile> {
        match self.tiles.get(tile_key(col, row)) {
            Some(tile) => tile,
            None => Arc::new(Tile::new(col, row, &self.default_tile_data(), None)),
        }
    }

    /// Inserts `tile`, replacing any tile at its position.
    pub fn add_tile(&self, tile: Arc<Tile>) -> Option<Arc<Tile>> {
        self.tiles.assign(tile_key(tile.col(), tile.row()), tile)
    }

    /// Inserts a new tile over `data` without recording a change.
    pub fn add_tile_with_data(&self, col: i32, row: i32, data: &Arc<TileData>) -> Arc<Tile> {
        let tile = Arc::new(Tile::new(col, row, data, self.memento.clone()));
        self.add_tile(tile.clone());
        tile
    }

    pub(crate) fn memento(&self) -> Option<&Arc<MementoManager>> {
        self.memento.as_ref()
    }

    /// Removes the tile and records the deletion. Returns whether a tile
    /// was present.
    pub fn delete_tile(&self, col: i32, row: i32) -> bool {
        let removed = self.tiles.erase(tile_key(col, row)).is_some();
        if removed {
            if let Some(memento) = &self.memento {
                memento.register_tile_deleted(col, row);
            }
        }
        removed
    }

    /// Weakly consistent copy of every tile.
    pub fn tiles(&self) -> Vec<Arc<Tile>> {
        self.tiles
            .snapshot()
            .into_iter()
            .map(|(_, tile)| tile)
            .collect()
    }

    pub fn num_tiles(&self) -> usize {
        self.tiles.len()
    }

    /// Deletes every tile, recording each deletion.
    pub fn clear(&self) {
        for tile in self.tiles.clear() {
            if let Some(memento) = &self.memento {
                memento.register_tile_deleted(tile.col(), tile.row());
            }
        }
        self.tiles.reclaim();
    }

    /// Releases tiles erased earlier once no reader can still see them.
    pub fn reclaim(&self) -> usize {
        self.tiles.reclaim()
    }
}

impl fmt::Debug for TileIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TileIndex")
            .field("tiles", &self.tiles.len())
            .field("default_data", &self.default_tile_data().id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_unique_and_non_zero() {
        let coords = [(0, 0), (1, 0), (0, 1), (-1, 0), (0, -1), (i32::MAX, i32::MIN)];
        let keys: std::collections::HashSet<u64> =
            coords.iter().map(|&(c, r)| tile_key(c, r)).collect();
        assert_eq!(keys.len(), coords.len());
        assert!(!keys.contains(&0));
        assert_eq!(tile_key(i32::MIN, i32::MIN), 0);
    }

    #[test]
    fn lazy_tiles_share_default_data() {
        let default = TileData::standalone(1, &[3]);
        let index = TileIndex::new(&default, None);
        let (tile, created) = index.get_tile_lazy(-4, 7);
        assert!(created);
        assert!(Arc::ptr_eq(&tile.tile_data(), &default));
        let (again, created) = index.get_tile_lazy(-4, 7);
        assert!(!created);
        assert!(Arc::ptr_eq(&tile, &again));
        assert_eq!(index.num_tiles(), 1);

        let detached = index.get_read_only_tile_lazy(0, 0);
        assert_eq!(detached.read().unwrap()[0], 3);
        assert_eq!(index.num_tiles(), 1);
    }

    #[test]
    fn deletion_is_recorded_in_history() {
        let default = TileData::standalone(1, &[0]);
        let memento = Arc::new(MementoManager::new(&default));
        let index = TileIndex::new(&default, Some(memento.clone()));
        index.get_tile_lazy(1, 1);
        assert_eq!(memento.pending_count(), 1);
        memento.commit();

        assert!(index.delete_tile(1, 1));
        assert!(!index.delete_tile(1, 1));
        assert_eq!(memento.pending_count(), 1);
        memento.commit();
        assert_eq!(memento.revision_count(), 2);
    }
}
