//! Tiled pixel storage.
//!
//! A [`TiledDataManager`] is an unbounded, sparse grid of 64x64 pixel
//! tiles. Tiles point at shared, copy-on-write [`TileData`] versions owned
//! by a [`TileDataStore`], which keeps resident memory under a ceiling by
//! pre-cloning hot versions and compressing cold ones into a swap file.
//! Every change goes through a [`MementoManager`] so whole transactions
//! can be undone and redone.

pub mod codec;
mod config;
mod data_manager;
mod error;
mod extent;
mod geometry;
mod memento;
mod store;
pub mod swap;
pub mod test_support;
mod tile;
mod tile_data;
mod tile_index;

/// Tile width in pixels.
pub const TILE_WIDTH: usize = 64;
/// Tile height in pixels.
pub const TILE_HEIGHT: usize = 64;

pub use config::{
    PoolerConfig, SwapCompression, SwapperConfig, TileStoreConfig, DEFAULT_MAX_CLONES,
    DEFAULT_MEMORY_LIMIT_BYTES, DEFAULT_POOL_LIMIT_BYTES, DEFAULT_SOFT_LIMIT_BYTES,
    DEFAULT_SWAP_CAPACITY_BYTES, DEFAULT_SWAP_WINDOW_BYTES, DEFAULT_ZSTD_LEVEL,
};
pub use data_manager::TiledDataManager;
pub use error::{TileError, TileResult};
pub use extent::ExtentManager;
pub use geometry::{x_to_col, y_to_row, Rect};
pub use memento::{ChangeKind, Memento, MementoItem, MementoManager};
pub use store::{ClockIter, PoolerCycle, StoreLimits, SwapperCycle, TileDataStore, TileStoreSnapshot};
pub use tile::Tile;
pub use tile_data::{TileData, TileDataReadGuard, TileDataUser, TileDataWriteGuard};
pub use tile_index::{tile_key, TileIndex};
