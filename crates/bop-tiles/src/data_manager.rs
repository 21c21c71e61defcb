//! Facade over one tile grid: tile access, undo history, rectangle
//! operations, byte access and the tile stream.

use std::fmt;
use std::io::{BufRead, Write};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, instrument, warn};

use crate::codec::{compressor_for_version, read_header, write_header, CURRENT_VERSION};
use crate::error::{TileError, TileResult};
use crate::extent::ExtentManager;
use crate::geometry::Rect;
use crate::memento::{Memento, MementoManager};
use crate::store::TileDataStore;
use crate::tile::Tile;
use crate::tile_data::{fill_pixels, TileData};
use crate::tile_index::TileIndex;
use crate::{TILE_HEIGHT, TILE_WIDTH};

/// Every tile touched by `rect`, with the part of `rect` inside it.
fn tile_spans(rect: Rect) -> impl Iterator<Item = (i32, i32, Rect)> {
    rect.tile_span().into_iter().flat_map(move |(c0, r0, c1, r1)| {
        (r0..=r1).flat_map(move |row| {
            (c0..=c1).map(move |col| (col, row, rect.intersected(&Rect::of_tile(col, row))))
        })
    })
}

/// Byte offset of canvas point `(x, y)` inside its tile.
#[inline]
fn offset_in_tile(x: i32, y: i32, pixel_size: usize) -> usize {
    let tx = x.rem_euclid(TILE_WIDTH as i32) as usize;
    let ty = y.rem_euclid(TILE_HEIGHT as i32) as usize;
    (ty * TILE_WIDTH + tx) * pixel_size
}

/// A sparse, unbounded grid of tiles with copy-on-write tiles and undo
/// history.
pub struct TiledDataManager {
    store: Arc<TileDataStore>,
    pixel_size: usize,
    default_pixel: RwLock<Vec<u8>>,
    memento: Arc<MementoManager>,
    index: TileIndex,
    extent: ExtentManager,
    lock: RwLock<()>,
}

impl TiledDataManager {
    pub fn new(
        store: Arc<TileDataStore>,
        pixel_size: usize,
        default_pixel: &[u8],
    ) -> TileResult<Self> {
        let default = store.allocate(pixel_size, default_pixel)?;
        let memento = Arc::new(MementoManager::new(&default));
        let index = TileIndex::new(&default, Some(memento.clone()));
        Ok(Self {
            store,
            pixel_size,
            default_pixel: RwLock::new(default_pixel.to_vec()),
            memento,
            index,
            extent: ExtentManager::new(),
            lock: RwLock::new(()),
        })
    }

    /// A grid sharing every tile version of this one, with empty history.
    pub fn fork(&self) -> Self {
        let _guard = self.lock.read();
        let default = self.index.default_tile_data();
        let memento = Arc::new(MementoManager::new(&default));
        let index = TileIndex::new(&default, Some(memento.clone()));
        for tile in self.index.tiles() {
            index.add_tile_with_data(tile.col(), tile.row(), &tile.tile_data());
        }
        let forked = Self {
            store: self.store.clone(),
            pixel_size: self.pixel_size,
            default_pixel: RwLock::new(self.default_pixel()),
            memento,
            index,
            extent: ExtentManager::new(),
            lock: RwLock::new(()),
        };
        forked.recalculate_extent();
        forked
    }

    pub fn store(&self) -> &Arc<TileDataStore> {
        &self.store
    }

    pub fn memento_manager(&self) -> &Arc<MementoManager> {
        &self.memento
    }

    pub fn pixel_size(&self) -> usize {
        self.pixel_size
    }

    pub fn default_pixel(&self) -> Vec<u8> {
        self.default_pixel.read().clone()
    }

    fn check_pixel(&self, pixel: &[u8]) -> TileResult<()> {
        if pixel.len() != self.pixel_size {
            return Err(TileError::PixelSizeMismatch {
                expected: self.pixel_size,
                found: pixel.len(),
            });
        }
        Ok(())
    }

    /// Changes the pixel that missing tiles read as. Recorded in the open
    /// memento, if any.
    pub fn set_default_pixel(&self, pixel: &[u8]) -> TileResult<()> {
        self.check_pixel(pixel)?;
        let _guard = self.lock.write();
        self.set_default_pixel_impl(pixel)
    }

    fn set_default_pixel_impl(&self, pixel: &[u8]) -> TileResult<()> {
        let data = self.store.allocate(self.pixel_size, pixel)?;
        self.index.set_default_tile_data(&data);
        self.memento.set_default_tile_data(&data);
        *self.default_pixel.write() = pixel.to_vec();
        Ok(())
    }

    pub fn num_tiles(&self) -> usize {
        self.index.num_tiles()
    }

    // Tile access

    /// The tile at `(col, row)`. A writable request creates a missing tile;
    /// a read-only one returns a detached tile over the default data.
    pub fn get_tile(&self, col: i32, row: i32, writable: bool) -> Arc<Tile> {
        if writable {
            let (tile, created) = self.index.get_tile_lazy(col, row);
            if created {
                self.extent.notify_tile_added(col, row);
            }
            tile
        } else {
            self.index.get_read_only_tile_lazy(col, row)
        }
    }

    /// The version committed before the open transaction, or the live tile
    /// when no named transaction is open.
    pub fn get_old_tile(&self, col: i32, row: i32) -> Arc<Tile> {
        self.old_tile(col, row).0
    }

    fn old_tile(&self, col: i32, row: i32) -> (Arc<Tile>, bool) {
        if let Some(committed) = self.memento.get_committed_tile_with_flag(col, row) {
            return committed;
        }
        self.read_only_tile(col, row)
    }

    fn read_only_tile(&self, col: i32, row: i32) -> (Arc<Tile>, bool) {
        match self.index.get_existing(col, row) {
            Some(tile) => (tile, true),
            None => (self.index.get_read_only_tile_lazy(col, row), false),
        }
    }

    /// Puts a tile over `data` at `(col, row)`, replacing what was there,
    /// and records the change.
    fn insert_shared_tile(&self, col: i32, row: i32, data: &Arc<TileData>, was_deleted: bool) {
        let tile = self.index.add_tile_with_data(col, row, data);
        tile.register_change();
        if !was_deleted {
            self.extent.notify_tile_added(col, row);
        }
    }

    fn delete_tile(&self, col: i32, row: i32) -> bool {
        let deleted = self.index.delete_tile(col, row);
        if deleted {
            self.extent.notify_tile_removed(col, row);
        }
        deleted
    }

    // History

    /// Opens a named transaction.
    pub fn get_memento(&self) -> Arc<Memento> {
        let memento = self.memento.get_memento();
        memento.save_old_default_pixel(&self.default_pixel());
        memento
    }

    pub fn has_current_memento(&self) -> bool {
        self.memento.has_current_memento()
    }

    /// Folds pending changes into history and wakes the store workers.
    pub fn commit(&self) {
        let _guard = self.lock.write();
        self.commit_locked();
    }

    fn commit_locked(&self) {
        if let Some(memento) = self.memento.current_memento() {
            memento.save_new_default_pixel(&self.default_pixel());
        }
        self.memento.commit();
        self.index.reclaim();
        self.store.kick_pooler();
        self.store.kick_swapper();
    }

    /// Undoes the latest revision. `memento` supplies the default pixel to
    /// restore.
    #[instrument(skip_all, fields(memento = memento.id()))]
    pub fn rollback(&self, memento: &Arc<Memento>) -> TileResult<()> {
        let _guard = self.lock.write();
        self.commit_locked();
        self.memento.rollback(&self.index);
        if let Some(pixel) = memento.old_default_pixel() {
            if pixel != self.default_pixel() {
                self.set_default_pixel_impl(&pixel)?;
            }
        }
        self.recalculate_extent();
        self.index.reclaim();
        Ok(())
    }

    /// Redoes the most recently undone revision.
    #[instrument(skip_all, fields(memento = memento.id()))]
    pub fn rollforward(&self, memento: &Arc<Memento>) -> TileResult<()> {
        let _guard = self.lock.write();
        self.commit_locked();
        self.memento.rollforward(&self.index);
        if let Some(pixel) = memento.new_default_pixel() {
            if pixel != self.default_pixel() {
                self.set_default_pixel_impl(&pixel)?;
            }
        }
        self.recalculate_extent();
        self.index.reclaim();
        Ok(())
    }

    /// Forgets history older than `oldest`.
    pub fn purge_history(&self, oldest: &Arc<Memento>) {
        self.memento.purge_history(oldest);
    }

    // Rectangle operations

    /// Fills `rect` with `pixel`. Whole tiles are replaced by one shared
    /// filled data, or dropped when `pixel` is the default.
    #[instrument(skip(self, pixel))]
    pub fn clear_rect(&self, rect: Rect, pixel: &[u8]) -> TileResult<()> {
        self.check_pixel(pixel)?;
        if rect.is_empty() {
            return Ok(());
        }
        let is_default = pixel == self.default_pixel().as_slice();
        let rect = if is_default {
            rect.intersected(&self.extent())
        } else {
            rect
        };
        let mut filled: Option<Arc<TileData>> = None;
        for (col, row, span) in tile_spans(rect) {
            if span == Rect::of_tile(col, row) {
                self.delete_tile(col, row);
                if !is_default {
                    let data = match &filled {
                        Some(data) => data.clone(),
                        None => {
                            let data = self.store.allocate(self.pixel_size, pixel)?;
                            filled = Some(data.clone());
                            data
                        }
                    };
                    self.insert_shared_tile(col, row, &data, false);
                }
            } else {
                let tile = self.get_tile(col, row, true);
                let mut guard = tile.write()?;
                let line = span.width as usize * self.pixel_size;
                for y in span.y..span.bottom() {
                    let start = offset_in_tile(span.x, y, self.pixel_size);
                    fill_pixels(&mut guard[start..start + line], pixel);
                }
            }
        }
        Ok(())
    }

    /// Fills `rect` with pixels whose every byte is `value`.
    pub fn clear_rect_with(&self, rect: Rect, value: u8) -> TileResult<()> {
        self.clear_rect(rect, &vec![value; self.pixel_size])
    }

    /// Drops every tile.
    pub fn clear(&self) {
        self.index.clear();
        self.extent.clear();
    }

    /// Copies `rect` from `src`, sharing whole tiles.
    pub fn bit_blt(&self, src: &TiledDataManager, rect: Rect) -> TileResult<()> {
        self.bit_blt_impl(src, rect, false)
    }

    /// Like [`bit_blt`](Self::bit_blt), reading `src`'s committed versions.
    pub fn bit_blt_old_data(&self, src: &TiledDataManager, rect: Rect) -> TileResult<()> {
        self.bit_blt_impl(src, rect, true)
    }

    fn source_tile(src: &TiledDataManager, col: i32, row: i32, old: bool) -> (Arc<Tile>, bool) {
        if old {
            src.old_tile(col, row)
        } else {
            src.read_only_tile(col, row)
        }
    }

    fn share_tile(&self, src_tile: &Tile, exists: bool, defaults_coincide: bool) {
        let (col, row) = (src_tile.col(), src_tile.row());
        let was_deleted = self.index.delete_tile(col, row);
        if exists || !defaults_coincide {
            self.insert_shared_tile(col, row, &src_tile.tile_data(), was_deleted);
        } else if was_deleted {
            self.extent.notify_tile_removed(col, row);
        }
    }

    fn bit_blt_impl(&self, src: &TiledDataManager, rect: Rect, old: bool) -> TileResult<()> {
        if rect.is_empty() || std::ptr::eq(self, src) {
            return Ok(());
        }
        self.check_pixel(&src.default_pixel())?;
        let defaults_coincide = src.default_pixel() == self.default_pixel();
        let mut scratch = Vec::new();
        for (col, row, span) in tile_spans(rect) {
            let (src_tile, exists) = Self::source_tile(src, col, row, old);
            if span == Rect::of_tile(col, row) {
                self.share_tile(&src_tile, exists, defaults_coincide);
                continue;
            }
            let line = span.width as usize * self.pixel_size;
            scratch.clear();
            {
                let source = src_tile.read()?;
                for y in span.y..span.bottom() {
                    let start = offset_in_tile(span.x, y, self.pixel_size);
                    scratch.extend_from_slice(&source[start..start + line]);
                }
            }
            let tile = self.get_tile(col, row, true);
            let mut guard = tile.write()?;
            for (i, y) in (span.y..span.bottom()).enumerate() {
                let start = offset_in_tile(span.x, y, self.pixel_size);
                guard[start..start + line].copy_from_slice(&scratch[i * line..(i + 1) * line]);
            }
        }
        Ok(())
    }

    /// Shares every tile touched by `rect`, ignoring the partial borders.
    pub fn bit_blt_rough(&self, src: &TiledDataManager, rect: Rect) -> TileResult<()> {
        self.bit_blt_rough_impl(src, rect, false)
    }

    pub fn bit_blt_rough_old_data(&self, src: &TiledDataManager, rect: Rect) -> TileResult<()> {
        self.bit_blt_rough_impl(src, rect, true)
    }

    fn bit_blt_rough_impl(&self, src: &TiledDataManager, rect: Rect, old: bool) -> TileResult<()> {
        if rect.is_empty() || std::ptr::eq(self, src) {
            return Ok(());
        }
        self.check_pixel(&src.default_pixel())?;
        let defaults_coincide = src.default_pixel() == self.default_pixel();
        for (col, row, _) in tile_spans(rect) {
            let (src_tile, exists) = Self::source_tile(src, col, row, old);
            self.share_tile(&src_tile, exists, defaults_coincide);
        }
        Ok(())
    }

    /// Crops the grid to `rect`: tiles outside are dropped and the outside
    /// part of border tiles is reset to the default pixel.
    #[instrument(skip(self))]
    pub fn set_extent(&self, rect: Rect) -> TileResult<()> {
        if rect.contains(&self.extent()) {
            return Ok(());
        }
        let default = self.default_pixel();
        for tile in self.index.tiles() {
            let tile_rect = tile.extent();
            if rect.contains(&tile_rect) {
                continue;
            }
            if !rect.intersects(&tile_rect) {
                self.delete_tile(tile.col(), tile.row());
                continue;
            }
            let keep = rect
                .intersected(&tile_rect)
                .translated(-tile_rect.x, -tile_rect.y);
            let row_bytes = TILE_WIDTH * self.pixel_size;
            let mut guard = tile.write()?;
            for (y, line) in guard.chunks_exact_mut(row_bytes).enumerate() {
                let y = y as i32;
                if y < keep.y || y >= keep.bottom() {
                    fill_pixels(line, &default);
                    continue;
                }
                let left = keep.x as usize * self.pixel_size;
                let right = keep.right() as usize * self.pixel_size;
                fill_pixels(&mut line[..left], &default);
                fill_pixels(&mut line[right..], &default);
            }
        }
        Ok(())
    }

    /// Tile-aligned bounding rectangle of the grid.
    pub fn extent(&self) -> Rect {
        self.extent.extent()
    }

    /// Rebuilds the extent from the tiles present.
    pub fn recalculate_extent(&self) {
        self.extent
            .replace_tile_stats(self.index.tiles().iter().map(|t| (t.col(), t.row())));
    }

    /// Rectangles of every tile present.
    pub fn region(&self) -> Vec<Rect> {
        self.index.tiles().iter().map(|tile| tile.extent()).collect()
    }

    /// Drops tiles intersecting `area` whose content equals the default.
    pub fn purge(&self, area: Rect) -> TileResult<()> {
        let default = self.index.default_tile_data();
        let default_bytes = default.read()?;
        let mut doomed = Vec::new();
        for tile in self.index.tiles() {
            if !tile.extent().intersects(&area) {
                continue;
            }
            let data = tile.tile_data();
            if Arc::ptr_eq(&data, &default) || data.read()?[..] == default_bytes[..] {
                doomed.push((tile.col(), tile.row()));
            }
        }
        drop(default_bytes);
        let purged = doomed
            .into_iter()
            .filter(|&(col, row)| self.delete_tile(col, row))
            .count();
        debug!(purged, "purged default tiles");
        Ok(())
    }

    // Byte access

    pub fn pixel(&self, x: i32, y: i32) -> TileResult<Vec<u8>> {
        let tile = self.get_tile(x.div_euclid(TILE_WIDTH as i32), y.div_euclid(TILE_HEIGHT as i32), false);
        let guard = tile.read()?;
        let start = offset_in_tile(x, y, self.pixel_size);
        Ok(guard[start..start + self.pixel_size].to_vec())
    }

    pub fn set_pixel(&self, x: i32, y: i32, pixel: &[u8]) -> TileResult<()> {
        self.check_pixel(pixel)?;
        let tile = self.get_tile(x.div_euclid(TILE_WIDTH as i32), y.div_euclid(TILE_HEIGHT as i32), true);
        let mut guard = tile.write()?;
        let start = offset_in_tile(x, y, self.pixel_size);
        guard[start..start + self.pixel_size].copy_from_slice(pixel);
        Ok(())
    }

    fn check_buffer(&self, rect: Rect, len: usize, stride: usize) -> TileResult<()> {
        let line = rect.width as usize * self.pixel_size;
        let needed = (rect.height as usize - 1) * stride + line;
        if stride < line || len < needed {
            return Err(TileError::invalid_state(format!(
                "buffer of {len} bytes with stride {stride} cannot hold {rect:?}"
            )));
        }
        Ok(())
    }

    /// Copies `rect` into `out` as interleaved pixels, `rect.width` pixels
    /// per row.
    pub fn read_bytes(&self, rect: Rect, out: &mut [u8]) -> TileResult<()> {
        self.read_bytes_strided(rect, out, rect.width.max(0) as usize * self.pixel_size)
    }

    pub fn read_bytes_strided(&self, rect: Rect, out: &mut [u8], stride: usize) -> TileResult<()> {
        if rect.is_empty() {
            return Ok(());
        }
        self.check_buffer(rect, out.len(), stride)?;
        let _guard = self.lock.read();
        for (col, row, span) in tile_spans(rect) {
            let tile = self.index.get_read_only_tile_lazy(col, row);
            let source = tile.read()?;
            let line = span.width as usize * self.pixel_size;
            for y in span.y..span.bottom() {
                let src = offset_in_tile(span.x, y, self.pixel_size);
                let dst = (y - rect.y) as usize * stride + (span.x - rect.x) as usize * self.pixel_size;
                out[dst..dst + line].copy_from_slice(&source[src..src + line]);
            }
        }
        Ok(())
    }

    /// Writes interleaved pixels of `rect` from `data`, `rect.width` pixels
    /// per row.
    pub fn write_bytes(&self, rect: Rect, data: &[u8]) -> TileResult<()> {
        self.write_bytes_strided(rect, data, rect.width.max(0) as usize * self.pixel_size)
    }

    pub fn write_bytes_strided(&self, rect: Rect, data: &[u8], stride: usize) -> TileResult<()> {
        let _guard = self.lock.write();
        self.write_bytes_body(rect, data, stride)
    }

    fn write_bytes_body(&self, rect: Rect, data: &[u8], stride: usize) -> TileResult<()> {
        if rect.is_empty() {
            return Ok(());
        }
        self.check_buffer(rect, data.len(), stride)?;
        for (col, row, span) in tile_spans(rect) {
            let tile = self.get_tile(col, row, true);
            let mut guard = tile.write()?;
            let line = span.width as usize * self.pixel_size;
            for y in span.y..span.bottom() {
                let dst = offset_in_tile(span.x, y, self.pixel_size);
                let src = (y - rect.y) as usize * stride + (span.x - rect.x) as usize * self.pixel_size;
                guard[dst..dst + line].copy_from_slice(&data[src..src + line]);
            }
        }
        Ok(())
    }

    fn check_channels(&self, channel_sizes: &[usize]) -> TileResult<()> {
        let total: usize = channel_sizes.iter().sum();
        if total != self.pixel_size || channel_sizes.contains(&0) {
            return Err(TileError::PixelSizeMismatch {
                expected: self.pixel_size,
                found: total,
            });
        }
        Ok(())
    }

    /// Reads `rect` as one plane per channel.
    pub fn read_planar_bytes(&self, channel_sizes: &[usize], rect: Rect) -> TileResult<Vec<Vec<u8>>> {
        self.check_channels(channel_sizes)?;
        let pixels = rect.area().max(0) as usize;
        let mut interleaved = vec![0u8; pixels * self.pixel_size];
        self.read_bytes(rect, &mut interleaved)?;
        let mut planes: Vec<Vec<u8>> = channel_sizes
            .iter()
            .map(|size| Vec::with_capacity(size * pixels))
            .collect();
        for pixel in interleaved.chunks_exact(self.pixel_size) {
            let mut at = 0;
            for (plane, &size) in planes.iter_mut().zip(channel_sizes) {
                plane.extend_from_slice(&pixel[at..at + size]);
                at += size;
            }
        }
        Ok(planes)
    }

    /// Writes `rect` from one plane per channel. A `None` plane leaves that
    /// channel untouched.
    pub fn write_planar_bytes(
        &self,
        planes: &[Option<&[u8]>],
        channel_sizes: &[usize],
        rect: Rect,
    ) -> TileResult<()> {
        self.check_channels(channel_sizes)?;
        if planes.len() != channel_sizes.len() {
            return Err(TileError::invalid_state(format!(
                "{} planes for {} channels",
                planes.len(),
                channel_sizes.len()
            )));
        }
        let pixels = rect.area().max(0) as usize;
        for (plane, &size) in planes.iter().zip(channel_sizes) {
            if let Some(plane) = plane {
                if plane.len() < size * pixels {
                    return Err(TileError::invalid_state(format!(
                        "plane of {} bytes cannot hold {pixels} pixels",
                        plane.len()
                    )));
                }
            }
        }
        let mut interleaved = vec![0u8; pixels * self.pixel_size];
        if planes.iter().any(Option::is_none) {
            self.read_bytes(rect, &mut interleaved)?;
        }
        for (p, pixel) in interleaved.chunks_exact_mut(self.pixel_size).enumerate() {
            let mut at = 0;
            for (plane, &size) in planes.iter().zip(channel_sizes) {
                if let Some(plane) = plane {
                    pixel[at..at + size].copy_from_slice(&plane[p * size..(p + 1) * size]);
                }
                at += size;
            }
        }
        self.write_bytes(rect, &interleaved)
    }

    /// Columns from `x` to the right edge of its tile.
    pub fn num_contiguous_columns(&self, x: i32, _min_y: i32, _max_y: i32) -> i32 {
        TILE_WIDTH as i32 - x.rem_euclid(TILE_WIDTH as i32)
    }

    /// Rows from `y` to the bottom edge of its tile.
    pub fn num_contiguous_rows(&self, y: i32, _min_x: i32, _max_x: i32) -> i32 {
        TILE_HEIGHT as i32 - y.rem_euclid(TILE_HEIGHT as i32)
    }

    pub fn row_stride(&self, _x: i32, _y: i32) -> usize {
        TILE_WIDTH * self.pixel_size
    }

    // Tile stream

    /// Writes every tile as a version 2 stream.
    pub fn write_tiles(&self, out: &mut dyn Write) -> TileResult<()> {
        self.write_tiles_with_version(out, CURRENT_VERSION)
    }

    #[instrument(skip(self, out))]
    pub fn write_tiles_with_version(&self, out: &mut dyn Write, version: u32) -> TileResult<()> {
        let _guard = self.lock.read();
        let compressor = compressor_for_version(version)?;
        let tiles = self.index.tiles();
        write_header(out, version, self.pixel_size, tiles.len())?;
        for tile in &tiles {
            let data = tile.read()?;
            if let Err(err) = compressor.write_tile(tile.col(), tile.row(), &data, out) {
                warn!(col = tile.col(), row = tile.row(), error = %err, "failed to write tile");
                return Err(err);
            }
        }
        debug!(tiles = tiles.len(), version, "tile stream written");
        Ok(())
    }

    /// Replaces the grid with the tiles of a stream, as one transaction.
    /// Tiles read before an error are kept.
    #[instrument(skip(self, input))]
    pub fn read_tiles(&self, input: &mut dyn BufRead) -> TileResult<()> {
        self.clear();
        let _guard = self.lock.write();
        let _memento = self.memento.get_memento();
        let result = self.read_tiles_body(input);
        self.memento.commit();
        if let Err(err) = &result {
            warn!(error = %err, tiles = self.num_tiles(), "tile stream read incomplete");
        }
        result
    }

    fn read_tiles_body(&self, input: &mut dyn BufRead) -> TileResult<()> {
        let header = read_header(input, self.pixel_size)?;
        let compressor = compressor_for_version(header.version)?;
        for _ in 0..header.tile_count {
            let record = compressor.read_tile(input, self.pixel_size)?;
            let stride = record.rect.width.max(0) as usize * self.pixel_size;
            self.write_bytes_body(record.rect, &record.data, stride)?;
        }
        debug!(tiles = header.tile_count, version = header.version, "tile stream read");
        Ok(())
    }
}

impl fmt::Debug for TiledDataManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TiledDataManager")
            .field("pixel_size", &self.pixel_size)
            .field("default_pixel", &self.default_pixel())
            .field("tiles", &self.num_tiles())
            .field("extent", &self.extent())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TileStoreConfig;
    use tempfile::TempDir;

    fn grid(pixel_size: usize, default: &[u8]) -> (TempDir, TiledDataManager) {
        let dir = TempDir::new().expect("tempdir");
        let mut config = TileStoreConfig::for_testing(dir.path());
        config.pooler.enabled = false;
        config.swapper.enabled = false;
        let store = TileDataStore::new(config).expect("store");
        let dm = TiledDataManager::new(store, pixel_size, default).expect("grid");
        (dir, dm)
    }

    #[test]
    fn contiguous_columns_and_rows() {
        let (_dir, dm) = grid(1, &[0]);
        assert_eq!(dm.num_contiguous_columns(0, 0, 0), 64);
        assert_eq!(dm.num_contiguous_columns(63, 0, 0), 1);
        assert_eq!(dm.num_contiguous_columns(-1, 0, 0), 1);
        assert_eq!(dm.num_contiguous_columns(-64, 0, 0), 64);
        assert_eq!(dm.num_contiguous_rows(70, 0, 0), 58);
        assert_eq!(dm.num_contiguous_rows(-10, 0, 0), 10);
        assert_eq!(dm.row_stride(0, 0), 64);
    }

    #[test]
    fn bytes_round_trip_across_tile_borders() {
        let (_dir, dm) = grid(2, &[0, 0]);
        let rect = Rect::new(-10, 50, 100, 30);
        let data: Vec<u8> = (0..rect.area() as usize * 2).map(|i| (i % 251) as u8).collect();
        dm.write_bytes(rect, &data).unwrap();
        let mut out = vec![0u8; data.len()];
        dm.read_bytes(rect, &mut out).unwrap();
        assert_eq!(out, data);
        assert_eq!(dm.num_tiles(), 6);
        assert_eq!(dm.extent(), Rect::new(-64, 0, 192, 128));
    }

    #[test]
    fn pixel_accessors() {
        let (_dir, dm) = grid(3, &[1, 2, 3]);
        assert_eq!(dm.pixel(1000, -1000).unwrap(), vec![1, 2, 3]);
        assert_eq!(dm.num_tiles(), 0);
        dm.set_pixel(-1, -1, &[9, 8, 7]).unwrap();
        assert_eq!(dm.pixel(-1, -1).unwrap(), vec![9, 8, 7]);
        assert_eq!(dm.pixel(-2, -1).unwrap(), vec![1, 2, 3]);
        assert!(dm.set_pixel(0, 0, &[1]).is_err());
    }

    #[test]
    fn planar_write_keeps_missing_channels() {
        let (_dir, dm) = grid(3, &[10, 20, 30]);
        let rect = Rect::new(0, 0, 2, 1);
        let red = [1u8, 2];
        let blue = [5u8, 6];
        dm.write_planar_bytes(&[Some(&red), None, Some(&blue)], &[1, 1, 1], rect)
            .unwrap();
        let mut out = [0u8; 6];
        dm.read_bytes(rect, &mut out).unwrap();
        assert_eq!(out, [1, 20, 5, 2, 20, 6]);

        let planes = dm.read_planar_bytes(&[2, 1], rect).unwrap();
        assert_eq!(planes, vec![vec![1, 20, 2, 20], vec![5, 6]]);
        assert!(dm.read_planar_bytes(&[1, 1], rect).is_err());
    }

    #[test]
    fn clear_with_default_drops_whole_tiles() {
        let (_dir, dm) = grid(1, &[0]);
        dm.clear_rect(Rect::new(0, 0, 128, 64), &[5]).unwrap();
        assert_eq!(dm.num_tiles(), 2);
        let a = dm.get_tile(0, 0, false).tile_data();
        let b = dm.get_tile(1, 0, false).tile_data();
        assert!(Arc::ptr_eq(&a, &b));

        dm.clear_rect(Rect::new(10, 10, 5, 5), &[0]).unwrap();
        assert_eq!(dm.pixel(12, 12).unwrap(), vec![0]);
        assert_eq!(dm.pixel(9, 12).unwrap(), vec![5]);
        assert!(!Arc::ptr_eq(&dm.get_tile(0, 0, false).tile_data(), &b));

        dm.clear_rect(Rect::new(-1000, -1000, 5000, 5000), &[0]).unwrap();
        assert_eq!(dm.num_tiles(), 0);
        assert!(dm.extent().is_empty());
    }

    #[test]
    fn set_extent_crops_tiles() {
        let (_dir, dm) = grid(1, &[0]);
        dm.clear_rect(Rect::new(0, 0, 192, 64), &[7]).unwrap();
        dm.set_extent(Rect::new(0, 0, 100, 64)).unwrap();
        assert_eq!(dm.num_tiles(), 2);
        assert_eq!(dm.extent(), Rect::new(0, 0, 128, 64));
        assert_eq!(dm.pixel(99, 5).unwrap(), vec![7]);
        assert_eq!(dm.pixel(100, 5).unwrap(), vec![0]);
    }

    #[test]
    fn purge_drops_default_tiles() {
        let (_dir, dm) = grid(1, &[0]);
        dm.get_tile(0, 0, true);
        dm.set_pixel(70, 0, &[1]).unwrap();
        dm.set_pixel(140, 0, &[1]).unwrap();
        dm.set_pixel(140, 0, &[0]).unwrap();
        assert_eq!(dm.num_tiles(), 3);
        dm.purge(Rect::new(0, 0, 64, 64)).unwrap();
        assert_eq!(dm.num_tiles(), 2);
        dm.purge(dm.extent()).unwrap();
        assert_eq!(dm.num_tiles(), 1);
        assert_eq!(dm.region(), vec![Rect::of_tile(1, 0)]);
    }

    #[test]
    fn fork_shares_versions() {
        let (_dir, dm) = grid(1, &[0]);
        dm.set_pixel(3, 3, &[9]).unwrap();
        let fork = dm.fork();
        assert!(Arc::ptr_eq(
            &dm.get_tile(0, 0, false).tile_data(),
            &fork.get_tile(0, 0, false).tile_data()
        ));
        fork.set_pixel(3, 3, &[1]).unwrap();
        assert_eq!(dm.pixel(3, 3).unwrap(), vec![9]);
        assert_eq!(fork.extent(), dm.extent());
    }
}
