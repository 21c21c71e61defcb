use std::fmt;
use std::fs::{self, File};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use super::allocator::{ChunkAllocator, SwapChunk};
use super::window::SwapWindow;
use crate::codec::TileCompressor2;
use crate::config::{SwapCompression, TileStoreConfig};
use crate::error::{TileError, TileResult};
use crate::test_support::{swap_write_override, SwapWriteContext};

/// Payload flag for zstd frames; LZF and raw payloads reuse the tile stream
/// flags.
const FLAG_ZSTD: u8 = 2;

/// Snapshot of swap backend counters.
#[derive(Debug, Clone, Default)]
pub struct SwapStoreSnapshot {
    pub swap_outs: u64,
    pub swap_ins: u64,
    pub bytes_written: u64,
    pub bytes_read: u64,
    pub write_failures: u64,
    pub free_space: u64,
    pub fragmentation: f64,
}

#[derive(Debug, Default)]
struct SwapMetrics {
    swap_outs: AtomicU64,
    swap_ins: AtomicU64,
    bytes_written: AtomicU64,
    bytes_read: AtomicU64,
    write_failures: AtomicU64,
}

/// Compressed tile buffers inside one anonymous, bounded swap file.
pub struct SwappedStore {
    file: File,
    compression: SwapCompression,
    zstd_level: i32,
    allocator: Mutex<ChunkAllocator>,
    write_window: Mutex<SwapWindow>,
    read_window: Mutex<SwapWindow>,
    metrics: SwapMetrics,
}

impl SwappedStore {
    pub fn new(config: &TileStoreConfig) -> TileResult<Self> {
        let file = match &config.swap_dir {
            Some(dir) => {
                fs::create_dir_all(dir)?;
                tempfile::tempfile_in(dir)?
            }
            None => tempfile::tempfile()?,
        };
        let capacity = config.swap_capacity_bytes;
        file.set_len(capacity)?;
        debug!(
            capacity,
            window = config.swap_window_bytes,
            compression = ?config.swap_compression,
            "swap file created"
        );
        Ok(Self {
            file,
            compression: config.swap_compression,
            zstd_level: config.zstd_level,
            allocator: Mutex::new(ChunkAllocator::new(capacity)),
            write_window: Mutex::new(SwapWindow::new(config.swap_window_bytes, capacity)),
            read_window: Mutex::new(SwapWindow::new(config.swap_window_bytes, capacity)),
            metrics: SwapMetrics::default(),
        })
    }

    fn encode(&self, data: &[u8], pixel_size: usize) -> TileResult<Vec<u8>> {
        let mut encoded = Vec::with_capacity(data.len() / 2 + 1);
        match self.compression {
            SwapCompression::Lzf => TileCompressor2::pack(data, pixel_size, &mut encoded),
            SwapCompression::Zstd => {
                encoded.push(FLAG_ZSTD);
                let frame = zstd::bulk::compress(data, self.zstd_level)
                    .map_err(TileError::compression)?;
                encoded.extend_from_slice(&frame);
            }
            SwapCompression::None => {
                encoded.push(crate::codec::FLAG_RAW);
                encoded.extend_from_slice(data);
            }
        }
        Ok(encoded)
    }

    fn decode(encoded: &[u8], pixel_size: usize, out: &mut [u8]) -> TileResult<()> {
        match encoded.first() {
            Some(&FLAG_ZSTD) => {
                let written = zstd::bulk::decompress_to_buffer(&encoded[1..], out)
                    .map_err(TileError::corruption)?;
                if written != out.len() {
                    return Err(TileError::corruption(format!(
                        "zstd frame expanded to {written} bytes, expected {}",
                        out.len()
                    )));
                }
                Ok(())
            }
            _ => TileCompressor2::unpack(encoded, pixel_size, out),
        }
    }

    /// Encodes `data` and writes it into a freshly allocated chunk.
    pub fn swap_out(&self, tile_id: u64, pixel_size: usize, data: &[u8]) -> TileResult<SwapChunk> {
        let encoded = self.encode(data, pixel_size)?;
        let ctx = SwapWriteContext {
            tile_id,
            bytes: encoded.len(),
        };
        if let Some(result) = swap_write_override(&ctx) {
            if let Err(err) = result {
                self.metrics.write_failures.fetch_add(1, Ordering::Relaxed);
                return Err(err);
            }
        }

        let chunk = match self.allocator.lock().allocate(encoded.len() as u64) {
            Ok(chunk) => chunk,
            Err(err) => {
                self.metrics.write_failures.fetch_add(1, Ordering::Relaxed);
                return Err(err);
            }
        };
        let written = self
            .write_window
            .lock()
            .slice_mut(&self.file, &chunk)
            .map(|slot| slot.copy_from_slice(&encoded));
        if let Err(err) = written {
            warn!(tile_id, ?chunk, error = %err, "swap write failed");
            self.metrics.write_failures.fetch_add(1, Ordering::Relaxed);
            self.allocator.lock().free(chunk);
            return Err(err);
        }

        self.metrics.swap_outs.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .bytes_written
            .fetch_add(encoded.len() as u64, Ordering::Relaxed);
        trace!(tile_id, ?chunk, raw = data.len(), "tile swapped out");
        Ok(chunk)
    }

    /// Reads `chunk` back into `out`. The chunk stays allocated.
    pub fn swap_in(&self, chunk: &SwapChunk, pixel_size: usize, out: &mut [u8]) -> TileResult<()> {
        let encoded = {
            let mut window = self.read_window.lock();
            window.slice(&self.file, chunk)?.to_vec()
        };
        Self::decode(&encoded, pixel_size, out)?;
        self.metrics.swap_ins.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .bytes_read
            .fetch_add(encoded.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Releases `chunk` without reading it.
    pub fn forget(&self, chunk: SwapChunk) {
        self.allocator.lock().free(chunk);
    }

    pub fn metrics(&self) -> SwapStoreSnapshot {
        let allocator = self.allocator.lock();
        SwapStoreSnapshot {
            swap_outs: self.metrics.swap_outs.load(Ordering::Relaxed),
            swap_ins: self.metrics.swap_ins.load(Ordering::Relaxed),
            bytes_written: self.metrics.bytes_written.load(Ordering::Relaxed),
            bytes_read: self.metrics.bytes_read.load(Ordering::Relaxed),
            write_failures: self.metrics.write_failures.load(Ordering::Relaxed),
            free_space: allocator.free_space(),
            fragmentation: allocator.fragmentation(),
        }
    }

    pub fn sanity_check(&self) -> TileResult<()> {
        self.allocator.lock().sanity_check()
    }
}

impl fmt::Debug for SwappedStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SwappedStore")
            .field("compression", &self.compression)
            .field("metrics", &self.metrics)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(compression: SwapCompression) -> (TempDir, SwappedStore) {
        let dir = TempDir::new().expect("tempdir");
        let mut config = TileStoreConfig::for_testing(dir.path());
        config.swap_capacity_bytes = 4 * 1024 * 1024;
        config.swap_window_bytes = 256 * 1024;
        config.swap_compression = compression;
        let store = SwappedStore::new(&config).expect("swap store");
        (dir, store)
    }

    fn sample_tile(seed: u8) -> Vec<u8> {
        (0..64 * 64 * 4)
            .map(|i| ((i / 7) as u8).wrapping_mul(seed))
            .collect()
    }

    #[test]
    fn round_trips_with_every_codec() {
        for compression in [SwapCompression::Lzf, SwapCompression::Zstd, SwapCompression::None] {
            let (_dir, store) = store(compression);
            let chunks: Vec<_> = (1..=20u8)
                .map(|seed| (seed, store.swap_out(seed as u64, 4, &sample_tile(seed)).unwrap()))
                .collect();
            for (seed, chunk) in &chunks {
                let mut out = vec![0u8; 64 * 64 * 4];
                store.swap_in(chunk, 4, &mut out).unwrap();
                assert_eq!(out, sample_tile(*seed), "{compression:?} seed {seed}");
            }
            for (_, chunk) in chunks {
                store.forget(chunk);
            }
            let snapshot = store.metrics();
            assert_eq!(snapshot.swap_outs, 20);
            assert_eq!(snapshot.swap_ins, 20);
            assert_eq!(snapshot.free_space, 4 * 1024 * 1024);
            store.sanity_check().unwrap();
        }
    }

    #[test]
    fn full_swap_file_reports_exhaustion() {
        let (_dir, store) = store(SwapCompression::None);
        let tile = sample_tile(3);
        let mut held = Vec::new();
        let err = loop {
            match store.swap_out(1, 4, &tile) {
                Ok(chunk) => held.push(chunk),
                Err(err) => break err,
            }
        };
        assert!(err.is_resource_exhaustion());
        assert_eq!(held.len(), 4 * 1024 * 1024 / (tile.len() + 1));
        assert_eq!(store.metrics().write_failures, 1);
    }
}
