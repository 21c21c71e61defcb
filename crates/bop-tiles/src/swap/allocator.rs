use std::collections::BTreeMap;
use std::fmt;

use tracing::error;

use crate::error::{TileError, TileResult};

/// Byte range reserved inside the swap file.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SwapChunk {
    pub offset: u64,
    pub len: u64,
}

impl SwapChunk {
    pub const fn end(&self) -> u64 {
        self.offset + self.len
    }
}

impl fmt::Debug for SwapChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SwapChunk({}..{})", self.offset, self.end())
    }
}

/// First-fit allocator over `[0, capacity)`.
///
/// Free ranges are keyed by offset and never touch each other: `free`
/// coalesces with both neighbours.
#[derive(Debug)]
pub struct ChunkAllocator {
    capacity: u64,
    free: BTreeMap<u64, u64>,
    free_bytes: u64,
    allocated_chunks: usize,
}

impl ChunkAllocator {
    pub fn new(capacity: u64) -> Self {
        let mut free = BTreeMap::new();
        if capacity > 0 {
            free.insert(0, capacity);
        }
        Self {
            capacity,
            free,
            free_bytes: capacity,
            allocated_chunks: 0,
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn allocate(&mut self, size: u64) -> TileResult<SwapChunk> {
        if size == 0 {
            return Err(TileError::internal("zero-sized swap chunk requested"));
        }
        let found = self
            .free
            .iter()
            .find(|(_, &len)| len >= size)
            .map(|(&offset, &len)| (offset, len));
        let Some((offset, len)) = found else {
            return Err(TileError::SwapExhausted {
                requested: size,
                capacity: self.capacity,
            });
        };
        self.free.remove(&offset);
        if len > size {
            self.free.insert(offset + size, len - size);
        }
        self.free_bytes -= size;
        self.allocated_chunks += 1;
        Ok(SwapChunk { offset, len: size })
    }

    pub fn free(&mut self, chunk: SwapChunk) {
        if chunk.len == 0 || chunk.end() > self.capacity {
            error!(?chunk, capacity = self.capacity, "freeing chunk outside swap region");
            debug_assert!(false, "bad chunk {chunk:?}");
            return;
        }
        let mut offset = chunk.offset;
        let mut len = chunk.len;

        if let Some((&prev_offset, &prev_len)) = self.free.range(..offset).next_back() {
            if prev_offset + prev_len > offset {
                error!(?chunk, "double free of swap chunk");
                debug_assert!(false, "double free {chunk:?}");
                return;
            }
            if prev_offset + prev_len == offset {
                self.free.remove(&prev_offset);
                offset = prev_offset;
                len += prev_len;
            }
        }
        if let Some((&next_offset, &next_len)) = self.free.range(chunk.offset..).next() {
            if next_offset < chunk.end() {
                error!(?chunk, "double free of swap chunk");
                debug_assert!(false, "double free {chunk:?}");
                // Undo the merge with the previous range, if any.
                if offset != chunk.offset {
                    self.free.insert(offset, len - chunk.len);
                }
                return;
            }
            if next_offset == chunk.end() {
                self.free.remove(&next_offset);
                len += next_len;
            }
        }
        self.free.insert(offset, len);
        self.free_bytes += chunk.len;
        self.allocated_chunks -= 1;
    }

    pub fn free_space(&self) -> u64 {
        self.free_bytes
    }

    pub fn allocated_chunks(&self) -> usize {
        self.allocated_chunks
    }

    /// `1 - largest_free_range / total_free`; zero when free space is one
    /// contiguous range (or there is none).
    pub fn fragmentation(&self) -> f64 {
        if self.free_bytes == 0 {
            return 0.0;
        }
        let largest = self.free.values().copied().max().unwrap_or(0);
        1.0 - largest as f64 / self.free_bytes as f64
    }

    /// Verifies that free ranges are sorted, disjoint, non-adjacent, inside
    /// the region, and sum to the free byte count.
    pub fn sanity_check(&self) -> TileResult<()> {
        let mut last_end: Option<u64> = None;
        let mut total = 0u64;
        for (&offset, &len) in &self.free {
            if len == 0 {
                return Err(TileError::internal(format!("empty free range at {offset}")));
            }
            if let Some(end) = last_end {
                if offset <= end {
                    return Err(TileError::internal(format!(
                        "free range at {offset} overlaps or touches range ending at {end}"
                    )));
                }
            }
            if offset + len > self.capacity {
                return Err(TileError::internal(format!(
                    "free range {offset}+{len} exceeds capacity {}",
                    self.capacity
                )));
            }
            last_end = Some(offset + len);
            total += len;
        }
        if total != self.free_bytes {
            return Err(TileError::internal(format!(
                "free ranges sum to {total}, counter says {}",
                self.free_bytes
            )));
        }
        Ok(())
    }
}
