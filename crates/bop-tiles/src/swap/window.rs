use std::fs::File;

use memmap2::{MmapMut, MmapOptions};
use tracing::trace;

use super::allocator::SwapChunk;
use crate::error::{TileError, TileResult};

/// Window offsets are aligned to this many bytes.
const WINDOW_ALIGN: u64 = 64 * 1024;

/// A mapped view of part of the swap file.
///
/// Accessing a chunk outside the current view remaps the window so that it
/// starts at the chunk (aligned down) and spans `window_size` bytes, or the
/// whole chunk when the chunk is larger.
pub struct SwapWindow {
    window_size: u64,
    file_len: u64,
    start: u64,
    map: Option<MmapMut>,
    remaps: u64,
}

impl SwapWindow {
    pub fn new(window_size: u64, file_len: u64) -> Self {
        Self {
            window_size,
            file_len,
            start: 0,
            map: None,
            remaps: 0,
        }
    }

    pub fn remaps(&self) -> u64 {
        self.remaps
    }

    fn covers(&self, chunk: &SwapChunk) -> bool {
        match &self.map {
            Some(map) => chunk.offset >= self.start && chunk.end() <= self.start + map.len() as u64,
            None => false,
        }
    }

    fn remap(&mut self, file: &File, chunk: &SwapChunk) -> TileResult<()> {
        if chunk.end() > self.file_len {
            return Err(TileError::internal(format!(
                "{chunk:?} outside swap file of {} bytes",
                self.file_len
            )));
        }
        let start = chunk.offset - chunk.offset % WINDOW_ALIGN;
        let len = self
            .window_size
            .max(chunk.end() - start)
            .min(self.file_len - start);
        // Drop the old view before mapping a new one.
        self.map = None;
        // SAFETY: the swap file is private to this process, unlinked, and
        // sized once at creation; all access goes through the store's locks.
        let map = unsafe {
            MmapOptions::new()
                .offset(start)
                .len(len as usize)
                .map_mut(file)?
        };
        trace!(start, len, "swap window remapped");
        self.start = start;
        self.map = Some(map);
        self.remaps += 1;
        Ok(())
    }

    /// Mutable bytes of `chunk`, remapping if needed.
    pub fn slice_mut(&mut self, file: &File, chunk: &SwapChunk) -> TileResult<&mut [u8]> {
        if !self.covers(chunk) {
            self.remap(file, chunk)?;
        }
        let start = (chunk.offset - self.start) as usize;
        let end = start + chunk.len as usize;
        match self.map.as_mut() {
            Some(map) => Ok(&mut map[start..end]),
            None => Err(TileError::internal("swap window not mapped")),
        }
    }

    /// Bytes of `chunk`, remapping if needed.
    pub fn slice(&mut self, file: &File, chunk: &SwapChunk) -> TileResult<&[u8]> {
        self.slice_mut(file, chunk).map(|bytes| &*bytes)
    }
}

impl std::fmt::Debug for SwapWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwapWindow")
            .field("start", &self.start)
            .field("mapped", &self.map.as_ref().map(|m| m.len()))
            .field("remaps", &self.remaps)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remaps_only_when_chunk_leaves_the_view() {
        let file = tempfile::tempfile().expect("tempfile");
        file.set_len(1024 * 1024).unwrap();
        let mut window = SwapWindow::new(256 * 1024, 1024 * 1024);

        let a = SwapChunk { offset: 100, len: 50 };
        window.slice_mut(&file, &a).unwrap().fill(7);
        let b = SwapChunk { offset: 4096, len: 10 };
        window.slice_mut(&file, &b).unwrap().fill(9);
        assert_eq!(window.remaps(), 1);

        let far = SwapChunk { offset: 900 * 1024, len: 100 };
        window.slice_mut(&file, &far).unwrap().fill(3);
        assert_eq!(window.remaps(), 2);

        assert!(window.slice(&file, &a).unwrap().iter().all(|&x| x == 7));
        assert_eq!(window.remaps(), 3);
        assert!(window.slice(&file, &far).unwrap().iter().all(|&x| x == 3));
    }

    #[test]
    fn chunks_larger_than_the_window_are_mapped_whole() {
        let file = tempfile::tempfile().expect("tempfile");
        file.set_len(512 * 1024).unwrap();
        let mut window = SwapWindow::new(64 * 1024, 512 * 1024);
        let big = SwapChunk { offset: 70_000, len: 200_000 };
        assert_eq!(window.slice_mut(&file, &big).unwrap().len(), 200_000);
        let outside = SwapChunk { offset: 500 * 1024, len: 64 * 1024 };
        assert!(window.slice_mut(&file, &outside).is_err());
    }
}
