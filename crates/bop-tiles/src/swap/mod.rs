//! Disk-backed swap area for evicted tile buffers.

mod allocator;
mod store;
mod window;

pub use allocator::{ChunkAllocator, SwapChunk};
pub use store::{SwapStoreSnapshot, SwappedStore};
pub use window::SwapWindow;
