//! Failure injection for swap writes.
//!
//! Hooks exist only in debug builds; release builds always take the real
//! path.

use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;

use crate::error::TileResult;

/// Context passed to swap write failure injection hooks.
#[derive(Debug, Clone, Copy)]
pub struct SwapWriteContext {
    pub tile_id: u64,
    /// Encoded size about to be written.
    pub bytes: usize,
}

/// Hook signature for swap write overrides. Returning `Some` replaces the
/// write with the given result.
pub type SwapWriteHook =
    dyn Fn(&SwapWriteContext) -> Option<TileResult<()>> + Send + Sync + 'static;

#[cfg(debug_assertions)]
fn swap_write_hook_slot() -> &'static RwLock<Option<Arc<SwapWriteHook>>> {
    static SLOT: OnceLock<RwLock<Option<Arc<SwapWriteHook>>>> = OnceLock::new();
    SLOT.get_or_init(|| RwLock::new(None))
}

/// Consults the installed swap write hook, if any.
pub fn swap_write_override(ctx: &SwapWriteContext) -> Option<TileResult<()>> {
    #[cfg(debug_assertions)]
    {
        let hook = swap_write_hook_slot().read().clone();
        hook.and_then(|hook| hook(ctx))
    }

    #[cfg(not(debug_assertions))]
    {
        let _ = ctx;
        None
    }
}

/// Guard that restores the previous swap write hook when dropped.
pub struct SwapWriteHookGuard {
    #[cfg(debug_assertions)]
    previous: Option<Arc<SwapWriteHook>>,
}

impl Drop for SwapWriteHookGuard {
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        {
            let mut slot = swap_write_hook_slot().write();
            *slot = self.previous.take();
        }
    }
}

/// Install a swap write hook, returning a guard that reverts to the previous
/// hook (if any) when dropped.
#[cfg(debug_assertions)]
pub fn install_swap_write_hook<F>(hook: F) -> SwapWriteHookGuard
where
    F: Fn(&SwapWriteContext) -> Option<TileResult<()>> + Send + Sync + 'static,
{
    let mut slot = swap_write_hook_slot().write();
    let previous = std::mem::replace(&mut *slot, Some(Arc::new(hook)));
    SwapWriteHookGuard { previous }
}

/// No-op in release builds.
#[cfg(not(debug_assertions))]
pub fn install_swap_write_hook<F>(_hook: F) -> SwapWriteHookGuard
where
    F: Fn(&SwapWriteContext) -> Option<TileResult<()>> + Send + Sync + 'static,
{
    SwapWriteHookGuard {}
}

/// Polls `predicate` until it holds or `timeout` elapses. Returns the last
/// observed value.
pub fn wait_for(timeout: std::time::Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    loop {
        if predicate() {
            return true;
        }
        if std::time::Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(std::time::Duration::from_millis(5));
    }
}
