use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{TileError, TileResult};

/// Default emergency ceiling for resident tile data.
///
/// Above this value allocations run a synchronous eviction pass before
/// proceeding.
pub const DEFAULT_MEMORY_LIMIT_BYTES: u64 = 256 * 1024 * 1024; // 256 MiB

/// Default soft ceiling. Data that is only referenced by undo history is
/// swapped out once resident memory crosses it.
pub const DEFAULT_SOFT_LIMIT_BYTES: u64 = 64 * 1024 * 1024; // 64 MiB

/// Default budget for pre-made clones held by the pooler.
pub const DEFAULT_POOL_LIMIT_BYTES: u64 = 32 * 1024 * 1024; // 32 MiB

/// Default size of the bounded on-disk swap region.
pub const DEFAULT_SWAP_CAPACITY_BYTES: u64 = 4 * 1024 * 1024 * 1024; // 4 GiB

/// Default size of one mapped swap window.
///
/// Chunks are mapped through a window of this size; a chunk outside the
/// current window remaps it.
pub const DEFAULT_SWAP_WINDOW_BYTES: u64 = 16 * 1024 * 1024; // 16 MiB

/// Default zstd level when [`SwapCompression::Zstd`] is selected.
pub const DEFAULT_ZSTD_LEVEL: i32 = 1;

/// Maximum number of pre-made clones kept per tile data.
pub const DEFAULT_MAX_CLONES: usize = 16;

const DEFAULT_POOLER_MIN_INTERVAL_MS: u64 = 100;
const DEFAULT_POOLER_MAX_INTERVAL_MS: u64 = 60_000;
const DEFAULT_SWAPPER_INTERVAL_MS: u64 = 1_000;

/// Codec applied to tile buffers written to the swap file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SwapCompression {
    #[default]
    Lzf,
    Zstd,
    None,
}

/// Background pooler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolerConfig {
    pub enabled: bool,
    /// Poll interval after a productive cycle.
    pub min_interval: Duration,
    /// Upper bound of the doubling backoff between idle cycles.
    pub max_interval: Duration,
    pub max_clones: usize,
}

impl Default for PoolerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_interval: Duration::from_millis(DEFAULT_POOLER_MIN_INTERVAL_MS),
            max_interval: Duration::from_millis(DEFAULT_POOLER_MAX_INTERVAL_MS),
            max_clones: DEFAULT_MAX_CLONES,
        }
    }
}

/// Background swapper settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SwapperConfig {
    pub enabled: bool,
    /// Wake-up period when nobody kicks the swapper.
    pub interval: Duration,
}

impl Default for SwapperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_millis(DEFAULT_SWAPPER_INTERVAL_MS),
        }
    }
}

/// Configuration for a [`TileDataStore`](crate::store::TileDataStore).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TileStoreConfig {
    pub memory_limit_bytes: u64,
    pub soft_limit_bytes: u64,
    pub pool_limit_bytes: u64,
    /// Directory of the anonymous swap file; the system temp dir when unset.
    pub swap_dir: Option<PathBuf>,
    pub swap_capacity_bytes: u64,
    pub swap_window_bytes: u64,
    pub swap_compression: SwapCompression,
    pub zstd_level: i32,
    pub pooler: PoolerConfig,
    pub swapper: SwapperConfig,
}

impl Default for TileStoreConfig {
    fn default() -> Self {
        Self {
            memory_limit_bytes: DEFAULT_MEMORY_LIMIT_BYTES,
            soft_limit_bytes: DEFAULT_SOFT_LIMIT_BYTES,
            pool_limit_bytes: DEFAULT_POOL_LIMIT_BYTES,
            swap_dir: None,
            swap_capacity_bytes: DEFAULT_SWAP_CAPACITY_BYTES,
            swap_window_bytes: DEFAULT_SWAP_WINDOW_BYTES,
            swap_compression: SwapCompression::default(),
            zstd_level: DEFAULT_ZSTD_LEVEL,
            pooler: PoolerConfig::default(),
            swapper: SwapperConfig::default(),
        }
    }
}

impl TileStoreConfig {
    pub fn validate(&self) -> TileResult<()> {
        if self.memory_limit_bytes == 0 {
            return Err(TileError::invalid_config("memory_limit_bytes must be > 0"));
        }
        if self.soft_limit_bytes == 0 {
            return Err(TileError::invalid_config("soft_limit_bytes must be > 0"));
        }
        if self.swap_capacity_bytes == 0 {
            return Err(TileError::invalid_config("swap_capacity_bytes must be > 0"));
        }
        if self.swap_window_bytes == 0 || self.swap_window_bytes > self.swap_capacity_bytes {
            return Err(TileError::invalid_config(format!(
                "swap_window_bytes ({}) must be in 1..={}",
                self.swap_window_bytes, self.swap_capacity_bytes
            )));
        }
        if self.pooler.min_interval.is_zero() || self.pooler.min_interval > self.pooler.max_interval {
            return Err(TileError::invalid_config(format!(
                "pooler interval range {:?}..{:?} is empty",
                self.pooler.min_interval, self.pooler.max_interval
            )));
        }
        if self.pooler.max_clones == 0 {
            return Err(TileError::invalid_config("pooler.max_clones must be > 0"));
        }
        if self.swapper.interval.is_zero() {
            return Err(TileError::invalid_config("swapper.interval must be > 0"));
        }
        if !(zstd::compression_level_range().contains(&self.zstd_level)) {
            return Err(TileError::invalid_config(format!(
                "zstd_level {} out of range",
                self.zstd_level
            )));
        }
        Ok(())
    }

    /// Settings for tests and small tools: small ceilings, a swap file in
    /// `dir`, and fast background cycles.
    pub fn for_testing(dir: impl Into<PathBuf>) -> Self {
        Self {
            memory_limit_bytes: 8 * 1024 * 1024,
            soft_limit_bytes: 4 * 1024 * 1024,
            pool_limit_bytes: 2 * 1024 * 1024,
            swap_dir: Some(dir.into()),
            swap_capacity_bytes: 256 * 1024 * 1024,
            swap_window_bytes: 1024 * 1024,
            pooler: PoolerConfig {
                min_interval: Duration::from_millis(5),
                max_interval: Duration::from_millis(50),
                ..PoolerConfig::default()
            },
            swapper: SwapperConfig {
                enabled: true,
                interval: Duration::from_millis(10),
            },
            ..Self::default()
        }
    }
}
