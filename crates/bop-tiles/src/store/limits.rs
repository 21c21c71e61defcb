use crate::config::TileStoreConfig;

/// Memory thresholds derived from the configured ceilings.
///
/// ```text
///  0 ---- soft_limit -- soft_threshold ---- hard_limit -- hard_threshold -- emergency
///          ^ soft pass target                 ^ aggressive pass target
/// ```
///
/// Each limit sits one eighth below its threshold so a pass frees a batch
/// rather than a single tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreLimits {
    pub emergency_threshold: u64,
    pub hard_threshold: u64,
    pub hard_limit: u64,
    pub soft_threshold: u64,
    pub soft_limit: u64,
    pub pool_limit: u64,
}

impl StoreLimits {
    pub fn from_config(config: &TileStoreConfig) -> Self {
        let emergency_threshold = config.memory_limit_bytes;
        let hard_threshold = emergency_threshold - emergency_threshold / 8;
        let hard_limit = hard_threshold - hard_threshold / 8;
        let soft_threshold = config.soft_limit_bytes.min(hard_threshold);
        let soft_limit = soft_threshold - soft_threshold / 8;
        Self {
            emergency_threshold,
            hard_threshold,
            hard_limit,
            soft_threshold,
            soft_limit,
            pool_limit: config.pool_limit_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thresholds_are_ordered() {
        let limits = StoreLimits::from_config(&TileStoreConfig::default());
        assert_eq!(limits.emergency_threshold, 256 << 20);
        assert_eq!(limits.hard_threshold, 224 << 20);
        assert_eq!(limits.hard_limit, 196 << 20);
        assert_eq!(limits.soft_threshold, 64 << 20);
        assert_eq!(limits.soft_limit, 56 << 20);
    }

    #[test]
    fn soft_threshold_is_clamped_to_hard() {
        let config = TileStoreConfig {
            memory_limit_bytes: 8 << 20,
            soft_limit_bytes: 64 << 20,
            ..TileStoreConfig::default()
        };
        let limits = StoreLimits::from_config(&config);
        assert_eq!(limits.soft_threshold, limits.hard_threshold);
        assert!(limits.soft_limit < limits.soft_threshold);
    }
}
