//! Static, init-time configuration for the cache core.
//!
//! There is no on-disk configuration format here; this is the plain,
//! always-valid struct an embedder builds by hand or from its own config
//! layer before calling [`crate::CacheCore::init`].

/// `PAGE_SIZE` is fixed for the lifetime of the crate: it is the unit the
/// admission history keys on and the unit the read engine allocates copy
/// buffers in.
pub const PAGE_SIZE: u64 = 4096;

pub mod defaults {
    pub const FULL_THRESHOLD: u8 = 99;
    pub const HIT_RATIO_THRESHOLD: f32 = 0.5;
    pub const MAX_HISTORY_INITIAL: usize = 1000;
    pub const MIN_MAX_HISTORY: usize = 250;
    pub const MAX_MAX_HISTORY: usize = 10_000;
    pub const HASH_SIZE_INITIAL: usize = 2048;
    pub const MIN_HASH_SIZE: usize = 2048;
    pub const MAX_HASH_SIZE: usize = 1 << 20;
    pub const HASH_RESIZE_THRESHOLD: f32 = 0.75;

    /// Above this measured hit ratio, `max_entries` is allowed to grow
    /// towards `max_max_history`; below the low-water mark, it is allowed to
    /// shrink towards `min_max_history`. Quality-of-service only, never
    /// correctness-bearing (spec §4.3).
    pub const HISTORY_GROW_HIT_RATIO: f64 = 0.7;
    pub const HISTORY_SHRINK_HIT_RATIO: f64 = 0.2;
    /// How often (in `admit`/`insert_or_touch` calls) the bound is
    /// reconsidered, to avoid thrashing `max_entries` on every single call.
    pub const HISTORY_RESIZE_CHECK_INTERVAL: u64 = 256;
}

#[derive(Debug, Clone)]
pub struct CacheCoreConf {
    /// Number of cache lines / lock table rows. Immutable after `init`.
    pub num_lines: u32,

    /// `occupancy_percent() >= full_threshold` is the "cache near-full"
    /// predicate gating the admission filter.
    pub full_threshold: u8,

    /// Minimum `hit_pages / total_pages` ratio required to admit a MISS once
    /// the cache is near-full.
    pub hit_ratio_threshold: f32,

    pub max_history_initial: usize,
    pub min_max_history: usize,
    pub max_max_history: usize,

    pub hash_size_initial: usize,
    pub hash_size_min: usize,
    pub hash_size_max: usize,

    /// Allow the admission history bucket count and bound to adapt to the
    /// observed hit ratio. Purely a quality-of-service knob; never required
    /// for correctness.
    pub adaptive_sizing: bool,
}

impl Default for CacheCoreConf {
    fn default() -> Self {
        Self {
            num_lines: 1024,
            full_threshold: defaults::FULL_THRESHOLD,
            hit_ratio_threshold: defaults::HIT_RATIO_THRESHOLD,
            max_history_initial: defaults::MAX_HISTORY_INITIAL,
            min_max_history: defaults::MIN_MAX_HISTORY,
            max_max_history: defaults::MAX_MAX_HISTORY,
            hash_size_initial: defaults::HASH_SIZE_INITIAL,
            hash_size_min: defaults::MIN_HASH_SIZE,
            hash_size_max: defaults::MAX_HASH_SIZE,
            adaptive_sizing: true,
        }
    }
}

impl CacheCoreConf {
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.num_lines > 0, "num_lines must be > 0");
        anyhow::ensure!(
            self.full_threshold <= 100,
            "full_threshold must be a percentage in [0, 100]"
        );
        anyhow::ensure!(
            self.hit_ratio_threshold > 0.0 && self.hit_ratio_threshold <= 1.0,
            "hit_ratio_threshold must be in (0, 1]"
        );
        anyhow::ensure!(
            self.hash_size_initial.is_power_of_two(),
            "hash_size_initial must be a power of two"
        );
        anyhow::ensure!(
            self.min_max_history <= self.max_history_initial
                && self.max_history_initial <= self.max_max_history,
            "max_history_initial must lie within [min_max_history, max_max_history]"
        );
        Ok(())
    }
}
