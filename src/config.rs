//! Cache configuration and builder.

use std::time::Duration;

/// Tuning knobs for a [`crate::cache::DbufCache`].
#[derive(Debug, Clone)]
pub struct DbufCacheConfig {
    /// Hint used to size the hash index: the index picks `table_size` so
    /// that `table_size * average_block_size >= physical_memory_hint`,
    /// bounded below by [`Self::min_table_entries`].
    pub physical_memory_hint: usize,

    /// Average block size used in the sizing formula above.
    pub average_block_size: usize,

    /// Lower bound on hash table entries, regardless of the sizing formula.
    pub min_table_entries: usize,

    /// Number of stripe mutexes guarding the hash index chains.
    pub hash_stripes: usize,

    /// Maximum number of concurrent TXGs a single Buffer may be dirty in.
    /// Bounds `dirty_count`.
    pub max_concurrent_txgs: u32,

    /// Maximum length of a bonus-buffer scratch allocation.
    pub max_bonus_len: usize,

    /// Maximum number of dirty records flushed as one batch by the syncer
    /// before yielding (keeps `sync_list` responsive under huge dirty
    /// lists); purely a scheduling knob, not a correctness one.
    pub max_sync_batch: usize,
}

impl Default for DbufCacheConfig {
    fn default() -> Self {
        Self {
            physical_memory_hint: 256 * 1024 * 1024,
            average_block_size: 128 * 1024,
            min_table_entries: 1 << 10,
            // Scale stripe count with core count so lock contention on the
            // hash index doesn't grow with the machine size.
            hash_stripes: (num_cpus::get() * 32).next_power_of_two(),
            max_concurrent_txgs: 3,
            max_bonus_len: crate::common::MAX_BONUS_LEN,
            max_sync_batch: 256,
        }
    }
}

impl DbufCacheConfig {
    /// The table size chosen by the sizing formula above, before it is
    /// rounded by the hash index to its own internal representation.
    pub fn sized_table_entries(&self) -> usize {
        let by_memory = self.physical_memory_hint / self.average_block_size.max(1);
        by_memory.max(self.min_table_entries)
    }
}

/// Consuming builder for [`DbufCacheConfig`]: chainable setters ending in
/// `build()`.
#[derive(Debug, Clone, Default)]
pub struct DbufCacheConfigBuilder {
    config: DbufCacheConfig,
}

impl DbufCacheConfigBuilder {
    pub fn new() -> Self {
        Self { config: DbufCacheConfig::default() }
    }

    pub fn physical_memory_hint(mut self, bytes: usize) -> Self {
        self.config.physical_memory_hint = bytes;
        self
    }

    pub fn average_block_size(mut self, bytes: usize) -> Self {
        self.config.average_block_size = bytes;
        self
    }

    pub fn hash_stripes(mut self, stripes: usize) -> Self {
        self.config.hash_stripes = stripes.max(1);
        self
    }

    pub fn max_concurrent_txgs(mut self, n: u32) -> Self {
        self.config.max_concurrent_txgs = n.max(1);
        self
    }

    pub fn max_bonus_len(mut self, len: usize) -> Self {
        self.config.max_bonus_len = len;
        self
    }

    pub fn build(self) -> DbufCacheConfig {
        self.config
    }
}

/// Interval used by background maintenance; not part of the cache core
/// proper, but kept alongside it as ambient configuration.
pub const DEFAULT_STATS_INTERVAL: Duration = Duration::from_secs(30);

static PROCESS_DEFAULT: once_cell::sync::OnceCell<DbufCacheConfig> = once_cell::sync::OnceCell::new();

/// The process-wide default configuration, computed once. Callers building
/// more than one [`crate::cache::DbufCache`] with the same tuning can share
/// this rather than recompute `num_cpus::get()`-derived sizing every time.
pub fn process_default() -> &'static DbufCacheConfig {
    PROCESS_DEFAULT.get_or_init(DbufCacheConfig::default)
}
