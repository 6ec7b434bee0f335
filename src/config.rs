use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the LSM store.
///
/// Values are injected into sub-components at construction time, so multiple
/// stores with distinct configurations can coexist in one process.
#[derive(Debug, Clone)]
pub struct LsmConfig {
    /// Directory path for the database
    pub dir: PathBuf,

    /// Aggregate memtable byte budget; exceeding it triggers a flush
    /// (default: 64MB)
    pub total_mem_size_limit: usize,

    /// Size at which the active memtable is frozen (default: 4MB)
    pub per_mem_size_limit: usize,

    /// Block capacity in bytes (default: 32KB)
    pub block_size: usize,

    /// SST count threshold triggering compaction into the next level
    /// (default: 4)
    pub level_ratio: usize,

    /// Maximum number of cached blocks (default: 1024)
    pub block_cache_capacity: usize,

    /// Promotion threshold K of the LRU-K block cache (default: 8)
    pub block_cache_k: usize,

    /// Expected element count used to size each SST's Bloom filter
    /// (default: 65536)
    pub bloom_expected_size: usize,

    /// Target false-positive rate of each SST's Bloom filter (default: 0.1)
    pub bloom_error_rate: f64,

    /// Number of WAL records buffered before an append hits disk
    /// (default: 128)
    pub wal_buffer_size: usize,

    /// WAL segment size triggering rotation to a new file (default: 4KB)
    pub wal_file_size_limit: u64,

    /// How often the background cleaner scans for reclaimable WAL segments
    /// (default: 1s)
    pub wal_clean_interval: Duration,
}

impl Default for LsmConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./emberdb"),
            total_mem_size_limit: 64 * 1024 * 1024, // 64MB
            per_mem_size_limit: 4 * 1024 * 1024,    // 4MB
            block_size: 32 * 1024,                  // 32KB
            level_ratio: 4,
            block_cache_capacity: 1024,
            block_cache_k: 8,
            bloom_expected_size: 65536,
            bloom_error_rate: 0.1,
            wal_buffer_size: 128,
            wal_file_size_limit: 4096,
            wal_clean_interval: Duration::from_secs(1),
        }
    }
}

impl LsmConfig {
    /// Create a new config with the given directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Set the aggregate memtable byte budget
    pub fn total_mem_size_limit(mut self, size: usize) -> Self {
        self.total_mem_size_limit = size;
        self
    }

    /// Set the per-memtable freeze threshold
    pub fn per_mem_size_limit(mut self, size: usize) -> Self {
        self.per_mem_size_limit = size;
        self
    }

    /// Set the block capacity in bytes
    pub fn block_size(mut self, size: usize) -> Self {
        self.block_size = size;
        self
    }

    /// Set the per-level SST count threshold
    pub fn level_ratio(mut self, ratio: usize) -> Self {
        self.level_ratio = ratio;
        self
    }

    /// Set the block cache capacity
    pub fn block_cache_capacity(mut self, capacity: usize) -> Self {
        self.block_cache_capacity = capacity;
        self
    }

    /// Set the LRU-K promotion threshold
    pub fn block_cache_k(mut self, k: usize) -> Self {
        self.block_cache_k = k;
        self
    }

    /// Set the expected Bloom filter element count
    pub fn bloom_expected_size(mut self, size: usize) -> Self {
        self.bloom_expected_size = size;
        self
    }

    /// Set the Bloom filter false-positive rate
    pub fn bloom_error_rate(mut self, rate: f64) -> Self {
        self.bloom_error_rate = rate;
        self
    }

    /// Set the WAL record buffer size
    pub fn wal_buffer_size(mut self, size: usize) -> Self {
        self.wal_buffer_size = size;
        self
    }

    /// Set the WAL segment rotation limit
    pub fn wal_file_size_limit(mut self, limit: u64) -> Self {
        self.wal_file_size_limit = limit;
        self
    }

    /// Set the WAL cleaner scan interval
    pub fn wal_clean_interval(mut self, interval: Duration) -> Self {
        self.wal_clean_interval = interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LsmConfig::default();
        assert_eq!(config.dir, PathBuf::from("./emberdb"));
        assert_eq!(config.total_mem_size_limit, 64 * 1024 * 1024);
        assert_eq!(config.per_mem_size_limit, 4 * 1024 * 1024);
        assert_eq!(config.block_size, 32 * 1024);
        assert_eq!(config.level_ratio, 4);
        assert_eq!(config.block_cache_k, 8);
    }

    #[test]
    fn test_config_builder() {
        let config = LsmConfig::new("/tmp/test")
            .per_mem_size_limit(1024)
            .level_ratio(2)
            .block_size(256)
            .wal_clean_interval(Duration::from_secs(30));

        assert_eq!(config.dir, PathBuf::from("/tmp/test"));
        assert_eq!(config.per_mem_size_limit, 1024);
        assert_eq!(config.level_ratio, 2);
        assert_eq!(config.block_size, 256);
        assert_eq!(config.wal_clean_interval, Duration::from_secs(30));
    }
}
