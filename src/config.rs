use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the storage engine.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding segment files and the manifest (default: `./data`)
    pub data_dir: PathBuf,

    /// Active memtable size that triggers rotation (default: 4MB)
    pub memtable_threshold_bytes: usize,

    /// Target size for compaction output segments (default: 16MB)
    pub segment_size: u64,

    /// Maximum on-disk size of a segment block (default: 4KB)
    pub block_size: usize,

    /// Number of bits in each segment's Bloom filter (default: 1000)
    pub bloom_bits: usize,

    /// Number of hash probes per key in the Bloom filter (default: 3)
    pub bloom_hashes: u32,

    /// Table-count threshold for level 0 (default: 4)
    pub level0_threshold: usize,

    /// Base of the geometric threshold for levels >= 1 (default: 4)
    pub base_threshold: usize,

    /// Growth factor of the geometric threshold for levels >= 1 (default: 2)
    pub increase_factor: usize,

    /// Explicit per-level threshold overrides
    pub level_thresholds: BTreeMap<u32, usize>,

    /// How often the flush worker drains one sealed memtable (default: 50ms)
    pub flush_interval: Duration,

    /// How often the compaction worker scans the levels (default: 200ms)
    pub compaction_interval: Duration,

    /// How long `stop()` waits for in-flight background ticks (default: 5s)
    pub shutdown_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            memtable_threshold_bytes: 4 * 1024 * 1024,
            segment_size: 16 * 1024 * 1024,
            block_size: 4096,
            bloom_bits: 1000,
            bloom_hashes: 3,
            level0_threshold: 4,
            base_threshold: 4,
            increase_factor: 2,
            level_thresholds: BTreeMap::new(),
            flush_interval: Duration::from_millis(50),
            compaction_interval: Duration::from_millis(200),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl Config {
    /// Create a new config rooted at the given data directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: dir.into(),
            ..Default::default()
        }
    }

    /// Set the memtable rotation threshold in bytes
    pub fn memtable_threshold_bytes(mut self, bytes: usize) -> Self {
        self.memtable_threshold_bytes = bytes;
        self
    }

    /// Set the target compaction output segment size in bytes
    pub fn segment_size(mut self, bytes: u64) -> Self {
        self.segment_size = bytes;
        self
    }

    /// Set the segment block size in bytes
    pub fn block_size(mut self, bytes: usize) -> Self {
        self.block_size = bytes;
        self
    }

    /// Set the Bloom filter geometry
    pub fn bloom(mut self, bits: usize, hashes: u32) -> Self {
        self.bloom_bits = bits;
        self.bloom_hashes = hashes;
        self
    }

    /// Set the level-0 table-count compaction trigger
    pub fn level0_threshold(mut self, tables: usize) -> Self {
        self.level0_threshold = tables;
        self
    }

    /// Set the geometric trigger for levels >= 1 (`base * factor^level`)
    pub fn level_growth(mut self, base: usize, factor: usize) -> Self {
        self.base_threshold = base;
        self.increase_factor = factor;
        self
    }

    /// Override the table-count trigger for one specific level
    pub fn level_threshold_override(mut self, level: u32, tables: usize) -> Self {
        self.level_thresholds.insert(level, tables);
        self
    }

    /// Set the flush worker period
    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Set the compaction worker period
    pub fn compaction_interval(mut self, interval: Duration) -> Self {
        self.compaction_interval = interval;
        self
    }

    /// Table-count threshold above which the given level is compacted.
    ///
    /// Explicit overrides win; otherwise level 0 uses the fixed trigger and
    /// deeper levels grow geometrically.
    pub fn level_threshold(&self, level: u32) -> usize {
        if let Some(&tables) = self.level_thresholds.get(&level) {
            return tables;
        }
        if level == 0 {
            self.level0_threshold
        } else {
            self.base_threshold
                .saturating_mul(self.increase_factor.saturating_pow(level))
        }
    }
}
