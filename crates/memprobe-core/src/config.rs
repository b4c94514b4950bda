//! # Engine Configuration
//!
//! The validated, read-only configuration object consumed by the engine.
//! Built through [`EngineConfigBuilder`]; every invalid or mutually-exclusive
//! combination is rejected by [`EngineConfig::validate`] before any memory is
//! allocated, so a rejected configuration has no side effects and is safe to
//! retry with corrected input.

use crate::arena;

/// Width in bits of each individual memory access performed by a kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ChunkWidth {
    /// 32-bit accesses.
    Bits32,
    /// 64-bit accesses.
    Bits64,
    /// 128-bit accesses.
    Bits128,
    /// 256-bit accesses.
    Bits256,
}

impl ChunkWidth {
    /// All supported widths, in canonical ascending order.
    pub const ALL: [ChunkWidth; 4] = [
        ChunkWidth::Bits32,
        ChunkWidth::Bits64,
        ChunkWidth::Bits128,
        ChunkWidth::Bits256,
    ];

    /// Width in bits.
    #[must_use]
    pub fn bits(self) -> u32 {
        match self {
            ChunkWidth::Bits32 => 32,
            ChunkWidth::Bits64 => 64,
            ChunkWidth::Bits128 => 128,
            ChunkWidth::Bits256 => 256,
        }
    }

    /// Width in bytes.
    #[must_use]
    pub fn bytes(self) -> usize {
        self.bits() as usize / 8
    }

    /// Parses a width from its bit count.
    #[must_use]
    pub fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            32 => Some(ChunkWidth::Bits32),
            64 => Some(ChunkWidth::Bits64),
            128 => Some(ChunkWidth::Bits128),
            256 => Some(ChunkWidth::Bits256),
            _ => None,
        }
    }
}

/// Memory access pattern of a benchmark kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pattern {
    /// Fixed-stride traversal of the partition.
    Sequential,
    /// Pointer-chase traversal over a single-cycle permutation of blocks.
    Random,
}

/// Memory operation performed at each access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Load from memory.
    Read,
    /// Store to memory.
    Write,
}

/// Stride sizes (in chunks) accepted for sequential kernels.
pub const VALID_STRIDES: [i64; 10] = [1, -1, 2, -2, 4, -4, 8, -8, 16, -16];

/// Default working-set size per worker thread: 4 MiB.
pub const DEFAULT_WORKING_SET_PER_THREAD: usize = 4 * 1024 * 1024;

/// Errors detected during configuration validation.
///
/// All variants are raised before any allocation; no engine state is mutated.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Working-set size per thread is zero or not a multiple of the page
    /// granularity.
    #[error(
        "working set size per thread must be a nonzero multiple of the {granularity} B page \
         granularity, got {requested} B"
    )]
    WorkingSetNotPageMultiple {
        /// Requested working-set size in bytes.
        requested: usize,
        /// Page granularity the size must be a multiple of.
        granularity: usize,
    },

    /// Worker thread count is zero or exceeds the logical CPU count.
    #[error("worker thread count {requested} must be in 1..={available} (logical CPUs)")]
    InvalidThreadCount {
        /// Requested thread count.
        requested: usize,
        /// Logical CPUs available on the host.
        available: usize,
    },

    /// A stride outside the supported set was requested.
    #[error("invalid stride {0}: strides can be 1, -1, 2, -2, 4, -4, 8, -8, 16, or -16")]
    InvalidStride(i64),

    /// One of the enabled-dimension sets is empty.
    #[error("at least one {0} must be enabled")]
    EmptyDimension(&'static str),

    /// Huge pages and explicit NUMA placement were both requested on a host
    /// whose huge-page facility is not NUMA-aware.
    #[error(
        "huge pages cannot be combined with NUMA-aware placement on this host; \
         disable NUMA explicitly to use huge pages"
    )]
    HugePagesWithNuma,

    /// Iteration count of zero makes every measurement empty.
    #[error("iteration count must be at least 1")]
    ZeroIterations,
}

/// Validated, read-only engine configuration.
///
/// Constructed via [`EngineConfig::builder`]. Field accessors are the only
/// public surface; the engine never mutates a configuration after
/// construction.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    working_set_per_thread: usize,
    worker_threads: usize,
    chunk_widths: Vec<ChunkWidth>,
    strides: Vec<i64>,
    patterns: Vec<Pattern>,
    operations: Vec<Operation>,
    numa_enabled: bool,
    large_pages: bool,
    iterations: u32,
    starting_test_index: u32,
    output_file: Option<std::path::PathBuf>,
}

impl EngineConfig {
    /// Creates a new configuration builder with the default dimension sets.
    #[must_use]
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    /// Working-set size per worker thread, in bytes.
    #[must_use]
    pub fn working_set_per_thread(&self) -> usize {
        self.working_set_per_thread
    }

    /// Number of worker threads per benchmark.
    #[must_use]
    pub fn worker_threads(&self) -> usize {
        self.worker_threads
    }

    /// Enabled chunk widths, canonical ascending order.
    #[must_use]
    pub fn chunk_widths(&self) -> &[ChunkWidth] {
        &self.chunk_widths
    }

    /// Enabled sequential strides, canonical order.
    #[must_use]
    pub fn strides(&self) -> &[i64] {
        &self.strides
    }

    /// Enabled access patterns, sequential first.
    #[must_use]
    pub fn patterns(&self) -> &[Pattern] {
        &self.patterns
    }

    /// Enabled operations, reads first.
    #[must_use]
    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    /// Whether NUMA-aware placement is enabled.
    #[must_use]
    pub fn numa_enabled(&self) -> bool {
        self.numa_enabled
    }

    /// Whether working sets are backed by huge pages.
    #[must_use]
    pub fn large_pages(&self) -> bool {
        self.large_pages
    }

    /// Iterations per benchmark configuration.
    #[must_use]
    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    /// Starting test index for row numbering.
    #[must_use]
    pub fn starting_test_index(&self) -> u32 {
        self.starting_test_index
    }

    /// CSV output path, if file output was requested.
    #[must_use]
    pub fn output_file(&self) -> Option<&std::path::Path> {
        self.output_file.as_deref()
    }

    /// Allocation granularity implied by the page mode.
    #[must_use]
    pub fn granularity(&self) -> usize {
        if self.large_pages {
            arena::huge_page_size()
        } else {
            arena::page_size()
        }
    }
}

/// Builder for [`EngineConfig`].
///
/// Defaults mirror the classic single-thread sweep: 64-bit chunks, +1 stride,
/// sequential pattern, reads and writes, NUMA enabled, one iteration.
#[derive(Debug)]
pub struct EngineConfigBuilder {
    working_set_per_thread: usize,
    worker_threads: usize,
    chunk_widths: Vec<ChunkWidth>,
    strides: Vec<i64>,
    patterns: Vec<Pattern>,
    operations: Vec<Operation>,
    numa_enabled: bool,
    large_pages: bool,
    iterations: u32,
    starting_test_index: u32,
    output_file: Option<std::path::PathBuf>,
}

impl Default for EngineConfigBuilder {
    fn default() -> Self {
        Self {
            working_set_per_thread: DEFAULT_WORKING_SET_PER_THREAD,
            worker_threads: 1,
            chunk_widths: vec![ChunkWidth::Bits64],
            strides: vec![1],
            patterns: vec![Pattern::Sequential],
            operations: vec![Operation::Read, Operation::Write],
            numa_enabled: true,
            large_pages: false,
            iterations: 1,
            starting_test_index: 1,
            output_file: None,
        }
    }
}

impl EngineConfigBuilder {
    /// Sets the working-set size per worker thread, in bytes.
    #[must_use]
    pub fn working_set_per_thread(mut self, bytes: usize) -> Self {
        self.working_set_per_thread = bytes;
        self
    }

    /// Sets the number of worker threads.
    #[must_use]
    pub fn worker_threads(mut self, n: usize) -> Self {
        self.worker_threads = n;
        self
    }

    /// Replaces the enabled chunk widths.
    #[must_use]
    pub fn chunk_widths(mut self, widths: Vec<ChunkWidth>) -> Self {
        self.chunk_widths = widths;
        self
    }

    /// Replaces the enabled sequential strides.
    #[must_use]
    pub fn strides(mut self, strides: Vec<i64>) -> Self {
        self.strides = strides;
        self
    }

    /// Replaces the enabled access patterns.
    #[must_use]
    pub fn patterns(mut self, patterns: Vec<Pattern>) -> Self {
        self.patterns = patterns;
        self
    }

    /// Replaces the enabled operations.
    #[must_use]
    pub fn operations(mut self, operations: Vec<Operation>) -> Self {
        self.operations = operations;
        self
    }

    /// Enables or disables NUMA-aware placement.
    #[must_use]
    pub fn numa_enabled(mut self, enabled: bool) -> Self {
        self.numa_enabled = enabled;
        self
    }

    /// Enables or disables huge-page backing for working sets.
    #[must_use]
    pub fn large_pages(mut self, enabled: bool) -> Self {
        self.large_pages = enabled;
        self
    }

    /// Sets the iteration count per benchmark configuration.
    #[must_use]
    pub fn iterations(mut self, n: u32) -> Self {
        self.iterations = n;
        self
    }

    /// Sets the starting test index.
    #[must_use]
    pub fn starting_test_index(mut self, index: u32) -> Self {
        self.starting_test_index = index;
        self
    }

    /// Enables CSV file output at the given path.
    #[must_use]
    pub fn output_file(mut self, path: impl Into<std::path::PathBuf>) -> Self {
        self.output_file = Some(path.into());
        self
    }

    /// Enables every dimension: all chunks, all strides, both patterns, both
    /// operations.
    #[must_use]
    pub fn all_dimensions(mut self) -> Self {
        self.chunk_widths = ChunkWidth::ALL.to_vec();
        self.strides = VALID_STRIDES.to_vec();
        self.patterns = vec![Pattern::Sequential, Pattern::Random];
        self.operations = vec![Operation::Read, Operation::Write];
        self
    }

    /// Validates and builds the configuration.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] describing the first rejected option. No
    /// allocation has taken place when this returns.
    pub fn build(self) -> Result<EngineConfig, ConfigError> {
        let granularity = if self.large_pages {
            arena::huge_page_size()
        } else {
            arena::page_size()
        };

        if self.working_set_per_thread == 0 || self.working_set_per_thread % granularity != 0 {
            return Err(ConfigError::WorkingSetNotPageMultiple {
                requested: self.working_set_per_thread,
                granularity,
            });
        }

        let available = num_cpus::get();
        if self.worker_threads == 0 || self.worker_threads > available {
            return Err(ConfigError::InvalidThreadCount {
                requested: self.worker_threads,
                available,
            });
        }

        if self.chunk_widths.is_empty() {
            return Err(ConfigError::EmptyDimension("chunk width"));
        }
        if self.patterns.is_empty() {
            return Err(ConfigError::EmptyDimension("access pattern"));
        }
        if self.operations.is_empty() {
            return Err(ConfigError::EmptyDimension("operation"));
        }
        if self.patterns.contains(&Pattern::Sequential) && self.strides.is_empty() {
            return Err(ConfigError::EmptyDimension("stride"));
        }

        for &stride in &self.strides {
            if !VALID_STRIDES.contains(&stride) {
                return Err(ConfigError::InvalidStride(stride));
            }
        }

        // The huge-page facility used for working sets is not NUMA-aware, so
        // the combination must be rejected here, not at allocation time.
        if self.large_pages && self.numa_enabled {
            return Err(ConfigError::HugePagesWithNuma);
        }

        if self.iterations == 0 {
            return Err(ConfigError::ZeroIterations);
        }

        let mut chunk_widths = self.chunk_widths;
        chunk_widths.sort_unstable();
        chunk_widths.dedup();

        let mut strides = self.strides;
        strides.sort_unstable_by_key(|s| (s.unsigned_abs(), s.is_negative()));
        strides.dedup();

        let mut patterns = self.patterns;
        patterns.sort_unstable_by_key(|p| matches!(p, Pattern::Random));
        patterns.dedup();

        let mut operations = self.operations;
        operations.sort_unstable_by_key(|o| matches!(o, Operation::Write));
        operations.dedup();

        Ok(EngineConfig {
            working_set_per_thread: self.working_set_per_thread,
            worker_threads: self.worker_threads,
            chunk_widths,
            strides,
            patterns,
            operations,
            numa_enabled: self.numa_enabled,
            large_pages: self.large_pages,
            iterations: self.iterations,
            starting_test_index: self.starting_test_index,
            output_file: self.output_file,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_build_succeeds() {
        let config = EngineConfig::builder().build().unwrap();
        assert_eq!(config.worker_threads(), 1);
        assert_eq!(config.chunk_widths(), &[ChunkWidth::Bits64]);
        assert_eq!(config.strides(), &[1]);
        assert_eq!(config.patterns(), &[Pattern::Sequential]);
        assert_eq!(config.iterations(), 1);
        assert!(config.numa_enabled());
        assert!(!config.large_pages());
    }

    #[test]
    fn rejects_non_page_multiple_working_set() {
        // 10 KB is not a multiple of the 4 KB page granularity.
        let err = EngineConfig::builder()
            .working_set_per_thread(10 * 1024)
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::WorkingSetNotPageMultiple { .. }));
    }

    #[test]
    fn rejects_zero_working_set() {
        let err = EngineConfig::builder()
            .working_set_per_thread(0)
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::WorkingSetNotPageMultiple { .. }));
    }

    #[test]
    fn rejects_excess_threads() {
        let err = EngineConfig::builder()
            .worker_threads(num_cpus::get() + 1)
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidThreadCount { .. }));
    }

    #[test]
    fn rejects_huge_pages_with_numa() {
        let err = EngineConfig::builder()
            .large_pages(true)
            .working_set_per_thread(arena::huge_page_size())
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::HugePagesWithNuma));
    }

    #[test]
    fn huge_pages_allowed_without_numa() {
        let config = EngineConfig::builder()
            .large_pages(true)
            .numa_enabled(false)
            .working_set_per_thread(arena::huge_page_size())
            .build()
            .unwrap();
        assert!(config.large_pages());
        assert_eq!(config.granularity(), arena::huge_page_size());
    }

    #[test]
    fn rejects_invalid_stride() {
        let err = EngineConfig::builder().strides(vec![3]).build().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidStride(3)));
    }

    #[test]
    fn rejects_empty_dimensions() {
        let err = EngineConfig::builder()
            .chunk_widths(vec![])
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::EmptyDimension("chunk width")));

        let err = EngineConfig::builder()
            .operations(vec![])
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::EmptyDimension("operation")));
    }

    #[test]
    fn canonicalizes_dimension_order() {
        let config = EngineConfig::builder()
            .chunk_widths(vec![ChunkWidth::Bits256, ChunkWidth::Bits32, ChunkWidth::Bits32])
            .strides(vec![-16, 1, -1, 16])
            .patterns(vec![Pattern::Random, Pattern::Sequential])
            .operations(vec![Operation::Write, Operation::Read])
            .build()
            .unwrap();
        assert_eq!(config.chunk_widths(), &[ChunkWidth::Bits32, ChunkWidth::Bits256]);
        assert_eq!(config.strides(), &[1, -1, 16, -16]);
        assert_eq!(config.patterns(), &[Pattern::Sequential, Pattern::Random]);
        assert_eq!(config.operations(), &[Operation::Read, Operation::Write]);
    }

    #[test]
    fn chunk_width_conversions() {
        for width in ChunkWidth::ALL {
            assert_eq!(ChunkWidth::from_bits(width.bits()), Some(width));
            assert_eq!(width.bytes() * 8, width.bits() as usize);
        }
        assert_eq!(ChunkWidth::from_bits(48), None);
    }
}
