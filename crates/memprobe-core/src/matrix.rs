//! # Benchmark Matrix
//!
//! Enumerates the cross product of enabled dimensions into an ordered
//! sequence of benchmark specifications. Order: memory node, CPU node,
//! pattern (sequential block first), operation, chunk width, stride
//! (sequential only). Every combination yields a throughput spec; a latency
//! spec follows it unless the run is single-threaded and an unloaded-latency
//! spec already exists — one unloaded measurement is enough no matter how
//! many other dimensions are swept.
//!
//! The test index lives in an explicit [`RunContext`] threaded through the
//! build; it advances only when a latency spec is appended, so the throughput
//! and latency specs of one combination share an index, distinguished by the
//! `T`/`L` display suffix.

use crate::config::{ChunkWidth, EngineConfig, Operation, Pattern};

/// Stride value carried by specs whose pattern has no stride dimension.
pub const RANDOM_STRIDE_SENTINEL: i64 = 0;

/// Byte volume one pass set should move, tuning pass counts to working-set
/// size so each iteration's duration stays in a measurable band.
const PASS_VOLUME_KB: u64 = 64 * 1024;

/// What a benchmark measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BenchmarkKind {
    /// Aggregate bytes/second under full worker load.
    Throughput,
    /// Nanoseconds per dependent access, under `threads − 1` of load.
    Latency,
}

/// One fully resolved benchmark configuration, immutable once built.
#[derive(Debug, Clone)]
pub struct BenchmarkSpec {
    /// What this benchmark measures.
    pub kind: BenchmarkKind,
    /// Access pattern of the load kernel.
    pub pattern: Pattern,
    /// Operation of the load kernel.
    pub operation: Operation,
    /// Access width.
    pub chunk: ChunkWidth,
    /// Signed stride in chunks; [`RANDOM_STRIDE_SENTINEL`] for random.
    pub stride: i64,
    /// NUMA node holding the working set.
    pub mem_node: usize,
    /// NUMA node supplying the worker CPUs.
    pub cpu_node: usize,
    /// Total worker threads.
    pub thread_count: usize,
    /// Iterations to execute.
    pub iterations: u32,
    /// Passes per iteration, size-adaptive.
    pub passes_per_iteration: u64,
    /// Display index; shared by the T/L pair of one combination.
    pub test_index: u32,
    /// Display name, e.g. `Test #4T (Throughput)`.
    pub name: String,
}

impl BenchmarkSpec {
    /// Number of load-generating threads: all of them for throughput, all
    /// but the probe for latency.
    #[must_use]
    pub fn load_thread_count(&self) -> usize {
        match self.kind {
            BenchmarkKind::Throughput => self.thread_count,
            BenchmarkKind::Latency => self.thread_count - 1,
        }
    }
}

/// Per-invocation mutable state threaded through the build: the current test
/// index. One context per engine run; there is no ambient global.
#[derive(Debug)]
pub struct RunContext {
    test_index: u32,
}

impl RunContext {
    /// Starts a context at the configured base index.
    #[must_use]
    pub fn new(starting_test_index: u32) -> Self {
        Self {
            test_index: starting_test_index,
        }
    }

    /// Current test index.
    #[must_use]
    pub fn current(&self) -> u32 {
        self.test_index
    }

    fn advance(&mut self) {
        self.test_index += 1;
    }
}

/// Passes per iteration for a working set, monotonically non-increasing in
/// working-set size: larger sets get fewer passes.
#[must_use]
pub fn passes_for_working_set(working_set_kb: u64) -> u64 {
    (PASS_VOLUME_KB / working_set_kb.max(1)).clamp(1, 65536)
}

/// Enumerates the benchmark matrix for a configuration.
#[derive(Debug)]
pub struct MatrixBuilder<'a> {
    config: &'a EngineConfig,
    num_nodes: usize,
}

impl<'a> MatrixBuilder<'a> {
    /// Creates a builder sweeping `num_nodes` NUMA nodes; a NUMA-disabled
    /// configuration collapses the sweep to a single node.
    #[must_use]
    pub fn new(config: &'a EngineConfig, num_nodes: usize) -> Self {
        let num_nodes = if config.numa_enabled() {
            num_nodes.max(1)
        } else {
            1
        };
        Self { config, num_nodes }
    }

    /// Number of nodes the matrix sweeps.
    #[must_use]
    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    /// Builds the ordered spec sequence, advancing `ctx` as latency specs are
    /// appended.
    #[must_use]
    pub fn build(&self, ctx: &mut RunContext) -> Vec<BenchmarkSpec> {
        let config = self.config;
        let working_set_kb = (config.working_set_per_thread() / 1024) as u64;
        let throughput_passes = passes_for_working_set(working_set_kb);
        let latency_passes = (throughput_passes / 4).max(1);

        let mut specs = Vec::new();
        let mut latency_emitted = false;

        for mem_node in 0..self.num_nodes {
            for cpu_node in 0..self.num_nodes {
                for &pattern in config.patterns() {
                    for &operation in config.operations() {
                        for &chunk in config.chunk_widths() {
                            let strides: &[i64] = match pattern {
                                Pattern::Sequential => config.strides(),
                                Pattern::Random => &[RANDOM_STRIDE_SENTINEL],
                            };
                            for &stride in strides {
                                specs.push(self.spec(
                                    BenchmarkKind::Throughput,
                                    pattern,
                                    operation,
                                    chunk,
                                    stride,
                                    mem_node,
                                    cpu_node,
                                    throughput_passes,
                                    ctx.current(),
                                ));

                                if config.worker_threads() > 1 || !latency_emitted {
                                    specs.push(self.spec(
                                        BenchmarkKind::Latency,
                                        pattern,
                                        operation,
                                        chunk,
                                        stride,
                                        mem_node,
                                        cpu_node,
                                        latency_passes,
                                        ctx.current(),
                                    ));
                                    ctx.advance();
                                    latency_emitted = true;
                                }
                            }
                        }
                    }
                }
            }
        }

        specs
    }

    #[allow(clippy::too_many_arguments)]
    fn spec(
        &self,
        kind: BenchmarkKind,
        pattern: Pattern,
        operation: Operation,
        chunk: ChunkWidth,
        stride: i64,
        mem_node: usize,
        cpu_node: usize,
        passes_per_iteration: u64,
        test_index: u32,
    ) -> BenchmarkSpec {
        let name = match kind {
            BenchmarkKind::Throughput => format!("Test #{test_index}T (Throughput)"),
            BenchmarkKind::Latency => format!("Test #{test_index}L (Latency)"),
        };
        BenchmarkSpec {
            kind,
            pattern,
            operation,
            chunk,
            stride,
            mem_node,
            cpu_node,
            thread_count: self.config.worker_threads(),
            iterations: self.config.iterations(),
            passes_per_iteration,
            test_index,
            name,
        }
    }
}
