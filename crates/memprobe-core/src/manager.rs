//! # Benchmark Manager
//!
//! Top-level orchestrator. Owns the per-node working-set arenas and the
//! per-package power samplers, drives the matrix strictly sequentially —
//! configurations never overlap, so CPU, memory, and power windows never
//! interfere across runs — and assembles one result row per configuration.
//!
//! Failure severity follows the measurement contract: arena allocation
//! failure is fatal to the engine (a silent fallback would invalidate every
//! NUMA-locality claim), while a worker-pool construction failure abandons
//! only the remaining matrix, preserving rows already emitted.

use crate::arena::{ArenaBacking, WorkingSetArena};
use crate::config::{EngineConfig, Pattern};
use crate::matrix::{BenchmarkKind, BenchmarkSpec, MatrixBuilder, RunContext};
use crate::power::{PowerSample, PowerSampler};
use crate::report::{ResultRow, ResultSink};
use crate::topology::SystemTopology;
use crate::worker::{self, ExecutionPlan, WorkerAssignment, WorkerError, WorkerOutcome, WorkerRole};
use crate::Result;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;
const NANOS_PER_SEC: f64 = 1_000_000_000.0;

/// Orchestrates a full benchmark sweep.
#[derive(Debug)]
pub struct BenchmarkManager {
    config: EngineConfig,
    topology: SystemTopology,
    arenas: Vec<WorkingSetArena>,
    samplers: Vec<PowerSampler>,
    num_nodes: usize,
}

impl BenchmarkManager {
    /// Sets up the engine: detects topology, constructs per-package power
    /// samplers, and allocates one working-set arena per tested node.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Arena`] when any node-local allocation fails.
    /// This is fatal to the run; no rows can be produced afterwards.
    pub fn new(config: EngineConfig) -> Result<Self> {
        let topology = SystemTopology::detect();
        topology.log();

        let num_nodes = if config.numa_enabled() {
            topology.num_nodes()
        } else {
            1
        };

        let backing = ArenaBacking::from_config(&config);
        let arena_size = config.worker_threads() * config.working_set_per_thread();

        let mut arenas = Vec::with_capacity(num_nodes);
        for node in 0..num_nodes {
            let arena = WorkingSetArena::allocate(node, arena_size, backing)?;
            arena.prefault();
            tracing::info!(
                "arena: {} B on node {} at {:#x} ({} B granularity)",
                arena.usable_len(),
                node,
                arena.base_addr(),
                arena.granularity()
            );
            arenas.push(arena);
        }

        let samplers = (0..topology.num_packages())
            .map(PowerSampler::for_package)
            .collect();

        Ok(Self {
            config,
            topology,
            arenas,
            samplers,
            num_nodes,
        })
    }

    /// The detected host topology.
    #[must_use]
    pub fn topology(&self) -> &SystemTopology {
        &self.topology
    }

    /// Runs every configuration of the matrix in order, emitting one row per
    /// configuration. Returns the number of rows emitted.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Worker`] when a pool cannot be constructed;
    /// the remaining matrix is abandoned and already-emitted rows stay
    /// valid. Sink failures surface as [`crate::Error::Sink`].
    pub fn run(&mut self, sink: &mut dyn ResultSink) -> Result<usize> {
        let mut ctx = RunContext::new(self.config.starting_test_index());
        let specs = MatrixBuilder::new(&self.config, self.num_nodes).build(&mut ctx);
        tracing::info!("running {} benchmark configuration(s)", specs.len());

        let reader_names: Vec<String> = self
            .samplers
            .iter()
            .map(|s| s.reader_name().to_string())
            .collect();
        sink.begin(&reader_names)?;

        let mut emitted = 0;
        for spec in &specs {
            let row = self.run_one(spec)?;
            sink.emit(&row)?;
            emitted += 1;
        }

        tracing::info!("sweep complete: {emitted} row(s)");
        Ok(emitted)
    }

    /// Runs one configuration: open power windows, drive the worker pool to
    /// completion, close the windows, assemble the row.
    fn run_one(&mut self, spec: &BenchmarkSpec) -> Result<ResultRow> {
        tracing::debug!("{}: starting", spec.name);
        let assignments = self.assignments(spec)?;

        let plan = ExecutionPlan {
            pattern: spec.pattern,
            operation: spec.operation,
            chunk: spec.chunk,
            stride: spec.stride,
            iterations: spec.iterations,
            load_passes: spec.passes_per_iteration,
            probe_passes: spec.passes_per_iteration,
            seed: u64::from(spec.test_index),
        };

        for sampler in &mut self.samplers {
            sampler.start_window();
        }
        let outcome = worker::run_workers(&plan, assignments);
        let power: Vec<PowerSample> = self
            .samplers
            .iter_mut()
            .map(PowerSampler::stop_window)
            .collect();

        let outcomes = outcome?;
        Ok(self.assemble_row(spec, &outcomes, power))
    }

    /// Builds the per-worker placement for a configuration: worker `k` pins
    /// to the `k`-th CPU of the configured CPU node and owns the partition
    /// `k × working_set .. +working_set` of the memory node's arena.
    fn assignments(&self, spec: &BenchmarkSpec) -> Result<Vec<WorkerAssignment>> {
        let arena = &self.arenas[spec.mem_node];
        let working_set = self.config.working_set_per_thread();

        if self.topology.cpus_for_node(spec.cpu_node).is_empty() {
            return Err(WorkerError::NoCpus {
                node: spec.cpu_node,
            }
            .into());
        }

        let mut assignments = Vec::with_capacity(spec.thread_count);
        for index in 0..spec.thread_count {
            let role = if spec.kind == BenchmarkKind::Latency && index == 0 {
                WorkerRole::LatencyProbe
            } else {
                WorkerRole::Load
            };
            assignments.push(WorkerAssignment {
                index,
                cpu: self.topology.cpu_in_node(spec.cpu_node, index),
                partition: arena.partition(index, working_set)?,
                role,
            });
        }
        Ok(assignments)
    }

    fn assemble_row(
        &self,
        spec: &BenchmarkSpec,
        outcomes: &[WorkerOutcome],
        power: Vec<PowerSample>,
    ) -> ResultRow {
        let warning = outcomes.iter().any(|o| o.warning);

        let (throughput_mbs, latency_ns) = match spec.kind {
            BenchmarkKind::Throughput => (aggregate_throughput(outcomes), None),
            BenchmarkKind::Latency => {
                let probe = outcomes
                    .iter()
                    .find(|o| o.role == WorkerRole::LatencyProbe);
                #[allow(clippy::cast_precision_loss)]
                let latency = probe.and_then(|p| {
                    let ticks = if p.adjusted_ticks > 0 {
                        p.adjusted_ticks
                    } else {
                        p.elapsed_ticks
                    };
                    if p.accesses == 0 {
                        None
                    } else {
                        Some(ticks as f64 / p.accesses as f64)
                    }
                });
                let loads: Vec<WorkerOutcome> = outcomes
                    .iter()
                    .filter(|o| o.role == WorkerRole::Load)
                    .cloned()
                    .collect();
                (aggregate_throughput(&loads), latency)
            }
        };

        // Single-thread latency rows have no load kernel to describe.
        let degenerate = spec.kind == BenchmarkKind::Latency && spec.thread_count < 2;
        let stride = if degenerate || spec.pattern == Pattern::Random {
            None
        } else {
            Some(spec.stride)
        };

        ResultRow {
            kind: spec.kind,
            name: spec.name.clone(),
            test_index: spec.test_index,
            iterations: spec.iterations,
            working_set_per_thread_kb: (self.config.working_set_per_thread() / 1024) as u64,
            total_threads: spec.thread_count,
            load_threads: spec.load_thread_count(),
            mem_node: spec.mem_node,
            cpu_node: spec.cpu_node,
            pattern: (!degenerate).then_some(spec.pattern),
            operation: (!degenerate).then_some(spec.operation),
            chunk: (!degenerate).then_some(spec.chunk),
            stride,
            throughput_mbs,
            latency_ns,
            power,
            warning,
        }
    }
}

/// Realized aggregate throughput in MB/s: bytes summed across workers over
/// the maximum elapsed time. The slowest worker bounds end-to-end completion.
fn aggregate_throughput(outcomes: &[WorkerOutcome]) -> Option<f64> {
    if outcomes.is_empty() {
        return None;
    }
    let bytes: u64 = outcomes.iter().map(|o| o.bytes_moved).sum();
    let denominator = outcomes
        .iter()
        .map(|o| o.adjusted_ticks)
        .max()
        .filter(|&t| t > 0)
        .or_else(|| outcomes.iter().map(|o| o.elapsed_ticks).max())?;
    if denominator == 0 {
        return None;
    }
    #[allow(clippy::cast_precision_loss)]
    let mbs = bytes as f64 / BYTES_PER_MB * NANOS_PER_SEC / denominator as f64;
    Some(mbs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChunkWidth, Operation};
    use crate::report::ResultRow;

    /// Collects emitted rows for assertions.
    #[derive(Default)]
    struct CollectSink {
        header_names: Vec<String>,
        rows: Vec<ResultRow>,
    }

    impl ResultSink for CollectSink {
        fn begin(&mut self, power_reader_names: &[String]) -> std::io::Result<()> {
            self.header_names = power_reader_names.to_vec();
            Ok(())
        }

        fn emit(&mut self, row: &ResultRow) -> std::io::Result<()> {
            self.rows.push(row.clone());
            Ok(())
        }
    }

    fn small_config() -> EngineConfig {
        EngineConfig::builder()
            .numa_enabled(false)
            .working_set_per_thread(crate::arena::page_size())
            .worker_threads(1)
            .chunk_widths(vec![ChunkWidth::Bits64])
            .strides(vec![1])
            .patterns(vec![Pattern::Sequential])
            .operations(vec![Operation::Read])
            .build()
            .unwrap()
    }

    #[test]
    fn sweep_emits_one_row_per_spec() {
        let mut manager = BenchmarkManager::new(small_config()).unwrap();
        let mut sink = CollectSink::default();
        let emitted = manager.run(&mut sink).unwrap();

        // 1 chunk x 1 stride x 1 pattern x 1 op: one throughput spec plus
        // the single unloaded-latency spec.
        assert_eq!(emitted, 2);
        assert_eq!(sink.rows.len(), 2);
        assert_eq!(sink.rows[0].kind, BenchmarkKind::Throughput);
        assert_eq!(sink.rows[1].kind, BenchmarkKind::Latency);
        assert_eq!(sink.header_names.len(), manager.topology().num_packages());
    }

    #[test]
    fn throughput_row_carries_metric() {
        let mut manager = BenchmarkManager::new(small_config()).unwrap();
        let mut sink = CollectSink::default();
        manager.run(&mut sink).unwrap();

        let row = &sink.rows[0];
        assert!(row.throughput_mbs.unwrap() > 0.0);
        assert!(row.latency_ns.is_none());
        assert_eq!(row.pattern, Some(Pattern::Sequential));
        assert_eq!(row.load_threads, 1);
    }

    #[test]
    fn unloaded_latency_row_is_degenerate() {
        let mut manager = BenchmarkManager::new(small_config()).unwrap();
        let mut sink = CollectSink::default();
        manager.run(&mut sink).unwrap();

        let row = &sink.rows[1];
        assert_eq!(row.kind, BenchmarkKind::Latency);
        assert_eq!(row.total_threads, 1);
        assert_eq!(row.load_threads, 0);
        assert!(row.latency_ns.unwrap() > 0.0);
        assert!(row.throughput_mbs.is_none());
        assert!(row.pattern.is_none());
        assert!(row.operation.is_none());
        assert!(row.chunk.is_none());
        assert!(row.stride.is_none());
    }

    #[test]
    fn rows_emit_in_increasing_test_index_order() {
        let config = EngineConfig::builder()
            .numa_enabled(false)
            .working_set_per_thread(crate::arena::page_size())
            .worker_threads(num_cpus::get().min(2))
            .chunk_widths(vec![ChunkWidth::Bits32, ChunkWidth::Bits64])
            .strides(vec![1])
            .patterns(vec![Pattern::Sequential])
            .operations(vec![Operation::Read])
            .build()
            .unwrap();
        let mut manager = BenchmarkManager::new(config).unwrap();
        let mut sink = CollectSink::default();
        manager.run(&mut sink).unwrap();

        let indices: Vec<u32> = sink.rows.iter().map(|r| r.test_index).collect();
        let mut sorted = indices.clone();
        sorted.sort_unstable();
        assert_eq!(indices, sorted);
    }

    #[test]
    fn aggregate_uses_slowest_worker() {
        let outcome = |bytes: u64, adjusted: u64| WorkerOutcome {
            index: 0,
            role: WorkerRole::Load,
            elapsed_ticks: adjusted + 10,
            elapsed_dummy_ticks: 10,
            adjusted_ticks: adjusted,
            bytes_per_pass: bytes,
            passes: 1,
            accesses: 1,
            bytes_moved: bytes,
            warning: false,
        };

        // 1 MiB in 1 ms and 1 MiB in 2 ms: 2 MiB over the slower 2 ms.
        let outcomes = vec![outcome(1 << 20, 1_000_000), outcome(1 << 20, 2_000_000)];
        let mbs = aggregate_throughput(&outcomes).unwrap();
        assert!((mbs - 1000.0).abs() < 1e-6);
    }

    #[test]
    fn aggregate_falls_back_to_elapsed_when_calibration_swallows() {
        let outcomes = vec![WorkerOutcome {
            index: 0,
            role: WorkerRole::Load,
            elapsed_ticks: 1_000_000,
            elapsed_dummy_ticks: 2_000_000,
            adjusted_ticks: 0,
            bytes_per_pass: 1 << 20,
            passes: 1,
            accesses: 1,
            bytes_moved: 1 << 20,
            warning: true,
        }];
        let mbs = aggregate_throughput(&outcomes).unwrap();
        assert!((mbs - 1000.0).abs() < 1e-6);
    }

    #[test]
    fn aggregate_of_no_workers_is_unavailable() {
        assert!(aggregate_throughput(&[]).is_none());
    }
}
