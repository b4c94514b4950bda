//! # Worker Execution Core
//!
//! Thread-per-worker kernel runner. The coordinator creates all workers for
//! a configuration, waits until every worker has reached READY, then releases
//! a shared start gate so all timed regions begin after a single
//! synchronization point; cross-thread start skew is bounded by scheduler
//! wake latency.
//!
//! Per-worker state machine: CREATED → READY (thread spawned, blocked on the
//! gate) → RUNNING (timed kernel) → DONE (counters finalized) → joined. Each
//! worker samples the monotonic clock immediately around its own kernel loop;
//! there is no shared stop signal and no mid-run cancellation — a run either
//! completes all its passes or the engine is already tearing down.
//!
//! Calibration: every worker also times the dummy twin of its kernel and
//! reports `adjusted = elapsed − dummy`. A non-positive difference, a failed
//! affinity pin, or an interval too small for the clock's granularity raises
//! the worker's warning flag; it never aborts the run.

mod chase;
mod kernel;

use crate::arena::Partition;
use crate::config::{ChunkWidth, Operation, Pattern};
use kernel::AccessKernel;
use parking_lot::{Condvar, Mutex};
use std::sync::OnceLock;
use std::time::Instant;

/// A measured interval must exceed the observed clock granularity by this
/// factor, or the worker flags its result.
const MIN_RESOLVABLE_STEPS: u64 = 1000;

/// Errors constructing or joining a worker pool. Non-fatal to the process:
/// the manager abandons the remaining matrix and preserves emitted rows.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// The OS refused to spawn a worker thread.
    #[error("failed to spawn worker {index}: {message}")]
    SpawnFailed {
        /// Worker index within the configuration.
        index: usize,
        /// OS error description.
        message: String,
    },

    /// A worker thread panicked before finalizing its counters.
    #[error("worker {index} panicked")]
    Panicked {
        /// Worker index within the configuration.
        index: usize,
    },

    /// The configured CPU node has no usable CPUs to pin to.
    #[error("no usable CPUs on node {node}")]
    NoCpus {
        /// The empty CPU node.
        node: usize,
    },
}

/// Role of one worker within a configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerRole {
    /// Throughput-generating worker running the configured kernel.
    Load,
    /// Latency measurement worker: always a load-dependent pointer chase.
    LatencyProbe,
}

/// Placement of one worker: its pinned CPU and exclusive arena partition.
#[derive(Debug)]
pub struct WorkerAssignment {
    /// Worker index within the configuration.
    pub index: usize,
    /// Logical CPU to pin to; `None` leaves the thread unpinned (and flags
    /// the result).
    pub cpu: Option<usize>,
    /// Exclusive, disjoint working-set partition.
    pub partition: Partition,
    /// Load generator or latency probe.
    pub role: WorkerRole,
}

/// Kernel parameters shared by every worker of one configuration.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionPlan {
    /// Access pattern of the load kernel.
    pub pattern: Pattern,
    /// Operation of the load kernel.
    pub operation: Operation,
    /// Access width.
    pub chunk: ChunkWidth,
    /// Signed stride in chunks (sequential only; the random sentinel is 0).
    pub stride: i64,
    /// Iterations to execute back to back.
    pub iterations: u32,
    /// Passes per iteration for load workers.
    pub load_passes: u64,
    /// Passes per iteration for the latency probe.
    pub probe_passes: u64,
    /// Base seed for chase construction; each worker derives its own.
    pub seed: u64,
}

/// Finalized counters of one worker, readable after join.
#[derive(Debug, Clone)]
pub struct WorkerOutcome {
    /// Worker index within the configuration.
    pub index: usize,
    /// Role the worker executed.
    pub role: WorkerRole,
    /// Monotonic nanoseconds spent in the real kernel.
    pub elapsed_ticks: u64,
    /// Monotonic nanoseconds spent in the dummy kernel.
    pub elapsed_dummy_ticks: u64,
    /// `elapsed_ticks − elapsed_dummy_ticks`, saturating at zero.
    pub adjusted_ticks: u64,
    /// Bytes moved per pass.
    pub bytes_per_pass: u64,
    /// Total passes executed (all iterations).
    pub passes: u64,
    /// Total individual accesses performed.
    pub accesses: u64,
    /// Total bytes moved.
    pub bytes_moved: u64,
    /// Result is suspect: calibration, affinity, or timer resolution.
    pub warning: bool,
}

/// Shared start gate: workers arrive and block; the coordinator releases all
/// of them at once, or aborts them if pool construction failed part-way.
struct StartGate {
    state: Mutex<GateState>,
    cond: Condvar,
}

#[derive(Default)]
struct GateState {
    ready: usize,
    signal: Option<GateSignal>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GateSignal {
    Go,
    Abort,
}

impl StartGate {
    fn new() -> Self {
        Self {
            state: Mutex::new(GateState::default()),
            cond: Condvar::new(),
        }
    }

    /// Worker side: signal READY and block until released.
    fn arrive_and_wait(&self) -> GateSignal {
        let mut state = self.state.lock();
        state.ready += 1;
        self.cond.notify_all();
        loop {
            if let Some(signal) = state.signal {
                return signal;
            }
            self.cond.wait(&mut state);
        }
    }

    /// Coordinator side: block until `count` workers are READY.
    fn wait_ready(&self, count: usize) {
        let mut state = self.state.lock();
        while state.ready < count {
            self.cond.wait(&mut state);
        }
    }

    /// Coordinator side: release every waiter with one signal.
    fn release(&self, signal: GateSignal) {
        let mut state = self.state.lock();
        state.signal = Some(signal);
        self.cond.notify_all();
    }
}

/// Runs one configuration's workers to completion and returns their
/// counters, ordered by worker index.
///
/// # Errors
///
/// Returns [`WorkerError`] when a thread cannot be spawned or panics; the
/// spawned workers are released through the abort path before this returns.
pub fn run_workers(
    plan: &ExecutionPlan,
    assignments: Vec<WorkerAssignment>,
) -> Result<Vec<WorkerOutcome>, WorkerError> {
    let count = assignments.len();
    let gate = StartGate::new();
    let plan = *plan;

    std::thread::scope(|scope| {
        let mut handles = Vec::with_capacity(count);
        let mut spawn_error = None;

        for assignment in assignments {
            let index = assignment.index;
            let gate = &gate;
            let spawned = std::thread::Builder::new()
                .name(format!("memprobe-worker-{index}"))
                .spawn_scoped(scope, move || worker_main(&plan, assignment, gate));
            match spawned {
                Ok(handle) => handles.push((index, handle)),
                Err(err) => {
                    spawn_error = Some(WorkerError::SpawnFailed {
                        index,
                        message: err.to_string(),
                    });
                    break;
                }
            }
        }

        if let Some(err) = spawn_error {
            // Release the workers that did spawn so the scope can close.
            gate.release(GateSignal::Abort);
            for (_, handle) in handles {
                let _ = handle.join();
            }
            return Err(err);
        }

        gate.wait_ready(count);
        gate.release(GateSignal::Go);

        let mut outcomes = Vec::with_capacity(count);
        for (index, handle) in handles {
            let outcome = handle
                .join()
                .map_err(|_| WorkerError::Panicked { index })?;
            outcomes.push(outcome);
        }
        outcomes.sort_by_key(|o| o.index);
        Ok(outcomes)
    })
}

/// Body of one worker thread: pin, prepare, READY, timed kernels, DONE.
fn worker_main(
    plan: &ExecutionPlan,
    assignment: WorkerAssignment,
    gate: &StartGate,
) -> WorkerOutcome {
    let mut warning = false;

    match assignment.cpu {
        Some(cpu) => {
            if let Err(message) = pin_to_cpu(cpu) {
                tracing::warn!(
                    "worker {}: failed to pin to CPU {cpu}: {message}",
                    assignment.index
                );
                warning = true;
            }
        }
        None => warning = true,
    }

    let seed = plan.seed ^ (assignment.index as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    let (kernel, passes_per_iteration) = match assignment.role {
        WorkerRole::Load => (
            AccessKernel::prepare(
                &assignment.partition,
                plan.pattern,
                plan.operation,
                plan.chunk,
                plan.stride,
                seed,
            ),
            plan.load_passes,
        ),
        WorkerRole::LatencyProbe => (
            AccessKernel::prepare_probe(&assignment.partition, plan.chunk, seed),
            plan.probe_passes,
        ),
    };

    if gate.arrive_and_wait() == GateSignal::Abort {
        return WorkerOutcome {
            index: assignment.index,
            role: assignment.role,
            elapsed_ticks: 0,
            elapsed_dummy_ticks: 0,
            adjusted_ticks: 0,
            bytes_per_pass: kernel.bytes_per_pass(),
            passes: 0,
            accesses: 0,
            bytes_moved: 0,
            warning: true,
        };
    }

    let mut bytes_moved = 0u64;
    let started = Instant::now();
    for _ in 0..plan.iterations {
        bytes_moved += kernel.run(&assignment.partition, passes_per_iteration);
    }
    let elapsed_ticks = saturating_nanos(started.elapsed());

    let dummy_started = Instant::now();
    for _ in 0..plan.iterations {
        kernel.run_dummy(passes_per_iteration);
    }
    let elapsed_dummy_ticks = saturating_nanos(dummy_started.elapsed());

    let adjusted_ticks = elapsed_ticks.saturating_sub(elapsed_dummy_ticks);
    if adjusted_ticks == 0 {
        tracing::warn!(
            "worker {}: dummy kernel ({} ns) swallowed the measurement ({} ns)",
            assignment.index,
            elapsed_dummy_ticks,
            elapsed_ticks
        );
        warning = true;
    }
    if elapsed_ticks < timer_granularity_ns() * MIN_RESOLVABLE_STEPS {
        warning = true;
    }

    let total_passes = u64::from(plan.iterations) * passes_per_iteration;
    WorkerOutcome {
        index: assignment.index,
        role: assignment.role,
        elapsed_ticks,
        elapsed_dummy_ticks,
        adjusted_ticks,
        bytes_per_pass: kernel.bytes_per_pass(),
        passes: total_passes,
        accesses: total_passes * kernel.accesses_per_pass(),
        bytes_moved,
        warning,
    }
}

fn saturating_nanos(duration: std::time::Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

/// Smallest nonzero step the monotonic clock was observed to take.
fn timer_granularity_ns() -> u64 {
    static GRANULARITY: OnceLock<u64> = OnceLock::new();
    *GRANULARITY.get_or_init(|| {
        let mut smallest = u64::MAX;
        for _ in 0..64 {
            let start = Instant::now();
            let mut elapsed = start.elapsed();
            while elapsed.is_zero() {
                elapsed = start.elapsed();
            }
            smallest = smallest.min(saturating_nanos(elapsed));
        }
        smallest.max(1)
    })
}

/// Pins the current thread to one logical CPU.
#[cfg(target_os = "linux")]
fn pin_to_cpu(cpu: usize) -> Result<(), String> {
    use libc::{cpu_set_t, sched_setaffinity, CPU_SET, CPU_ZERO};
    use std::mem;

    // SAFETY: the cpu_set_t is zero-initialized and CPU_SET stays within its
    // capacity; pid 0 targets the calling thread.
    #[allow(unsafe_code)]
    unsafe {
        let mut set: cpu_set_t = mem::zeroed();
        CPU_ZERO(&mut set);
        CPU_SET(cpu, &mut set);
        if sched_setaffinity(0, mem::size_of::<cpu_set_t>(), &raw const set) != 0 {
            return Err(std::io::Error::last_os_error().to_string());
        }
    }
    Ok(())
}

/// Pinning is unsupported here; callers flag the result.
#[cfg(not(target_os = "linux"))]
fn pin_to_cpu(_cpu: usize) -> Result<(), String> {
    Err("CPU pinning is not supported on this platform".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::{ArenaBacking, WorkingSetArena};

    const WS: usize = 32 * 1024;

    fn arena_for(threads: usize) -> WorkingSetArena {
        WorkingSetArena::allocate(0, WS * threads, ArenaBacking::Standard { numa_aware: false })
            .unwrap()
    }

    fn plan(pattern: Pattern) -> ExecutionPlan {
        ExecutionPlan {
            pattern,
            operation: Operation::Read,
            chunk: ChunkWidth::Bits64,
            stride: if pattern == Pattern::Sequential { 1 } else { 0 },
            iterations: 2,
            load_passes: 4,
            probe_passes: 2,
            seed: 99,
        }
    }

    fn assignments(arena: &WorkingSetArena, roles: &[WorkerRole]) -> Vec<WorkerAssignment> {
        roles
            .iter()
            .enumerate()
            .map(|(index, &role)| WorkerAssignment {
                index,
                cpu: Some(index % num_cpus::get()),
                partition: arena.partition(index, WS).unwrap(),
                role,
            })
            .collect()
    }

    #[test]
    fn single_load_worker_completes() {
        let arena = arena_for(1);
        let outcomes =
            run_workers(&plan(Pattern::Sequential), assignments(&arena, &[WorkerRole::Load]))
                .unwrap();
        assert_eq!(outcomes.len(), 1);

        let outcome = &outcomes[0];
        assert_eq!(outcome.role, WorkerRole::Load);
        assert_eq!(outcome.passes, 2 * 4);
        assert_eq!(outcome.bytes_per_pass, WS as u64);
        assert_eq!(outcome.bytes_moved, 8 * WS as u64);
        assert!(outcome.elapsed_ticks > 0);
        assert_eq!(
            outcome.adjusted_ticks,
            outcome.elapsed_ticks.saturating_sub(outcome.elapsed_dummy_ticks)
        );
    }

    #[test]
    fn probe_and_load_workers_complete() {
        let arena = arena_for(2);
        let outcomes = run_workers(
            &plan(Pattern::Sequential),
            assignments(&arena, &[WorkerRole::LatencyProbe, WorkerRole::Load]),
        )
        .unwrap();
        assert_eq!(outcomes.len(), 2);

        let probe = &outcomes[0];
        assert_eq!(probe.role, WorkerRole::LatencyProbe);
        assert_eq!(probe.passes, 2 * 2);
        assert_eq!(probe.accesses, probe.passes * (WS as u64 / 8));

        let load = &outcomes[1];
        assert_eq!(load.role, WorkerRole::Load);
        assert_eq!(load.passes, 2 * 4);
    }

    #[test]
    fn random_pattern_load_workers_complete() {
        let arena = arena_for(2);
        let outcomes = run_workers(
            &plan(Pattern::Random),
            assignments(&arena, &[WorkerRole::Load, WorkerRole::Load]),
        )
        .unwrap();
        assert_eq!(outcomes.len(), 2);
        for outcome in &outcomes {
            assert_eq!(outcome.bytes_moved, outcome.passes * outcome.bytes_per_pass);
        }
    }

    #[test]
    fn unpinned_worker_is_flagged() {
        let arena = arena_for(1);
        let mut assignments = assignments(&arena, &[WorkerRole::Load]);
        assignments[0].cpu = None;
        let outcomes = run_workers(&plan(Pattern::Sequential), assignments).unwrap();
        assert!(outcomes[0].warning);
    }

    #[test]
    fn outcomes_are_ordered_by_index() {
        let arena = arena_for(3);
        let roles = [WorkerRole::Load, WorkerRole::Load, WorkerRole::Load];
        let outcomes = run_workers(&plan(Pattern::Sequential), assignments(&arena, &roles)).unwrap();
        let indices: Vec<usize> = outcomes.iter().map(|o| o.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn timer_granularity_is_positive() {
        let step = timer_granularity_ns();
        assert!(step >= 1);
        // Sane monotonic clocks resolve far below a millisecond.
        assert!(step < 1_000_000);
    }

    #[test]
    fn gate_releases_all_waiters() {
        let gate = std::sync::Arc::new(StartGate::new());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let gate = std::sync::Arc::clone(&gate);
            handles.push(std::thread::spawn(move || gate.arrive_and_wait()));
        }
        gate.wait_ready(4);
        gate.release(GateSignal::Go);
        for handle in handles {
            assert_eq!(handle.join().unwrap(), GateSignal::Go);
        }
    }
}
