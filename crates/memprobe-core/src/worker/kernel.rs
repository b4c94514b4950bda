//! # Access Kernels
//!
//! The timed inner loops. A kernel is prepared outside the timed region
//! (pointer-chase construction included), then run for a pass count; every
//! kernel has a structurally identical dummy twin that executes the same
//! loop control flow without touching memory, so the fixed loop and timing
//! cost can be measured and subtracted.

use super::chase::{self, ChaseLayout};
use crate::arena::Partition;
use crate::config::{ChunkWidth, Operation, Pattern};
use std::hint::black_box;

/// A 256-bit access lane.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
struct Lane256 {
    lo: u128,
    hi: u128,
}

/// A prepared kernel for one worker: geometry resolved, chase built.
#[derive(Debug)]
pub(crate) enum AccessKernel {
    /// Fixed-stride traversal with wrap at the partition boundary.
    Sequential {
        /// Access width.
        chunk: ChunkWidth,
        /// Signed stride in chunks.
        stride: i64,
        /// Operation at each step.
        operation: Operation,
        /// Chunks in the partition.
        len_chunks: usize,
        /// Accesses in one pass.
        accesses_per_pass: u64,
    },
    /// Dependent pointer chase over a single-cycle block permutation.
    Chase {
        /// Chase geometry in the partition.
        layout: ChaseLayout,
        /// Store back through the chain instead of load-only.
        write: bool,
    },
}

impl AccessKernel {
    /// Prepares the kernel for `partition`. For [`Pattern::Random`] this
    /// builds the chase in place; the work happens outside any timed region.
    pub(crate) fn prepare(
        partition: &Partition,
        pattern: Pattern,
        operation: Operation,
        chunk: ChunkWidth,
        stride: i64,
        seed: u64,
    ) -> Self {
        match pattern {
            Pattern::Sequential => {
                let len_chunks = partition.len() / chunk.bytes();
                let step = stride.unsigned_abs().max(1) as usize;
                let accesses_per_pass = (len_chunks / step).max(1) as u64;
                AccessKernel::Sequential {
                    chunk,
                    stride,
                    operation,
                    len_chunks,
                    accesses_per_pass,
                }
            }
            Pattern::Random => {
                let layout = chase::build(partition, chunk, seed);
                AccessKernel::Chase {
                    layout,
                    write: operation == Operation::Write,
                }
            }
        }
    }

    /// Prepares the latency-probe kernel: always a load-dependent chase,
    /// regardless of the configuration's declared pattern and operation.
    pub(crate) fn prepare_probe(partition: &Partition, chunk: ChunkWidth, seed: u64) -> Self {
        let layout = chase::build(partition, chunk, seed);
        AccessKernel::Chase {
            layout,
            write: false,
        }
    }

    /// Bytes moved by one pass.
    pub(crate) fn bytes_per_pass(&self) -> u64 {
        match self {
            AccessKernel::Sequential {
                chunk,
                accesses_per_pass,
                ..
            } => accesses_per_pass * chunk.bytes() as u64,
            AccessKernel::Chase { layout, .. } => {
                (layout.num_blocks * layout.block_size) as u64
            }
        }
    }

    /// Accesses performed by one pass.
    pub(crate) fn accesses_per_pass(&self) -> u64 {
        match self {
            AccessKernel::Sequential {
                accesses_per_pass, ..
            } => *accesses_per_pass,
            AccessKernel::Chase { layout, .. } => layout.num_blocks as u64,
        }
    }

    /// Runs `passes` passes over the partition, returning bytes moved.
    pub(crate) fn run(&self, partition: &Partition, passes: u64) -> u64 {
        match self {
            AccessKernel::Sequential {
                chunk,
                stride,
                operation,
                len_chunks,
                accesses_per_pass,
            } => {
                let base = partition.as_mut_ptr();
                for _ in 0..passes {
                    match (chunk, operation) {
                        (ChunkWidth::Bits32, Operation::Read) => {
                            seq_read::<u32>(base, *len_chunks, *stride, *accesses_per_pass);
                        }
                        (ChunkWidth::Bits32, Operation::Write) => {
                            seq_write::<u32>(base, *len_chunks, *stride, *accesses_per_pass);
                        }
                        (ChunkWidth::Bits64, Operation::Read) => {
                            seq_read::<u64>(base, *len_chunks, *stride, *accesses_per_pass);
                        }
                        (ChunkWidth::Bits64, Operation::Write) => {
                            seq_write::<u64>(base, *len_chunks, *stride, *accesses_per_pass);
                        }
                        (ChunkWidth::Bits128, Operation::Read) => {
                            seq_read::<u128>(base, *len_chunks, *stride, *accesses_per_pass);
                        }
                        (ChunkWidth::Bits128, Operation::Write) => {
                            seq_write::<u128>(base, *len_chunks, *stride, *accesses_per_pass);
                        }
                        (ChunkWidth::Bits256, Operation::Read) => {
                            seq_read::<Lane256>(base, *len_chunks, *stride, *accesses_per_pass);
                        }
                        (ChunkWidth::Bits256, Operation::Write) => {
                            seq_write::<Lane256>(base, *len_chunks, *stride, *accesses_per_pass);
                        }
                    }
                }
                passes * self.bytes_per_pass()
            }
            AccessKernel::Chase { layout, write } => {
                let mut offset = 0u64;
                for _ in 0..passes {
                    offset = if *write {
                        chase::traverse_write(partition, *layout, offset)
                    } else {
                        chase::traverse_read(partition, *layout, offset)
                    };
                }
                black_box(offset);
                passes * self.bytes_per_pass()
            }
        }
    }

    /// Runs the dummy twin: identical loop control flow and pass structure,
    /// no memory dereference.
    pub(crate) fn run_dummy(&self, passes: u64) {
        match self {
            AccessKernel::Sequential {
                stride,
                len_chunks,
                accesses_per_pass,
                ..
            } => {
                for _ in 0..passes {
                    seq_dummy(*len_chunks, *stride, *accesses_per_pass);
                }
            }
            AccessKernel::Chase { layout, .. } => {
                let mut offset = 0u64;
                for _ in 0..passes {
                    for _ in 0..layout.num_blocks {
                        offset = black_box(offset.wrapping_add(layout.block_size as u64));
                    }
                }
                black_box(offset);
            }
        }
    }
}

/// Advances a chunk index by a signed stride, wrapping at the boundary.
#[inline]
#[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
fn wrap_step(index: usize, stride: i64, len_chunks: usize) -> usize {
    debug_assert!(len_chunks > 0);
    (index as i64 + stride).rem_euclid(len_chunks as i64) as usize
}

/// Start index for a stride direction: negative strides walk down from the
/// last chunk.
#[inline]
fn start_chunk(stride: i64, len_chunks: usize) -> usize {
    if stride < 0 {
        len_chunks - 1
    } else {
        0
    }
}

fn seq_read<T: Copy>(base: *mut u8, len_chunks: usize, stride: i64, accesses: u64) {
    let base = base.cast::<T>();
    let mut index = start_chunk(stride, len_chunks);
    for _ in 0..accesses {
        // SAFETY: index < len_chunks, and len_chunks * size_of::<T>() fits
        // the partition the kernel was prepared for.
        #[allow(unsafe_code)]
        let value = unsafe { base.add(index).read_volatile() };
        let _ = value;
        index = wrap_step(index, stride, len_chunks);
    }
}

fn seq_write<T: Copy + Default>(base: *mut u8, len_chunks: usize, stride: i64, accesses: u64) {
    let base = base.cast::<T>();
    let fill = T::default();
    let mut index = start_chunk(stride, len_chunks);
    for _ in 0..accesses {
        // SAFETY: index < len_chunks, and len_chunks * size_of::<T>() fits
        // the partition the kernel was prepared for.
        #[allow(unsafe_code)]
        unsafe {
            base.add(index).write_volatile(fill);
        }
        index = wrap_step(index, stride, len_chunks);
    }
}

/// Dummy twin of the sequential kernels: same index arithmetic per step,
/// no dereference. `black_box` keeps the loop from collapsing to a closed
/// form.
fn seq_dummy(len_chunks: usize, stride: i64, accesses: u64) {
    let mut index = start_chunk(stride, len_chunks);
    for _ in 0..accesses {
        index = black_box(wrap_step(index, stride, len_chunks));
    }
    black_box(index);
}
