//! # Pointer-Chase Construction
//!
//! Decomposes a worker's partition into chunk-sized blocks and links them
//! into a single cycle: each block stores the byte offset of the next block
//! to visit. The successor permutation is built with Sattolo's algorithm,
//! the cycle-guaranteeing variant of Fisher-Yates — restricting each swap
//! partner to a strictly smaller index yields a permutation that is one
//! n-cycle, so a full pass visits every block exactly once before returning
//! to the start. A plain uniform shuffle can decompose into disjoint
//! sub-cycles and would under-measure latency; it is never used here.
//!
//! Every dereference of the chain feeds the next address, so consecutive
//! accesses form a true data dependency with no instruction-level overlap.

use crate::arena::Partition;
use crate::config::ChunkWidth;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Geometry of a chase laid out in a partition.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ChaseLayout {
    /// Size of each block in bytes; holds at least the next-offset word.
    pub block_size: usize,
    /// Number of blocks in the partition.
    pub num_blocks: usize,
}

/// Block size for a chunk width: the chunk itself, widened to hold the
/// next-offset word when the chunk is narrower than `u64`.
pub(crate) fn block_size(chunk: ChunkWidth) -> usize {
    chunk.bytes().max(std::mem::size_of::<u64>())
}

/// Builds the chase in `partition`, returning its layout.
///
/// The permutation is seeded so a worker's chase is reproducible across the
/// dummy/real kernel pair of one run.
pub(crate) fn build(partition: &Partition, chunk: ChunkWidth, seed: u64) -> ChaseLayout {
    let block_size = block_size(chunk);
    let num_blocks = partition.len() / block_size;
    debug_assert!(num_blocks >= 1);

    let successor = sattolo_cycle(num_blocks, seed);

    let base = partition.as_mut_ptr();
    for (block, &next) in successor.iter().enumerate() {
        let offset = block * block_size;
        // SAFETY: offset + 8 <= num_blocks * block_size <= partition length,
        // and block_size >= 8 keeps next-offset words disjoint.
        #[allow(unsafe_code)]
        unsafe {
            base.add(offset)
                .cast::<u64>()
                .write_volatile((next * block_size) as u64);
        }
    }

    ChaseLayout {
        block_size,
        num_blocks,
    }
}

/// Sattolo's algorithm: a uniformly random permutation of `0..n` consisting
/// of exactly one n-cycle.
fn sattolo_cycle(n: usize, seed: u64) -> Vec<usize> {
    let mut successor: Vec<usize> = (0..n).collect();
    let mut rng = StdRng::seed_from_u64(seed);
    for i in (1..n).rev() {
        let j = rng.gen_range(0..i);
        successor.swap(i, j);
    }
    successor
}

/// One full traversal of the chain: follows `num_blocks` successive
/// dereferences from block 0. Returns the final offset so callers can keep
/// the dependency chain alive across passes.
pub(crate) fn traverse_read(partition: &Partition, layout: ChaseLayout, start: u64) -> u64 {
    let base = partition.as_mut_ptr();
    let mut offset = start;
    for _ in 0..layout.num_blocks {
        // SAFETY: offsets written by `build` are block starts inside the
        // partition.
        #[allow(unsafe_code)]
        unsafe {
            offset = base.add(offset as usize).cast::<u64>().read_volatile();
        }
    }
    offset
}

/// One full traversal that stores each block's successor back through the
/// chain, producing dependent write traffic.
pub(crate) fn traverse_write(partition: &Partition, layout: ChaseLayout, start: u64) -> u64 {
    let base = partition.as_mut_ptr();
    let mut offset = start;
    for _ in 0..layout.num_blocks {
        // SAFETY: offsets written by `build` are block starts inside the
        // partition.
        #[allow(unsafe_code)]
        unsafe {
            let slot = base.add(offset as usize).cast::<u64>();
            let next = slot.read_volatile();
            slot.write_volatile(next);
            offset = next;
        }
    }
    offset
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::{ArenaBacking, WorkingSetArena};

    fn test_partition(size: usize) -> (WorkingSetArena, Partition) {
        let arena =
            WorkingSetArena::allocate(0, size, ArenaBacking::Standard { numa_aware: false })
                .unwrap();
        let partition = arena.partition(0, size).unwrap();
        (arena, partition)
    }

    #[test]
    fn sattolo_is_single_cycle() {
        for n in [2usize, 3, 7, 64, 1000] {
            for seed in 0..4u64 {
                let successor = sattolo_cycle(n, seed);

                let mut visited = vec![false; n];
                let mut at = 0usize;
                for _ in 0..n {
                    assert!(!visited[at], "revisited block {at} before cycle closed");
                    visited[at] = true;
                    at = successor[at];
                }
                assert_eq!(at, 0, "cycle did not return to the start block");
                assert!(visited.iter().all(|&v| v));
            }
        }
    }

    #[test]
    fn sattolo_has_no_fixed_points() {
        // A single n-cycle (n >= 2) maps no block to itself.
        let successor = sattolo_cycle(256, 42);
        for (i, &next) in successor.iter().enumerate() {
            assert_ne!(i, next);
        }
    }

    #[test]
    fn built_chase_visits_every_block_once() {
        let (_arena, partition) = test_partition(16 * 1024);
        let layout = build(&partition, ChunkWidth::Bits64, 7);
        assert_eq!(layout.block_size, 8);
        assert_eq!(layout.num_blocks, 16 * 1024 / 8);

        let base = partition.as_mut_ptr();
        let mut visited = std::collections::HashSet::new();
        let mut offset = 0u64;
        for _ in 0..layout.num_blocks {
            assert!(visited.insert(offset), "offset {offset} revisited early");
            assert_eq!(offset as usize % layout.block_size, 0);
            assert!((offset as usize) < partition.len());
            #[allow(unsafe_code)]
            unsafe {
                offset = base.add(offset as usize).cast::<u64>().read_volatile();
            }
        }
        assert_eq!(offset, 0, "traversal must close the cycle at the start");
        assert_eq!(visited.len(), layout.num_blocks);
    }

    #[test]
    fn narrow_chunks_widen_to_offset_word() {
        let (_arena, partition) = test_partition(8 * 1024);
        let layout = build(&partition, ChunkWidth::Bits32, 1);
        assert_eq!(layout.block_size, 8);
    }

    #[test]
    fn wide_chunks_keep_their_size() {
        let (_arena, partition) = test_partition(8 * 1024);
        let layout = build(&partition, ChunkWidth::Bits256, 1);
        assert_eq!(layout.block_size, 32);
        assert_eq!(layout.num_blocks, 8 * 1024 / 32);
    }

    #[test]
    fn traverse_read_completes_pass() {
        let (_arena, partition) = test_partition(4 * 1024);
        let layout = build(&partition, ChunkWidth::Bits64, 3);
        let end = traverse_read(&partition, layout, 0);
        assert_eq!(end, 0);
    }

    #[test]
    fn traverse_write_preserves_cycle() {
        let (_arena, partition) = test_partition(4 * 1024);
        let layout = build(&partition, ChunkWidth::Bits64, 3);
        let end = traverse_write(&partition, layout, 0);
        assert_eq!(end, 0);
        // Chain still closed after write-back.
        assert_eq!(traverse_read(&partition, layout, 0), 0);
    }
}
