//! # Working-Set Arenas
//!
//! One contiguous, page- or huge-page-aligned memory region per tested NUMA
//! node. An arena is allocated once at engine start, carved into disjoint
//! per-worker partitions for each benchmark, and released at engine teardown.
//!
//! Allocation requests one extra granule of slack, then aligns the usable
//! base upward to the granule boundary; the usable length is exactly the
//! requested size. Node placement is strict: the mapping is bound to the
//! requested node with `MPOL_BIND | MPOL_MF_STRICT`, and a bind that cannot
//! be satisfied is an error — never a silent redirect to another node, which
//! would invalidate every NUMA-locality claim of the measurement.
//!
//! Raw pointers never leave this module's types: workers receive [`Partition`]
//! handles whose construction is bounds-checked against the arena.

use crate::config::EngineConfig;
use std::sync::OnceLock;

/// Errors raised by working-set allocation. All variants are fatal to the
/// engine run: a benchmark without a correctly placed working set measures
/// nothing meaningful.
#[derive(Debug, thiserror::Error)]
pub enum ArenaError {
    /// The backing mapping could not be created.
    #[error("failed to allocate {size} B on node {node}: {message}")]
    AllocationFailed {
        /// Target NUMA node.
        node: usize,
        /// Requested mapping size in bytes.
        size: usize,
        /// OS error description.
        message: String,
    },

    /// Strict node binding was refused by the kernel.
    #[error("failed to bind {size} B to node {node}: {message}")]
    BindFailed {
        /// Target NUMA node.
        node: usize,
        /// Mapping size in bytes.
        size: usize,
        /// OS error description.
        message: String,
    },

    /// Huge-page backing is not available on this platform.
    #[error("huge-page working sets are not supported on this platform")]
    HugePagesUnsupported,

    /// A requested partition does not fit inside the arena.
    #[error(
        "partition {index} ({size} B) exceeds arena on node {node} ({usable} B usable)"
    )]
    PartitionOutOfRange {
        /// Partition index.
        index: usize,
        /// Partition size in bytes.
        size: usize,
        /// Owning node.
        node: usize,
        /// Usable arena length.
        usable: usize,
    },
}

/// Backing mode for an arena, selected once at configuration validation time.
///
/// Huge pages are uniform-only: the huge-page facility is not NUMA-aware, and
/// the [`EngineConfig`] builder rejects the combination before allocation is
/// ever attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArenaBacking {
    /// Standard pages; `numa_aware` selects strict node binding.
    Standard {
        /// Bind each arena to its node (`MPOL_BIND | MPOL_MF_STRICT`).
        numa_aware: bool,
    },
    /// Huge pages, uniform placement.
    Huge,
}

impl ArenaBacking {
    /// Selects the backing implied by a validated configuration.
    #[must_use]
    pub fn from_config(config: &EngineConfig) -> Self {
        if config.large_pages() {
            ArenaBacking::Huge
        } else {
            ArenaBacking::Standard {
                numa_aware: config.numa_enabled(),
            }
        }
    }

    /// Allocation granularity of this backing.
    #[must_use]
    pub fn granularity(self) -> usize {
        match self {
            ArenaBacking::Standard { .. } => page_size(),
            ArenaBacking::Huge => huge_page_size(),
        }
    }
}

/// Host standard page size in bytes.
#[must_use]
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        #[cfg(unix)]
        {
            // SAFETY: sysconf with a valid name has no preconditions.
            #[allow(unsafe_code)]
            let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
            if sz > 0 {
                return sz as usize;
            }
        }
        4096
    })
}

/// Host huge page size in bytes (`Hugepagesize` from `/proc/meminfo`,
/// defaulting to 2 MiB).
#[must_use]
pub fn huge_page_size() -> usize {
    static HUGE_PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *HUGE_PAGE_SIZE.get_or_init(|| {
        #[cfg(target_os = "linux")]
        {
            if let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") {
                for line in meminfo.lines() {
                    if let Some(rest) = line.strip_prefix("Hugepagesize:") {
                        if let Some(kb) = rest
                            .split_whitespace()
                            .next()
                            .and_then(|v| v.parse::<usize>().ok())
                        {
                            return kb * 1024;
                        }
                    }
                }
            }
        }
        2 * 1024 * 1024
    })
}

/// An exclusive, disjoint sub-range of an arena assigned to one worker.
///
/// Partitions are created bounds-checked by [`WorkingSetArena::partition`]
/// and stay valid for the lifetime of the owning arena, which the manager
/// holds across every worker join.
#[derive(Debug)]
pub struct Partition {
    ptr: *mut u8,
    len: usize,
}

// SAFETY: a Partition is an exclusive view of a disjoint byte range; the
// arena guarantees no two partitions overlap, so moving one to another
// thread cannot alias.
#[allow(unsafe_code)]
unsafe impl Send for Partition {}

impl Partition {
    /// Length of the partition in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when the partition is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Base address, for range assertions.
    #[must_use]
    pub fn base_addr(&self) -> usize {
        self.ptr as usize
    }

    pub(crate) fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr
    }
}

/// A contiguous, aligned working-set region owned by one NUMA node.
#[derive(Debug)]
pub struct WorkingSetArena {
    /// Original mapping base, kept for release.
    mapping: *mut u8,
    /// Full mapping length including alignment slack.
    mapping_len: usize,
    /// Usable base, aligned up to the granule boundary.
    aligned: *mut u8,
    /// Usable length (the originally requested size).
    usable_len: usize,
    granularity: usize,
    node: usize,
    backing: ArenaBacking,
}

// SAFETY: the arena owns its mapping exclusively; all shared access goes
// through disjoint Partition handles.
#[allow(unsafe_code)]
unsafe impl Send for WorkingSetArena {}
#[allow(unsafe_code)]
unsafe impl Sync for WorkingSetArena {}

impl WorkingSetArena {
    /// Allocates a working-set arena of `usable_size` bytes on `node`.
    ///
    /// The mapping is one granule larger than requested; the usable base is
    /// aligned up to the granule boundary, so the slack is never part of the
    /// usable range.
    ///
    /// # Errors
    ///
    /// Returns [`ArenaError`] when the mapping or the strict node binding
    /// fails. No fallback is attempted.
    pub fn allocate(
        node: usize,
        usable_size: usize,
        backing: ArenaBacking,
    ) -> Result<Self, ArenaError> {
        let granularity = backing.granularity();
        let mapping_len = usable_size + granularity;

        let mapping = Self::map(node, mapping_len, backing)?;

        let mask = granularity - 1;
        let aligned = ((mapping as usize + mask) & !mask) as *mut u8;

        tracing::debug!(
            "arena node {}: mapped {} B at {:#x}, aligned base {:#x}, {} B usable",
            node,
            mapping_len,
            mapping as usize,
            aligned as usize,
            usable_size
        );

        Ok(Self {
            mapping,
            mapping_len,
            aligned,
            usable_len: usable_size,
            granularity,
            node,
            backing,
        })
    }

    #[cfg(target_os = "linux")]
    fn map(node: usize, len: usize, backing: ArenaBacking) -> Result<*mut u8, ArenaError> {
        let mut flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
        if backing == ArenaBacking::Huge {
            flags |= libc::MAP_HUGETLB;
        }

        // SAFETY: anonymous private mapping with no fixed address.
        #[allow(unsafe_code)]
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                flags,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(ArenaError::AllocationFailed {
                node,
                size: len,
                message: std::io::Error::last_os_error().to_string(),
            });
        }
        let ptr = ptr.cast::<u8>();

        if let ArenaBacking::Standard { numa_aware: true } = backing {
            if let Err(err) = bind_to_node(ptr, len, node) {
                // SAFETY: ptr/len are the mapping just created above.
                #[allow(unsafe_code)]
                unsafe {
                    libc::munmap(ptr.cast(), len);
                }
                return Err(err);
            }
        }

        Ok(ptr)
    }

    #[cfg(not(target_os = "linux"))]
    fn map(node: usize, len: usize, backing: ArenaBacking) -> Result<*mut u8, ArenaError> {
        if backing == ArenaBacking::Huge {
            return Err(ArenaError::HugePagesUnsupported);
        }

        let layout = std::alloc::Layout::from_size_align(len, backing.granularity())
            .map_err(|e| ArenaError::AllocationFailed {
                node,
                size: len,
                message: e.to_string(),
            })?;
        // SAFETY: layout has nonzero size.
        #[allow(unsafe_code)]
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(ArenaError::AllocationFailed {
                node,
                size: len,
                message: "allocator returned null".to_string(),
            });
        }
        Ok(ptr)
    }

    /// Usable base address; `base_addr() % granularity() == 0` always holds.
    #[must_use]
    pub fn base_addr(&self) -> usize {
        self.aligned as usize
    }

    /// Usable length in bytes.
    #[must_use]
    pub fn usable_len(&self) -> usize {
        self.usable_len
    }

    /// Allocation granularity (standard or huge page size).
    #[must_use]
    pub fn granularity(&self) -> usize {
        self.granularity
    }

    /// Owning NUMA node.
    #[must_use]
    pub fn node(&self) -> usize {
        self.node
    }

    /// Backing mode of this arena.
    #[must_use]
    pub fn backing(&self) -> ArenaBacking {
        self.backing
    }

    /// The exclusive partition `index × size .. index × size + size`.
    ///
    /// # Errors
    ///
    /// Returns [`ArenaError::PartitionOutOfRange`] when the range does not
    /// fit inside the usable region.
    pub fn partition(&self, index: usize, size: usize) -> Result<Partition, ArenaError> {
        let start = index
            .checked_mul(size)
            .ok_or(ArenaError::PartitionOutOfRange {
                index,
                size,
                node: self.node,
                usable: self.usable_len,
            })?;
        let end = start
            .checked_add(size)
            .ok_or(ArenaError::PartitionOutOfRange {
                index,
                size,
                node: self.node,
                usable: self.usable_len,
            })?;
        if end > self.usable_len || size == 0 {
            return Err(ArenaError::PartitionOutOfRange {
                index,
                size,
                node: self.node,
                usable: self.usable_len,
            });
        }
        // SAFETY: start + size <= usable_len, so the offset stays inside the
        // mapping.
        #[allow(unsafe_code)]
        let ptr = unsafe { self.aligned.add(start) };
        Ok(Partition { ptr, len: size })
    }

    /// Touches every granule of the usable region once, faulting pages in so
    /// first-touch cost never lands inside a timed kernel.
    pub fn prefault(&self) {
        let step = self.granularity;
        let mut offset = 0;
        while offset < self.usable_len {
            // SAFETY: offset < usable_len keeps the write inside the mapping.
            #[allow(unsafe_code)]
            unsafe {
                self.aligned.add(offset).write_volatile(0);
            }
            offset += step;
        }
    }
}

impl Drop for WorkingSetArena {
    fn drop(&mut self) {
        if self.mapping.is_null() {
            return;
        }

        #[cfg(target_os = "linux")]
        // SAFETY: mapping/mapping_len are exactly what mmap returned.
        #[allow(unsafe_code)]
        unsafe {
            libc::munmap(self.mapping.cast(), self.mapping_len);
        }

        #[cfg(not(target_os = "linux"))]
        // SAFETY: the layout matches the allocation in `map`.
        #[allow(unsafe_code)]
        unsafe {
            if let Ok(layout) =
                std::alloc::Layout::from_size_align(self.mapping_len, self.granularity)
            {
                std::alloc::dealloc(self.mapping, layout);
            }
        }
    }
}

/// Binds a mapping to one node, strictly: `MPOL_BIND` with `MPOL_MF_STRICT`,
/// so pages that cannot land on `node` fail the call instead of migrating
/// elsewhere.
#[cfg(target_os = "linux")]
fn bind_to_node(ptr: *mut u8, len: usize, node: usize) -> Result<(), ArenaError> {
    const MPOL_BIND: i32 = 2;
    const MPOL_MF_STRICT: u32 = 1;
    const MPOL_MF_MOVE: u32 = 2;

    let mut nodemask: u64 = 0;
    if node < 64 {
        nodemask = 1u64 << node;
    }

    // SAFETY: ptr/len describe a live mapping; the nodemask outlives the call.
    #[allow(unsafe_code)]
    let result = unsafe {
        libc::syscall(
            libc::SYS_mbind,
            ptr,
            len,
            MPOL_BIND,
            &raw const nodemask,
            64usize,
            MPOL_MF_STRICT | MPOL_MF_MOVE,
        )
    };

    if result < 0 {
        let err = std::io::Error::last_os_error();
        // Single-node kernels without NUMA support report ENOSYS; there is
        // only one node to land on, so the placement claim still holds.
        if err.raw_os_error() == Some(libc::ENOSYS) {
            return Ok(());
        }
        return Err(ArenaError::BindFailed {
            node,
            size: len,
            message: err.to_string(),
        });
    }

    Ok(())
}
