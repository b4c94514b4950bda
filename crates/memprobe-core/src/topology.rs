//! # Host Topology Detection
//!
//! Detects the NUMA and package layout the engine sweeps over:
//! NUMA nodes with their logical CPU sets, the CPU → node map, and the
//! physical package count used to key DRAM power readers.
//!
//! Detection reads Linux sysfs (`/sys/devices/system/node`,
//! `/sys/devices/system/cpu`) and falls back to a single-node, single-package
//! topology on other platforms or when sysfs is unavailable. Detection never
//! fails.
//!
//! Invariant: the per-node CPU lists partition the host's logical CPUs — every
//! CPU belongs to exactly one node.

/// NUMA node, CPU, and physical package layout of the host.
#[derive(Debug, Clone)]
pub struct SystemTopology {
    num_nodes: usize,
    cpus_per_node: Vec<Vec<usize>>,
    cpu_to_node: Vec<usize>,
    cpu_to_package: Vec<usize>,
    num_packages: usize,
}

impl SystemTopology {
    /// Detects the host topology, falling back to a single node when NUMA
    /// information is unavailable.
    #[must_use]
    pub fn detect() -> Self {
        #[cfg(target_os = "linux")]
        {
            if let Some(topo) = Self::detect_sysfs() {
                return topo;
            }
        }

        Self::single_node_fallback()
    }

    #[cfg(target_os = "linux")]
    fn detect_sysfs() -> Option<Self> {
        use std::fs;
        use std::path::Path;

        let node_root = Path::new("/sys/devices/system/node");
        if !node_root.exists() {
            return None;
        }

        let mut node_ids: Vec<usize> = Vec::new();
        for entry in fs::read_dir(node_root).ok()? {
            let entry = entry.ok()?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(id) = name.strip_prefix("node").and_then(|s| s.parse().ok()) {
                node_ids.push(id);
            }
        }
        if node_ids.is_empty() {
            return None;
        }
        node_ids.sort_unstable();
        let num_nodes = node_ids.last().copied()? + 1;

        let num_cpus = Self::online_cpu_count();
        let mut cpus_per_node = vec![Vec::new(); num_nodes];
        let mut cpu_to_node = vec![0usize; num_cpus];

        for &node in &node_ids {
            let cpulist = node_root.join(format!("node{node}")).join("cpulist");
            let Ok(list) = fs::read_to_string(&cpulist) else {
                continue;
            };
            let cpus = parse_cpulist(list.trim());
            for &cpu in &cpus {
                if cpu < num_cpus {
                    cpu_to_node[cpu] = node;
                }
            }
            cpus_per_node[node] = cpus;
        }

        let (cpu_to_package, num_packages) = Self::detect_packages(num_cpus);

        Some(Self {
            num_nodes,
            cpus_per_node,
            cpu_to_node,
            cpu_to_package,
            num_packages,
        })
    }

    /// Maps each logical CPU to its physical package id via
    /// `cpu<N>/topology/physical_package_id`. Missing entries land in
    /// package 0.
    #[cfg(target_os = "linux")]
    fn detect_packages(num_cpus: usize) -> (Vec<usize>, usize) {
        use std::fs;

        let mut cpu_to_package = vec![0usize; num_cpus];
        let mut max_package = 0usize;
        for (cpu, slot) in cpu_to_package.iter_mut().enumerate() {
            let path =
                format!("/sys/devices/system/cpu/cpu{cpu}/topology/physical_package_id");
            if let Ok(contents) = fs::read_to_string(&path) {
                if let Ok(package) = contents.trim().parse::<usize>() {
                    *slot = package;
                    max_package = max_package.max(package);
                }
            }
        }
        (cpu_to_package, max_package + 1)
    }

    #[cfg(target_os = "linux")]
    fn online_cpu_count() -> usize {
        if let Ok(online) = std::fs::read_to_string("/sys/devices/system/cpu/online") {
            if let Some(max) = parse_cpulist(online.trim()).into_iter().max() {
                return max + 1;
            }
        }
        num_cpus::get()
    }

    fn single_node_fallback() -> Self {
        let num_cpus = num_cpus::get();
        Self {
            num_nodes: 1,
            cpus_per_node: vec![(0..num_cpus).collect()],
            cpu_to_node: vec![0; num_cpus],
            cpu_to_package: vec![0; num_cpus],
            num_packages: 1,
        }
    }

    /// Number of NUMA nodes.
    #[must_use]
    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    /// Total number of logical CPUs.
    #[must_use]
    pub fn num_cpus(&self) -> usize {
        self.cpu_to_node.len()
    }

    /// Number of physical packages (sockets).
    #[must_use]
    pub fn num_packages(&self) -> usize {
        self.num_packages
    }

    /// Logical CPUs belonging to a node; empty for an invalid node id.
    #[must_use]
    pub fn cpus_for_node(&self, node: usize) -> &[usize] {
        self.cpus_per_node.get(node).map_or(&[], Vec::as_slice)
    }

    /// NUMA node of a logical CPU; 0 for an invalid CPU id.
    #[must_use]
    pub fn node_for_cpu(&self, cpu: usize) -> usize {
        self.cpu_to_node.get(cpu).copied().unwrap_or(0)
    }

    /// Physical package of a logical CPU; 0 for an invalid CPU id.
    #[must_use]
    pub fn package_for_cpu(&self, cpu: usize) -> usize {
        self.cpu_to_package.get(cpu).copied().unwrap_or(0)
    }

    /// The `index`-th logical CPU of a node, wrapping when `index` exceeds
    /// the node's CPU count. Used to place worker `k` of a benchmark onto its
    /// configured CPU node.
    #[must_use]
    pub fn cpu_in_node(&self, node: usize, index: usize) -> Option<usize> {
        let cpus = self.cpus_for_node(node);
        if cpus.is_empty() {
            return None;
        }
        Some(cpus[index % cpus.len()])
    }

    /// True when the host exposes more than one NUMA node.
    #[must_use]
    pub fn is_numa(&self) -> bool {
        self.num_nodes > 1
    }

    /// Logs the detected layout at info level.
    pub fn log(&self) {
        tracing::info!(
            "topology: {} NUMA node(s), {} logical CPU(s), {} package(s)",
            self.num_nodes,
            self.num_cpus(),
            self.num_packages
        );
        for node in 0..self.num_nodes {
            tracing::info!("  node {}: CPUs {:?}", node, self.cpus_for_node(node));
        }
    }
}

/// Parses a sysfs CPU list such as `0-3,8-11` into explicit CPU ids.
fn parse_cpulist(s: &str) -> Vec<usize> {
    let mut cpus = Vec::new();
    for part in s.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if let Some((lo, hi)) = part.split_once('-') {
            if let (Ok(lo), Ok(hi)) = (lo.parse::<usize>(), hi.parse::<usize>()) {
                cpus.extend(lo..=hi);
            }
        } else if let Ok(cpu) = part.parse::<usize>() {
            cpus.push(cpu);
        }
    }
    cpus
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_is_sane() {
        let topo = SystemTopology::detect();
        assert!(topo.num_nodes() >= 1);
        assert!(topo.num_cpus() >= 1);
        assert!(topo.num_packages() >= 1);
    }

    #[test]
    fn cpus_partition_without_overlap() {
        let topo = SystemTopology::detect();
        let mut seen = std::collections::HashSet::new();
        for node in 0..topo.num_nodes() {
            for &cpu in topo.cpus_for_node(node) {
                assert!(seen.insert(cpu), "CPU {cpu} listed in more than one node");
                assert_eq!(topo.node_for_cpu(cpu), node);
            }
        }
    }

    #[test]
    fn cpu_in_node_wraps() {
        let topo = SystemTopology::detect();
        let cpus = topo.cpus_for_node(0);
        assert!(!cpus.is_empty());
        assert_eq!(topo.cpu_in_node(0, 0), Some(cpus[0]));
        assert_eq!(topo.cpu_in_node(0, cpus.len()), Some(cpus[0]));
    }

    #[test]
    fn invalid_ids_degrade_to_zero() {
        let topo = SystemTopology::detect();
        assert_eq!(topo.node_for_cpu(usize::MAX), 0);
        assert_eq!(topo.package_for_cpu(usize::MAX), 0);
        assert!(topo.cpus_for_node(usize::MAX).is_empty());
    }

    #[test]
    fn parse_cpulist_forms() {
        assert_eq!(parse_cpulist("0"), vec![0]);
        assert_eq!(parse_cpulist("0-3"), vec![0, 1, 2, 3]);
        assert_eq!(parse_cpulist("0,2,4"), vec![0, 2, 4]);
        assert_eq!(parse_cpulist("0-1,8-9"), vec![0, 1, 8, 9]);
        assert_eq!(parse_cpulist(""), Vec::<usize>::new());
    }

    #[test]
    fn fallback_is_single_node() {
        let topo = SystemTopology::single_node_fallback();
        assert_eq!(topo.num_nodes(), 1);
        assert_eq!(topo.num_packages(), 1);
        assert_eq!(topo.cpus_for_node(0).len(), topo.num_cpus());
    }
}
