//! Hardware topology oracle.
//!
//! Maps worker indices to NUMA nodes and exposes a small integer distance
//! between any two workers. The oracle is computed once at engine init and
//! is immutable afterwards, so lookups are lock-free and thread-safe.

use std::collections::HashMap;

/// Distance between two workers pinned to the same core.
pub const DIST_SELF: i32 = 0;
/// Distance between two workers sharing the innermost level (same node).
pub const DIST_NODE: i32 = 1;
/// Distance between two workers in separate sockets / NUMA nodes.
pub const DIST_REMOTE: i32 = 4;

#[derive(Debug, Clone)]
pub struct Topology {
    pub core_to_node: HashMap<usize, usize>,
    pub node_cores: HashMap<usize, Vec<usize>>,
    pub num_nodes: usize,
    /// Whether detection produced usable hierarchy information.
    detected: bool,
}

impl Topology {
    /// Detects the machine topology.
    ///
    /// Detection is conservative: it defaults to a single NUMA node unless
    /// the core count strongly suggests a multi-socket machine. A wrong
    /// single-node guess costs locality, a wrong multi-node guess costs
    /// correctness of the steal order, so the bias is towards one node.
    pub fn detect() -> Self {
        use sysinfo::{CpuRefreshKind, System};

        let mut system = System::new();
        system.refresh_cpu_specifics(CpuRefreshKind::everything());
        let num_cores = system.cpus().len();
        if num_cores == 0 {
            return Topology::flat(1);
        }

        let estimated_nodes = if num_cores > 32 {
            (num_cores / 16).clamp(1, 4)
        } else {
            1
        };
        Topology::with_nodes(num_cores, estimated_nodes)
    }

    /// Builds a topology with `cores` workers spread round-robin across
    /// `nodes` NUMA nodes. Used directly by tests and by engines that know
    /// their placement better than the detector does.
    pub fn with_nodes(cores: usize, nodes: usize) -> Self {
        let nodes = nodes.max(1);
        let mut core_to_node = HashMap::new();
        let mut node_cores: HashMap<usize, Vec<usize>> = HashMap::new();

        for core in 0..cores {
            let node = core % nodes;
            core_to_node.insert(core, node);
            node_cores.entry(node).or_default().push(core);
        }

        Topology {
            core_to_node,
            node_cores,
            num_nodes: nodes,
            detected: true,
        }
    }

    /// A topology with no hierarchy information: every worker is its own
    /// neighborhood and `nb_levels` reports the information as missing.
    pub fn flat(cores: usize) -> Self {
        let mut t = Topology::with_nodes(cores, 1);
        t.detected = false;
        t
    }

    /// Distance between two workers: 0 for the same worker, 1 within a
    /// NUMA node, 4 across nodes.
    pub fn distance(&self, a: usize, b: usize) -> i32 {
        if a == b {
            return DIST_SELF;
        }
        match (self.core_to_node.get(&a), self.core_to_node.get(&b)) {
            (Some(na), Some(nb)) if na == nb => DIST_NODE,
            (Some(_), Some(_)) => DIST_REMOTE,
            _ => DIST_REMOTE,
        }
    }

    /// Number of hierarchy levels, or -1 when topology information is
    /// unavailable.
    pub fn nb_levels(&self) -> i32 {
        if !self.detected {
            return -1;
        }
        if self.num_nodes > 1 {
            DIST_REMOTE / 2
        } else {
            DIST_NODE / 2
        }
    }

    /// Workers sharing a NUMA node with `worker`.
    pub fn siblings(&self, worker: usize) -> Option<&Vec<usize>> {
        let node = self.core_to_node.get(&worker)?;
        self.node_cores.get(node)
    }

    /// NUMA node of `worker`, defaulting to 0 for unknown workers.
    pub fn node_of(&self, worker: usize) -> usize {
        self.core_to_node.get(&worker).copied().unwrap_or(0)
    }

    /// Number of workers in the node of `worker`.
    pub fn node_size(&self, worker: usize) -> usize {
        self.siblings(worker).map(|s| s.len()).unwrap_or(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance_is_symmetric() {
        let topo = Topology::with_nodes(8, 2);
        for a in 0..8 {
            for b in 0..8 {
                assert_eq!(topo.distance(a, b), topo.distance(b, a));
            }
        }
    }

    #[test]
    fn test_distance_levels() {
        let topo = Topology::with_nodes(4, 2);
        // workers 0 and 2 share node 0, workers 0 and 1 do not
        assert_eq!(topo.distance(0, 0), DIST_SELF);
        assert_eq!(topo.distance(0, 2), DIST_NODE);
        assert_eq!(topo.distance(0, 1), DIST_REMOTE);
    }

    #[test]
    fn test_nb_levels_unavailable() {
        let topo = Topology::flat(4);
        assert_eq!(topo.nb_levels(), -1);
    }

    #[test]
    fn test_node_mapping_consistency() {
        let topo = Topology::with_nodes(6, 2);
        for (core, &node) in &topo.core_to_node {
            assert!(topo.node_cores[&node].contains(core));
        }
        assert_eq!(topo.node_size(0), 3);
    }
}
