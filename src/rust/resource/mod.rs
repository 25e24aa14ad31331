// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

pub mod detect;
pub mod error;
pub mod node;
pub mod usage;

//==============================================================================
// Imports
//==============================================================================

use self::{
    detect::Topology,
    node::Node,
    usage::{
        UsageReport,
        UsageSample,
    },
};
use crate::{
    component::ComponentId,
    runtime::{
        fail::Fail,
        message::TaskId,
    },
};
use ::std::{
    collections::HashMap,
    path::PathBuf,
};

//==============================================================================
// Exports
//==============================================================================

pub use self::error::AllocationError;

//==============================================================================
// Structures
//==============================================================================

/// Platform settings applied on top of the detected topology.
#[derive(Clone, Debug)]
pub struct ResourceSettings {
    pub host: String,
    /// Platform `NODE_ALLOCATION_MODE` is EXCLUSIVE.
    pub exclusive: bool,
    /// Platform `PROCS_PER_NODE`; zero means the detected maximum.
    pub procs_per_node: usize,
    pub use_accurate_nodes: bool,
    /// Where to write the usage report, if anywhere.
    pub usage_report: Option<PathBuf>,
}

/// Inputs of one allocation request.
#[derive(Clone, Debug)]
pub struct AllocationRequest {
    pub owner: ComponentId,
    pub task_id: TaskId,
    pub nproc: usize,
    pub whole_nodes: bool,
    pub whole_sockets: bool,
    /// Requested processes per node; zero means no preference.
    pub task_ppn: usize,
}

/// Cores held on one node.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeShare {
    pub name: String,
    /// Processes placed on the node.
    pub procs: usize,
    /// Core indices reserved on the node.
    pub cores: Vec<usize>,
}

/// Cores granted to a task.
#[derive(Clone, Debug)]
pub struct Allocation {
    pub task_id: TaskId,
    pub owner: ComponentId,
    pub nproc: usize,
    /// Largest number of processes placed on any node.
    pub ppn: usize,
    pub whole_nodes: bool,
    pub whole_sockets: bool,
    pub nodes: Vec<NodeShare>,
    pub accurate: bool,
    pub max_ppn: usize,
    pub cores_per_node: usize,
    pub sockets_per_node: usize,
}

/// Resource Manager
///
/// Owns the node tree. Nodes are kept in two disjoint lists: `avail_nodes`
/// holds every node with no core in use, `alloc_nodes` every node holding at
/// least one core.
pub struct ResourceManager {
    host: String,
    nodes: Vec<Node>,
    avail_nodes: Vec<usize>,
    alloc_nodes: Vec<usize>,
    total_cores: usize,
    avail_cores: usize,
    alloc_cores: usize,
    processes: usize,
    cores_per_node: usize,
    sockets_per_node: usize,
    max_ppn: usize,
    ppn: usize,
    accurate: bool,
    exclusive: bool,
    allocations: HashMap<TaskId, Allocation>,
    usage: Option<UsageReport>,
}

//==============================================================================
// Associate Functions
//==============================================================================

impl ResourceManager {
    /// Builds the node tree from a detected topology.
    pub fn new(topology: Topology, settings: ResourceSettings) -> Result<Self, Fail> {
        let Topology {
            mut nodes,
            cores_per_node,
            mut sockets_per_node,
            max_ppn,
            mut accurate,
        } = topology;

        if accurate && !settings.use_accurate_nodes {
            warn!("new(): accurate node names disabled by platform settings");
            accurate = false;
        }

        let user_ppn: usize = match settings.procs_per_node {
            0 => max_ppn,
            ppn => ppn,
        };
        let ppn: usize = if user_ppn <= max_ppn {
            for node in nodes.iter_mut() {
                node.1 = node.1.min(user_ppn);
            }
            user_ppn
        } else {
            warn!(
                "new(): platform PROCS_PER_NODE ({}) exceeds batch allocation ({}), using the latter",
                user_ppn, max_ppn
            );
            max_ppn
        };

        if sockets_per_node == 0 || cores_per_node % sockets_per_node != 0 {
            warn!(
                "new(): cores per node ({}) not divisible by sockets per node ({}), using one socket",
                cores_per_node, sockets_per_node
            );
            sockets_per_node = 1;
        }

        Self::build(settings, nodes, cores_per_node, sockets_per_node, max_ppn, ppn, accurate)
    }

    /// Builds a synthetic allocation of `nnodes` nodes with `ppn` cores each,
    /// as requested on the command line.
    pub fn with_override(nnodes: usize, ppn: usize, settings: ResourceSettings) -> Result<Self, Fail> {
        let nodes: Vec<(String, usize)> = (0..nnodes).map(|i| (format!("dummy_node{}", i), ppn)).collect();
        let settings: ResourceSettings = ResourceSettings {
            host: format!("override_{}", settings.host),
            ..settings
        };
        Self::build(settings, nodes, ppn, 1, ppn, ppn, false)
    }

    fn build(
        settings: ResourceSettings,
        list: Vec<(String, usize)>,
        cores_per_node: usize,
        sockets_per_node: usize,
        max_ppn: usize,
        ppn: usize,
        accurate: bool,
    ) -> Result<Self, Fail> {
        let mut nodes: Vec<Node> = Vec::with_capacity(list.len());
        for (name, ncores) in list {
            if nodes.iter().any(|n| n.name() == name) {
                warn!("build(): duplicate node {} ignored", name);
                continue;
            }
            nodes.push(Node::new(&name, sockets_per_node, cores_per_node, ncores));
        }
        if nodes.is_empty() {
            let cause: String = format!("no nodes available on host {}", settings.host);
            error!("build(): {}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }
        let total_cores: usize = nodes.iter().map(Node::total_cores).sum();
        info!(
            "build(): {} nodes and {} processors per node ({} cores)",
            nodes.len(),
            ppn,
            total_cores
        );

        let usage: Option<UsageReport> = match settings.usage_report {
            Some(ref path) => Some(UsageReport::create(path, &settings.host, nodes.len(), ppn, accurate)?),
            None => None,
        };

        let mut rm: Self = Self {
            host: settings.host,
            avail_nodes: (0..nodes.len()).collect(),
            alloc_nodes: Vec::new(),
            nodes,
            total_cores,
            avail_cores: total_cores,
            alloc_cores: 0,
            processes: 0,
            cores_per_node,
            sockets_per_node,
            max_ppn,
            ppn,
            accurate,
            exclusive: settings.exclusive,
            allocations: HashMap::new(),
            usage,
        };
        rm.report("initial state of resources");
        Ok(rm)
    }

    /// Effective processes per node for a request.
    pub fn effective_ppn(&self, nproc: usize, task_ppn: usize) -> usize {
        let mut ppn: usize = self.ppn.min(self.max_ppn).min(nproc);
        if task_ppn > 0 {
            ppn = ppn.min(task_ppn);
        }
        ppn.max(1)
    }

    /// Reserves cores for a task.
    ///
    /// Available nodes are scanned in list order, followed by partially used
    /// nodes when the request may share nodes. A failed attempt leaves no
    /// trace in the node tree.
    pub fn get_allocation(&mut self, request: &AllocationRequest) -> Result<Allocation, AllocationError> {
        if let Some(existing) = self.allocations.get(&request.task_id) {
            warn!("get_allocation(): task {} already holds an allocation", request.task_id);
            return Ok(existing.clone());
        }

        let (whole_nodes, whole_sockets): (bool, bool) = if self.nodes.len() == 1 {
            (false, false)
        } else if self.exclusive {
            (true, true)
        } else {
            (request.whole_nodes, request.whole_sockets)
        };
        let nproc: usize = request.nproc.max(1);
        let ppn: usize = self.effective_ppn(nproc, request.task_ppn);
        let task_id: TaskId = request.task_id;

        let candidates: Vec<usize> = if whole_nodes {
            self.avail_nodes.clone()
        } else {
            self.avail_nodes.iter().chain(self.alloc_nodes.iter()).cloned().collect()
        };

        let mut shares: Vec<(usize, NodeShare)> = Vec::new();
        let mut remaining: usize = nproc;
        if whole_nodes {
            for ix in candidates.iter().cloned() {
                let node: &mut Node = &mut self.nodes[ix];
                if !node.is_free() || node.total_cores() < ppn {
                    continue;
                }
                let procs: usize = ppn.min(remaining);
                let cores: Vec<usize> = node.allocate_whole(task_id);
                shares.push((ix, Self::share(node, procs, cores)));
                remaining -= procs;
                if remaining == 0 {
                    break;
                }
            }
        } else if whole_sockets {
            for ix in candidates.iter().cloned() {
                let node: &mut Node = &mut self.nodes[ix];
                let target: usize = ppn.min(remaining);
                let cores: Vec<usize> = node.allocate_sockets(task_id, target);
                if cores.is_empty() {
                    continue;
                }
                let procs: usize = target.min(cores.len());
                shares.push((ix, Self::share(node, procs, cores)));
                remaining -= procs;
                if remaining == 0 {
                    break;
                }
            }
        } else {
            // Shared nodes: wrap around until satisfied or no core is left.
            'passes: loop {
                let mut progress: bool = false;
                for ix in candidates.iter().cloned() {
                    let node: &mut Node = &mut self.nodes[ix];
                    let take: usize = ppn.min(node.avail_cores()).min(remaining);
                    if take == 0 {
                        continue;
                    }
                    let cores: Vec<usize> = node.allocate_cores(task_id, take);
                    match shares.iter_mut().find(|(i, _)| *i == ix) {
                        Some((_, share)) => {
                            share.procs += cores.len();
                            share.cores.extend(cores);
                        },
                        None => shares.push((ix, Self::share(node, take, cores))),
                    }
                    remaining -= take;
                    progress = true;
                    if remaining == 0 {
                        break 'passes;
                    }
                }
                if !progress {
                    break;
                }
            }
        }

        if remaining > 0 {
            for (ix, _) in shares.iter() {
                self.nodes[*ix].release(task_id);
            }
            let e: AllocationError = self.classify_failure(nproc, ppn, whole_nodes || whole_sockets);
            debug!("get_allocation(): task {}: {}", task_id, e);
            return Err(e);
        }

        let mut held: usize = 0;
        for (ix, share) in shares.iter() {
            held += share.cores.len();
            if let Some(pos) = self.avail_nodes.iter().position(|n| n == ix) {
                self.avail_nodes.remove(pos);
                self.alloc_nodes.push(*ix);
            }
        }
        self.avail_cores -= held;
        self.alloc_cores += held;
        self.processes += nproc;

        let allocation: Allocation = Allocation {
            task_id,
            owner: request.owner.clone(),
            nproc,
            ppn: shares.iter().map(|(_, s)| s.procs).max().unwrap_or(ppn),
            whole_nodes,
            whole_sockets,
            nodes: shares.into_iter().map(|(_, s)| s).collect(),
            accurate: self.accurate,
            max_ppn: self.max_ppn,
            cores_per_node: self.cores_per_node,
            sockets_per_node: self.sockets_per_node,
        };
        self.allocations.insert(task_id, allocation.clone());
        let notes: String = if whole_nodes {
            format!("allocation for task {} using whole nodes", task_id)
        } else {
            format!("allocation for task {} using partial nodes", task_id)
        };
        self.report(&notes);
        Ok(allocation)
    }

    /// Returns the cores of `task_id` to the pool. Releasing an unknown or
    /// already released task does nothing and returns `false`.
    pub fn release_allocation(&mut self, task_id: TaskId) -> bool {
        let allocation: Allocation = match self.allocations.remove(&task_id) {
            Some(allocation) => allocation,
            None => {
                debug!("release_allocation(): task {} holds no allocation", task_id);
                return false;
            },
        };

        let mut freed: usize = 0;
        for ix in 0..self.nodes.len() {
            if !allocation.nodes.iter().any(|s| s.name == self.nodes[ix].name()) {
                continue;
            }
            freed += self.nodes[ix].release(task_id);
            if self.nodes[ix].is_free() {
                self.alloc_nodes.retain(|n| *n != ix);
                if !self.avail_nodes.contains(&ix) {
                    self.avail_nodes.push(ix);
                }
            }
        }
        self.avail_cores += freed;
        self.alloc_cores -= freed;
        self.processes -= allocation.nproc;
        self.report(&format!("released nodes for task {}", task_id));
        true
    }

    fn share(node: &Node, procs: usize, cores: Vec<usize>) -> NodeShare {
        NodeShare {
            name: node.name().to_string(),
            procs,
            cores,
        }
    }

    /// Decides whether a failed request may succeed later.
    fn classify_failure(&self, nproc: usize, ppn: usize, exclusive_layout: bool) -> AllocationError {
        let could_fit: bool = if exclusive_layout {
            let walk: usize = self.nodes.iter().map(|n| ppn.min(n.total_cores())).sum();
            walk >= nproc
        } else {
            nproc <= self.total_cores
        };
        if could_fit {
            AllocationError::Insufficient { nproc, ppn }
        } else if nproc > self.total_cores {
            AllocationError::BadRequest {
                nproc,
                total_cores: self.total_cores,
            }
        } else {
            AllocationError::Mismatch { nproc, ppn }
        }
    }

    fn report(&mut self, notes: &str) {
        let sample: UsageSample = UsageSample {
            avail_cores: self.avail_cores,
            alloc_cores: self.alloc_cores,
            total_cores: self.total_cores,
            processes: self.processes,
        };
        if let Some(usage) = self.usage.as_mut() {
            if let Err(e) = usage.record(sample, notes) {
                warn!("report(): cannot write resource usage ({:?})", e);
            }
        }
    }

    /// Verifies the bookkeeping invariants of the node tree.
    pub fn check_invariants(&self) -> Result<(), Fail> {
        let fail = |cause: String| -> Result<(), Fail> {
            error!("check_invariants(): {}", cause);
            Err(Fail::new(libc::EFAULT, &cause))
        };
        if self.avail_cores + self.alloc_cores != self.total_cores {
            return fail(format!(
                "available ({}) and allocated ({}) cores do not add up to {}",
                self.avail_cores, self.alloc_cores, self.total_cores
            ));
        }
        let held: usize = self.allocations.values().flat_map(|a| a.nodes.iter()).map(|s| s.cores.len()).sum();
        if held != self.alloc_cores {
            return fail(format!("allocations hold {} cores, expected {}", held, self.alloc_cores));
        }
        for (ix, node) in self.nodes.iter().enumerate() {
            if node.avail_cores() + node.allocated_cores() != node.total_cores() {
                return fail(format!("core counts of node {} do not add up", node.name()));
            }
            let in_avail: usize = self.avail_nodes.iter().filter(|n| **n == ix).count();
            let in_alloc: usize = self.alloc_nodes.iter().filter(|n| **n == ix).count();
            if in_avail + in_alloc != 1 || (in_avail == 1) != node.is_free() {
                return fail(format!("node {} is misfiled", node.name()));
            }
        }
        Ok(())
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn ppn(&self) -> usize {
        self.ppn
    }

    pub fn max_ppn(&self) -> usize {
        self.max_ppn
    }

    pub fn cores_per_node(&self) -> usize {
        self.cores_per_node
    }

    pub fn sockets_per_node(&self) -> usize {
        self.sockets_per_node
    }

    pub fn accurate_nodes(&self) -> bool {
        self.accurate
    }

    pub fn total_cores(&self) -> usize {
        self.total_cores
    }

    pub fn avail_cores(&self) -> usize {
        self.avail_cores
    }

    pub fn alloc_cores(&self) -> usize {
        self.alloc_cores
    }

    pub fn processes(&self) -> usize {
        self.processes
    }

    /// Names of nodes with no core in use, in scan order.
    pub fn avail_nodes(&self) -> Vec<&str> {
        self.avail_nodes.iter().map(|ix| self.nodes[*ix].name()).collect()
    }

    /// Names of nodes holding at least one core.
    pub fn alloc_nodes(&self) -> Vec<&str> {
        self.alloc_nodes.iter().map(|ix| self.nodes[*ix].name()).collect()
    }

    pub fn allocation(&self, task_id: TaskId) -> Option<&Allocation> {
        self.allocations.get(&task_id)
    }
}

impl Allocation {
    pub fn node_names(&self) -> Vec<&str> {
        self.nodes.iter().map(|s| s.name.as_str()).collect()
    }

    /// Whether some node of the allocation is shared with other tasks.
    pub fn partial_nodes(&self) -> bool {
        !self.whole_nodes
    }
}
