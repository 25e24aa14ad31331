// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use crate::runtime::message::TaskId;

//==============================================================================
// Structures
//==============================================================================

/// Core
///
/// Holds at most one task at a time.
#[derive(Clone, Debug)]
pub struct Core {
    index: usize,
    task_id: Option<TaskId>,
}

/// Socket
#[derive(Clone, Debug)]
pub struct Socket {
    index: usize,
    cores: Vec<Core>,
    avail_cores: usize,
}

/// Node
///
/// Sockets and cores are fixed at construction and always scanned in
/// declaration order.
#[derive(Clone, Debug)]
pub struct Node {
    name: String,
    sockets: Vec<Socket>,
    total_cores: usize,
    avail_cores: usize,
    task_ids: Vec<TaskId>,
}

//==============================================================================
// Associate Functions
//==============================================================================

impl Core {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn is_free(&self) -> bool {
        self.task_id.is_none()
    }
}

impl Socket {
    fn new(index: usize, first_core: usize, ncores: usize) -> Self {
        let cores: Vec<Core> = (first_core..first_core + ncores)
            .map(|index| Core { index, task_id: None })
            .collect();
        Self {
            index,
            cores,
            avail_cores: ncores,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn total_cores(&self) -> usize {
        self.cores.len()
    }

    pub fn avail_cores(&self) -> usize {
        self.avail_cores
    }

    pub fn is_free(&self) -> bool {
        self.avail_cores == self.cores.len()
    }

    /// Hands up to `count` free cores to `task_id`, returning their indices.
    fn take(&mut self, task_id: TaskId, count: usize) -> Vec<usize> {
        let mut taken: Vec<usize> = Vec::with_capacity(count);
        for core in self.cores.iter_mut() {
            if taken.len() == count {
                break;
            }
            if core.task_id.is_none() {
                core.task_id = Some(task_id);
                taken.push(core.index);
            }
        }
        self.avail_cores -= taken.len();
        taken
    }

    fn release(&mut self, task_id: TaskId) -> usize {
        let mut freed: usize = 0;
        for core in self.cores.iter_mut() {
            if core.task_id == Some(task_id) {
                core.task_id = None;
                freed += 1;
            }
        }
        self.avail_cores += freed;
        freed
    }
}

impl Node {
    /// Creates a node with `ncores` allocatable cores, grouped in sockets of
    /// `cores_per_node / sockets_per_node` cores. A trailing socket holds the
    /// remainder when `ncores` is not a multiple of the socket size.
    pub fn new(name: &str, sockets_per_node: usize, cores_per_node: usize, ncores: usize) -> Self {
        let cores_per_socket: usize = match sockets_per_node {
            0 => cores_per_node.max(1),
            spn => (cores_per_node / spn).max(1),
        };
        let mut sockets: Vec<Socket> = Vec::new();
        let mut first_core: usize = 0;
        while first_core < ncores {
            let size: usize = cores_per_socket.min(ncores - first_core);
            sockets.push(Socket::new(sockets.len(), first_core, size));
            first_core += size;
        }
        Self {
            name: name.to_string(),
            sockets,
            total_cores: ncores,
            avail_cores: ncores,
            task_ids: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sockets(&self) -> &[Socket] {
        &self.sockets
    }

    pub fn total_cores(&self) -> usize {
        self.total_cores
    }

    pub fn avail_cores(&self) -> usize {
        self.avail_cores
    }

    pub fn allocated_cores(&self) -> usize {
        self.total_cores - self.avail_cores
    }

    pub fn is_free(&self) -> bool {
        self.avail_cores == self.total_cores
    }

    pub fn task_ids(&self) -> &[TaskId] {
        &self.task_ids
    }

    /// Hands every core of the node to `task_id`.
    pub fn allocate_whole(&mut self, task_id: TaskId) -> Vec<usize> {
        let total: usize = self.total_cores;
        self.allocate_cores(task_id, total)
    }

    /// Hands whole free sockets to `task_id` until at least `target` cores are
    /// held or no free socket remains.
    pub fn allocate_sockets(&mut self, task_id: TaskId, target: usize) -> Vec<usize> {
        let mut taken: Vec<usize> = Vec::new();
        for socket in self.sockets.iter_mut() {
            if taken.len() >= target {
                break;
            }
            if socket.is_free() {
                let n: usize = socket.total_cores();
                taken.extend(socket.take(task_id, n));
            }
        }
        self.commit(task_id, taken.len());
        taken
    }

    /// Hands up to `count` free cores to `task_id`, sockets and cores in order.
    pub fn allocate_cores(&mut self, task_id: TaskId, count: usize) -> Vec<usize> {
        let mut taken: Vec<usize> = Vec::with_capacity(count);
        for socket in self.sockets.iter_mut() {
            if taken.len() == count {
                break;
            }
            let n: usize = count - taken.len();
            taken.extend(socket.take(task_id, n));
        }
        self.commit(task_id, taken.len());
        taken
    }

    /// Frees every core held by `task_id`, returning how many were freed.
    pub fn release(&mut self, task_id: TaskId) -> usize {
        let freed: usize = self.sockets.iter_mut().map(|s| s.release(task_id)).sum();
        self.avail_cores += freed;
        self.task_ids.retain(|t| *t != task_id);
        freed
    }

    /// Core indices held by `task_id` on this node.
    pub fn cores_of(&self, task_id: TaskId) -> Vec<usize> {
        self.sockets
            .iter()
            .flat_map(|s| s.cores.iter())
            .filter(|c| c.task_id == Some(task_id))
            .map(|c| c.index)
            .collect()
    }

    fn commit(&mut self, task_id: TaskId, ncores: usize) {
        if ncores > 0 {
            self.avail_cores -= ncores;
            if !self.task_ids.contains(&task_id) {
                self.task_ids.push(task_id);
            }
        }
    }
}

//==============================================================================
// Unit Tests
//==============================================================================
