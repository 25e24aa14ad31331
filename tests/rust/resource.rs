// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::anyhow::Result;
use ::ipsframework::{
    resource::{
        detect::Topology,
        error::AllocationError,
        Allocation,
        AllocationRequest,
        ResourceManager,
        ResourceSettings,
    },
    runtime::message::TaskId,
    ComponentId,
};

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Resource manager over `nnodes` nodes named n1, n2, ... with `cores` cores and `sockets` sockets each.
fn machine(nnodes: usize, cores: usize, sockets: usize) -> Result<ResourceManager> {
    let topology: Topology = Topology {
        nodes: (1..=nnodes).map(|i| (format!("n{}", i), cores)).collect(),
        cores_per_node: cores,
        sockets_per_node: sockets,
        max_ppn: cores,
        accurate: true,
    };
    let settings: ResourceSettings = ResourceSettings {
        host: String::from("testhost"),
        exclusive: false,
        procs_per_node: 0,
        use_accurate_nodes: true,
        usage_report: None,
    };
    Ok(ResourceManager::new(topology, settings)?)
}

fn request(task_id: u64, nproc: usize, whole_nodes: bool, task_ppn: usize) -> AllocationRequest {
    AllocationRequest {
        owner: ComponentId::new("requester", "sim"),
        task_id: TaskId::from(task_id),
        nproc,
        whole_nodes,
        whole_sockets: false,
        task_ppn,
    }
}

fn names(allocation: &Allocation) -> Vec<String> {
    allocation.nodes.iter().map(|share| share.name.clone()).collect()
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

/// Tests whole-node allocation of three tasks on four nodes and the order in which nodes come back.
#[test]
fn allocate_whole_nodes_and_release_out_of_order() -> Result<()> {
    let mut rm: ResourceManager = machine(4, 8, 2)?;

    let first: Allocation = rm.get_allocation(&request(1, 8, true, 0))?;
    let second: Allocation = rm.get_allocation(&request(2, 16, true, 0))?;
    let third: Allocation = rm.get_allocation(&request(3, 8, true, 0))?;
    ipsframework::ensure_eq!(names(&first), vec!["n1".to_string()]);
    ipsframework::ensure_eq!(names(&second), vec!["n2".to_string(), "n3".to_string()]);
    ipsframework::ensure_eq!(names(&third), vec!["n4".to_string()]);
    ipsframework::ensure_eq!(rm.avail_nodes().is_empty(), true);
    ipsframework::ensure_eq!(rm.avail_cores(), 0);
    ipsframework::ensure_eq!(rm.alloc_cores(), 32);
    rm.check_invariants()?;

    for task_id in [2, 1, 3] {
        ipsframework::ensure_eq!(rm.release_allocation(TaskId::from(task_id)), true);
        rm.check_invariants()?;
    }
    ipsframework::ensure_eq!(rm.avail_nodes(), vec!["n2", "n3", "n1", "n4"]);
    ipsframework::ensure_eq!(rm.alloc_nodes().is_empty(), true);
    ipsframework::ensure_eq!(rm.avail_cores(), 32);
    ipsframework::ensure_eq!(rm.release_allocation(TaskId::from(2)), false);
    Ok(())
}

/// Tests that a shared allocation wraps around the nodes without exceeding the requested ppn per pass.
#[test]
fn allocate_shared_with_task_ppn() -> Result<()> {
    let mut rm: ResourceManager = machine(2, 8, 2)?;

    let allocation: Allocation = rm.get_allocation(&request(1, 10, false, 4))?;
    let procs: usize = allocation.nodes.iter().map(|share| share.procs).sum();
    let cores: usize = allocation.nodes.iter().map(|share| share.cores.len()).sum();
    ipsframework::ensure_eq!(procs, 10);
    ipsframework::ensure_eq!(cores, 10);
    ipsframework::ensure_eq!(names(&allocation), vec!["n1".to_string(), "n2".to_string()]);
    ipsframework::ensure_eq!(allocation.nodes[0].procs, 6);
    ipsframework::ensure_eq!(allocation.nodes[1].procs, 4);
    ipsframework::ensure_eq!(rm.alloc_cores(), 10);
    ipsframework::ensure_eq!(rm.avail_cores(), 6);
    ipsframework::ensure_eq!(rm.alloc_nodes(), vec!["n1", "n2"]);
    rm.check_invariants()?;

    // Partially used nodes still take further shared work.
    let more: Allocation = rm.get_allocation(&request(2, 6, false, 0))?;
    ipsframework::ensure_eq!(more.nodes.iter().map(|share| share.procs).sum::<usize>(), 6);
    ipsframework::ensure_eq!(rm.avail_cores(), 0);
    rm.check_invariants()?;
    Ok(())
}

/// Tests that a request blocked by a running task succeeds once the task releases its node.
#[test]
fn insufficient_until_release() -> Result<()> {
    let mut rm: ResourceManager = machine(2, 4, 1)?;

    let first: Allocation = rm.get_allocation(&request(1, 4, true, 0))?;
    ipsframework::ensure_eq!(names(&first), vec!["n1".to_string()]);

    let blocked: AllocationError = match rm.get_allocation(&request(2, 8, true, 0)) {
        Ok(allocation) => anyhow::bail!("request should not fit yet, got {:?}", allocation),
        Err(e) => e,
    };
    ipsframework::ensure_eq!(blocked.is_recoverable(), true);
    ipsframework::ensure_eq!(rm.avail_nodes(), vec!["n2"]);
    ipsframework::ensure_eq!(rm.alloc_cores(), 4);
    rm.check_invariants()?;

    rm.release_allocation(TaskId::from(1));
    let second: Allocation = rm.get_allocation(&request(2, 8, true, 0))?;
    let mut held: Vec<String> = names(&second);
    held.sort();
    ipsframework::ensure_eq!(held, vec!["n1".to_string(), "n2".to_string()]);
    ipsframework::ensure_eq!(rm.avail_cores(), 0);
    rm.check_invariants()?;
    Ok(())
}

/// Tests that a request larger than the machine is refused without touching the node tree.
#[test]
fn bad_request_leaves_no_trace() -> Result<()> {
    let mut rm: ResourceManager = machine(2, 4, 1)?;

    match rm.get_allocation(&request(1, 9, false, 0)) {
        Err(AllocationError::BadRequest { nproc, total_cores }) => {
            ipsframework::ensure_eq!(nproc, 9);
            ipsframework::ensure_eq!(total_cores, 8);
        },
        other => anyhow::bail!("expected a bad request, got {:?}", other),
    }
    ipsframework::ensure_eq!(rm.avail_cores(), 8);
    ipsframework::ensure_eq!(rm.alloc_cores(), 0);
    ipsframework::ensure_eq!(rm.avail_nodes(), vec!["n1", "n2"]);
    ipsframework::ensure_eq!(rm.allocation(TaskId::from(1)).is_none(), true);
    rm.check_invariants()?;
    Ok(())
}

/// Tests that asking twice for the same task hands back the first allocation.
#[test]
fn duplicate_task_reuses_allocation() -> Result<()> {
    let mut rm: ResourceManager = machine(2, 4, 1)?;

    let first: Allocation = rm.get_allocation(&request(7, 2, false, 0))?;
    let again: Allocation = rm.get_allocation(&request(7, 2, false, 0))?;
    ipsframework::ensure_eq!(first.nodes, again.nodes);
    ipsframework::ensure_eq!(rm.alloc_cores(), 2);
    rm.check_invariants()?;
    Ok(())
}

/// Tests the synthetic allocation built from command-line node and ppn counts.
#[test]
fn override_allocation() -> Result<()> {
    let settings: ResourceSettings = ResourceSettings {
        host: String::from("testhost"),
        exclusive: false,
        procs_per_node: 0,
        use_accurate_nodes: true,
        usage_report: None,
    };
    let rm: ResourceManager = ResourceManager::with_override(3, 2, settings)?;
    ipsframework::ensure_eq!(rm.num_nodes(), 3);
    ipsframework::ensure_eq!(rm.ppn(), 2);
    ipsframework::ensure_eq!(rm.total_cores(), 6);
    ipsframework::ensure_eq!(rm.accurate_nodes(), false);
    ipsframework::ensure_eq!(rm.host(), "override_testhost");
    Ok(())
}

/// Tests that whole-socket requests take entire free sockets and wait for one to come back once all are held.
#[test]
fn allocate_whole_sockets() -> Result<()> {
    let mut rm: ResourceManager = machine(2, 8, 2)?;
    let socket_request = |task_id: u64, nproc: usize, task_ppn: usize| -> AllocationRequest {
        AllocationRequest {
            whole_sockets: true,
            ..request(task_id, nproc, false, task_ppn)
        }
    };

    // Six processes need both sockets of the first node.
    let first: Allocation = rm.get_allocation(&socket_request(1, 6, 0))?;
    ipsframework::ensure_eq!(names(&first), vec!["n1".to_string()]);
    ipsframework::ensure_eq!(first.nodes[0].procs, 6);
    ipsframework::ensure_eq!(first.nodes[0].cores.len(), 8);

    // Two processes still hold a whole socket of the second node.
    let second: Allocation = rm.get_allocation(&socket_request(2, 2, 2))?;
    ipsframework::ensure_eq!(names(&second), vec!["n2".to_string()]);
    ipsframework::ensure_eq!(second.nodes[0].cores, vec![0, 1, 2, 3]);
    let third: Allocation = rm.get_allocation(&socket_request(3, 4, 0))?;
    ipsframework::ensure_eq!(third.nodes[0].cores, vec![4, 5, 6, 7]);
    ipsframework::ensure_eq!(rm.avail_cores(), 0);
    rm.check_invariants()?;

    let blocked: AllocationError = match rm.get_allocation(&socket_request(4, 1, 0)) {
        Ok(allocation) => anyhow::bail!("no socket should be free, got {:?}", allocation),
        Err(e) => e,
    };
    ipsframework::ensure_eq!(blocked.is_recoverable(), true);

    rm.release_allocation(TaskId::from(2));
    let fourth: Allocation = rm.get_allocation(&socket_request(4, 1, 0))?;
    ipsframework::ensure_eq!(names(&fourth), vec!["n2".to_string()]);
    ipsframework::ensure_eq!(fourth.nodes[0].cores, vec![0, 1, 2, 3]);
    rm.check_invariants()?;
    Ok(())
}

/// Tests that a whole-node request the machine could hold, but not at the requested ppn, is a mismatch.
#[test]
fn mismatched_request_is_not_recoverable() -> Result<()> {
    let mut rm: ResourceManager = machine(2, 4, 1)?;

    match rm.get_allocation(&request(1, 6, true, 2)) {
        Err(AllocationError::Mismatch { nproc, ppn }) => {
            ipsframework::ensure_eq!(nproc, 6);
            ipsframework::ensure_eq!(ppn, 2);
        },
        other => anyhow::bail!("expected a mismatch, got {:?}", other),
    }
    let error: AllocationError = AllocationError::Mismatch { nproc: 6, ppn: 2 };
    ipsframework::ensure_eq!(error.is_recoverable(), false);
    ipsframework::ensure_eq!(rm.avail_nodes(), vec!["n1", "n2"]);
    ipsframework::ensure_eq!(rm.avail_cores(), 8);
    rm.check_invariants()?;
    Ok(())
}
