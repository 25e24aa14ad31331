// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use crate::{
    resource::Allocation,
    runtime::fail::Fail,
};
use ::std::{
    collections::BTreeMap,
    path::Path,
};

//==============================================================================
// Structures
//==============================================================================

/// Parallel launcher flavour, selected by the platform `MPIRUN` and
/// `MPIRUN_VERSION` settings.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Launcher {
    /// Runs the binary directly.
    Eval,
    /// Open MPI `mpirun`, or `prun` against a persistent DVM.
    OpenMpi { dvm: bool },
    /// SGI MPT `mpirun`.
    Sgi,
    Mpiexec,
    Aprun,
    Numactl,
    Srun,
}

/// Command line and environment for one task.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LaunchCommand {
    pub argv: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Hostfile lines `name slots=N`, one per node, when node names are not accurate.
    pub hostfile: Vec<String>,
}

//==============================================================================
// Associate Functions
//==============================================================================

impl Launcher {
    /// Selects the flavour for a platform. Only the file name of `mpirun` is
    /// considered, so absolute launcher paths are accepted.
    pub fn from_platform(mpirun: &str, version: &str) -> Result<Self, Fail> {
        let command: &str = Path::new(mpirun.trim())
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("");
        let version: String = version.trim().to_uppercase();
        match command {
            "eval" => Ok(Launcher::Eval),
            "mpirun" if version.starts_with("OPENMPI") => Ok(Launcher::OpenMpi {
                dvm: version == "OPENMPI-DVM",
            }),
            "mpirun" if version.starts_with("SGI") => Ok(Launcher::Sgi),
            "mpiexec" => Ok(Launcher::Mpiexec),
            "aprun" => Ok(Launcher::Aprun),
            "numactl" => Ok(Launcher::Numactl),
            "srun" => Ok(Launcher::Srun),
            _ => {
                let cause: String = format!("unsupported launcher {:?} (version {:?})", mpirun, version);
                error!("from_platform(): {}", cause);
                Err(Fail::new(libc::EINVAL, &cause))
            },
        }
    }

    /// Composes the launch command of `binary` over `allocation`. `smp_node`
    /// tells whether the whole machine is a single node.
    pub fn build(
        &self,
        allocation: &Allocation,
        binary: &str,
        args: &[String],
        smp_node: bool,
    ) -> Result<LaunchCommand, Fail> {
        let nproc: String = allocation.nproc.to_string();
        let ppn: String = allocation.ppn.to_string();
        let nodes: String = allocation.node_names().join(",");
        let mut cmd: LaunchCommand = LaunchCommand::default();
        if !allocation.accurate {
            cmd.hostfile = allocation
                .nodes
                .iter()
                .map(|share| format!("{} slots={}", share.name, share.procs))
                .collect();
        }

        match self {
            Launcher::Eval => (),
            Launcher::OpenMpi { dvm } => {
                cmd.push(if *dvm { "prun" } else { "mpirun" });
                if smp_node || *dvm {
                    cmd.extend(&["-np", &nproc]);
                } else {
                    cmd.extend(&["-np", &nproc, "-npernode", &ppn]);
                }
                if allocation.accurate {
                    cmd.extend(&["-H", &nodes]);
                }
            },
            Launcher::Sgi if allocation.accurate => {
                // Nodes holding the same number of processes share one clause.
                let mut groups: Vec<(usize, Vec<&str>)> = Vec::new();
                for share in allocation.nodes.iter() {
                    match groups.iter_mut().find(|(p, _)| *p == share.procs) {
                        Some((_, names)) => names.push(share.name.as_str()),
                        None => groups.push((share.procs, vec![share.name.as_str()])),
                    }
                }
                cmd.push("mpirun");
                for (i, (procs, names)) in groups.iter().enumerate() {
                    if i > 0 {
                        cmd.push(":");
                    }
                    cmd.push(&names.join(","));
                    cmd.push(&procs.to_string());
                    cmd.push(binary);
                    cmd.argv.extend(args.iter().cloned());
                }
                let cpulist: Vec<String> = allocation
                    .nodes
                    .iter()
                    .map(|s| {
                        let cores: Vec<String> = s.cores.iter().take(s.procs).map(usize::to_string).collect();
                        cores.join(",")
                    })
                    .collect();
                cmd.env.insert("MPI_DSM_CPULIST".to_string(), cpulist.join(":"));
                return Ok(cmd);
            },
            Launcher::Sgi => cmd.extend(&["mpirun", &ppn]),
            Launcher::Mpiexec => {
                cmd.push("mpiexec");
                if smp_node {
                    cmd.extend(&["-n", &nproc]);
                } else if allocation.accurate {
                    cmd.extend(&["--host", &nodes, "-n", &nproc, "-npernode", &ppn]);
                } else {
                    cmd.extend(&["-n", &nproc, "-npernode", &ppn]);
                }
            },
            Launcher::Aprun => {
                cmd.push("aprun");
                if allocation.accurate {
                    cmd.extend(&["-n", &nproc, "-N", &ppn, "-L", &nodes]);
                } else {
                    let hi: usize = allocation.max_ppn.saturating_sub(1);
                    let lo: usize = allocation.max_ppn.saturating_sub(allocation.ppn);
                    cmd.extend(&["-n", &nproc, "-cc", &format!("{}-{}", hi, lo), "-N", &ppn]);
                }
            },
            Launcher::Numactl => {
                cmd.push("numactl");
                if allocation.accurate && allocation.partial_nodes() {
                    let cores: Vec<String> = allocation
                        .nodes
                        .iter()
                        .flat_map(|s| s.cores.iter())
                        .map(usize::to_string)
                        .collect();
                    cmd.push(&format!("--physcpubind={}", cores.join(",")));
                }
            },
            Launcher::Srun => {
                let nnodes: String = allocation.nodes.len().to_string();
                cmd.extend(&["srun", "-N", &nnodes, "-n", &nproc]);
            },
        }
        cmd.push(binary);
        cmd.argv.extend(args.iter().cloned());
        Ok(cmd)
    }
}

impl LaunchCommand {
    fn push(&mut self, word: &str) {
        self.argv.push(word.to_string());
    }

    fn extend(&mut self, words: &[&str]) {
        self.argv.extend(words.iter().map(|w| w.to_string()));
    }

    /// Command line as a single display string.
    pub fn display(&self) -> String {
        self.argv.join(" ")
    }
}

//==============================================================================
// Unit Tests
//==============================================================================
