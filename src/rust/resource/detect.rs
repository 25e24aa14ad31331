// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use crate::runtime::fail::Fail;
use ::std::{
    collections::HashMap,
    fs,
    process::{
        Command,
        Output,
    },
};

//==============================================================================
// Structures
//==============================================================================

/// Strategy used to learn the shape of the batch allocation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NodeDetection {
    Checkjob,
    Qstat,
    Qstat2,
    PbsEnv,
    SlurmEnv,
    Manual,
    /// Try every strategy in turn.
    Any,
}

/// Platform values consulted by detection.
#[derive(Clone, Debug, Default)]
pub struct DetectionSettings {
    pub nodes: usize,
    pub procs_per_node: usize,
    pub total_procs: usize,
    pub cores_per_node: usize,
    pub sockets_per_node: usize,
}

/// Outcome of node detection.
#[derive(Clone, Debug, PartialEq)]
pub struct Topology {
    /// Node names with the number of allocatable cores on each.
    pub nodes: Vec<(String, usize)>,
    pub cores_per_node: usize,
    pub sockets_per_node: usize,
    pub max_ppn: usize,
    /// Whether node names are real host names usable on a launch line.
    pub accurate: bool,
}

/// Raw probe result before topology settings are applied.
#[derive(Clone, Debug, PartialEq)]
struct Probe {
    nodes: Vec<(String, usize)>,
    ppn: usize,
    mixed: bool,
    accurate: bool,
}

/// Access to the batch environment.
pub trait Platform {
    /// Reads an environment variable.
    fn env(&self, name: &str) -> Option<String>;
    /// Runs a command and returns its standard output.
    fn run(&self, argv: &[&str]) -> Result<String, Fail>;
    /// Reads a whole text file.
    fn read_file(&self, path: &str) -> Result<String, Fail>;
}

/// The machine the framework runs on.
pub struct HostPlatform;

/// A platform backed by fixed values.
#[derive(Clone, Debug, Default)]
pub struct StaticPlatform {
    pub env: HashMap<String, String>,
    pub commands: HashMap<String, String>,
    pub files: HashMap<String, String>,
}

//==============================================================================
// Associate Functions
//==============================================================================

impl NodeDetection {
    /// Parses a `NODE_DETECTION` value. Unknown values select [NodeDetection::Any].
    pub fn parse(name: &str) -> Self {
        match name.trim() {
            "checkjob" => NodeDetection::Checkjob,
            "qstat" => NodeDetection::Qstat,
            "qstat2" => NodeDetection::Qstat2,
            "pbs_env" => NodeDetection::PbsEnv,
            "slurm_env" => NodeDetection::SlurmEnv,
            "manual" => NodeDetection::Manual,
            _ => NodeDetection::Any,
        }
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

impl Platform for HostPlatform {
    fn env(&self, name: &str) -> Option<String> {
        ::std::env::var(name).ok()
    }

    fn run(&self, argv: &[&str]) -> Result<String, Fail> {
        let (program, args): (&&str, &[&str]) = match argv.split_first() {
            Some(split) => split,
            None => return Err(Fail::new(libc::EINVAL, "empty command line")),
        };
        let output: Output = Command::new(program).args(args).output()?;
        if !output.status.success() {
            let cause: String = format!("command {:?} exited with {}", argv, output.status);
            error!("run(): {}", cause);
            return Err(Fail::new(libc::EIO, &cause));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn read_file(&self, path: &str) -> Result<String, Fail> {
        Ok(fs::read_to_string(path)?)
    }
}

impl Platform for StaticPlatform {
    fn env(&self, name: &str) -> Option<String> {
        self.env.get(name).cloned()
    }

    fn run(&self, argv: &[&str]) -> Result<String, Fail> {
        match self.commands.get(&argv.join(" ")) {
            Some(out) => Ok(out.clone()),
            None => Err(Fail::new(libc::ENOENT, &format!("command {:?} unavailable", argv))),
        }
    }

    fn read_file(&self, path: &str) -> Result<String, Fail> {
        match self.files.get(path) {
            Some(text) => Ok(text.clone()),
            None => Err(Fail::new(libc::ENOENT, &format!("no such file {:?}", path))),
        }
    }
}

//==============================================================================
// Standalone Functions
//==============================================================================

/// Learns the allocation shape with `strategy`, then applies the platform
/// core and socket counts.
pub fn detect(
    strategy: NodeDetection,
    settings: &DetectionSettings,
    platform: &dyn Platform,
) -> Result<Topology, Fail> {
    let probe: Probe = match strategy {
        NodeDetection::Checkjob => checkjob_info(platform)?,
        NodeDetection::Qstat => qstat_info(platform)?,
        NodeDetection::Qstat2 => qstat2_info(platform)?,
        NodeDetection::PbsEnv => pbs_info(platform)?,
        NodeDetection::SlurmEnv => slurm_info(platform)?,
        NodeDetection::Manual => manual_info(settings),
        NodeDetection::Any => {
            warn!("detect(): no node detection strategy specified, trying all of them");
            checkjob_info(platform)
                .or_else(|_| qstat_info(platform))
                .or_else(|_| pbs_info(platform))
                .or_else(|_| slurm_info(platform))
                .unwrap_or_else(|_| manual_info(settings))
        },
    };
    apply_topology(probe, settings)
}

fn apply_topology(probe: Probe, settings: &DetectionSettings) -> Result<Topology, Fail> {
    let Probe {
        mut nodes,
        mut ppn,
        mixed,
        accurate,
    } = probe;

    let mut cpn: usize = settings.cores_per_node;
    if cpn == 0 {
        cpn = ppn;
    } else if cpn < ppn {
        ppn = cpn;
        if !mixed {
            for node in nodes.iter_mut() {
                node.1 = ppn;
            }
        }
    }
    let spn: usize = settings.sockets_per_node.max(1);
    if spn > cpn || cpn % spn != 0 {
        let cause: String = format!(
            "invalid resource settings: {} sockets per node with {} cores per node",
            spn, cpn
        );
        error!("apply_topology(): {}", cause);
        return Err(Fail::new(libc::EINVAL, &cause));
    }
    Ok(Topology {
        nodes,
        cores_per_node: cpn,
        sockets_per_node: spn,
        max_ppn: ppn,
        accurate,
    })
}

fn dummy_nodes(count: usize, ppn: usize) -> Vec<(String, usize)> {
    (0..count).map(|i| (format!("dummynode{}", i), ppn)).collect()
}

fn require_env(platform: &dyn Platform, name: &str) -> Result<String, Fail> {
    match platform.env(name) {
        Some(value) => Ok(value),
        None => Err(Fail::new(libc::ENOENT, &format!("environment variable {} not set", name))),
    }
}

fn parse_count(text: &str, what: &str) -> Result<usize, Fail> {
    match text.trim().parse::<usize>() {
        Ok(n) => Ok(n),
        Err(_) => {
            let cause: String = format!("cannot parse {} from {:?}", what, text);
            error!("parse_count(): {}", cause);
            Err(Fail::new(libc::EINVAL, &cause))
        },
    }
}

/// Platform file values.
fn manual_info(settings: &DetectionSettings) -> Probe {
    let mut nodes: usize = settings.nodes;
    let mut ppn: usize = settings.procs_per_node;
    let mut total: usize = settings.total_procs;
    if total == 0 {
        if nodes == 0 {
            if ppn == 0 {
                ppn = settings.cores_per_node.max(1);
            }
            nodes = 1;
        }
        total = nodes * ppn;
    }
    let mut list: Vec<(String, usize)> = dummy_nodes(nodes, ppn);
    if ppn > 0 && total < nodes * (ppn - 1) {
        if let Some(last) = list.last_mut() {
            last.1 = total % ppn;
        }
    }
    Probe {
        nodes: list,
        ppn,
        mixed: false,
        accurate: false,
    }
}

/// `PBS_NODEFILE` lists one node name per usable process slot.
fn pbs_info(platform: &dyn Platform) -> Result<Probe, Fail> {
    if let Some(path) = platform.env("PBS_NODEFILE") {
        let text: String = platform.read_file(&path)?;
        let mut nodes: Vec<(String, usize)> = Vec::new();
        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            match nodes.iter_mut().find(|(name, _)| name == line) {
                Some(entry) => entry.1 += 1,
                None => nodes.push((line.to_string(), 1)),
            }
        }
        let max_p: usize = nodes.iter().map(|n| n.1).max().unwrap_or(0);
        let min_p: usize = nodes.iter().map(|n| n.1).min().unwrap_or(0);
        if !nodes.is_empty() {
            return Ok(Probe {
                nodes,
                ppn: max_p,
                mixed: max_p != min_p,
                accurate: true,
            });
        }
    }
    let count: usize = parse_count(&require_env(platform, "PBS_NNODES")?, "PBS_NNODES")?;
    Ok(Probe {
        nodes: dummy_nodes(count, 1),
        ppn: 1,
        mixed: false,
        accurate: false,
    })
}

/// SLURM environment with in-process node list expansion.
fn slurm_info(platform: &dyn Platform) -> Result<Probe, Fail> {
    let nodelist: String = require_env(platform, "SLURM_NODELIST")?;
    let tasks: String = match platform.env("SLURM_TASKS_PER_NODE") {
        Some(t) => t,
        None => require_env(platform, "SLURM_JOB_TASKS_PER_NODE")?,
    };
    let ppn: usize = parse_count(tasks.split('(').next().unwrap_or(""), "tasks per node")?;
    let nproc: usize = match platform.env("SLURM_NPROC") {
        Some(n) => parse_count(&n, "SLURM_NPROC")?,
        None => 0,
    };
    let mut nodes: Vec<(String, usize)> = expand_slurm_nodelist(&nodelist)?
        .into_iter()
        .map(|name| (name, ppn))
        .collect();
    let mut mixed: bool = false;
    if nproc > 0 && nproc < nodes.len() * ppn {
        mixed = true;
        if let Some(last) = nodes.last_mut() {
            last.1 = nproc % ppn;
        }
    }
    Ok(Probe {
        nodes,
        ppn,
        mixed,
        accurate: true,
    })
}

/// Expands `prefix[lo-hi,n],other` notation into individual host names.
/// Zero padding of the lower bound is preserved.
pub fn expand_slurm_nodelist(nodelist: &str) -> Result<Vec<String>, Fail> {
    let mut names: Vec<String> = Vec::new();
    let mut depth: usize = 0;
    let mut item: String = String::new();
    let mut items: Vec<String> = Vec::new();
    for c in nodelist.trim().chars() {
        match c {
            '[' => depth += 1,
            ']' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                items.push(item.clone());
                item.clear();
                continue;
            },
            _ => (),
        }
        item.push(c);
    }
    if !item.is_empty() {
        items.push(item);
    }

    for item in items.iter().filter(|i| !i.is_empty()) {
        let (prefix, rest): (&str, &str) = match item.find('[') {
            Some(ix) => (&item[..ix], &item[ix + 1..]),
            None => {
                names.push(item.clone());
                continue;
            },
        };
        let (ranges, suffix): (&str, &str) = match rest.find(']') {
            Some(ix) => (&rest[..ix], &rest[ix + 1..]),
            None => {
                let cause: String = format!("unbalanced brackets in node list {:?}", nodelist);
                error!("expand_slurm_nodelist(): {}", cause);
                return Err(Fail::new(libc::EINVAL, &cause));
            },
        };
        for range in ranges.split(',') {
            match range.split_once('-') {
                Some((lo, hi)) => {
                    let width: usize = lo.len();
                    let lo_n: usize = parse_count(lo, "node range")?;
                    let hi_n: usize = parse_count(hi, "node range")?;
                    for n in lo_n..=hi_n {
                        names.push(format!("{}{:0width$}{}", prefix, n, suffix, width = width));
                    }
                },
                None => names.push(format!("{}{}{}", prefix, range, suffix)),
            }
        }
    }
    Ok(names)
}

/// `checkjob $PBS_JOBID` output.
fn checkjob_info(platform: &dyn Platform) -> Result<Probe, Fail> {
    let job_id: String = require_env(platform, "PBS_JOBID")?;
    let output: String = platform.run(&["checkjob", &job_id])?;
    parse_checkjob(&output)
}

fn parse_checkjob(output: &str) -> Result<Probe, Fail> {
    let lines: Vec<&str> = output.lines().map(str::trim).collect();
    let mut total: usize = 0;
    let mut data: Vec<&str> = Vec::new();
    let mut in_nodes: bool = false;
    for line in lines.iter() {
        if let Some((_, tasks)) = line.split_once("Total Requested Tasks:") {
            total = parse_count(tasks, "total requested tasks")?;
        }
        if *line == "Allocated Nodes:" && data.is_empty() {
            in_nodes = true;
            continue;
        }
        if in_nodes {
            if line.is_empty() {
                in_nodes = false;
            } else {
                data.push(line);
            }
        }
    }

    let first: &str = match data.first() {
        Some(first) => first,
        None => return Err(Fail::new(libc::EINVAL, "could not parse resource data")),
    };
    let mut nodes: Vec<(String, usize)> = Vec::new();
    let ppn: usize;
    if first.contains(':') {
        // [node:tasks][node:tasks]...
        for line in data.iter() {
            let inner: &str = line.trim_start_matches('[').trim_end_matches(']');
            for pair in inner.split("][") {
                match pair.split_once(':') {
                    Some((name, p)) => nodes.push((name.to_string(), parse_count(p, "tasks per node")?)),
                    None => return Err(Fail::new(libc::EINVAL, "could not parse resource data")),
                }
            }
        }
        ppn = nodes.last().map(|n| n.1).unwrap_or(0);
    } else if first.contains('*') {
        // [list,of,ranges]*tasks
        let joined: String = data.concat();
        let (list, p): (&str, &str) = match joined.split_once('*') {
            Some(split) => split,
            None => return Err(Fail::new(libc::EINVAL, "could not parse resource data")),
        };
        ppn = parse_count(p, "tasks per node")?;
        for range in list.trim_matches(|c| c == '[' || c == ']').split(',') {
            match range.split_once('-') {
                Some((lo, hi)) => {
                    for n in parse_count(lo, "node id")?..=parse_count(hi, "node id")? {
                        nodes.push((n.to_string(), ppn));
                    }
                },
                None => nodes.push((range.to_string(), ppn)),
            }
        }
    } else {
        return Err(Fail::new(libc::EINVAL, "could not parse resource data"));
    }

    if (nodes.len() * ppn).abs_diff(total) > 1 {
        let cause: String = format!(
            "node count ({}) times cores ({}) does not match task count ({})",
            nodes.len(),
            ppn,
            total
        );
        error!("parse_checkjob(): {}", cause);
        return Err(Fail::new(libc::EINVAL, &cause));
    }
    Ok(Probe {
        nodes,
        ppn,
        mixed: false,
        accurate: false,
    })
}

/// `qstat -f $PBS_JOBID`, using the Cray `mppwidth`/`mppnppn` resource list.
fn qstat_info(platform: &dyn Platform) -> Result<Probe, Fail> {
    let job_id: String = require_env(platform, "PBS_JOBID")?;
    let output: String = platform.run(&["qstat", "-f", &job_id])?;
    let field = |key: &str| -> Option<String> {
        output
            .lines()
            .find(|l| l.contains(key))
            .and_then(|l| l.split_once('='))
            .map(|(_, v)| v.trim().to_string())
    };
    let width: usize = match field("Resource_List.mppwidth") {
        Some(w) => parse_count(&w, "mppwidth")?,
        None => return Err(Fail::new(libc::EINVAL, "qstat output lacks Resource_List.mppwidth")),
    };
    let ppn: usize = match field("Resource_List.mppnppn") {
        Some(p) => parse_count(&p, "mppnppn")?.max(1),
        None => 1,
    };
    let count: usize = (width + ppn - 1) / ppn;
    Ok(Probe {
        nodes: dummy_nodes(count, ppn),
        ppn,
        mixed: false,
        accurate: false,
    })
}

/// `qstat -f $PBS_JOBID`, reading `exec_host` entries of the form `node/slot+...`.
fn qstat2_info(platform: &dyn Platform) -> Result<Probe, Fail> {
    let job_id: String = require_env(platform, "PBS_JOBID")?;
    let output: String = platform.run(&["qstat", "-f", &job_id])?;
    parse_exec_host(&output)
}

fn parse_exec_host(output: &str) -> Result<Probe, Fail> {
    let mut collected: String = String::new();
    let mut started: bool = false;
    for line in output.lines() {
        if line.contains("exec_host") {
            started = true;
            collected.push_str(line.trim());
        } else if line.contains("Hold_Types") {
            break;
        } else if started {
            collected.push_str(line.trim());
        }
    }
    let hosts: &str = match collected.split_once('=') {
        Some((_, hosts)) => hosts.trim(),
        None => return Err(Fail::new(libc::EINVAL, "qstat output lacks exec_host")),
    };
    let mut nodes: Vec<(String, usize)> = Vec::new();
    for entry in hosts.split('+') {
        let name: &str = match entry.split_once('/') {
            Some((name, _)) => name,
            None => return Err(Fail::new(libc::EINVAL, &format!("malformed exec_host entry {:?}", entry))),
        };
        match nodes.iter_mut().find(|(n, _)| n == name) {
            Some(node) => node.1 += 1,
            None => nodes.push((name.to_string(), 1)),
        }
    }
    let ppn: usize = nodes.iter().map(|n| n.1).max().unwrap_or(0);
    Ok(Probe {
        nodes,
        ppn,
        mixed: false,
        accurate: true,
    })
}

//==============================================================================
// Unit Tests
//==============================================================================
