// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    component::ComponentId,
    config::simulation::absolute,
    runtime::{
        fail::Fail,
        message::CallId,
        value::{
            Value,
            ValueMap,
        },
    },
    services::Services,
};
use ::std::{
    collections::BTreeMap,
    fs,
    path::{
        Path,
        PathBuf,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// When checkpoints are taken, from the CHECKPOINT section.
#[derive(Clone, Debug, PartialEq)]
pub enum CheckpointMode {
    WalltimeRegular(f64),
    WalltimeExplicit(Vec<f64>),
    PhystimeRegular(f64),
    PhystimeExplicit(Vec<f64>),
    All,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CheckpointPolicy {
    pub mode: CheckpointMode,
    /// Checkpoints kept on disk; negative keeps all of them, zero disables checkpointing.
    pub num_checkpoint: i64,
    pub protect_frequency: Option<u64>,
}

/// What a worker remembers about the checkpoints it has taken.
#[derive(Clone, Debug, Default)]
pub struct CheckpointState {
    /// Seconds since framework start at the last checkpoint.
    pub last_walltime: f64,
    pub last_phystime: Option<f64>,
    pub count: u64,
    /// Tags taken during this run, with whether they are protected.
    pub taken: Vec<(String, bool)>,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl CheckpointPolicy {
    /// Reads the CHECKPOINT section.
    pub fn from_section(section: &ValueMap) -> Result<Self, Fail> {
        let field = |name: &str| -> Result<&Value, Fail> {
            match section.get(name) {
                Some(value) => Ok(value),
                None => {
                    let cause: String = format!("missing CHECKPOINT config parameter {}", name);
                    error!("from_section(): {}", cause);
                    Err(Fail::new(libc::EINVAL, &cause))
                },
            }
        };
        let values = |name: &str| -> Result<Vec<f64>, Fail> {
            let words: Vec<String> = field(name)?.to_string_list()?;
            let mut values: Vec<f64> = Vec::with_capacity(words.len());
            for word in words {
                match word.parse::<f64>() {
                    Ok(v) => values.push(v),
                    Err(_) => return Err(Fail::new(libc::EINVAL, &format!("bad {} entry {:?}", name, word))),
                }
            }
            Ok(values)
        };

        let mode_name: String = field("MODE")?.to_string().trim().to_uppercase();
        let num_checkpoint: i64 = field("NUM_CHECKPOINT")?.as_int()?;
        let mode: CheckpointMode = match mode_name.as_str() {
            "WALLTIME_REGULAR" => CheckpointMode::WalltimeRegular(field("WALLTIME_INTERVAL")?.as_float()?),
            "WALLTIME_EXPLICIT" => CheckpointMode::WalltimeExplicit(values("WALLTIME_VALUES")?),
            "PHYSTIME_REGULAR" => CheckpointMode::PhystimeRegular(field("PHYSTIME_INTERVAL")?.as_float()?),
            "PHYSTIME_EXPLICIT" => CheckpointMode::PhystimeExplicit(values("PHYSTIME_VALUES")?),
            "ALL" => CheckpointMode::All,
            other => {
                let cause: String = format!("invalid checkpoint MODE {}", other);
                error!("from_section(): {}", cause);
                return Err(Fail::new(libc::EINVAL, &cause));
            },
        };
        let protect_frequency: Option<u64> = match section.get("PROTECT_FREQUENCY") {
            Some(Value::None) | None => None,
            Some(value) => Some(value.as_int()?).filter(|f| *f > 0).map(|f| f as u64),
        };
        Ok(Self {
            mode,
            num_checkpoint,
            protect_frequency,
        })
    }

    /// Whether a checkpoint is due at `walltime` seconds into the run and physics time `phystime`. The last physics
    /// time defaults to `first_phystime`.
    pub fn is_due(&self, state: &CheckpointState, walltime: f64, phystime: f64, first_phystime: f64) -> bool {
        if self.num_checkpoint == 0 {
            return false;
        }
        let last_phystime: f64 = state.last_phystime.unwrap_or(first_phystime);
        match &self.mode {
            CheckpointMode::WalltimeRegular(interval) => walltime - state.last_walltime >= *interval,
            CheckpointMode::WalltimeExplicit(values) => {
                values.iter().any(|t| walltime >= *t && *t > state.last_walltime)
            },
            CheckpointMode::PhystimeRegular(interval) => phystime - last_phystime >= *interval,
            CheckpointMode::PhystimeExplicit(values) => values.iter().any(|t| phystime >= *t && *t > last_phystime),
            CheckpointMode::All => true,
        }
    }
}

impl CheckpointState {
    /// Records checkpoint `tag` and returns whether it is protected from purging.
    pub fn record(&mut self, tag: &str, protect: bool, protect_frequency: Option<u64>) -> bool {
        self.count += 1;
        let protected: bool = protect || protect_frequency.map(|f| self.count % f == 0).unwrap_or(false);
        self.taken.push((tag.to_string(), protected));
        protected
    }

    fn taken_tag(&self, tag: &str) -> bool {
        self.taken.iter().any(|(t, _)| t == tag)
    }
}

impl Services {
    /// Asks `components` to checkpoint at physics time `timestamp` if the CHECKPOINT policy says so, then purges old
    /// restart directories. Returns the checkpoint results, or `None` when no checkpoint was due.
    pub fn checkpoint_components(
        &mut self,
        components: &[ComponentId],
        timestamp: f64,
        force: bool,
        protect: bool,
    ) -> Result<Option<BTreeMap<CallId, Value>>, Fail> {
        let walltime: f64 = self.context.start.elapsed().as_secs_f64();
        let policy: Option<CheckpointPolicy> = match self.sim_conf.get("CHECKPOINT") {
            Some(Value::Map(section)) => Some(CheckpointPolicy::from_section(section)?),
            _ if force => None,
            _ => {
                let cause: String = String::from("missing CHECKPOINT config section");
                self.error(&cause);
                return Err(Fail::new(libc::EINVAL, &cause));
            },
        };
        if !force {
            let due: bool = match &policy {
                Some(policy) => {
                    let first_phystime: f64 = match self.checkpoint.last_phystime {
                        Some(t) => t,
                        None => self.get_time_loop()?.first().copied().unwrap_or(0.0),
                    };
                    policy.is_due(&self.checkpoint, walltime, timestamp, first_phystime)
                },
                None => false,
            };
            if !due {
                return Ok(None);
            }
        }

        self.checkpoint.last_walltime = walltime;
        self.checkpoint.last_phystime = Some(timestamp);
        let names: String = components.iter().map(|c| c.to_string()).collect::<Vec<String>>().join(" ");
        self.send_event("IPS_CHECKPOINT_START", &format!("Components = {}", names), true);

        let mut call_ids: Vec<CallId> = Vec::with_capacity(components.len());
        let mut failure: Option<Fail> = None;
        for component in components {
            match self.call_nonblocking(component, "checkpoint", vec![Value::Float(timestamp)]) {
                Ok(call_id) => call_ids.push(call_id),
                Err(e) if failure.is_none() => failure = Some(e),
                Err(_) => (),
            }
        }
        let waited: Result<BTreeMap<CallId, Value>, Fail> = self.wait_call_list(&call_ids, true);
        let results: BTreeMap<CallId, Value> = match (failure, waited) {
            (None, Ok(results)) => results,
            (Some(e), Ok(results)) => {
                self.call_results.extend(results);
                self.send_event("IPS_CHECKPOINT_END", &format!("Components = {} failed: {}", names, e.cause), false);
                return Err(e);
            },
            (Some(e), Err(_)) | (None, Err(e)) => {
                self.send_event("IPS_CHECKPOINT_END", &format!("Components = {} failed: {}", names, e.cause), false);
                return Err(e);
            },
        };

        let tag: String = restart_tag(timestamp);
        let protect_frequency: Option<u64> = policy.as_ref().and_then(|p| p.protect_frequency);
        self.checkpoint.record(&tag, protect, protect_frequency);
        let num_checkpoint: i64 = policy.as_ref().map(|p| p.num_checkpoint).unwrap_or(-1);
        if num_checkpoint >= 0 {
            self.purge_checkpoints(num_checkpoint as usize)?;
        }

        self.send_event("IPS_CHECKPOINT_END", &format!("Components = {}", names), true);
        Ok(Some(results))
    }

    /// Removes the oldest unprotected restart directories beyond `keep`.
    fn purge_checkpoints(&mut self, keep: usize) -> Result<(), Fail> {
        let base: PathBuf = self.sim_root.join("restart");
        let prior: Vec<String> = restart_dirs(&base)?
            .into_iter()
            .filter(|tag| !self.checkpoint.taken_tag(tag))
            .collect();
        let current: Vec<String> = self
            .checkpoint
            .taken
            .iter()
            .filter(|(tag, protected)| !*protected && base.join(tag).is_dir())
            .map(|(tag, _)| tag.clone())
            .collect();
        for tag in expired_checkpoints(prior, current, keep) {
            let dir: PathBuf = base.join(&tag);
            self.debug(&format!("purging checkpoint {:?}", dir));
            fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Name of the restart directory for physics time `t`.
pub fn restart_tag(t: f64) -> String {
    format!("{:.3}", t)
}

/// Numerically named directories under `base`, oldest first.
pub fn restart_dirs(base: &Path) -> Result<Vec<String>, Fail> {
    if !base.is_dir() {
        return Ok(Vec::new());
    }
    let mut dirs: Vec<(f64, String)> = Vec::new();
    for entry in fs::read_dir(base)? {
        let entry: fs::DirEntry = entry?;
        if !entry.path().is_dir() {
            continue;
        }
        let name: String = entry.file_name().to_string_lossy().into_owned();
        if let Ok(t) = name.parse::<f64>() {
            dirs.push((t, name));
        }
    }
    dirs.sort_by(|a, b| a.0.total_cmp(&b.0));
    Ok(dirs.into_iter().map(|(_, name)| name).collect())
}

/// Checkpoints to delete, oldest first, so that at most `keep` purge candidates remain. Candidates are the
/// directories of earlier runs followed by this run's unprotected checkpoints.
pub fn expired_checkpoints(prior: Vec<String>, current: Vec<String>, keep: usize) -> Vec<String> {
    let mut candidates: Vec<String> = prior;
    candidates.extend(current);
    let excess: usize = candidates.len().saturating_sub(keep);
    candidates.into_iter().take(excess).collect()
}

/// Resolves `RESTART_TIME: LATEST` of a restarting simulation to its newest checkpoint under RESTART_ROOT.
pub fn settle_restart_time(sim_conf: &mut ValueMap) -> Result<(), Fail> {
    let restarting: bool = sim_conf
        .get("SIMULATION_MODE")
        .map(|mode| mode.to_string().trim().to_uppercase() == "RESTART")
        .unwrap_or(false);
    let latest: bool = sim_conf
        .get("RESTART_TIME")
        .map(|t| t.to_string().trim().to_uppercase() == "LATEST")
        .unwrap_or(false);
    if !(restarting && latest) {
        return Ok(());
    }
    let root: PathBuf = match sim_conf.get("RESTART_ROOT") {
        Some(root) => absolute(Path::new(&root.to_string())),
        None => {
            let cause: String = String::from("RESTART_TIME is LATEST but RESTART_ROOT is not set");
            error!("settle_restart_time(): {}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        },
    };
    match restart_dirs(&root.join("restart"))?.pop() {
        Some(tag) => {
            debug!("settle_restart_time(): restarting from {} in {:?}", tag, root);
            sim_conf.insert("RESTART_TIME".to_string(), Value::Str(tag));
            Ok(())
        },
        None => {
            let cause: String = format!("no checkpoints under {:?}", root.join("restart"));
            error!("settle_restart_time(): {}", cause);
            Err(Fail::new(libc::ENOENT, &cause))
        },
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
