// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    component::ComponentId,
    config::platform::AllocationMode,
    runtime::{
        fail::Fail,
        value::{
            Value,
            ValueMap,
        },
    },
};
use ::std::{
    collections::BTreeMap,
    path::{
        Path,
        PathBuf,
    },
};

//======================================================================================================================
// Constants
//======================================================================================================================

pub mod sim_keys {
    pub const SIM_NAME: &str = "SIM_NAME";
    pub const SIM_ROOT: &str = "SIM_ROOT";
    pub const LOG_FILE: &str = "LOG_FILE";
    pub const LOG_LEVEL: &str = "LOG_LEVEL";
    pub const PORTS: &str = "PORTS";
    pub const NAMES: &str = "NAMES";
    pub const IMPLEMENTATION: &str = "IMPLEMENTATION";
    pub const DRIVER: &str = "DRIVER";
    pub const INIT: &str = "INIT";
    pub const NODE_ALLOCATION_MODE: &str = "NODE_ALLOCATION_MODE";
    pub const SIMULATION_CONFIG_FILE: &str = "SIMULATION_CONFIG_FILE";
    pub const PORTAL_SIM_NAME: &str = "__PORTAL_SIM_NAME";
    pub const INPUT_DIR: &str = "INPUT_DIR";
    pub const IPS_ROOT: &str = "IPS_ROOT";
    pub const DATA_TREE_ROOT: &str = "DATA_TREE_ROOT";
    pub const BIN_DIR: &str = "BIN_DIR";
    pub const BIN_PATH: &str = "BIN_PATH";
    pub const PLASMA_STATE_FILES: &str = "PLASMA_STATE_FILES";
}

/// Keys every component section must define.
pub const REQUIRED_COMPONENT_KEYS: [&str; 7] =
    ["CLASS", "SUB_CLASS", "NAME", "SCRIPT", "INPUT_FILES", "OUTPUT_FILES", "NPROC"];

//======================================================================================================================
// Structures
//======================================================================================================================

/// One loaded workflow.
#[derive(Clone, Debug)]
pub struct SimulationData {
    pub sim_name: String,
    /// Event stream name. Sub-workflows share their parent's.
    pub portal_sim_name: String,
    pub sim_root: PathBuf,
    pub log_file: PathBuf,
    pub config_file: PathBuf,
    /// Directory of the simulation file.
    pub conf_file_dir: PathBuf,
    /// Merged and interpolated mapping.
    pub sim_conf: ValueMap,
    pub port_map: BTreeMap<String, ComponentId>,
    pub all_comps: Vec<ComponentId>,
    pub init_comp: Option<ComponentId>,
    pub driver_comp: Option<ComponentId>,
    pub sub_workflow: bool,
}

/// A component section ready to be instantiated under a port.
#[derive(Clone, Debug)]
pub struct PortBinding {
    pub port: String,
    pub section: String,
    pub config: ValueMap,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl SimulationData {
    pub fn new(sim_name: &str, sim_conf: ValueMap, config_file: &Path, conf_file_dir: &Path) -> Result<Self, Fail> {
        let sim_root: PathBuf = PathBuf::from(required_str(&sim_conf, sim_keys::SIM_ROOT, sim_name)?);
        let log_file: PathBuf = absolute(Path::new(&required_str(&sim_conf, sim_keys::LOG_FILE, sim_name)?));
        Ok(Self {
            sim_name: sim_name.to_string(),
            portal_sim_name: sim_name.to_string(),
            sim_root,
            log_file,
            config_file: config_file.to_path_buf(),
            conf_file_dir: conf_file_dir.to_path_buf(),
            sim_conf,
            port_map: BTreeMap::new(),
            all_comps: Vec::new(),
            init_comp: None,
            driver_comp: None,
            sub_workflow: false,
        })
    }

    /// Normalizes the workflow's NODE_ALLOCATION_MODE, inheriting the platform's when absent.
    pub fn settle_allocation_mode(&mut self, platform_mode: AllocationMode) -> Result<AllocationMode, Fail> {
        let mode: AllocationMode = match self.sim_conf.get(sim_keys::NODE_ALLOCATION_MODE) {
            Some(Value::None) | None => platform_mode,
            Some(value) => match AllocationMode::parse(&value.to_string()) {
                Some(mode) => mode,
                None => {
                    let cause: String = format!("bad NODE_ALLOCATION_MODE value {} in {}", value, self.sim_name);
                    error!("settle_allocation_mode(): {}", cause);
                    return Err(Fail::new(libc::EINVAL, &cause));
                },
            },
        };
        self.sim_conf
            .insert(sim_keys::NODE_ALLOCATION_MODE.to_string(), Value::from(mode.as_str()));
        Ok(mode)
    }

    /// Resolves the PORTS section into component sections with their inherited defaults filled in.
    pub fn port_bindings(&self) -> Result<Vec<PortBinding>, Fail> {
        let ports: &ValueMap = match self.sim_conf.get(sim_keys::PORTS) {
            Some(Value::Map(ports)) => ports,
            _ => {
                let cause: String = format!("missing PORTS section in simulation {}", self.sim_name);
                error!("port_bindings(): {}", cause);
                return Err(Fail::new(libc::EINVAL, &cause));
            },
        };
        let names: Vec<String> = match ports.get(sim_keys::NAMES) {
            Some(names) => names.to_string_list()?,
            None => Vec::new(),
        };

        let mut bindings: Vec<PortBinding> = Vec::with_capacity(names.len());
        for port in names {
            let section: String = match ports.get(&port) {
                Some(Value::Map(port_conf)) => match port_conf.get(sim_keys::IMPLEMENTATION) {
                    Some(Value::None) | None => String::new(),
                    Some(implementation) => implementation.to_string().trim().to_string(),
                },
                _ => {
                    let cause: String = format!("port {} has no section in simulation {}", port, self.sim_name);
                    error!("port_bindings(): {}", cause);
                    return Err(Fail::new(libc::EINVAL, &cause));
                },
            };
            if section.is_empty() {
                debug!("port_bindings(): port {} of {} has no implementation", port, self.sim_name);
                continue;
            }
            let config: ValueMap = match self.sim_conf.get(&section) {
                Some(Value::Map(config)) => self.component_defaults(config.clone()),
                _ => {
                    let cause: String = format!(
                        "error accessing configuration section for component {} in simulation {}",
                        section, self.sim_name
                    );
                    error!("port_bindings(): {}", cause);
                    return Err(Fail::new(libc::EINVAL, &cause));
                },
            };
            let missing: Vec<&str> = REQUIRED_COMPONENT_KEYS
                .iter()
                .copied()
                .filter(|key| !config.contains_key(*key))
                .collect();
            if !missing.is_empty() {
                let cause: String = format!(
                    "missing required entries {:?} in simulation {} component {} configuration section",
                    missing, self.sim_name, section
                );
                error!("port_bindings(): {}", cause);
                return Err(Fail::new(libc::EINVAL, &cause));
            }
            bindings.push(PortBinding { port, section, config });
        }
        Ok(bindings)
    }

    /// Records the worker that implements `port`.
    pub fn bind(&mut self, port: &str, id: ComponentId) {
        if port == sim_keys::DRIVER {
            self.driver_comp = Some(id.clone());
        } else if port == sim_keys::INIT {
            self.init_comp = Some(id.clone());
        }
        self.port_map.insert(port.to_string(), id.clone());
        self.all_comps.push(id);
    }

    /// Components the framework drives directly: INIT first, then DRIVER.
    pub fn entry_components(&self) -> Vec<ComponentId> {
        self.init_comp.iter().chain(self.driver_comp.iter()).cloned().collect()
    }

    fn component_defaults(&self, mut config: ValueMap) -> ValueMap {
        if !config.contains_key(sim_keys::INPUT_DIR) {
            let input_dir: Value = match self.sim_conf.get(sim_keys::INPUT_DIR) {
                Some(dir) => dir.clone(),
                None => Value::from(self.conf_file_dir.to_string_lossy().into_owned()),
            };
            config.insert(sim_keys::INPUT_DIR.to_string(), input_dir);
        }
        for key in [sim_keys::IPS_ROOT, sim_keys::BIN_DIR, sim_keys::PLASMA_STATE_FILES] {
            if let (false, Some(value)) = (config.contains_key(key), self.sim_conf.get(key)) {
                config.insert(key.to_string(), value.clone());
            }
        }
        if !config.contains_key(sim_keys::DATA_TREE_ROOT) {
            let data_tree_root: Value = match self.sim_conf.get(sim_keys::DATA_TREE_ROOT) {
                Some(dir) => dir.clone(),
                None => Value::from(self.conf_file_dir.to_string_lossy().into_owned()),
            };
            config.insert(sim_keys::DATA_TREE_ROOT.to_string(), data_tree_root);
        }
        if !config.contains_key(sim_keys::BIN_PATH) {
            let bin_path: Option<Value> = self
                .sim_conf
                .get(sim_keys::BIN_PATH)
                .or_else(|| config.get(sim_keys::BIN_DIR))
                .cloned();
            if let Some(bin_path) = bin_path {
                config.insert(sim_keys::BIN_PATH.to_string(), bin_path);
            }
        }
        config
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Reads a mandatory string key of a simulation mapping.
pub fn required_str(conf: &ValueMap, key: &str, origin: &str) -> Result<String, Fail> {
    match conf.get(key) {
        Some(Value::None) | None => {
            let cause: String = format!("missing required parameter {} in {}", key, origin);
            error!("required_str(): {}", cause);
            Err(Fail::new(libc::EINVAL, &cause))
        },
        Some(value) => Ok(value.to_string()),
    }
}

/// Makes `path` absolute against the current directory.
pub fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    match ::std::env::current_dir() {
        Ok(cwd) => cwd.join(path),
        Err(_) => path.to_path_buf(),
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
