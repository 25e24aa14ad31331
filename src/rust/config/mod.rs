// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

pub mod platform;
pub mod simulation;
pub mod yaml;

//======================================================================================================================
// Imports
//======================================================================================================================

use self::{
    platform::{
        AllocationMode,
        PlatformConfig,
    },
    simulation::{
        absolute,
        required_str,
        sim_keys,
        PortBinding,
        SimulationData,
    },
    yaml::{
        interpolate,
        merge_absent,
        ConfigFile,
    },
};
use crate::{
    component::{
        registry::{
            ComponentRegistry,
            RegistryEntry,
        },
        worker::WorkerSpawner,
        ComponentId,
    },
    runtime::{
        fail::Fail,
        value::{
            Value,
            ValueMap,
        },
    },
};
use ::std::{
    collections::{
        BTreeMap,
        HashSet,
    },
    path::{
        Path,
        PathBuf,
    },
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Name under which the runspace initializer is registered with the component factory.
pub const RUNSPACE_INIT_NAME: &str = "runspaceInit";

/// Suffix of the synthetic simulation that hosts framework-attached components.
const FWK_SIM_SUFFIX: &str = "_FWK";

//======================================================================================================================
// Structures
//======================================================================================================================

/// Which setup phases the runspace initializer performs.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RunspaceOptions {
    pub create_runspace: bool,
    pub run_setup: bool,
    pub debug: bool,
}

/// What a dynamically created simulation looks like to its creator.
#[derive(Clone, Debug, PartialEq)]
pub struct CreatedSimulation {
    pub sim_name: String,
    pub init_comp: Option<ComponentId>,
    pub driver_comp: ComponentId,
}

/// Configuration Manager
///
/// Owns the platform mapping and every loaded simulation, and creates the workers that implement their ports.
pub struct ConfigurationManager {
    platform: PlatformConfig,
    compsets: Vec<ValueMap>,
    config_files: Vec<PathBuf>,
    sims: BTreeMap<String, SimulationData>,
    /// Simulation names in load order; the framework simulation comes last.
    sim_order: Vec<String>,
    finished: BTreeMap<String, SimulationData>,
    fwk_sim_name: String,
    fwk_components: Vec<ComponentId>,
    sim_names_seen: HashSet<String>,
    sim_roots_seen: HashSet<String>,
    log_files_seen: HashSet<PathBuf>,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl RunspaceOptions {
    /// Every phase enabled.
    pub fn all() -> Self {
        Self {
            create_runspace: true,
            run_setup: true,
            debug: false,
        }
    }
}

impl CreatedSimulation {
    pub fn to_value(&self) -> Value {
        Value::List(vec![
            Value::from(self.sim_name.as_str()),
            Value::from(self.init_comp.clone()),
            Value::from(self.driver_comp.clone()),
        ])
    }

    pub fn from_value(value: &Value) -> Result<Self, Fail> {
        match value.as_list()? {
            [sim_name, init_comp, driver_comp] => Ok(Self {
                sim_name: sim_name.as_str()?.to_string(),
                init_comp: match init_comp {
                    Value::None => None,
                    other => Some(other.as_component()?.clone()),
                },
                driver_comp: driver_comp.as_component()?.clone(),
            }),
            _ => Err(Fail::new(libc::EINVAL, "malformed simulation description")),
        }
    }
}

impl ConfigurationManager {
    /// Loads the platform file, component-set files and simulation files.
    pub fn new(
        platform_file: &Path,
        compset_files: &[PathBuf],
        sim_files: &[PathBuf],
        env: &ValueMap,
    ) -> Result<Self, Fail> {
        let platform: PlatformConfig = PlatformConfig::load(platform_file, env)?;
        let mut compsets: Vec<ValueMap> = Vec::with_capacity(compset_files.len());
        for path in compset_files {
            compsets.push(ConfigFile::new(path)?.to_map()?);
        }
        let mut cm: Self = Self::with_platform(platform, compsets);
        for path in sim_files {
            let file: ConfigFile = ConfigFile::new(path)?;
            for key in [sim_keys::SIM_NAME, sim_keys::SIM_ROOT, sim_keys::LOG_FILE] {
                ConfigFile::get_option(file.root(), key)?;
            }
            ConfigFile::get_subsection(file.root(), sim_keys::PORTS)?;
            let sim: SimulationData = cm.build_simulation(file.to_map()?, &absolute(path), &file.directory(), None)?;
            cm.config_files.push(path.clone());
            cm.insert_simulation(sim);
        }
        cm.create_framework_simulation()?;
        Ok(cm)
    }

    /// Starts from an already loaded platform, with no simulations.
    pub fn with_platform(platform: PlatformConfig, compsets: Vec<ValueMap>) -> Self {
        Self {
            platform,
            compsets,
            config_files: Vec::new(),
            sims: BTreeMap::new(),
            sim_order: Vec::new(),
            finished: BTreeMap::new(),
            fwk_sim_name: String::new(),
            fwk_components: Vec::new(),
            sim_names_seen: HashSet::new(),
            sim_roots_seen: HashSet::new(),
            log_files_seen: HashSet::new(),
        }
    }

    /// Creates the workers of every loaded simulation, then the framework-attached ones.
    pub fn initialize(
        &mut self,
        registry: &mut ComponentRegistry,
        spawner: &WorkerSpawner,
        options: &RunspaceOptions,
    ) -> Result<(), Fail> {
        let user_sims: Vec<String> = self.sim_names();
        for sim_name in user_sims {
            self.initialize_simulation(&sim_name, registry, spawner)?;
        }
        self.initialize_framework_components(registry, spawner, options)
    }

    /// Adds a simulation while the framework runs. Sub-workflows publish events under their parent's stream.
    pub fn create_simulation(
        &mut self,
        registry: &mut ComponentRegistry,
        spawner: &WorkerSpawner,
        parent_sim: &str,
        conf: ValueMap,
        config_file: &Path,
        overrides: &ValueMap,
        sub_workflow: bool,
    ) -> Result<CreatedSimulation, Fail> {
        let parent_portal: String = match self.sims.get(parent_sim) {
            Some(parent) => parent.portal_sim_name.clone(),
            None => {
                let cause: String = format!("unknown parent simulation {}", parent_sim);
                error!("create_simulation(): {}", cause);
                return Err(Fail::new(libc::EINVAL, &cause));
            },
        };
        let conf_file_dir: PathBuf = match absolute(config_file).parent() {
            Some(dir) => dir.to_path_buf(),
            None => PathBuf::from("/"),
        };
        let mut sim: SimulationData =
            self.build_simulation(conf, &absolute(config_file), &conf_file_dir, Some(overrides))?;
        sim.sub_workflow = sub_workflow;
        if sub_workflow {
            sim.portal_sim_name = parent_portal;
        }
        sim.sim_conf.insert(
            sim_keys::PORTAL_SIM_NAME.to_string(),
            Value::from(sim.portal_sim_name.as_str()),
        );
        let sim_name: String = sim.sim_name.clone();
        self.insert_simulation(sim);
        if let Err(e) = self.initialize_simulation(&sim_name, registry, spawner) {
            self.discard_simulation(&sim_name, registry);
            return Err(e);
        }
        let sim: &SimulationData = self.simulation(&sim_name)?;
        match &sim.driver_comp {
            Some(driver_comp) => Ok(CreatedSimulation {
                sim_name: sim_name.clone(),
                init_comp: sim.init_comp.clone(),
                driver_comp: driver_comp.clone(),
            }),
            None => Err(Fail::new(libc::EINVAL, "simulation has no DRIVER")),
        }
    }

    /// Same as [Self::create_simulation], reading the simulation mapping from `config_file`.
    pub fn create_simulation_from_file(
        &mut self,
        registry: &mut ComponentRegistry,
        spawner: &WorkerSpawner,
        parent_sim: &str,
        config_file: &Path,
        overrides: &ValueMap,
        sub_workflow: bool,
    ) -> Result<CreatedSimulation, Fail> {
        let conf: ValueMap = ConfigFile::new(config_file)?.to_map()?;
        self.create_simulation(registry, spawner, parent_sim, conf, config_file, overrides, sub_workflow)
    }

    pub fn platform(&self) -> &PlatformConfig {
        &self.platform
    }

    pub fn platform_file(&self) -> &Path {
        self.platform.path()
    }

    pub fn config_files(&self) -> &[PathBuf] {
        &self.config_files
    }

    pub fn fwk_sim_name(&self) -> &str {
        &self.fwk_sim_name
    }

    pub fn framework_components(&self) -> &[ComponentId] {
        &self.fwk_components
    }

    /// Names of the running user simulations in load order.
    pub fn sim_names(&self) -> Vec<String> {
        self.sim_order
            .iter()
            .filter(|name| **name != self.fwk_sim_name)
            .cloned()
            .collect()
    }

    pub fn simulation(&self, sim_name: &str) -> Result<&SimulationData, Fail> {
        match self.sims.get(sim_name).or_else(|| self.finished.get(sim_name)) {
            Some(sim) => Ok(sim),
            None => {
                let cause: String = format!("unknown simulation {}", sim_name);
                error!("simulation(): {}", cause);
                Err(Fail::new(libc::EINVAL, &cause))
            },
        }
    }

    /// Whether `sim_name` was created as somebody's sub-workflow.
    pub fn is_sub_workflow(&self, sim_name: &str) -> bool {
        self.sims.get(sim_name).map(|sim| sim.sub_workflow).unwrap_or(false)
    }

    pub fn get_port(&self, sim_name: &str, port_name: &str) -> Result<ComponentId, Fail> {
        match self.simulation(sim_name)?.port_map.get(port_name) {
            Some(id) => Ok(id.clone()),
            None => {
                let cause: String = format!("no component implements port {} in simulation {}", port_name, sim_name);
                error!("get_port(): {}", cause);
                Err(Fail::new(libc::EINVAL, &cause))
            },
        }
    }

    /// Reads `param` from the simulation mapping, falling back to the platform mapping.
    pub fn get_config_parameter(&self, sim_name: &str, param: &str) -> Result<Value, Fail> {
        let sim: &SimulationData = self.simulation(sim_name)?;
        match sim.sim_conf.get(param).or_else(|| self.platform.get(param)) {
            Some(value) => {
                trace!("get_config_parameter(): {} = {} in {}", param, value, sim_name);
                Ok(value.clone())
            },
            None => {
                let cause: String = format!("no configuration parameter {} in simulation {}", param, sim_name);
                debug!("get_config_parameter(): {}", cause);
                Err(Fail::new(libc::ENOENT, &cause))
            },
        }
    }

    /// Sets `param` in `target_sim`, or in every simulation when the target is the framework simulation.
    pub fn set_config_parameter(&mut self, param: &str, value: Value, target_sim: &str) -> Result<Value, Fail> {
        if self.platform.contains(param) {
            let cause: String = format!("cannot override platform parameter {}", param);
            error!("set_config_parameter(): {}", cause);
            return Err(Fail::new(libc::EPERM, &cause));
        }
        let targets: Vec<String> = if target_sim == self.fwk_sim_name {
            self.sims.keys().cloned().collect()
        } else {
            self.simulation(target_sim)?;
            vec![target_sim.to_string()]
        };
        for sim_name in targets {
            if let Some(sim) = self.sims.get_mut(&sim_name).or_else(|| self.finished.get_mut(&sim_name)) {
                debug!("set_config_parameter(): {} = {} in {}", param, value, sim_name);
                sim.sim_conf.insert(param.to_string(), value.clone());
            }
        }
        Ok(value)
    }

    pub fn get_platform_parameter(&self, param: &str) -> Result<Value, Fail> {
        match self.platform.get(param) {
            Some(value) => Ok(value.clone()),
            None => {
                let cause: String = format!("no platform data for {}", param);
                warn!("get_platform_parameter(): {}", cause);
                Err(Fail::new(libc::ENOENT, &cause))
            },
        }
    }

    /// Time points of the TIME_LOOP section of `sim_name`.
    pub fn get_time_loop(&self, sim_name: &str) -> Result<Vec<f64>, Fail> {
        time_loop(&self.simulation(sim_name)?.sim_conf)
    }

    /// Components of every user simulation, with their configuration sections.
    pub fn simulation_components(&self, registry: &ComponentRegistry) -> Vec<(ComponentId, ValueMap)> {
        let mut components: Vec<(ComponentId, ValueMap)> = Vec::new();
        for sim_name in self.sim_names() {
            if let Some(sim) = self.sims.get(&sim_name) {
                for id in sim.all_comps.iter() {
                    if let Ok(entry) = registry.get(id) {
                        components.push((id.clone(), entry.config.clone()));
                    }
                }
            }
        }
        components
    }

    /// Moves a simulation to the finished set and stops its workers.
    pub fn terminate_sim(&mut self, sim_name: &str, registry: &mut ComponentRegistry) -> Result<(), Fail> {
        let sim: SimulationData = match self.sims.remove(sim_name) {
            Some(sim) => sim,
            None => {
                let cause: String = format!("simulation {} is not running", sim_name);
                warn!("terminate_sim(): {}", cause);
                return Err(Fail::new(libc::EINVAL, &cause));
            },
        };
        self.sim_order.retain(|name| name != sim_name);
        for id in sim.all_comps.iter() {
            if let Some(entry) = registry.remove(id) {
                crate::component::worker::detach(id, entry);
            }
        }
        info!("terminate_sim(): simulation {} terminated", sim_name);
        self.finished.insert(sim_name.to_string(), sim);
        Ok(())
    }

    /// Terminates every simulation that is still registered.
    pub fn terminate(&mut self, registry: &mut ComponentRegistry) {
        let names: Vec<String> = self.sim_order.clone();
        for sim_name in names {
            if let Err(e) = self.terminate_sim(&sim_name, registry) {
                warn!("terminate(): {:?}", e);
            }
        }
    }

    fn build_simulation(
        &mut self,
        mut conf: ValueMap,
        config_file: &Path,
        conf_file_dir: &Path,
        overrides: Option<&ValueMap>,
    ) -> Result<SimulationData, Fail> {
        for compset in self.compsets.iter() {
            merge_absent(&mut conf, compset);
        }
        merge_absent(&mut conf, self.platform.conf());
        if let Some(overrides) = overrides {
            for (key, value) in overrides.iter() {
                conf.insert(key.clone(), value.clone());
            }
        }
        interpolate(&mut conf);

        let origin: String = config_file.to_string_lossy().into_owned();
        let sim_name: String = required_str(&conf, sim_keys::SIM_NAME, &origin)?;
        let sim_root: String = required_str(&conf, sim_keys::SIM_ROOT, &origin)?;
        let log_file: PathBuf = absolute(Path::new(&required_str(&conf, sim_keys::LOG_FILE, &origin)?));
        let duplicate: Option<&str> = if self.sim_names_seen.contains(&sim_name) {
            Some(sim_keys::SIM_NAME)
        } else if self.sim_roots_seen.contains(&sim_root) {
            Some(sim_keys::SIM_ROOT)
        } else if self.log_files_seen.contains(&log_file) {
            Some(sim_keys::LOG_FILE)
        } else {
            None
        };
        if let Some(key) = duplicate {
            let cause: String = format!("duplicate {} in configuration file {}", key, origin);
            error!("build_simulation(): {}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }
        conf.entry(sim_keys::SIMULATION_CONFIG_FILE.to_string())
            .or_insert_with(|| Value::from(origin.as_str()));

        let sim: SimulationData = SimulationData::new(&sim_name, conf, config_file, conf_file_dir)?;
        self.sim_names_seen.insert(sim_name);
        self.sim_roots_seen.insert(sim_root);
        self.log_files_seen.insert(log_file);
        Ok(sim)
    }

    fn insert_simulation(&mut self, sim: SimulationData) {
        let sim_name: String = sim.sim_name.clone();
        // The framework simulation stays last.
        match self.sim_order.iter().position(|name| *name == self.fwk_sim_name) {
            Some(ix) if !self.fwk_sim_name.is_empty() => self.sim_order.insert(ix, sim_name.clone()),
            _ => self.sim_order.push(sim_name.clone()),
        }
        self.sims.insert(sim_name, sim);
    }

    fn discard_simulation(&mut self, sim_name: &str, registry: &mut ComponentRegistry) {
        if let Some(sim) = self.sims.remove(sim_name) {
            for id in sim.all_comps.iter() {
                if let Some(entry) = registry.remove(id) {
                    crate::component::worker::detach(id, entry);
                }
            }
        }
        self.sim_order.retain(|name| name != sim_name);
    }

    fn create_framework_simulation(&mut self) -> Result<(), Fail> {
        let first: &SimulationData = match self.sim_order.first().and_then(|name| self.sims.get(name)) {
            Some(first) => first,
            None => {
                let cause: String = String::from("no simulation configuration files");
                error!("create_framework_simulation(): {}", cause);
                return Err(Fail::new(libc::EINVAL, &cause));
            },
        };
        let fwk_sim_name: String = format!("{}{}", first.sim_name, FWK_SIM_SUFFIX);
        let mut conf: ValueMap = first.sim_conf.clone();
        conf.insert(sim_keys::SIM_NAME.to_string(), Value::from(fwk_sim_name.as_str()));
        conf.insert(sim_keys::LOG_LEVEL.to_string(), Value::from("DEBUG"));
        let fwk_sim: SimulationData =
            SimulationData::new(&fwk_sim_name, conf, &first.config_file, &first.conf_file_dir)?;
        self.fwk_sim_name = fwk_sim_name.clone();
        self.sim_order.push(fwk_sim_name.clone());
        self.sims.insert(fwk_sim_name, fwk_sim);
        Ok(())
    }

    fn initialize_simulation(
        &mut self,
        sim_name: &str,
        registry: &mut ComponentRegistry,
        spawner: &WorkerSpawner,
    ) -> Result<(), Fail> {
        let platform_mode: AllocationMode = self.platform.allocation_mode()?;
        let bindings: Vec<PortBinding> = match self.sims.get_mut(sim_name) {
            Some(sim) => {
                sim.settle_allocation_mode(platform_mode)?;
                sim.port_bindings()?
            },
            None => return Err(Fail::new(libc::EINVAL, "unknown simulation")),
        };
        for binding in bindings {
            let id: ComponentId = self.create_component(sim_name, binding.config, registry, spawner)?;
            if let Some(sim) = self.sims.get_mut(sim_name) {
                sim.bind(&binding.port, id);
            }
        }

        let sim: &SimulationData = self.simulation(sim_name)?;
        if sim.driver_comp.is_none() {
            let cause: String = format!("missing DRIVER specification in config file for simulation {}", sim_name);
            error!("initialize_simulation(): {}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }
        if sim.init_comp.is_none() {
            warn!("initialize_simulation(): missing INIT specification in config file for simulation {}", sim_name);
        }
        info!(
            "initialize_simulation(): simulation {} has {} components",
            sim_name,
            sim.all_comps.len()
        );
        Ok(())
    }

    fn initialize_framework_components(
        &mut self,
        registry: &mut ComponentRegistry,
        spawner: &WorkerSpawner,
        options: &RunspaceOptions,
    ) -> Result<(), Fail> {
        let cwd: PathBuf = ::std::env::current_dir()?;
        let config_files: Vec<Value> = self
            .config_files
            .iter()
            .map(|p| Value::from(absolute(p).to_string_lossy().into_owned()))
            .collect();

        let mut conf: ValueMap = ValueMap::new();
        conf.insert("CLASS".to_string(), Value::from("FWK"));
        conf.insert("SUB_CLASS".to_string(), Value::from("COMP"));
        conf.insert("NAME".to_string(), Value::from(RUNSPACE_INIT_NAME));
        conf.insert("SCRIPT".to_string(), Value::from(""));
        conf.insert("INPUT_DIR".to_string(), Value::from("/dev/null"));
        conf.insert("INPUT_FILES".to_string(), Value::from(""));
        conf.insert("OUTPUT_FILES".to_string(), Value::from(""));
        conf.insert("NPROC".to_string(), Value::Int(1));
        conf.insert(
            "LOG_LEVEL".to_string(),
            Value::from(if options.debug { "DEBUG" } else { "WARNING" }),
        );
        conf.insert("OS_CWD".to_string(), Value::from(cwd.to_string_lossy().into_owned()));
        conf.insert("CONFIG_FILES".to_string(), Value::List(config_files));
        conf.insert(
            "PLATFORM_FILE".to_string(),
            Value::from(absolute(self.platform.path()).to_string_lossy().into_owned()),
        );
        conf.insert("CREATE_RUNSPACE".to_string(), Value::Bool(options.create_runspace));
        conf.insert("RUN_SETUP".to_string(), Value::Bool(options.run_setup));

        let fwk_sim_name: String = self.fwk_sim_name.clone();
        let id: ComponentId = self.create_component(&fwk_sim_name, conf, registry, spawner)?;
        if let Some(sim) = self.sims.get_mut(&fwk_sim_name) {
            sim.all_comps.push(id.clone());
        }
        self.fwk_components.push(id);
        Ok(())
    }

    fn create_component(
        &self,
        sim_name: &str,
        config: ValueMap,
        registry: &mut ComponentRegistry,
        spawner: &WorkerSpawner,
    ) -> Result<ComponentId, Fail> {
        let sim: &SimulationData = self.simulation(sim_name)?;
        let name: String = required_str(&config, "NAME", sim_name)?;
        let id: ComponentId = ComponentId::new(&name, sim_name);
        let entry: RegistryEntry = spawner.spawn(id.clone(), config, sim.sim_conf.clone())?;
        registry.add(id.clone(), entry)?;
        debug!("create_component(): created {}", id);
        Ok(id)
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Expands the TIME_LOOP section of a simulation mapping.
///
/// REGULAR mode yields `START + (FINISH - START) / NSTEP * n` for `n` in `0..=NSTEP`; EXPLICIT mode yields VALUES.
pub fn time_loop(sim_conf: &ValueMap) -> Result<Vec<f64>, Fail> {
    let section: &ValueMap = match sim_conf.get("TIME_LOOP") {
        Some(Value::Map(section)) => section,
        _ => {
            let cause: String = String::from("missing TIME_LOOP section");
            error!("time_loop(): {}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        },
    };
    let field = |name: &str| -> Result<&Value, Fail> {
        match section.get(name) {
            Some(value) => Ok(value),
            None => {
                let cause: String = format!("missing TIME_LOOP value {}", name);
                error!("time_loop(): {}", cause);
                Err(Fail::new(libc::EINVAL, &cause))
            },
        }
    };
    match field("MODE")?.to_string().trim().to_uppercase().as_str() {
        "REGULAR" => {
            let start: f64 = field("START")?.as_float()?;
            let finish: f64 = field("FINISH")?.as_float()?;
            let nstep: usize = field("NSTEP")?.as_usize()?;
            if nstep == 0 {
                let cause: String = String::from("TIME_LOOP NSTEP must be positive");
                error!("time_loop(): {}", cause);
                return Err(Fail::new(libc::EINVAL, &cause));
            }
            let step: f64 = (finish - start) / nstep as f64;
            Ok((0..=nstep).map(|n| start + step * n as f64).collect())
        },
        "EXPLICIT" => field("VALUES")?.to_float_list(),
        mode => {
            let cause: String = format!("invalid TIME_LOOP mode {:?}", mode);
            error!("time_loop(): {}", cause);
            Err(Fail::new(libc::EINVAL, &cause))
        },
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
