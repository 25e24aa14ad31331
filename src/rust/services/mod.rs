// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

pub mod checkpoint;
pub mod staging;
pub mod subflow;
pub mod task_pool;
pub mod tasks;

//======================================================================================================================
// Exports
//======================================================================================================================

pub use self::{
    task_pool::TaskPool,
    tasks::LaunchOptions,
};

//======================================================================================================================
// Imports
//======================================================================================================================

use self::{
    checkpoint::CheckpointState,
    subflow::SubFlow,
    tasks::RunningTask,
};
use crate::{
    component::{
        worker::WorkerContext,
        ComponentId,
    },
    config::{
        simulation::absolute,
        CreatedSimulation,
    },
    events::MonitorEvent,
    runtime::{
        fail::Fail,
        logging,
        message::{
            CallId,
            Message,
            MessageId,
            ServiceRequest,
            ServiceResponse,
            TaskId,
        },
        value::{
            Value,
            ValueMap,
        },
    },
};
use ::crossbeam_channel::Receiver;
use ::log::{
    Level,
    LevelFilter,
};
use ::std::{
    collections::{
        BTreeMap,
        HashMap,
    },
    path::{
        Path,
        PathBuf,
    },
    time::Instant,
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Default LOG_LEVEL of a component.
const DEFAULT_LOG_LEVEL: &str = "WARNING";

//======================================================================================================================
// Structures
//======================================================================================================================

/// Services
///
/// The façade a component sees. Every framework service is a request on the framework in-queue followed by a wait
/// on this worker's response queue. Tasks, task pools, checkpoint bookkeeping and staging live here too.
pub struct Services {
    component_id: ComponentId,
    config: ValueMap,
    sim_conf: ValueMap,
    context: WorkerContext,
    responses: Receiver<ServiceResponse>,
    /// Responses that arrived while waiting for another one.
    stash: HashMap<MessageId, ServiceResponse>,
    /// Call results collected by a `wait_call_list` that failed on another call.
    call_results: BTreeMap<CallId, Value>,
    /// `<CLASS>_<SUB_CLASS>_<NAME>_<seq>`.
    full_comp_id: String,
    sim_root: PathBuf,
    workdir: PathBuf,
    log_level: LevelFilter,
    shared_nodes: bool,
    ppn: usize,
    /// Method currently being served.
    method: Option<String>,
    phystimestamp: Option<f64>,
    binary_cache: HashMap<String, PathBuf>,
    running_tasks: HashMap<TaskId, RunningTask>,
    task_pools: HashMap<String, TaskPool>,
    checkpoint: CheckpointState,
    sub_flows: BTreeMap<String, SubFlow>,
    subflow_count: usize,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl Services {
    pub fn new(
        component_id: ComponentId,
        config: ValueMap,
        mut sim_conf: ValueMap,
        context: WorkerContext,
        responses: Receiver<ServiceResponse>,
    ) -> Result<Self, Fail> {
        let mut tag: Vec<String> = Vec::with_capacity(4);
        for key in ["CLASS", "SUB_CLASS", "NAME"] {
            match config.get(key) {
                Some(value) => tag.push(value.to_string()),
                None => {
                    let cause: String = format!("component {} has no {}", component_id, key);
                    error!("new(): {}", cause);
                    return Err(Fail::new(libc::EINVAL, &cause));
                },
            }
        }
        tag.push(component_id.seq_num().to_string());
        let full_comp_id: String = tag.join("_");

        let sim_root: PathBuf = match sim_conf.get("SIM_ROOT") {
            Some(root) => absolute(Path::new(&root.to_string())),
            None => {
                let cause: String = format!("simulation of {} has no SIM_ROOT", component_id);
                error!("new(): {}", cause);
                return Err(Fail::new(libc::EINVAL, &cause));
            },
        };
        let workdir: PathBuf = sim_root.join("work").join(&full_comp_id);

        let log_level: LevelFilter = logging::level_filter(
            &config
                .get("LOG_LEVEL")
                .or_else(|| sim_conf.get("LOG_LEVEL"))
                .map(Value::to_string)
                .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
        );
        let shared_nodes: bool = config
            .get("NODE_ALLOCATION_MODE")
            .or_else(|| sim_conf.get("NODE_ALLOCATION_MODE"))
            .map(|mode| mode.to_string().trim().to_uppercase() == "SHARED")
            .unwrap_or(false);
        let ppn: usize = config
            .get("PROCS_PER_NODE")
            .and_then(|ppn| ppn.as_usize().ok())
            .unwrap_or(0);

        checkpoint::settle_restart_time(&mut sim_conf)?;

        trace!("new(): services of {} work in {:?}", component_id, workdir);
        Ok(Self {
            component_id,
            config,
            sim_conf,
            context,
            responses,
            stash: HashMap::new(),
            call_results: BTreeMap::new(),
            full_comp_id,
            sim_root,
            workdir,
            log_level,
            shared_nodes,
            ppn,
            method: None,
            phystimestamp: None,
            binary_cache: HashMap::new(),
            running_tasks: HashMap::new(),
            task_pools: HashMap::new(),
            checkpoint: CheckpointState::default(),
            sub_flows: BTreeMap::new(),
            subflow_count: 0,
        })
    }

    pub fn component_id(&self) -> &ComponentId {
        &self.component_id
    }

    pub fn full_comp_id(&self) -> &str {
        &self.full_comp_id
    }

    /// Section of the simulation file that configures this component.
    pub fn config(&self) -> &ValueMap {
        &self.config
    }

    /// Simulation mapping as seen when the worker was created, plus local updates.
    pub fn sim_conf(&self) -> &ValueMap {
        &self.sim_conf
    }

    pub fn sim_name(&self) -> &str {
        self.component_id.sim_name()
    }

    /// Absolute SIM_ROOT of this worker's simulation.
    pub fn sim_root(&self) -> &Path {
        &self.sim_root
    }

    pub fn get_working_dir(&self) -> PathBuf {
        self.workdir.clone()
    }

    /// Method currently being served, if any.
    pub fn current_method(&self) -> Option<&str> {
        self.method.as_deref()
    }

    pub fn send_to_framework(&self, msg: Message) -> Result<(), Fail> {
        match self.context.fwk_tx.send(msg) {
            Ok(()) => Ok(()),
            Err(_) => {
                let cause: String = format!("framework in-queue closed for {}", self.component_id);
                error!("send_to_framework(): {}", cause);
                Err(Fail::new(libc::EPIPE, &cause))
            },
        }
    }

    /// Called by the worker before running a component method.
    pub fn begin_invocation(&mut self, method: &str) {
        if let Err(e) = ::std::fs::create_dir_all(&self.workdir) {
            warn!("begin_invocation(): cannot create {:?} ({})", self.workdir, e);
        }
        self.method = Some(method.to_string());
    }

    pub fn end_invocation(&mut self) {
        self.method = None;
    }

    /// Releases everything the worker still holds: running tasks and task pools.
    pub fn cleanup(&mut self) {
        let pools: Vec<String> = self.task_pools.keys().cloned().collect();
        for name in pools {
            if let Err(e) = self.remove_task_pool(&name) {
                warn!("cleanup(): {}: {:?}", name, e);
            }
        }
        self.kill_all_tasks();
    }

    //==================================================================================================================
    // Logging
    //==================================================================================================================

    /// Logs `message` under this component's target when LOG_LEVEL lets it through.
    pub fn log(&self, level: Level, message: &str) {
        if level <= self.log_level {
            log!(target: &self.full_comp_id, level, "{}", message);
        }
    }

    pub fn debug(&self, message: &str) {
        self.log(Level::Debug, message)
    }

    pub fn info(&self, message: &str) {
        self.log(Level::Info, message)
    }

    pub fn warning(&self, message: &str) {
        self.log(Level::Warn, message)
    }

    pub fn error(&self, message: &str) {
        self.log(Level::Error, message)
    }

    pub fn critical(&self, message: &str) {
        self.log(Level::Error, &format!("CRITICAL: {}", message))
    }

    //==================================================================================================================
    // Events
    //==================================================================================================================

    /// Publishes a monitor event on behalf of this component.
    pub fn send_event(&self, eventtype: &str, comment: &str, ok: bool) {
        let mut event: MonitorEvent =
            MonitorEvent::new(self.sim_name(), eventtype, self.component_id.class_name(), comment).with_ok(ok);
        if let Some(t) = self.phystimestamp {
            event = event.at(t);
        }
        if self.context.event_tx.send(event).is_err() {
            warn!("send_event(): event queue closed, {} dropped", eventtype);
        }
    }

    /// Records the physics time reached by this component.
    pub fn update_time_stamp(&mut self, timestamp: f64) {
        self.phystimestamp = Some(timestamp);
        self.send_event("IPS_UPDATE_TIME_STAMP", &format!("Timestamp = {}", timestamp), true);
    }

    //==================================================================================================================
    // Framework Requests
    //==================================================================================================================

    fn invoke_service(&self, method: &str, args: Vec<Value>, kwargs: ValueMap) -> Result<MessageId, Fail> {
        let mut request: ServiceRequest =
            ServiceRequest::new(self.component_id.clone(), self.context.fwk_id.clone(), method, args);
        request.kwargs = kwargs;
        let id: MessageId = request.id;
        trace!("invoke_service(): {} requests {} ({})", self.component_id, method, id);
        self.send_to_framework(Message::ServiceRequest(request))?;
        Ok(id)
    }

    /// Waits for the response to request `id`, setting aside any other response received meanwhile.
    fn get_service_response(&mut self, id: MessageId) -> Result<Value, Fail> {
        if let Some(response) = self.stash.remove(&id) {
            return response.result;
        }
        loop {
            match self.responses.recv() {
                Ok(response) if response.request_id == id => return response.result,
                Ok(response) => {
                    self.stash.insert(response.request_id, response);
                },
                Err(_) => {
                    let cause: String = format!("response queue of {} closed", self.component_id);
                    error!("get_service_response(): {}", cause);
                    return Err(Fail::new(libc::EPIPE, &cause));
                },
            }
        }
    }

    fn request(&mut self, method: &str, args: Vec<Value>) -> Result<Value, Fail> {
        self.request_with(method, args, ValueMap::new())
    }

    fn request_with(&mut self, method: &str, args: Vec<Value>, kwargs: ValueMap) -> Result<Value, Fail> {
        let id: MessageId = self.invoke_service(method, args, kwargs)?;
        self.get_service_response(id)
    }

    /// Component implementing `port_name` in this simulation.
    pub fn get_port(&mut self, port_name: &str) -> Result<ComponentId, Fail> {
        let value: Value = self.request("get_port", vec![Value::from(port_name)])?;
        Ok(value.as_component()?.clone())
    }

    /// Reads a configuration parameter from the local simulation mapping, then from the framework. A `silent`
    /// lookup of a missing parameter yields `Value::None`.
    pub fn get_config_param(&mut self, param: &str, silent: bool) -> Result<Value, Fail> {
        if let Some(value) = self.sim_conf.get(param) {
            return Ok(value.clone());
        }
        match self.request("get_config_parameter", vec![Value::from(param)]) {
            Ok(value) => Ok(value),
            Err(e) if silent && e.errno == libc::ENOENT => Ok(Value::None),
            Err(e) => {
                self.error(&format!("cannot read config parameter {}: {}", param, e.cause));
                Err(e)
            },
        }
    }

    /// Reads a parameter of the framework simulation, which carries the settings shared by all workflows.
    pub fn get_global_config_param(&mut self, param: &str) -> Result<Value, Fail> {
        let fwk_sim: String = self.context.fwk_id.sim_name().to_string();
        self.request("get_config_parameter", vec![Value::from(param), Value::from(fwk_sim)])
    }

    /// Sets `param` in `target_sim` (this simulation when `None`). Parameters loaded from the configuration files
    /// are fixed; the others live in the framework, so every worker reads the latest value.
    pub fn set_config_param(&mut self, param: &str, value: Value, target_sim: Option<&str>) -> Result<Value, Fail> {
        if self.sim_conf.contains_key(param) {
            let cause: String = format!("cannot dynamically alter simulation configuration parameter {}", param);
            self.error(&cause);
            return Err(Fail::new(libc::EPERM, &cause));
        }
        let target: String = target_sim.unwrap_or(self.component_id.sim_name()).to_string();
        match self.request(
            "set_config_parameter",
            vec![Value::from(param), value, Value::from(target.as_str())],
        ) {
            Ok(result) => Ok(result),
            Err(e) => {
                self.error(&format!("error setting value of configuration parameter {}: {}", param, e.cause));
                Err(e)
            },
        }
    }

    pub fn get_platform_parameter(&mut self, param: &str) -> Result<Value, Fail> {
        self.request("get_platform_parameter", vec![Value::from(param)])
    }

    pub fn get_time_loop(&mut self) -> Result<Vec<f64>, Fail> {
        self.request("get_time_loop", Vec::new())?.to_float_list()
    }

    pub fn get_sim_names(&mut self) -> Result<Vec<String>, Fail> {
        self.request("get_sim_names", Vec::new())?.to_string_list()
    }

    /// Components of every user simulation, with their sections and simulation roots.
    pub fn get_simulation_components(&mut self) -> Result<Vec<(ComponentId, ValueMap, PathBuf)>, Fail> {
        let value: Value = self.request("get_simulation_components", Vec::new())?;
        let mut components: Vec<(ComponentId, ValueMap, PathBuf)> = Vec::new();
        for entry in value.as_list()? {
            match entry.as_list()? {
                [id, config, sim_root] => components.push((
                    id.as_component()?.clone(),
                    config.as_map()?.clone(),
                    absolute(Path::new(sim_root.as_str()?)),
                )),
                _ => return Err(Fail::new(libc::EINVAL, "malformed simulation component")),
            }
        }
        Ok(components)
    }

    //==================================================================================================================
    // Calls
    //==================================================================================================================

    /// Invokes `method` on `callee` and waits for its result. A failure raised by the callee is returned as is.
    pub fn call(&mut self, callee: &ComponentId, method: &str, args: Vec<Value>) -> Result<Value, Fail> {
        let target: String = format!("{}:{}", callee, method);
        self.send_event("IPS_CALL_BEGIN", &format!("Target = {} args = {:?}", target, args), true);
        let call_id: CallId = self.call_nonblocking(callee, method, args)?;
        let result: Result<Value, Fail> = self.wait_call(call_id, true).map(|value| value.unwrap_or(Value::None));
        match &result {
            Ok(_) => self.send_event("IPS_CALL_END", &format!("Target = {}", target), true),
            Err(e) => self.send_event("IPS_CALL_END", &format!("Target = {} failed: {}", target, e.cause), false),
        }
        result
    }

    /// Starts an invocation of `method` on `callee` and returns its call id.
    pub fn call_nonblocking(&mut self, callee: &ComponentId, method: &str, args: Vec<Value>) -> Result<CallId, Fail> {
        self.call_nonblocking_with(callee, method, args, ValueMap::new())
    }

    pub fn call_nonblocking_with(
        &mut self,
        callee: &ComponentId,
        method: &str,
        args: Vec<Value>,
        kwargs: ValueMap,
    ) -> Result<CallId, Fail> {
        let value: Value = self.request_with(
            "init_call",
            vec![Value::from(callee.clone()), Value::from(method), Value::List(args)],
            kwargs,
        )?;
        CallId::try_from(&value)
    }

    /// Result of call `call_id`. Without `block`, `None` means the call is still running.
    pub fn wait_call(&mut self, call_id: CallId, block: bool) -> Result<Option<Value>, Fail> {
        if let Some(value) = self.call_results.remove(&call_id) {
            return Ok(Some(value));
        }
        let value: Value = self.request("wait_call", vec![Value::from(call_id), Value::Bool(block)])?;
        match value.as_list()? {
            [done, payload] => match done.as_bool()? {
                true => Ok(Some(payload.clone())),
                false => Ok(None),
            },
            _ => Err(Fail::new(libc::EINVAL, "malformed wait_call response")),
        }
    }

    /// Results of the calls in `call_ids` that are done; all of them when `block` is set. Every call is waited on
    /// before the first failure is returned, and the results collected meanwhile stay available to [Self::wait_call].
    pub fn wait_call_list(&mut self, call_ids: &[CallId], block: bool) -> Result<BTreeMap<CallId, Value>, Fail> {
        let mut results: BTreeMap<CallId, Value> = BTreeMap::new();
        let mut failure: Option<Fail> = None;
        for call_id in call_ids {
            match self.wait_call(*call_id, block) {
                Ok(Some(value)) => {
                    results.insert(*call_id, value);
                },
                Ok(None) => (),
                Err(e) if failure.is_none() => failure = Some(e),
                Err(_) => (),
            }
        }
        match failure {
            Some(e) => {
                self.call_results.extend(results);
                Err(e)
            },
            None => Ok(results),
        }
    }

    //==================================================================================================================
    // Simulations
    //==================================================================================================================

    /// Loads another workflow from `config_file` while the framework runs.
    pub fn create_simulation(&mut self, config_file: &Path, overrides: ValueMap) -> Result<CreatedSimulation, Fail> {
        let value: Value = self.request(
            "create_simulation",
            vec![Value::from(absolute(config_file).to_string_lossy().into_owned()), Value::Map(overrides)],
        )?;
        let created: CreatedSimulation = CreatedSimulation::from_value(&value)?;
        self.debug(&format!("created simulation {}", created.sim_name));
        Ok(created)
    }

    /// Stops the workers of `sim_name` and retires the simulation.
    pub fn terminate_sim(&mut self, sim_name: &str) -> Result<(), Fail> {
        self.request("terminate_sim", vec![Value::from(sim_name)])?;
        Ok(())
    }
}
