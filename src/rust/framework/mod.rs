// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

pub mod handler;

//======================================================================================================================
// Imports
//======================================================================================================================

use self::handler::{
    ServiceError,
    ServiceHandler,
};
use crate::{
    component::{
        worker::{
            WorkerContext,
            WorkerSpawner,
        },
        ComponentFactory,
        ComponentId,
        ComponentRegistry,
    },
    config::{
        platform::{
            AllocationMode,
            PlatformConfig,
        },
        simulation::{
            absolute,
            SimulationData,
        },
        yaml::environment_map,
        ConfigurationManager,
        RunspaceOptions,
    },
    events::{
        EventHub,
        EventSink,
        FileSink,
        LogSink,
        MonitorEvent,
    },
    resource::{
        detect::{
            detect,
            HostPlatform,
            Platform,
            Topology,
        },
        ResourceManager,
        ResourceSettings,
    },
    runtime::{
        fail::Fail,
        message::{
            CallId,
            Message,
            MessageId,
            MethodInvoke,
            MethodResult,
            ServiceRequest,
            ServiceResponse,
            Status,
        },
        value::{
            Value,
            ValueMap,
        },
    },
    task::{
        launcher::Launcher,
        TaskManager,
    },
};
use ::crossbeam_channel::{
    select,
    Receiver,
    Sender,
};
use ::std::{
    collections::{
        BTreeMap,
        HashMap,
        VecDeque,
    },
    fs,
    mem,
    path::PathBuf,
    thread,
    time::{
        Duration,
        Instant,
        SystemTime,
        UNIX_EPOCH,
    },
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Event code of everything the framework itself emits.
const FRAMEWORK_CODE: &str = "Framework";

/// Methods the framework drives on every entry component of a workflow, in order.
static WORKFLOW_METHODS: [&str; 3] = ["init", "step", "finalize"];

/// Methods driven on framework components once their `init` went through.
static FRAMEWORK_METHODS: [&str; 2] = ["step", "finalize"];

/// Pause between the terminate broadcast and tearing down the workers.
const TERMINATE_GRACE: Duration = Duration::from_millis(100);

//======================================================================================================================
// Structures
//======================================================================================================================

/// What a [Framework] is built from.
pub struct FrameworkOptions {
    pub platform_file: PathBuf,
    pub sim_files: Vec<PathBuf>,
    pub compset_files: Vec<PathBuf>,
    /// Command-line node count override.
    pub nodes: Option<usize>,
    /// Command-line processes-per-node override.
    pub ppn: Option<usize>,
    pub runspace: RunspaceOptions,
    /// Whether workflows are driven at all.
    pub run: bool,
    pub factory: ComponentFactory,
    /// Where events go. Defaults to the event file or the log, per `USE_PORTAL`.
    pub sink: Option<Box<dyn EventSink>>,
    /// Process environment, lowest configuration layer.
    pub env: ValueMap,
    /// Source of node detection inputs. Defaults to the host.
    pub probe: Option<Box<dyn Platform>>,
}

/// State the service handlers operate on.
pub struct FrameworkCore {
    pub cm: ConfigurationManager,
    pub tm: TaskManager,
    pub rm: ResourceManager,
    pub registry: ComponentRegistry,
    pub events: EventHub,
    pub spawner: WorkerSpawner,
    pub fwk_id: ComponentId,
}

/// Calls still to be driven for one workflow, one at a time.
struct Chain {
    sim_name: String,
    pending: VecDeque<(ComponentId, &'static str)>,
    ok: bool,
    /// User workflow, as opposed to the framework components.
    workflow: bool,
}

/// Whatever woke the dispatch loop up.
enum Incoming {
    Message(Message),
    Event(MonitorEvent),
    Timeout,
    Closed,
}

/// Framework
///
/// Owns the managers and the registry and serves every worker from a single thread.
pub struct Framework {
    core: FrameworkCore,
    in_rx: Receiver<Message>,
    event_rx: Receiver<MonitorEvent>,
    handlers: HashMap<&'static str, ServiceHandler>,
    /// Requests waiting for resources or call results.
    blocked: Vec<ServiceRequest>,
    chains: BTreeMap<String, Chain>,
    /// Calls issued by the framework, with the chain each belongs to.
    outstanding: HashMap<CallId, String>,
    result_timeout: Option<Duration>,
    last_progress: Instant,
    run: bool,
    failed: bool,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl FrameworkOptions {
    /// Runs every phase with the built-in components and the process environment.
    pub fn new(platform_file: PathBuf, sim_files: Vec<PathBuf>) -> Self {
        Self {
            platform_file,
            sim_files,
            compset_files: Vec::new(),
            nodes: None,
            ppn: None,
            runspace: RunspaceOptions::all(),
            run: true,
            factory: ComponentFactory::with_builtins(),
            sink: None,
            env: environment_map(::std::env::vars()),
            probe: None,
        }
    }
}

impl FrameworkCore {
    /// Publishes an event on behalf of the framework.
    pub fn send_event(&mut self, sim_name: &str, eventtype: &str, comment: &str, ok: bool) {
        self.events
            .publish(MonitorEvent::new(sim_name, eventtype, FRAMEWORK_CODE, comment).with_ok(ok));
    }

    /// Asks a worker to clean up and exit.
    pub fn send_terminate(&self, id: &ComponentId, status: Status) {
        let invoke: MethodInvoke = MethodInvoke {
            id: MessageId::next(),
            caller: self.fwk_id.clone(),
            callee: id.clone(),
            call_id: CallId::from(0),
            method: String::from("terminate"),
            args: vec![Value::from(status)],
            kwargs: ValueMap::new(),
        };
        if let Err(e) = self.registry.send_invoke(id, Message::MethodInvoke(invoke)) {
            warn!("send_terminate(): {:?}", e);
        }
    }

    /// Terminates the workers of `sim_name` and retires the simulation.
    pub fn terminate_sim(&mut self, sim_name: &str, status: Status) -> Result<(), Fail> {
        for id in self.registry.component_ids(sim_name) {
            self.send_terminate(&id, status);
        }
        self.cm.terminate_sim(sim_name, &mut self.registry)?;
        self.tm.forget_simulation(sim_name);
        Ok(())
    }
}

impl Framework {
    /// Loads the configuration, sizes the resource pool and starts every worker.
    pub fn new(options: FrameworkOptions) -> Result<Self, Fail> {
        let (fwk_tx, in_rx): (Sender<Message>, Receiver<Message>) = crossbeam_channel::unbounded();
        let (event_tx, event_rx): (Sender<MonitorEvent>, Receiver<MonitorEvent>) = crossbeam_channel::unbounded();

        let mut cm: ConfigurationManager = ConfigurationManager::new(
            &options.platform_file,
            &options.compset_files,
            &options.sim_files,
            &options.env,
        )?;
        let fwk_id: ComponentId = ComponentId::framework(cm.fwk_sim_name());
        let fwk_sim: &SimulationData = cm.simulation(cm.fwk_sim_name())?;
        let fwk_root: PathBuf = absolute(&fwk_sim.sim_root);
        let fwk_sim_name: String = fwk_sim.sim_name.clone();
        fs::create_dir_all(&fwk_root)?;

        let platform: &PlatformConfig = cm.platform();
        let settings: ResourceSettings = ResourceSettings {
            host: platform.host(),
            exclusive: platform.allocation_mode()? == AllocationMode::Exclusive,
            procs_per_node: platform.procs_per_node()?,
            use_accurate_nodes: platform.use_accurate_nodes(),
            usage_report: Some(fwk_root.join("resource_usage")),
        };
        let rm: ResourceManager = if options.nodes.is_some() || options.ppn.is_some() {
            let nodes: usize = options.nodes.unwrap_or(1).max(1);
            let ppn: usize = options.ppn.unwrap_or(settings.procs_per_node).max(1);
            ResourceManager::with_override(nodes, ppn, settings)?
        } else {
            let topology: Topology = match &options.probe {
                Some(probe) => detect(platform.node_detection(), &platform.detection_settings()?, &**probe)?,
                None => detect(platform.node_detection(), &platform.detection_settings()?, &HostPlatform)?,
            };
            ResourceManager::new(topology, settings)?
        };
        info!(
            "new(): {} nodes, {} processes per node on {}",
            rm.num_nodes(),
            rm.ppn(),
            rm.host()
        );
        let launcher: Launcher = Launcher::from_platform(&platform.mpirun(), &platform.mpirun_version())?;
        let tm: TaskManager = TaskManager::new(launcher);
        let result_timeout: Option<Duration> = platform.method_result_timeout()?;

        let sink: Box<dyn EventSink> = match options.sink {
            Some(sink) => sink,
            None if platform.use_portal() => {
                Box::new(FileSink::create(&fwk_root.join(format!("{}.events", fwk_sim_name)))?)
            },
            None => Box::new(LogSink),
        };
        let context: WorkerContext = WorkerContext {
            fwk_id: fwk_id.clone(),
            fwk_tx,
            event_tx,
            start: Instant::now(),
        };
        let spawner: WorkerSpawner = WorkerSpawner::new(context, options.factory);

        let mut registry: ComponentRegistry = ComponentRegistry::new();
        if let Err(e) = cm.initialize(&mut registry, &spawner, &options.runspace) {
            error!("new(): cannot start workers: {:?}", e);
            cm.terminate(&mut registry);
            return Err(e);
        }

        Ok(Self {
            core: FrameworkCore {
                cm,
                tm,
                rm,
                registry,
                events: EventHub::new(sink),
                spawner,
                fwk_id,
            },
            in_rx,
            event_rx,
            handlers: handler::handlers(),
            blocked: Vec::new(),
            chains: BTreeMap::new(),
            outstanding: HashMap::new(),
            result_timeout,
            last_progress: Instant::now(),
            run: options.run,
            failed: false,
        })
    }

    pub fn core(&self) -> &FrameworkCore {
        &self.core
    }

    /// Drives every workflow to completion and terminates all simulations. Returns whether every workflow
    /// succeeded; an error means the framework components could not be initialized.
    pub fn run(&mut self) -> Result<bool, Fail> {
        let fwk_comps: Vec<ComponentId> = self.core.cm.framework_components().to_vec();
        for id in fwk_comps.iter() {
            if let Err(e) = self.init_framework_component(id) {
                error!("run(): cannot initialize {}: {:?}", id, e);
                self.terminate_all_sims(Status::Failure);
                return Err(e);
            }
        }

        let fwk_sim_name: String = self.core.cm.fwk_sim_name().to_string();
        let pending: VecDeque<(ComponentId, &'static str)> = fwk_comps
            .iter()
            .flat_map(|id| FRAMEWORK_METHODS.iter().map(move |method| (id.clone(), *method)))
            .collect();
        self.chains.insert(
            fwk_sim_name.clone(),
            Chain {
                sim_name: fwk_sim_name.clone(),
                pending,
                ok: true,
                workflow: false,
            },
        );
        self.advance(&fwk_sim_name);

        while !self.chains.is_empty() {
            match self.next_incoming() {
                Incoming::Message(msg) => self.process(msg),
                Incoming::Event(event) => self.core.events.publish(event),
                Incoming::Timeout => self.fail_all_chains(),
                Incoming::Closed => {
                    error!("run(): framework queues closed");
                    self.failed = true;
                    break;
                },
            }
        }

        let status: Status = if self.failed { Status::Failure } else { Status::Success };
        self.terminate_all_sims(status);
        Ok(!self.failed)
    }

    /// Runs `init` of a framework component to completion, serving other requests meanwhile.
    fn init_framework_component(&mut self, id: &ComponentId) -> Result<(), Fail> {
        let call_id: CallId = self.core.tm.init_call(
            &self.core.registry,
            &self.core.fwk_id,
            id,
            "init",
            vec![Value::Float(0.0)],
            ValueMap::new(),
            false,
        )?;
        self.last_progress = Instant::now();
        loop {
            match self.next_incoming() {
                Incoming::Message(Message::MethodResult(result)) if result.call_id == call_id => {
                    self.last_progress = Instant::now();
                    return result.result.map(|_| ());
                },
                Incoming::Message(msg) => self.process(msg),
                Incoming::Event(event) => self.core.events.publish(event),
                Incoming::Timeout => {
                    let cause: String = format!("no result for {}.init() in time", id);
                    error!("init_framework_component(): {}", cause);
                    return Err(Fail::new(libc::ETIMEDOUT, &cause));
                },
                Incoming::Closed => {
                    let cause: String = String::from("framework queues closed");
                    error!("init_framework_component(): {}", cause);
                    return Err(Fail::new(libc::EPIPE, &cause));
                },
            }
        }
    }

    /// Waits for the next message or event, within the remaining result budget if there is one.
    fn next_incoming(&self) -> Incoming {
        match self.result_timeout {
            Some(budget) => {
                let remaining: Duration = budget.saturating_sub(self.last_progress.elapsed());
                select! {
                    recv(self.in_rx) -> msg => msg.map_or(Incoming::Closed, Incoming::Message),
                    recv(self.event_rx) -> event => event.map_or(Incoming::Closed, Incoming::Event),
                    default(remaining) => Incoming::Timeout,
                }
            },
            None => select! {
                recv(self.in_rx) -> msg => msg.map_or(Incoming::Closed, Incoming::Message),
                recv(self.event_rx) -> event => event.map_or(Incoming::Closed, Incoming::Event),
            },
        }
    }

    /// Handles one pulled message, then gives every blocked request another chance.
    fn process(&mut self, msg: Message) {
        match msg {
            Message::ServiceRequest(req) => self.serve(req),
            Message::MethodResult(result) => self.collect(result),
            other => warn!("process(): unexpected message {}", other.id()),
        }
        self.retry_blocked();
    }

    fn serve(&mut self, req: ServiceRequest) {
        let handler: ServiceHandler = match self.handlers.get(req.method.as_str()) {
            Some(handler) => *handler,
            None => {
                let cause: String = format!("unknown service {} requested by {}", req.method, req.sender);
                error!("serve(): {}", cause);
                self.respond(&req, Err(Fail::new(libc::ENOSYS, &cause)));
                return;
            },
        };
        trace!("serve(): {} from {}", req.method, req.sender);
        match handler(&mut self.core, &req) {
            Ok(value) => self.respond(&req, Ok(value)),
            Err(ServiceError::Blocked(reason)) => {
                trace!("serve(): {} from {} blocked ({})", req.method, req.sender, reason);
                self.blocked.push(req);
            },
            Err(ServiceError::Failed(e)) => self.respond(&req, Err(e)),
        }
    }

    fn respond(&self, req: &ServiceRequest, result: Result<Value, Fail>) {
        let response: ServiceResponse = ServiceResponse::reply(self.core.fwk_id.clone(), req, result);
        if let Err(e) = self.core.registry.send_response(response) {
            warn!("respond(): dropping response to {}: {:?}", req.sender, e);
        }
    }

    fn retry_blocked(&mut self) {
        let blocked: Vec<ServiceRequest> = mem::take(&mut self.blocked);
        for req in blocked {
            self.serve(req);
        }
    }

    /// Routes a method result either to the chain that issued it or to the task manager.
    fn collect(&mut self, result: MethodResult) {
        let key: String = match self.outstanding.remove(&result.call_id) {
            Some(key) => key,
            None => {
                self.core.tm.return_call(result);
                return;
            },
        };
        self.last_progress = Instant::now();
        if let Err(e) = &result.result {
            error!("collect(): {} failed in call {}: {:?}", result.callee, result.call_id, e);
            if let Some(chain) = self.chains.get_mut(&key) {
                chain.ok = false;
                chain.pending.clear();
            }
        }
        self.advance(&key);
    }

    /// Issues the next call of a chain, or finishes the chain when nothing is left.
    fn advance(&mut self, key: &str) {
        loop {
            let next: Option<(ComponentId, &'static str)> = match self.chains.get_mut(key) {
                Some(chain) if chain.ok => chain.pending.pop_front(),
                Some(_) => None,
                None => return,
            };
            let (callee, method): (ComponentId, &'static str) = match next {
                Some(next) => next,
                None => {
                    self.finish_chain(key);
                    return;
                },
            };
            match self.core.tm.init_call(
                &self.core.registry,
                &self.core.fwk_id,
                &callee,
                method,
                vec![Value::Float(0.0)],
                ValueMap::new(),
                false,
            ) {
                Ok(call_id) => {
                    debug!("advance(): {}.{}() as call {}", callee, method, call_id);
                    self.outstanding.insert(call_id, key.to_string());
                    return;
                },
                Err(e) => {
                    error!("advance(): cannot invoke {}.{}(): {:?}", callee, method, e);
                    if let Some(chain) = self.chains.get_mut(key) {
                        chain.ok = false;
                    }
                },
            }
        }
    }

    fn finish_chain(&mut self, key: &str) {
        let chain: Chain = match self.chains.remove(key) {
            Some(chain) => chain,
            None => return,
        };
        if !chain.ok {
            self.failed = true;
        }
        if chain.workflow {
            let (comment, status): (&str, Status) = match chain.ok {
                true => ("Simulation Ended", Status::Success),
                false => ("Simulation Execution Error", Status::Failure),
            };
            self.core.send_event(&chain.sim_name, "IPS_END", comment, chain.ok);
            if let Err(e) = self.core.terminate_sim(&chain.sim_name, status) {
                warn!("finish_chain(): {:?}", e);
            }
            info!("finish_chain(): simulation {} done ({})", chain.sim_name, status);
        } else if !chain.ok {
            error!("finish_chain(): framework components failed, no workflow is started");
        } else if self.run && !self.failed {
            self.start_workflows();
        }
    }

    /// Queues `init`, `step` and `finalize` of the entry components of every loaded workflow.
    fn start_workflows(&mut self) {
        let host: String = self.core.cm.platform().host();
        let user: String = match self.core.cm.platform().get("USER") {
            Some(user) => user.to_string(),
            None => String::new(),
        };
        let start_time: String = match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(elapsed) => format!("{:.3}", elapsed.as_secs_f64()),
            Err(_) => String::new(),
        };
        let resources: String = format!("Nodes = {}   PPN = {}", self.core.rm.num_nodes(), self.core.rm.ppn());

        let mut started: Vec<String> = Vec::new();
        for sim_name in self.core.cm.sim_names() {
            let entry_comps: Vec<ComponentId> = match self.core.cm.simulation(&sim_name) {
                Ok(sim) if sim.sub_workflow => continue,
                Ok(sim) => sim.entry_components(),
                Err(e) => {
                    warn!("start_workflows(): {:?}", e);
                    continue;
                },
            };
            let pending: VecDeque<(ComponentId, &'static str)> = entry_comps
                .iter()
                .flat_map(|id| WORKFLOW_METHODS.iter().map(move |method| (id.clone(), *method)))
                .collect();
            self.core.events.publish(
                MonitorEvent::new(&sim_name, "IPS_START", FRAMEWORK_CODE, "Starting IPS Simulation")
                    .with("host", &host)
                    .with("user", &user)
                    .with("startTime", &start_time),
            );
            self.core.send_event(&sim_name, "IPS_RESOURCE_ALLOC", &resources, true);
            self.chains.insert(
                sim_name.clone(),
                Chain {
                    sim_name: sim_name.clone(),
                    pending,
                    ok: true,
                    workflow: true,
                },
            );
            started.push(sim_name);
        }
        for sim_name in started {
            self.advance(&sim_name);
        }
    }

    /// Gives up on every chain after the result budget ran out.
    fn fail_all_chains(&mut self) {
        error!("fail_all_chains(): no method result within {:?}", self.result_timeout);
        self.failed = true;
        self.outstanding.clear();
        let keys: Vec<String> = self.chains.keys().cloned().collect();
        for key in keys.iter() {
            if let Some(chain) = self.chains.get_mut(key) {
                chain.ok = false;
                chain.pending.clear();
            }
        }
        for key in keys {
            self.finish_chain(&key);
        }
    }

    /// Sends `terminate(status)` to every remaining worker, then tears the simulations down.
    fn terminate_all_sims(&mut self, status: Status) {
        for sim_name in self.core.cm.sim_names() {
            for id in self.core.registry.component_ids(&sim_name) {
                self.core.send_terminate(&id, status);
            }
        }
        for id in self.core.cm.framework_components().to_vec() {
            self.core.send_terminate(&id, status);
        }
        thread::sleep(TERMINATE_GRACE);
        self.core.cm.terminate(&mut self.core.registry);
        while let Ok(event) = self.event_rx.try_recv() {
            self.core.events.publish(event);
        }
        self.blocked.clear();
        debug!("terminate_all_sims(): all simulations terminated ({})", status);
    }
}
