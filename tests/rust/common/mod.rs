// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

#![allow(dead_code)]

//======================================================================================================================
// Imports
//======================================================================================================================

use ::anyhow::Result;
use ::crossbeam_channel::{
    Receiver,
    Sender,
};
use ::ipsframework::{
    events::{
        MemorySink,
        MonitorEvent,
    },
    runtime::message::Status,
    Component,
    ComponentFactory,
    Fail,
    FrameworkOptions,
    Services,
    Value,
    ValueMap,
};
use ::std::{
    fs,
    path::{
        Path,
        PathBuf,
    },
};
use ::tempfile::TempDir;

//======================================================================================================================
// Constants
//======================================================================================================================

/// Nodes of the synthetic allocation used by framework tests.
pub const NODES: usize = 2;

/// Cores per node of the synthetic allocation used by framework tests.
pub const PPN: usize = 4;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Directory removed when the test is over.
pub struct Scratch {
    dir: TempDir,
}

/// Something a recording component saw.
#[derive(Clone, Debug, PartialEq)]
pub struct Observation {
    pub sim_name: String,
    pub component: String,
    pub method: String,
    pub timestamp: f64,
}

/// Component that reports every invocation it receives.
pub struct Recorder {
    tx: Sender<Observation>,
    fail_on: Option<String>,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl Scratch {
    pub fn new(name: &str) -> Result<Self> {
        let dir: TempDir = tempfile::Builder::new().prefix(&format!("ips-{}-", name)).tempdir()?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Writes `text` to `name` under the scratch directory.
    pub fn write(&self, name: &str, text: &str) -> Result<PathBuf> {
        let path: PathBuf = self.dir.path().join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, text)?;
        Ok(path)
    }
}

impl Recorder {
    pub fn new(tx: Sender<Observation>, fail_on: Option<&str>) -> Self {
        Self {
            tx,
            fail_on: fail_on.map(str::to_string),
        }
    }

    fn observe(&self, services: &Services, method: &str, timestamp: f64) -> Result<Value, Fail> {
        let observation: Observation = Observation {
            sim_name: services.sim_name().to_string(),
            component: services.component_id().to_string(),
            method: method.to_string(),
            timestamp,
        };
        let _ = self.tx.send(observation);
        match &self.fail_on {
            Some(failing) if failing == method => Err(Fail::new(libc::EIO, &format!("{} failed on purpose", method))),
            _ => Ok(Value::None),
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Component for Recorder {
    fn init(&mut self, services: &mut Services, timestamp: f64) -> Result<Value, Fail> {
        self.observe(services, "init", timestamp)
    }

    fn step(&mut self, services: &mut Services, timestamp: f64) -> Result<Value, Fail> {
        self.observe(services, "step", timestamp)
    }

    fn finalize(&mut self, services: &mut Services, timestamp: f64) -> Result<Value, Fail> {
        self.observe(services, "finalize", timestamp)
    }

    fn checkpoint(&mut self, services: &mut Services, timestamp: f64) -> Result<Value, Fail> {
        self.observe(services, "checkpoint", timestamp)
    }

    fn terminate(&mut self, services: &mut Services, _status: Status) -> Result<(), Fail> {
        self.observe(services, "terminate", 0.0).map(|_| ())
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Platform file for a single host launching tasks directly.
pub fn platform_yaml() -> String {
    String::from(
        "HOST: testhost\nUSER: tester\nMPIRUN: eval\nNODE_DETECTION: manual\nCORES_PER_NODE: 4\nSOCKETS_PER_NODE: \
         1\nNODE_ALLOCATION_MODE: SHARED\nPROCS_PER_NODE: 4\nNODES: 2\n",
    )
}

/// Component section named `section` built by the implementation registered as `name`.
pub fn component_yaml(section: &str, name: &str, extra: &[(&str, &str)]) -> String {
    let sub_class: String = section.to_lowercase();
    let mut entries: Vec<(&str, &str)> = vec![
        ("CLASS", "test"),
        ("SUB_CLASS", sub_class.as_str()),
        ("NAME", name),
        ("SCRIPT", "''"),
        ("INPUT_FILES", "''"),
        ("OUTPUT_FILES", "''"),
        ("NPROC", "1"),
    ];
    for (key, value) in extra {
        match entries.iter_mut().find(|entry| entry.0 == *key) {
            Some(entry) => entry.1 = *value,
            None => entries.push((*key, *value)),
        }
    }
    let mut text: String = format!("{}:\n", section);
    for (key, value) in entries {
        text.push_str(&format!("  {}: {}\n", key, value));
    }
    text
}

/// Simulation file header with its ports, each given as `(port, section)`.
pub fn simulation_yaml(sim_name: &str, sim_root: &Path, ports: &[(&str, &str)]) -> String {
    let names: Vec<&str> = ports.iter().map(|(port, _)| *port).collect();
    let mut text: String = format!(
        "SIM_NAME: {}\nSIM_ROOT: {}\nLOG_FILE: {}\nPORTS:\n  NAMES: {}\n",
        sim_name,
        sim_root.display(),
        sim_root.with_extension("log").display(),
        names.join(" ")
    );
    for (port, section) in ports {
        text.push_str(&format!("  {}:\n    IMPLEMENTATION: {}\n", port, section));
    }
    text
}

/// Factory with the built-in components plus `recorder` and `failing_step`.
pub fn recording_factory(tx: Sender<Observation>) -> ComponentFactory {
    let mut factory: ComponentFactory = ComponentFactory::with_builtins();
    let recorder_tx: Sender<Observation> = tx.clone();
    factory.register("recorder", move |_config: &ValueMap| -> Result<Box<dyn Component>, Fail> {
        Ok(Box::new(Recorder::new(recorder_tx.clone(), None)))
    });
    factory.register("failing_step", move |_config: &ValueMap| -> Result<Box<dyn Component>, Fail> {
        Ok(Box::new(Recorder::new(tx.clone(), Some("step"))))
    });
    factory
}

/// Options for a hermetic run over a synthetic allocation, publishing events to `sink`.
pub fn options(
    platform_file: PathBuf,
    sim_files: Vec<PathBuf>,
    factory: ComponentFactory,
    sink: &MemorySink,
) -> FrameworkOptions {
    let mut options: FrameworkOptions = FrameworkOptions::new(platform_file, sim_files);
    options.nodes = Some(NODES);
    options.ppn = Some(PPN);
    options.factory = factory;
    options.sink = Some(Box::new(sink.clone()));
    options.env = ValueMap::new();
    options
}

/// Everything recorded so far.
pub fn drain(rx: &Receiver<Observation>) -> Vec<Observation> {
    rx.try_iter().collect()
}

/// Methods seen by `component`, in order.
pub fn methods_of(observations: &[Observation], component: &str) -> Vec<String> {
    observations
        .iter()
        .filter(|o| o.component == component)
        .map(|o| o.method.clone())
        .collect()
}

/// Events of type `eventtype` published for `sim_name`.
pub fn events_of<'a>(events: &'a [MonitorEvent], sim_name: &str, eventtype: &str) -> Vec<&'a MonitorEvent> {
    events
        .iter()
        .filter(|e| e.sim_name == sim_name && e.eventtype == eventtype)
        .collect()
}
