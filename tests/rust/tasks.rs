// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

mod common;

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
    runtime::message::{
        CallId,
        TaskId,
    },
    services::LaunchOptions,
    Component,
    ComponentFactory,
    ComponentId,
    Fail,
    Framework,
    Services,
    Value,
    ValueMap,
};
use ::std::{
    collections::HashMap,
    path::PathBuf,
    time::{
        Duration,
        Instant,
    },
};
use common::{
    component_yaml,
    events_of,
    options,
    platform_yaml,
    recording_factory,
    simulation_yaml,
    Observation,
    Scratch,
    NODES,
    PPN,
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Every core of the synthetic allocation.
const ALL_CORES: usize = NODES * PPN;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Driver that holds every core with one task while its worker asks for more.
struct Holder {
    reports: Sender<(String, String)>,
}

/// Worker that launches a one-process task and waits for it, however long the launch takes.
struct Queued {
    reports: Sender<(String, String)>,
}

/// Driver that fills the machine with a task, kills it, then fills the machine again.
struct Killer {
    reports: Sender<(String, String)>,
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Component for Holder {
    fn step(&mut self, services: &mut Services, _timestamp: f64) -> Result<Value, Fail> {
        let workdir: PathBuf = services.get_working_dir();
        let held: TaskId = services.launch_task(
            ALL_CORES,
            &workdir,
            "sleep",
            &["1".to_string()],
            &LaunchOptions::default(),
        )?;

        let no_wait: LaunchOptions = LaunchOptions {
            block: false,
            ..LaunchOptions::default()
        };
        let refused: String = match services.launch_task(1, &workdir, "true", &[], &no_wait) {
            Ok(task_id) => format!("launched {}", task_id),
            Err(_) => String::from("refused"),
        };
        let _ = self.reports.send((String::from("no_wait"), refused));

        let worker: ComponentId = services.get_port("WORKER")?;
        let call_id: CallId = services.call_nonblocking(&worker, "step", vec![Value::Float(0.0)])?;
        let status: i64 = services.wait_task(held)?;
        let _ = self.reports.send((String::from("held"), status.to_string()));
        let result: Option<Value> = services.wait_call(call_id, true)?;
        let _ = self.reports.send((String::from("worker"), format!("{:?}", result)));
        Ok(Value::None)
    }
}

impl Component for Queued {
    fn step(&mut self, services: &mut Services, _timestamp: f64) -> Result<Value, Fail> {
        let workdir: PathBuf = services.get_working_dir();
        let start: Instant = Instant::now();
        let task_id: TaskId = services.launch_task(1, &workdir, "true", &[], &LaunchOptions::default())?;
        let waited: Duration = start.elapsed();
        let status: i64 = services.wait_task(task_id)?;
        let _ = self.reports.send((String::from("queued"), status.to_string()));
        let _ = self
            .reports
            .send((String::from("waited"), (waited >= Duration::from_millis(500)).to_string()));
        Ok(Value::None)
    }
}

impl Component for Killer {
    fn step(&mut self, services: &mut Services, _timestamp: f64) -> Result<Value, Fail> {
        let workdir: PathBuf = services.get_working_dir();
        let no_wait: LaunchOptions = LaunchOptions {
            block: false,
            ..LaunchOptions::default()
        };
        let hog: TaskId = services.launch_task(ALL_CORES, &workdir, "sleep", &["30".to_string()], &no_wait)?;
        services.kill_task(hog)?;
        let killed_again: String = match services.kill_task(hog) {
            Ok(()) => String::from("killed"),
            Err(e) => e.errno.to_string(),
        };
        let _ = self.reports.send((String::from("killed_again"), killed_again));

        let refill: TaskId = services.launch_task(ALL_CORES, &workdir, "true", &[], &no_wait)?;
        let status: i64 = services.wait_task(refill)?;
        let _ = self.reports.send((String::from("refill"), status.to_string()));
        Ok(Value::None)
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Runs a single workflow whose DRIVER and WORKER are built by `driver` and `worker`, returning the run outcome
/// and the published events.
fn run_pair(
    scratch: &Scratch,
    sim_name: &str,
    driver: &str,
    worker: &str,
    factory: ComponentFactory,
) -> Result<(bool, Vec<MonitorEvent>)> {
    let platform: PathBuf = scratch.write("platform.conf", &platform_yaml())?;
    let mut text: String = simulation_yaml(
        sim_name,
        &scratch.path().join(sim_name),
        &[("DRIVER", "DRIVER_COMP"), ("WORKER", "WORKER_COMP")],
    );
    text.push_str(&component_yaml("DRIVER_COMP", driver, &[]));
    text.push_str(&component_yaml("WORKER_COMP", worker, &[]));
    let sim: PathBuf = scratch.write(&format!("{}.yaml", sim_name), &text)?;
    let sink: MemorySink = MemorySink::new();

    let mut framework: Framework = Framework::new(options(platform, vec![sim], factory, &sink))?;
    let ok: bool = framework.run()?;
    Ok((ok, sink.events()))
}

/// Factory with the recording components plus `holder`, `queued` and `killer`, all reporting to `reports`.
fn task_factory(reports: Sender<(String, String)>) -> ComponentFactory {
    let (tx, _rx): (Sender<Observation>, Receiver<Observation>) = crossbeam_channel::unbounded();
    let mut factory: ComponentFactory = recording_factory(tx);
    let holder_reports: Sender<(String, String)> = reports.clone();
    factory.register("holder", move |_config: &ValueMap| -> Result<Box<dyn Component>, Fail> {
        Ok(Box::new(Holder {
            reports: holder_reports.clone(),
        }))
    });
    let queued_reports: Sender<(String, String)> = reports.clone();
    factory.register("queued", move |_config: &ValueMap| -> Result<Box<dyn Component>, Fail> {
        Ok(Box::new(Queued {
            reports: queued_reports.clone(),
        }))
    });
    factory.register("killer", move |_config: &ValueMap| -> Result<Box<dyn Component>, Fail> {
        Ok(Box::new(Killer {
            reports: reports.clone(),
        }))
    });
    factory
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

/// Tests that a blocking launch waits in the framework until another task hands its cores back.
#[test]
fn blocked_launch_is_retried() -> Result<()> {
    let scratch: Scratch = Scratch::new("blocked")?;
    let (reports_tx, reports_rx): (Sender<(String, String)>, Receiver<(String, String)>) =
        crossbeam_channel::unbounded();

    let (ok, events): (bool, Vec<MonitorEvent>) =
        run_pair(&scratch, "blocked", "holder", "queued", task_factory(reports_tx))?;
    ipsframework::ensure_eq!(ok, true);

    let reports: HashMap<String, String> = reports_rx.try_iter().collect();
    ipsframework::ensure_eq!(reports.get("no_wait").map(String::as_str), Some("refused"));
    ipsframework::ensure_eq!(reports.get("held").map(String::as_str), Some("0"));
    ipsframework::ensure_eq!(reports.get("queued").map(String::as_str), Some("0"));
    ipsframework::ensure_eq!(reports.get("waited").map(String::as_str), Some("true"));
    ipsframework::ensure_eq!(reports.get("worker").map(String::as_str), Some("Some(None)"));
    ipsframework::ensure_eq!(events_of(&events, "blocked", "IPS_LAUNCH_TASK").len(), 2);
    Ok(())
}

/// Tests that killing a task hands its cores back at once and that a killed task cannot be killed twice.
#[test]
fn kill_task_releases_cores() -> Result<()> {
    let scratch: Scratch = Scratch::new("kill")?;
    let (reports_tx, reports_rx): (Sender<(String, String)>, Receiver<(String, String)>) =
        crossbeam_channel::unbounded();

    let (ok, events): (bool, Vec<MonitorEvent>) =
        run_pair(&scratch, "kill", "killer", "recorder", task_factory(reports_tx))?;
    ipsframework::ensure_eq!(ok, true);

    let reports: HashMap<String, String> = reports_rx.try_iter().collect();
    let ebadf: String = libc::EBADF.to_string();
    ipsframework::ensure_eq!(reports.get("killed_again"), Some(&ebadf));
    ipsframework::ensure_eq!(reports.get("refill").map(String::as_str), Some("0"));
    ipsframework::ensure_eq!(events_of(&events, "kill", "IPS_LAUNCH_TASK").len(), 2);
    Ok(())
}
