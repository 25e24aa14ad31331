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
    Component,
    ComponentFactory,
    Fail,
    Framework,
    FrameworkOptions,
    Services,
    Value,
    ValueMap,
};
use ::std::{
    path::PathBuf,
    thread,
    time::Duration,
};
use common::{
    component_yaml,
    drain,
    events_of,
    methods_of,
    options,
    platform_yaml,
    recording_factory,
    simulation_yaml,
    Observation,
    Scratch,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Component whose step outlasts any reasonable result budget.
struct Sleeper {
    nap: Duration,
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Component for Sleeper {
    fn step(&mut self, _services: &mut Services, _timestamp: f64) -> Result<Value, Fail> {
        thread::sleep(self.nap);
        Ok(Value::None)
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Writes a simulation whose INIT and DRIVER ports are implemented by `init_name` and `driver_name`.
fn entry_simulation(scratch: &Scratch, sim_name: &str, init_name: &str, driver_name: &str) -> Result<PathBuf> {
    let mut text: String = simulation_yaml(
        sim_name,
        &scratch.path().join(sim_name),
        &[("INIT", "INIT_COMP"), ("DRIVER", "DRIVER_COMP")],
    );
    text.push_str(&component_yaml("INIT_COMP", init_name, &[]));
    text.push_str(&component_yaml("DRIVER_COMP", driver_name, &[]));
    scratch.write(&format!("{}.yaml", sim_name), &text)
}

/// Components of `sim_name` in the order they were first invoked.
fn components_of(observations: &[Observation], sim_name: &str) -> Vec<String> {
    let mut components: Vec<String> = Vec::new();
    for observation in observations.iter().filter(|o| o.sim_name == sim_name) {
        if !components.contains(&observation.component) {
            components.push(observation.component.clone());
        }
    }
    components
}

fn lifecycle() -> Vec<String> {
    ["init", "step", "finalize", "terminate"].iter().map(|m| m.to_string()).collect()
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

/// Tests that two workflows each run init, step and finalize on their entry components and are then terminated.
#[test]
fn two_workflow_sweep() -> Result<()> {
    let scratch: Scratch = Scratch::new("sweep")?;
    let platform: PathBuf = scratch.write("platform.conf", &platform_yaml())?;
    let alpha: PathBuf = entry_simulation(&scratch, "alpha", "recorder", "recorder")?;
    let beta: PathBuf = entry_simulation(&scratch, "beta", "recorder", "recorder")?;
    let (tx, rx): (Sender<Observation>, Receiver<Observation>) = crossbeam_channel::unbounded();
    let sink: MemorySink = MemorySink::new();

    let mut framework: Framework = Framework::new(options(platform, vec![alpha, beta], recording_factory(tx), &sink))?;
    ipsframework::ensure_eq!(framework.run()?, true);

    let observations: Vec<Observation> = drain(&rx);
    let events: Vec<MonitorEvent> = sink.events();
    for sim_name in ["alpha", "beta"] {
        let components: Vec<String> = components_of(&observations, sim_name);
        ipsframework::ensure_eq!(components.len(), 2);
        for component in components.iter() {
            ipsframework::ensure_eq!(methods_of(&observations, component), lifecycle());
        }
        // INIT finalizes before DRIVER starts.
        let init_done: usize = match observations
            .iter()
            .position(|o| o.component == components[0] && o.method == "finalize")
        {
            Some(ix) => ix,
            None => anyhow::bail!("INIT of {} never finalized", sim_name),
        };
        let driver_start: usize = match observations
            .iter()
            .position(|o| o.component == components[1] && o.method == "init")
        {
            Some(ix) => ix,
            None => anyhow::bail!("DRIVER of {} never initialized", sim_name),
        };
        ipsframework::ensure_eq!(init_done < driver_start, true);

        let starts: Vec<&MonitorEvent> = events_of(&events, sim_name, "IPS_START");
        let ends: Vec<&MonitorEvent> = events_of(&events, sim_name, "IPS_END");
        ipsframework::ensure_eq!(starts.len(), 1);
        ipsframework::ensure_eq!(ends.len(), 1);
        ipsframework::ensure_eq!(ends[0].ok, true);
        ipsframework::ensure_eq!(ends[0].comment.as_str(), "Simulation Ended");
        ipsframework::ensure_eq!(starts[0].seqnum < ends[0].seqnum, true);
        ipsframework::ensure_eq!(starts[0].extra.get("host").map(String::as_str), Some("testhost"));
        ipsframework::ensure_eq!(events_of(&events, sim_name, "IPS_RESOURCE_ALLOC").len(), 1);
    }
    Ok(())
}

/// Tests that a failing step fails its own workflow only.
#[test]
fn failing_workflow_does_not_stop_others() -> Result<()> {
    let scratch: Scratch = Scratch::new("failing")?;
    let platform: PathBuf = scratch.write("platform.conf", &platform_yaml())?;
    let good: PathBuf = entry_simulation(&scratch, "good", "recorder", "recorder")?;
    let bad: PathBuf = entry_simulation(&scratch, "bad", "recorder", "failing_step")?;
    let (tx, rx): (Sender<Observation>, Receiver<Observation>) = crossbeam_channel::unbounded();
    let sink: MemorySink = MemorySink::new();

    let mut framework: Framework = Framework::new(options(platform, vec![good, bad], recording_factory(tx), &sink))?;
    ipsframework::ensure_eq!(framework.run()?, false);

    let observations: Vec<Observation> = drain(&rx);
    let events: Vec<MonitorEvent> = sink.events();

    let bad_components: Vec<String> = components_of(&observations, "bad");
    ipsframework::ensure_eq!(bad_components.len(), 2);
    ipsframework::ensure_eq!(methods_of(&observations, &bad_components[0]), lifecycle());
    ipsframework::ensure_eq!(
        methods_of(&observations, &bad_components[1]),
        vec!["init".to_string(), "step".to_string(), "terminate".to_string()]
    );
    let bad_end: Vec<&MonitorEvent> = events_of(&events, "bad", "IPS_END");
    ipsframework::ensure_eq!(bad_end.len(), 1);
    ipsframework::ensure_eq!(bad_end[0].ok, false);
    ipsframework::ensure_eq!(bad_end[0].comment.as_str(), "Simulation Execution Error");

    for component in components_of(&observations, "good").iter() {
        ipsframework::ensure_eq!(methods_of(&observations, component), lifecycle());
    }
    let good_end: Vec<&MonitorEvent> = events_of(&events, "good", "IPS_END");
    ipsframework::ensure_eq!(good_end.len(), 1);
    ipsframework::ensure_eq!(good_end[0].ok, true);
    Ok(())
}

/// Tests that setup alone lays out the runspace without starting any workflow.
#[test]
fn setup_without_run() -> Result<()> {
    let scratch: Scratch = Scratch::new("setup")?;
    let platform: PathBuf = scratch.write("platform.conf", &platform_yaml())?;
    let mut text: String = simulation_yaml(
        "layout",
        &scratch.path().join("layout"),
        &[("INIT", "INIT_COMP"), ("DRIVER", "DRIVER_COMP")],
    );
    text.push_str(&component_yaml("INIT_COMP", "recorder", &[]));
    text.push_str(&component_yaml("DRIVER_COMP", "recorder", &[("INPUT_FILES", "input.dat")]));
    let sim: PathBuf = scratch.write("layout.yaml", &text)?;
    scratch.write("input.dat", "1 2 3\n")?;
    let (tx, rx): (Sender<Observation>, Receiver<Observation>) = crossbeam_channel::unbounded();
    let sink: MemorySink = MemorySink::new();

    let mut setup: FrameworkOptions = options(platform, vec![sim], recording_factory(tx), &sink);
    setup.run = false;
    let mut framework: Framework = Framework::new(setup)?;
    ipsframework::ensure_eq!(framework.run()?, true);

    let sim_root: PathBuf = scratch.path().join("layout");
    ipsframework::ensure_eq!(sim_root.join("layout.yaml").is_file(), true);
    ipsframework::ensure_eq!(sim_root.join("platform.conf").is_file(), true);
    ipsframework::ensure_eq!(sim_root.join("simulation_setup").is_dir(), true);
    let work: Vec<PathBuf> = ::std::fs::read_dir(sim_root.join("work"))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .collect();
    ipsframework::ensure_eq!(work.len(), 2);
    ipsframework::ensure_eq!(work.iter().filter(|dir| dir.join("input.dat").is_file()).count(), 1);

    ipsframework::ensure_eq!(events_of(&sink.events(), "layout", "IPS_START").len(), 0);
    let observations: Vec<Observation> = drain(&rx);
    ipsframework::ensure_eq!(observations.iter().all(|o| o.method == "terminate"), true);
    Ok(())
}

/// Tests that the generic driver runs every other port through the time loop.
#[test]
fn generic_driver_time_loop() -> Result<()> {
    let scratch: Scratch = Scratch::new("driver")?;
    let platform: PathBuf = scratch.write("platform.conf", &platform_yaml())?;
    let mut text: String = simulation_yaml(
        "loop",
        &scratch.path().join("loop"),
        &[("DRIVER", "DRIVER_COMP"), ("WORKER", "WORKER_COMP")],
    );
    text.push_str("TIME_LOOP:\n  MODE: REGULAR\n  START: 0\n  FINISH: 2\n  NSTEP: 2\n");
    text.push_str(&component_yaml("DRIVER_COMP", "generic_driver", &[]));
    text.push_str(&component_yaml("WORKER_COMP", "recorder", &[]));
    let sim: PathBuf = scratch.write("loop.yaml", &text)?;
    let (tx, rx): (Sender<Observation>, Receiver<Observation>) = crossbeam_channel::unbounded();
    let sink: MemorySink = MemorySink::new();

    let mut framework: Framework = Framework::new(options(platform, vec![sim], recording_factory(tx), &sink))?;
    ipsframework::ensure_eq!(framework.run()?, true);

    let observations: Vec<Observation> = drain(&rx);
    let worker: Vec<(String, f64)> = observations
        .iter()
        .filter(|o| o.method != "terminate")
        .map(|o| (o.method.clone(), o.timestamp))
        .collect();
    ipsframework::ensure_eq!(
        worker,
        vec![
            ("init".to_string(), 0.0),
            ("step".to_string(), 0.0),
            ("step".to_string(), 1.0),
            ("step".to_string(), 2.0),
            ("finalize".to_string(), 2.0),
        ]
    );
    ipsframework::ensure_eq!(observations.last().map(|o| o.method.as_str()), Some("terminate"));
    Ok(())
}

/// Tests that a workflow without a DRIVER port is refused before anything runs.
#[test]
fn missing_driver_is_refused() -> Result<()> {
    let scratch: Scratch = Scratch::new("nodriver")?;
    let platform: PathBuf = scratch.write("platform.conf", &platform_yaml())?;
    let mut text: String = simulation_yaml("lonely", &scratch.path().join("lonely"), &[("INIT", "INIT_COMP")]);
    text.push_str(&component_yaml("INIT_COMP", "recorder", &[]));
    let sim: PathBuf = scratch.write("lonely.yaml", &text)?;
    let (tx, _rx): (Sender<Observation>, Receiver<Observation>) = crossbeam_channel::unbounded();
    let sink: MemorySink = MemorySink::new();

    if Framework::new(options(platform, vec![sim], recording_factory(tx), &sink)).is_ok() {
        anyhow::bail!("a workflow without DRIVER should be refused");
    }
    Ok(())
}

/// Tests that two workflows sharing a SIM_NAME are refused.
#[test]
fn duplicate_simulation_is_refused() -> Result<()> {
    let scratch: Scratch = Scratch::new("duplicate")?;
    let platform: PathBuf = scratch.write("platform.conf", &platform_yaml())?;
    let first: PathBuf = entry_simulation(&scratch, "twin", "recorder", "recorder")?;
    let mut text: String = simulation_yaml(
        "twin",
        &scratch.path().join("twin2"),
        &[("INIT", "INIT_COMP"), ("DRIVER", "DRIVER_COMP")],
    );
    text.push_str(&component_yaml("INIT_COMP", "recorder", &[]));
    text.push_str(&component_yaml("DRIVER_COMP", "recorder", &[]));
    let second: PathBuf = scratch.write("twin2.yaml", &text)?;
    let (tx, _rx): (Sender<Observation>, Receiver<Observation>) = crossbeam_channel::unbounded();
    let sink: MemorySink = MemorySink::new();

    if Framework::new(options(platform, vec![first, second], recording_factory(tx), &sink)).is_ok() {
        anyhow::bail!("duplicate SIM_NAME should be refused");
    }
    Ok(())
}

/// Tests that a step outlasting METHOD_RESULT_TIMEOUT fails the run instead of hanging it.
#[test]
fn method_result_timeout_fails_the_run() -> Result<()> {
    let scratch: Scratch = Scratch::new("timeout")?;
    let mut platform_text: String = platform_yaml();
    platform_text.push_str("METHOD_RESULT_TIMEOUT: 0.3\n");
    let platform: PathBuf = scratch.write("platform.conf", &platform_text)?;
    let sim: PathBuf = entry_simulation(&scratch, "slow", "recorder", "sleeper")?;
    let (tx, rx): (Sender<Observation>, Receiver<Observation>) = crossbeam_channel::unbounded();
    let mut factory: ComponentFactory = recording_factory(tx);
    factory.register("sleeper", |_config: &ValueMap| -> Result<Box<dyn Component>, Fail> {
        Ok(Box::new(Sleeper {
            nap: Duration::from_secs(2),
        }))
    });
    let sink: MemorySink = MemorySink::new();

    let mut framework: Framework = Framework::new(options(platform, vec![sim], factory, &sink))?;
    ipsframework::ensure_eq!(framework.run()?, false);

    let events: Vec<MonitorEvent> = sink.events();
    let ends: Vec<&MonitorEvent> = events_of(&events, "slow", "IPS_END");
    ipsframework::ensure_eq!(ends.len(), 1);
    ipsframework::ensure_eq!(ends[0].ok, false);
    ipsframework::ensure_eq!(ends[0].comment.as_str(), "Simulation Execution Error");

    // INIT ran to completion before the driver stalled.
    let observations: Vec<Observation> = drain(&rx);
    let init: Vec<String> = components_of(&observations, "slow");
    ipsframework::ensure_eq!(init.len(), 1);
    ipsframework::ensure_eq!(methods_of(&observations, &init[0]).starts_with(&lifecycle()[..3]), true);
    Ok(())
}
