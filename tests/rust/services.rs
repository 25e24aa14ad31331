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
    config::CreatedSimulation,
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
    collections::{
        BTreeMap,
        HashMap,
    },
    fs,
    path::PathBuf,
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

/// Driver that exercises the component services during its step and reports what it got back.
struct Exerciser {
    sub_file: PathBuf,
    reports: Sender<(String, String)>,
}

/// Worker that overwrites a shared parameter whenever it steps.
struct SharedWriter;

/// Driver that waits on a list of calls where one callee fails, then collects the others one by one.
struct CallGatherer {
    reports: Sender<(String, String)>,
}

/// Driver that sets a shared parameter, lets its worker overwrite it, then reads it back.
struct SharedReader {
    reports: Sender<(String, String)>,
}

/// Driver that loads a stand-alone simulation from a file, drives it, then retires it.
struct Spawner {
    sim_file: PathBuf,
    sim_root: PathBuf,
    reports: Sender<(String, String)>,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl Exerciser {
    fn report(&self, what: &str, value: String) {
        let _ = self.reports.send((what.to_string(), value));
    }

    fn use_config(&self, services: &mut Services) -> Result<(), Fail> {
        let host: Value = services.get_platform_parameter("HOST")?;
        self.report("host", host.to_string());
        let missing: Value = services.get_config_param("NOT_THERE", true)?;
        self.report("missing", matches!(missing, Value::None).to_string());
        services.set_config_param("EXTRA_VALUE", Value::from("42"), None)?;
        let value: Value = services.get_config_param("EXTRA_VALUE", false)?;
        self.report("extra_value", value.to_string());
        let names: Vec<String> = services.get_sim_names()?;
        self.report("sim_names", names.join(" "));
        Ok(())
    }

    fn use_tasks(&self, services: &mut Services) -> Result<(), Fail> {
        let workdir: PathBuf = services.get_working_dir();
        let task_id: TaskId = services.launch_task(1, &workdir, "/bin/false", &[], &LaunchOptions::default())?;
        let status: i64 = services.wait_task(task_id)?;
        self.report("false_status", status.to_string());

        services.create_task_pool("batch")?;
        for i in 0..3 {
            let name: String = format!("task_{}", i);
            services.add_task("batch", &name, 1, &workdir, "/bin/true", &[], LaunchOptions::default())?;
        }
        let submitted: usize = services.submit_tasks("batch", true)?;
        self.report("submitted", submitted.to_string());
        let mut finished: BTreeMap<String, i64> = BTreeMap::new();
        while finished.len() < submitted {
            finished.extend(services.get_finished_tasks("batch")?);
        }
        services.remove_task_pool("batch")?;
        let failures: usize = finished.values().filter(|status| **status != 0).count();
        self.report("pool", format!("{} {}", finished.len(), failures));
        Ok(())
    }

    fn use_calls(&self, services: &mut Services) -> Result<(), Fail> {
        let worker: ComponentId = services.get_port("WORKER")?;
        let call_id: CallId = services.call_nonblocking(&worker, "step", vec![Value::Float(7.0)])?;
        let result: Option<Value> = services.wait_call(call_id, true)?;
        self.report("call", format!("{:?}", result));
        Ok(())
    }

    fn use_sub_workflow(&self, services: &mut Services) -> Result<(), Fail> {
        let created: CreatedSimulation = services.create_sub_workflow("inner", &self.sub_file, &ValueMap::new())?;
        for method in ["init", "step", "finalize"] {
            services.call(&created.driver_comp, method, vec![Value::Float(0.0)])?;
        }
        services.terminate_sim(&created.sim_name)?;
        self.report("sub_workflow", created.sim_name);
        Ok(())
    }

    fn use_staging(&self, services: &mut Services, timestamp: f64) -> Result<(), Fail> {
        let workdir: PathBuf = services.get_working_dir();
        fs::write(workdir.join("out.txt"), "done\n")?;
        services.stage_output_files(timestamp, &["out.txt".to_string()], false, false)?;
        self.report("staged", String::from("true"));
        Ok(())
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Component for Exerciser {
    fn step(&mut self, services: &mut Services, timestamp: f64) -> Result<Value, Fail> {
        self.use_config(services)?;
        self.use_tasks(services)?;
        self.use_calls(services)?;
        self.use_sub_workflow(services)?;
        self.use_staging(services, timestamp)?;
        Ok(Value::None)
    }
}

impl CallGatherer {
    /// Waits on `first` and `second` together, then on each `good` call alone.
    fn gather(
        &self,
        services: &mut Services,
        round: &str,
        first: CallId,
        second: CallId,
        good: CallId,
    ) -> Result<(), Fail> {
        let listed: String = match services.wait_call_list(&[first, second], true) {
            Ok(results) => format!("{} results", results.len()),
            Err(_) => String::from("failed"),
        };
        let _ = self.reports.send((format!("{}_list", round), listed));
        let alone: Option<Value> = services.wait_call(good, true)?;
        let _ = self.reports.send((format!("{}_alone", round), format!("{:?}", alone)));
        Ok(())
    }
}

impl Component for CallGatherer {
    fn step(&mut self, services: &mut Services, _timestamp: f64) -> Result<Value, Fail> {
        let worker: ComponentId = services.get_port("WORKER")?;
        let failer: ComponentId = services.get_port("FAILER")?;

        let good: CallId = services.call_nonblocking(&worker, "step", vec![Value::Float(1.0)])?;
        let bad: CallId = services.call_nonblocking(&failer, "step", vec![Value::Float(1.0)])?;
        self.gather(services, "good_first", good, bad, good)?;

        let bad: CallId = services.call_nonblocking(&failer, "step", vec![Value::Float(2.0)])?;
        let good: CallId = services.call_nonblocking(&worker, "step", vec![Value::Float(2.0)])?;
        self.gather(services, "bad_first", bad, good, good)?;
        Ok(Value::None)
    }
}

impl Component for SharedWriter {
    fn step(&mut self, services: &mut Services, _timestamp: f64) -> Result<Value, Fail> {
        services.set_config_param("SHARED_KEY", Value::from("from_worker"), None)?;
        Ok(Value::None)
    }
}

impl Component for SharedReader {
    fn step(&mut self, services: &mut Services, _timestamp: f64) -> Result<Value, Fail> {
        services.set_config_param("SHARED_KEY", Value::from("from_driver"), None)?;
        let first: Value = services.get_config_param("SHARED_KEY", false)?;
        let _ = self.reports.send((String::from("first"), first.to_string()));

        let worker: ComponentId = services.get_port("WORKER")?;
        services.call(&worker, "step", vec![Value::Float(0.0)])?;
        let second: Value = services.get_config_param("SHARED_KEY", false)?;
        let _ = self.reports.send((String::from("second"), second.to_string()));

        let fixed: String = match services.set_config_param("SIM_NAME", Value::from("renamed"), None) {
            Ok(_) => String::from("accepted"),
            Err(e) => e.errno.to_string(),
        };
        let _ = self.reports.send((String::from("fixed"), fixed));
        let name: Value = services.get_config_param("SIM_NAME", false)?;
        let _ = self.reports.send((String::from("sim_name"), name.to_string()));
        Ok(Value::None)
    }
}

impl Component for Spawner {
    fn step(&mut self, services: &mut Services, _timestamp: f64) -> Result<Value, Fail> {
        let mut overrides: ValueMap = ValueMap::new();
        overrides.insert(String::from("SIM_NAME"), Value::from("spawned"));
        overrides.insert(
            String::from("SIM_ROOT"),
            Value::from(self.sim_root.to_string_lossy().into_owned()),
        );
        overrides.insert(
            String::from("LOG_FILE"),
            Value::from(self.sim_root.with_extension("log").to_string_lossy().into_owned()),
        );
        let created: CreatedSimulation = services.create_simulation(&self.sim_file, overrides)?;
        let _ = self.reports.send((String::from("created"), created.sim_name.clone()));
        let _ = self
            .reports
            .send((String::from("has_init"), created.init_comp.is_some().to_string()));
        let names: Vec<String> = services.get_sim_names()?;
        let _ = self.reports.send((String::from("while_running"), names.join(" ")));

        let mut entries: Vec<ComponentId> = created.init_comp.clone().into_iter().collect();
        entries.push(created.driver_comp.clone());
        for entry in entries.iter() {
            for method in ["init", "step", "finalize"] {
                services.call(entry, method, vec![Value::Float(0.0)])?;
            }
        }
        services.terminate_sim(&created.sim_name)?;
        let names: Vec<String> = services.get_sim_names()?;
        let _ = self.reports.send((String::from("after_terminate"), names.join(" ")));
        Ok(Value::None)
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

/// Tests configuration, task, call, sub-workflow and staging services as seen from a running component.
#[test]
fn services_from_a_component() -> Result<()> {
    let scratch: Scratch = Scratch::new("services")?;
    let platform: PathBuf = scratch.write("platform.conf", &platform_yaml())?;

    let mut sub: String = String::from("PORTS:\n  NAMES: DRIVER\n  DRIVER:\n    IMPLEMENTATION: SUB_DRIVER\n");
    sub.push_str(&component_yaml("SUB_DRIVER", "recorder", &[]));
    let sub_file: PathBuf = scratch.write("sub.yaml", &sub)?;

    let mut text: String = simulation_yaml(
        "svc",
        &scratch.path().join("svc"),
        &[("DRIVER", "USER_COMP"), ("WORKER", "WORKER_COMP")],
    );
    text.push_str(&component_yaml("USER_COMP", "exerciser", &[]));
    text.push_str(&component_yaml("WORKER_COMP", "recorder", &[]));
    let sim: PathBuf = scratch.write("svc.yaml", &text)?;

    let (tx, rx): (Sender<Observation>, Receiver<Observation>) = crossbeam_channel::unbounded();
    let (reports_tx, reports_rx): (Sender<(String, String)>, Receiver<(String, String)>) =
        crossbeam_channel::unbounded();
    let mut factory: ComponentFactory = recording_factory(tx);
    factory.register("exerciser", move |_config: &ValueMap| -> Result<Box<dyn Component>, Fail> {
        Ok(Box::new(Exerciser {
            sub_file: sub_file.clone(),
            reports: reports_tx.clone(),
        }))
    });
    let sink: MemorySink = MemorySink::new();

    let mut framework: Framework = Framework::new(options(platform, vec![sim], factory, &sink))?;
    ipsframework::ensure_eq!(framework.run()?, true);

    let reports: HashMap<String, String> = reports_rx.try_iter().collect();
    ipsframework::ensure_eq!(reports.get("host").map(String::as_str), Some("testhost"));
    ipsframework::ensure_eq!(reports.get("missing").map(String::as_str), Some("true"));
    ipsframework::ensure_eq!(reports.get("extra_value").map(String::as_str), Some("42"));
    ipsframework::ensure_eq!(reports.get("sim_names").map(String::as_str), Some("svc"));
    ipsframework::ensure_eq!(reports.get("false_status").map(String::as_str), Some("1"));
    ipsframework::ensure_eq!(reports.get("submitted").map(String::as_str), Some("3"));
    ipsframework::ensure_eq!(reports.get("pool").map(String::as_str), Some("3 0"));
    ipsframework::ensure_eq!(reports.get("call").map(String::as_str), Some("Some(None)"));
    ipsframework::ensure_eq!(reports.get("sub_workflow").map(String::as_str), Some("inner"));
    ipsframework::ensure_eq!(reports.get("staged").map(String::as_str), Some("true"));

    let observations: Vec<Observation> = drain(&rx);
    let worker_steps: Vec<f64> = observations
        .iter()
        .filter(|o| o.sim_name == "svc" && o.method == "step")
        .map(|o| o.timestamp)
        .collect();
    ipsframework::ensure_eq!(worker_steps, vec![7.0]);
    let inner: Vec<&Observation> = observations.iter().filter(|o| o.sim_name == "inner").collect();
    ipsframework::ensure_eq!(inner.is_empty(), false);
    ipsframework::ensure_eq!(
        methods_of(&observations, &inner[0].component),
        vec![
            "init".to_string(),
            "step".to_string(),
            "finalize".to_string(),
            "terminate".to_string()
        ]
    );

    let events: Vec<MonitorEvent> = sink.events();
    let staged: Vec<&MonitorEvent> = events_of(&events, "svc", "IPS_STAGE_OUTPUTS");
    ipsframework::ensure_eq!(staged.len(), 1);
    ipsframework::ensure_eq!(staged[0].ok, true);
    ipsframework::ensure_eq!(events_of(&events, "svc", "IPS_LAUNCH_TASK").len(), 1);
    ipsframework::ensure_eq!(events_of(&events, "svc", "IPS_LAUNCH_TASK_POOL").len(), 3);
    ipsframework::ensure_eq!(events_of(&events, "svc", "IPS_CREATE_SUB_WORKFLOW").len(), 1);
    Ok(())
}

/// Tests that a parameter set by one worker is what its sibling reads next, and that file parameters stay fixed.
#[test]
fn config_param_shared_between_workers() -> Result<()> {
    let scratch: Scratch = Scratch::new("shared")?;
    let platform: PathBuf = scratch.write("platform.conf", &platform_yaml())?;
    let mut text: String = simulation_yaml(
        "shared",
        &scratch.path().join("shared"),
        &[("DRIVER", "READER_COMP"), ("WORKER", "WRITER_COMP")],
    );
    text.push_str(&component_yaml("READER_COMP", "shared_reader", &[]));
    text.push_str(&component_yaml("WRITER_COMP", "shared_writer", &[]));
    let sim: PathBuf = scratch.write("shared.yaml", &text)?;

    let (tx, _rx): (Sender<Observation>, Receiver<Observation>) = crossbeam_channel::unbounded();
    let (reports_tx, reports_rx): (Sender<(String, String)>, Receiver<(String, String)>) =
        crossbeam_channel::unbounded();
    let mut factory: ComponentFactory = recording_factory(tx);
    factory.register("shared_reader", move |_config: &ValueMap| -> Result<Box<dyn Component>, Fail> {
        Ok(Box::new(SharedReader {
            reports: reports_tx.clone(),
        }))
    });
    factory.register("shared_writer", |_config: &ValueMap| -> Result<Box<dyn Component>, Fail> {
        Ok(Box::new(SharedWriter))
    });
    let sink: MemorySink = MemorySink::new();

    let mut framework: Framework = Framework::new(options(platform, vec![sim], factory, &sink))?;
    ipsframework::ensure_eq!(framework.run()?, true);

    let reports: HashMap<String, String> = reports_rx.try_iter().collect();
    ipsframework::ensure_eq!(reports.get("first").map(String::as_str), Some("from_driver"));
    ipsframework::ensure_eq!(reports.get("second").map(String::as_str), Some("from_worker"));
    let eperm: String = libc::EPERM.to_string();
    ipsframework::ensure_eq!(reports.get("fixed"), Some(&eperm));
    ipsframework::ensure_eq!(reports.get("sim_name").map(String::as_str), Some("shared"));
    Ok(())
}

/// Tests that a failing call in a waited list neither loses nor strands the results of the other calls.
#[test]
fn wait_call_list_keeps_other_results() -> Result<()> {
    let scratch: Scratch = Scratch::new("gather")?;
    let platform: PathBuf = scratch.write("platform.conf", &platform_yaml())?;
    let mut text: String = simulation_yaml(
        "gather",
        &scratch.path().join("gather"),
        &[("DRIVER", "GATHER_COMP"), ("WORKER", "WORKER_COMP"), ("FAILER", "FAILER_COMP")],
    );
    text.push_str(&component_yaml("GATHER_COMP", "call_gatherer", &[]));
    text.push_str(&component_yaml("WORKER_COMP", "recorder", &[]));
    text.push_str(&component_yaml("FAILER_COMP", "failing_step", &[]));
    let sim: PathBuf = scratch.write("gather.yaml", &text)?;

    let (tx, rx): (Sender<Observation>, Receiver<Observation>) = crossbeam_channel::unbounded();
    let (reports_tx, reports_rx): (Sender<(String, String)>, Receiver<(String, String)>) =
        crossbeam_channel::unbounded();
    let mut factory: ComponentFactory = recording_factory(tx);
    factory.register("call_gatherer", move |_config: &ValueMap| -> Result<Box<dyn Component>, Fail> {
        Ok(Box::new(CallGatherer {
            reports: reports_tx.clone(),
        }))
    });
    let sink: MemorySink = MemorySink::new();

    let mut framework: Framework = Framework::new(options(platform, vec![sim], factory, &sink))?;
    ipsframework::ensure_eq!(framework.run()?, true);

    let reports: HashMap<String, String> = reports_rx.try_iter().collect();
    for round in ["good_first", "bad_first"] {
        let listed: Option<&str> = reports.get(&format!("{}_list", round)).map(String::as_str);
        let alone: Option<&str> = reports.get(&format!("{}_alone", round)).map(String::as_str);
        ipsframework::ensure_eq!(listed, Some("failed"));
        ipsframework::ensure_eq!(alone, Some("Some(None)"));
    }

    let observations: Vec<Observation> = drain(&rx);
    let steps: usize = observations.iter().filter(|o| o.method == "step").count();
    ipsframework::ensure_eq!(steps, 4);
    Ok(())
}

/// Tests that a component can load a stand-alone simulation with overrides, drive both its entry ports and retire it.
#[test]
fn create_simulation_from_a_component() -> Result<()> {
    let scratch: Scratch = Scratch::new("spawn")?;
    let platform: PathBuf = scratch.write("platform.conf", &platform_yaml())?;

    let mut template: String = simulation_yaml(
        "template",
        &scratch.path().join("template"),
        &[("INIT", "SPAWNED_INIT"), ("DRIVER", "SPAWNED_DRIVER")],
    );
    template.push_str(&component_yaml("SPAWNED_INIT", "recorder", &[]));
    template.push_str(&component_yaml("SPAWNED_DRIVER", "recorder", &[]));
    let sim_file: PathBuf = scratch.write("template.yaml", &template)?;

    let mut text: String = simulation_yaml("parent", &scratch.path().join("parent"), &[("DRIVER", "SPAWNER_COMP")]);
    text.push_str(&component_yaml("SPAWNER_COMP", "spawner", &[]));
    let sim: PathBuf = scratch.write("parent.yaml", &text)?;

    let (tx, rx): (Sender<Observation>, Receiver<Observation>) = crossbeam_channel::unbounded();
    let (reports_tx, reports_rx): (Sender<(String, String)>, Receiver<(String, String)>) =
        crossbeam_channel::unbounded();
    let mut factory: ComponentFactory = recording_factory(tx);
    let sim_root: PathBuf = scratch.path().join("spawned");
    factory.register("spawner", move |_config: &ValueMap| -> Result<Box<dyn Component>, Fail> {
        Ok(Box::new(Spawner {
            sim_file: sim_file.clone(),
            sim_root: sim_root.clone(),
            reports: reports_tx.clone(),
        }))
    });
    let sink: MemorySink = MemorySink::new();

    let mut framework: Framework = Framework::new(options(platform, vec![sim], factory, &sink))?;
    ipsframework::ensure_eq!(framework.run()?, true);

    let reports: HashMap<String, String> = reports_rx.try_iter().collect();
    ipsframework::ensure_eq!(reports.get("created").map(String::as_str), Some("spawned"));
    ipsframework::ensure_eq!(reports.get("has_init").map(String::as_str), Some("true"));
    ipsframework::ensure_eq!(reports.get("while_running").map(String::as_str), Some("parent spawned"));
    ipsframework::ensure_eq!(reports.get("after_terminate").map(String::as_str), Some("parent"));
    ipsframework::ensure_eq!(scratch.path().join("spawned").is_dir(), true);

    let observations: Vec<Observation> = drain(&rx);
    let spawned: Vec<&Observation> = observations.iter().filter(|o| o.sim_name == "spawned").collect();
    let mut components: Vec<String> = Vec::new();
    for observation in spawned.iter() {
        if !components.contains(&observation.component) {
            components.push(observation.component.clone());
        }
    }
    ipsframework::ensure_eq!(components.len(), 2);
    for component in components.iter() {
        ipsframework::ensure_eq!(
            methods_of(&observations, component),
            vec![
                "init".to_string(),
                "step".to_string(),
                "finalize".to_string(),
                "terminate".to_string()
            ]
        );
    }
    Ok(())
}
