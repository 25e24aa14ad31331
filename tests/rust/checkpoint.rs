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
    services::checkpoint::restart_dirs,
    Framework,
};
use ::std::{
    fs,
    path::{
        Path,
        PathBuf,
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
};

//======================================================================================================================
// Constants
//======================================================================================================================

const TIME_LOOP: &str = "TIME_LOOP:\n  MODE: EXPLICIT\n  VALUES: 1 2 3 4 5\n";

const CHECKPOINT: &str = "CHECKPOINT:\n  MODE: ALL\n  NUM_CHECKPOINT: 2\n  PROTECT_FREQUENCY: 3\n";

/// Restart directory of the runner component under a simulation root.
const RUNNER_TAG: &str = "test_worker_comp_task_runner";

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Simulation driving a task runner over five time steps, with `extra` appended to the top level.
fn runner_simulation(scratch: &Scratch, sim_name: &str, extra: &str, input_files: &str) -> Result<PathBuf> {
    let mut text: String = simulation_yaml(
        sim_name,
        &scratch.path().join(sim_name),
        &[("DRIVER", "DRIVER_COMP"), ("WORKER", "WORKER_COMP")],
    );
    text.push_str(TIME_LOOP);
    text.push_str(extra);
    text.push_str(&component_yaml("DRIVER_COMP", "generic_driver", &[]));
    text.push_str(&component_yaml(
        "WORKER_COMP",
        "task_runner",
        &[
            ("BINARY", "/bin/true"),
            ("INPUT_FILES", input_files),
            ("RESTART_FILES", "state.dat"),
        ],
    ));
    scratch.write(&format!("{}.yaml", sim_name), &text)
}

fn run(scratch: &Scratch, sim: PathBuf, sink: &MemorySink) -> Result<bool> {
    let platform: PathBuf = scratch.write("platform.conf", &platform_yaml())?;
    let (tx, _rx): (Sender<Observation>, Receiver<Observation>) = crossbeam_channel::unbounded();
    let mut framework: Framework = Framework::new(options(platform, vec![sim], recording_factory(tx), sink))?;
    Ok(framework.run()?)
}

/// The only working directory of a component under `sim_root` whose name starts with `prefix`.
fn workdir(sim_root: &Path, prefix: &str) -> Result<PathBuf> {
    for entry in fs::read_dir(sim_root.join("work"))? {
        let path: PathBuf = entry?.path();
        let matches: bool = path
            .file_name()
            .map(|name| name.to_string_lossy().starts_with(prefix))
            .unwrap_or(false);
        if matches {
            return Ok(path);
        }
    }
    anyhow::bail!("no working directory {} under {:?}", prefix, sim_root)
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

/// Tests that five checkpoints with two kept and every third protected leave tags 3, 4 and 5 on disk.
#[test]
fn checkpoint_retention() -> Result<()> {
    let scratch: Scratch = Scratch::new("retention")?;
    scratch.write("state.dat", "state at start\n")?;
    let sim: PathBuf = runner_simulation(&scratch, "ckpt", CHECKPOINT, "state.dat")?;
    let sink: MemorySink = MemorySink::new();

    ipsframework::ensure_eq!(run(&scratch, sim, &sink)?, true);

    let restart: PathBuf = scratch.path().join("ckpt").join("restart");
    ipsframework::ensure_eq!(
        restart_dirs(&restart)?,
        vec!["3.000".to_string(), "4.000".to_string(), "5.000".to_string()]
    );
    for tag in ["3.000", "4.000", "5.000"] {
        ipsframework::ensure_eq!(restart.join(tag).join(RUNNER_TAG).join("state.dat").is_file(), true);
    }

    let events: Vec<MonitorEvent> = sink.events();
    ipsframework::ensure_eq!(events_of(&events, "ckpt", "IPS_CHECKPOINT_START").len(), 5);
    ipsframework::ensure_eq!(events_of(&events, "ckpt", "IPS_CHECKPOINT_END").len(), 5);
    ipsframework::ensure_eq!(events_of(&events, "ckpt", "IPS_LAUNCH_TASK").len(), 5);
    Ok(())
}

/// Tests that a restarted simulation picks up the latest checkpoint of an earlier run.
#[test]
fn restart_from_latest_checkpoint() -> Result<()> {
    let scratch: Scratch = Scratch::new("restart")?;
    scratch.write("state.dat", "state at start\n")?;
    let first: PathBuf = runner_simulation(&scratch, "origin", CHECKPOINT, "state.dat")?;
    let sink: MemorySink = MemorySink::new();
    ipsframework::ensure_eq!(run(&scratch, first, &sink)?, true);

    let origin_root: PathBuf = scratch.path().join("origin");
    let restart: String = format!(
        "SIMULATION_MODE: RESTART\nRESTART_TIME: LATEST\nRESTART_ROOT: {}\n",
        origin_root.display()
    );
    let second: PathBuf = runner_simulation(&scratch, "resumed", &restart, "''")?;
    let sink: MemorySink = MemorySink::new();
    ipsframework::ensure_eq!(run(&scratch, second, &sink)?, true);

    let resumed_work: PathBuf = workdir(&scratch.path().join("resumed"), RUNNER_TAG)?;
    ipsframework::ensure_eq!(fs::read_to_string(resumed_work.join("state.dat"))?, "state at start\n");

    // Every time is at or before the restart time, so nothing runs.
    let events: Vec<MonitorEvent> = sink.events();
    ipsframework::ensure_eq!(events_of(&events, "resumed", "IPS_GET_RESTART").len(), 1);
    ipsframework::ensure_eq!(events_of(&events, "resumed", "IPS_LAUNCH_TASK").len(), 0);
    Ok(())
}
