// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    component::{
        Component,
        ComponentId,
    },
    config::simulation::absolute,
    runtime::{
        fail::Fail,
        value::{
            Value,
            ValueMap,
        },
    },
    services::{
        staging::copy_files,
        Services,
    },
};
use ::std::{
    fs,
    path::{
        Path,
        PathBuf,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Framework component laying out the simulation directories.
///
/// `init` creates the simulation root and keeps a copy of the configuration files in it. `step` creates the working
/// directory of every component and stages its input files there.
pub struct RunspaceInit {
    create_runspace: bool,
    run_setup: bool,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl RunspaceInit {
    pub fn new(config: &ValueMap) -> Result<Self, Fail> {
        Ok(Self {
            create_runspace: flag(config, "CREATE_RUNSPACE")?,
            run_setup: flag(config, "RUN_SETUP")?,
        })
    }

    /// Working directory and inputs of one component.
    fn setup_component(
        services: &Services,
        id: &ComponentId,
        config: &ValueMap,
        sim_root: &Path,
    ) -> Result<(), Fail> {
        let mut tag: Vec<String> = Vec::with_capacity(4);
        for key in ["CLASS", "SUB_CLASS", "NAME"] {
            tag.push(required(config, key)?.to_string());
        }
        tag.push(id.seq_num().to_string());
        let workdir: PathBuf = sim_root.join("work").join(tag.join("_"));
        fs::create_dir_all(&workdir)?;

        let input_dir: PathBuf = absolute(Path::new(&required(config, "INPUT_DIR")?.to_string()));
        let input_files: Vec<String> = match config.get("INPUT_FILES") {
            Some(files) => files.to_string_list()?,
            None => Vec::new(),
        };
        copy_files(&input_dir, &input_files, &workdir, "", false)?;

        if let Some(data_files) = config.get("DATA_FILES") {
            let data_files: Vec<String> = data_files.to_string_list()?;
            let data_dir: PathBuf = match (config.get("DATA_TREE_ROOT"), data_files.first()) {
                (Some(root), Some(first)) if absolute(Path::new(&root.to_string())).join(first).exists() => {
                    absolute(Path::new(&root.to_string()))
                },
                _ => input_dir.clone(),
            };
            copy_files(&data_dir, &data_files, &workdir, "", false)?;
        }

        let script: String = config.get("SCRIPT").map(Value::to_string).unwrap_or_default();
        let script: &Path = Path::new(script.trim());
        if !script.as_os_str().is_empty() {
            let script_dir: PathBuf = match (script.is_absolute(), config.get("BIN_DIR")) {
                (true, _) => script.parent().map(Path::to_path_buf).unwrap_or_default(),
                (false, Some(bin_dir)) => PathBuf::from(bin_dir.to_string()),
                (false, None) => input_dir,
            };
            match script.file_name() {
                Some(name) if script_dir.join(name).is_file() => {
                    let name: String = name.to_string_lossy().into_owned();
                    copy_files(&script_dir, &[name], &sim_root.join("simulation_setup"), "", false)?;
                },
                _ => services.debug(&format!("script {} of {} not found", script.display(), id)),
            }
        }
        Ok(())
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Component for RunspaceInit {
    fn init(&mut self, services: &mut Services, _timestamp: f64) -> Result<Value, Fail> {
        if !self.create_runspace {
            return Ok(Value::None);
        }
        let sim_root: PathBuf = services.sim_root().to_path_buf();
        fs::create_dir_all(&sim_root)?;

        let config_files: Vec<String> = match services.config().get("CONFIG_FILES") {
            Some(files) => files.to_string_list()?,
            None => Vec::new(),
        };
        let platform_file: String = services.config().get("PLATFORM_FILE").map(Value::to_string).unwrap_or_default();
        for file in config_files.iter().chain(Some(&platform_file).filter(|f| !f.is_empty())) {
            let path: &Path = Path::new(file);
            if let (Some(dir), Some(name)) = (path.parent(), path.file_name()) {
                copy_files(dir, &[name.to_string_lossy().into_owned()], &sim_root, "", false)?;
            }
        }
        services.debug(&format!("runspace created under {}", sim_root.display()));
        Ok(Value::None)
    }

    fn step(&mut self, services: &mut Services, _timestamp: f64) -> Result<Value, Fail> {
        if !self.run_setup {
            return Ok(Value::None);
        }
        let components: Vec<(ComponentId, ValueMap, PathBuf)> = services.get_simulation_components()?;
        for (id, config, sim_root) in components.iter() {
            let sim_root: PathBuf = absolute(sim_root);
            fs::create_dir_all(sim_root.join("simulation_setup"))?;
            if let Err(e) = Self::setup_component(services, id, config, &sim_root) {
                services.error(&format!("cannot set up {}: {}", id, e.cause));
                return Err(e);
            }
        }
        services.info(&format!("set up {} components", components.len()));
        Ok(Value::None)
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

fn flag(config: &ValueMap, key: &str) -> Result<bool, Fail> {
    match config.get(key) {
        Some(Value::None) | None => Ok(false),
        Some(value) => value.as_bool(),
    }
}

fn required<'a>(config: &'a ValueMap, key: &str) -> Result<&'a Value, Fail> {
    match config.get(key) {
        Some(value) => Ok(value),
        None => {
            let cause: String = format!("component section has no {}", key);
            error!("required(): {}", cause);
            Err(Fail::new(libc::EINVAL, &cause))
        },
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
