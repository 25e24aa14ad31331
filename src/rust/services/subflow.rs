// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    config::{
        simulation::{
            absolute,
            sim_keys,
        },
        yaml::ConfigFile,
        CreatedSimulation,
    },
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
    collections::BTreeMap,
    path::{
        Path,
        PathBuf,
    },
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Parent keys a sub-workflow never inherits.
const NOT_INHERITED: [&str; 5] = [
    sim_keys::SIM_NAME,
    sim_keys::SIM_ROOT,
    sim_keys::LOG_FILE,
    sim_keys::SIMULATION_CONFIG_FILE,
    sim_keys::PORTAL_SIM_NAME,
];

//======================================================================================================================
// Structures
//======================================================================================================================

/// A workflow created and driven by this component.
#[derive(Clone, Debug)]
pub struct SubFlow {
    pub created: CreatedSimulation,
    /// Mapping the sub-workflow was created with.
    pub conf: ValueMap,
    /// Mapping as read from its file.
    pub original: ValueMap,
    pub conf_file_dir: PathBuf,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl SubFlow {
    /// For each component section: its name, the directory its inputs come from, and its INPUT_FILES.
    pub fn component_inputs(&self) -> Vec<(String, PathBuf, Vec<String>)> {
        let mut inputs: Vec<(String, PathBuf, Vec<String>)> = Vec::new();
        for section in port_sections(&self.conf) {
            let files: Vec<String> = match self.conf.get(&section) {
                Some(Value::Map(comp)) => match comp.get("INPUT_FILES") {
                    Some(files) => files.to_string_list().unwrap_or_default(),
                    None => Vec::new(),
                },
                _ => continue,
            };
            let input_dir: PathBuf = match self.original.get(&section) {
                Some(Value::Map(comp)) => comp.get(sim_keys::INPUT_DIR),
                _ => None,
            }
            .or_else(|| self.original.get(sim_keys::INPUT_DIR))
            .map(|dir| absolute(Path::new(&dir.to_string())))
            .unwrap_or_else(|| self.conf_file_dir.clone());
            if !files.is_empty() {
                inputs.push((section, input_dir, files));
            }
        }
        inputs
    }

    /// Component section implementing `port`.
    pub fn port_section(&self, port: &str) -> Option<&ValueMap> {
        let section: String = section_of(&self.conf, port)?;
        match self.conf.get(&section) {
            Some(Value::Map(comp)) => Some(comp),
            _ => None,
        }
    }
}

impl Services {
    /// Creates a workflow rooted under this component's working directory from `config_file`. Keys absent from the
    /// file are inherited from this simulation; `overrides` are applied last, per component section first, then at
    /// the top level.
    pub fn create_sub_workflow(
        &mut self,
        name: &str,
        config_file: &Path,
        overrides: &ValueMap,
    ) -> Result<CreatedSimulation, Fail> {
        if self.sub_flows.contains_key(name) {
            let cause: String = format!("sub-workflow {} already exists", name);
            self.error(&cause);
            return Err(Fail::new(libc::EEXIST, &cause));
        }
        self.subflow_count += 1;
        let config_file: PathBuf = absolute(config_file);
        let original: ValueMap = ConfigFile::new(&config_file)?.to_map()?;
        let conf_file_dir: PathBuf = config_file.parent().map(Path::to_path_buf).unwrap_or_default();

        let sim_root: PathBuf = self.workdir.join(format!("sub_workflow_{}", self.subflow_count));
        let conf: ValueMap = sub_workflow_conf(&original, &self.sim_conf, name, &sim_root, &self.workdir, overrides);

        let value: Value = self.request(
            "create_sub_workflow",
            vec![
                Value::Map(conf.clone()),
                Value::from(config_file.to_string_lossy().into_owned()),
            ],
        )?;
        let created: CreatedSimulation = CreatedSimulation::from_value(&value)?;
        self.sub_flows.insert(
            name.to_string(),
            SubFlow {
                created: created.clone(),
                conf,
                original,
                conf_file_dir,
            },
        );
        self.send_event("IPS_CREATE_SUB_WORKFLOW", &format!("workflow_name = {}", created.sim_name), true);
        Ok(created)
    }

    pub fn sub_workflow(&self, name: &str) -> Option<&SubFlow> {
        self.sub_flows.get(name)
    }

    /// Copies the DRIVER outputs of sub-workflow `name`, or of all of them, into the working directory. Returns the
    /// copied files by workflow name.
    pub fn stage_subflow_output_files(&mut self, name: Option<&str>) -> Result<BTreeMap<String, Vec<String>>, Fail> {
        let selected: Vec<SubFlow> = match name {
            Some(name) => match self.sub_flows.get(name) {
                Some(sub_flow) => vec![sub_flow.clone()],
                None => {
                    let cause: String = format!("no sub-workflow named {}", name);
                    self.error(&cause);
                    return Err(Fail::new(libc::ENOENT, &cause));
                },
            },
            None => self.sub_flows.values().cloned().collect(),
        };

        let mut staged: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for sub_flow in selected {
            let driver: &ValueMap = match sub_flow.port_section(sim_keys::DRIVER) {
                Some(driver) => driver,
                None => continue,
            };
            let outputs: Vec<String> = match driver.get("OUTPUT_FILES") {
                Some(files) => files.to_string_list()?,
                None => Vec::new(),
            };
            if outputs.is_empty() {
                staged.insert(sub_flow.created.sim_name.clone(), outputs);
                continue;
            }
            let mut tag: Vec<String> = ["CLASS", "SUB_CLASS", "NAME"]
                .iter()
                .map(|key| driver.get(*key).map(Value::to_string).unwrap_or_default())
                .collect();
            tag.push(sub_flow.created.driver_comp.seq_num().to_string());
            let sim_root: PathBuf = match sub_flow.conf.get(sim_keys::SIM_ROOT) {
                Some(root) => absolute(Path::new(&root.to_string())),
                None => continue,
            };
            let driver_dir: PathBuf = sim_root.join("work").join(tag.join("_"));
            copy_files(&driver_dir, &outputs, &self.workdir, "", false)?;
            staged.insert(sub_flow.created.sim_name.clone(), outputs);
        }
        Ok(staged)
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

fn section_of(conf: &ValueMap, port: &str) -> Option<String> {
    match conf.get(sim_keys::PORTS) {
        Some(Value::Map(ports)) => match ports.get(port) {
            Some(Value::Map(binding)) => binding.get(sim_keys::IMPLEMENTATION).map(Value::to_string),
            _ => None,
        },
        _ => None,
    }
}

/// Component sections bound to the ports listed in PORTS.NAMES.
fn port_sections(conf: &ValueMap) -> Vec<String> {
    let names: Vec<String> = match conf.get(sim_keys::PORTS) {
        Some(Value::Map(ports)) => match ports.get(sim_keys::NAMES) {
            Some(names) => names.to_string_list().unwrap_or_default(),
            None => Vec::new(),
        },
        _ => Vec::new(),
    };
    let mut sections: Vec<String> = Vec::new();
    for port in names {
        if let Some(section) = section_of(conf, &port) {
            if !section.is_empty() && !sections.contains(&section) {
                sections.push(section);
            }
        }
    }
    sections
}

/// Builds the mapping of a sub-workflow named `name` rooted at `sim_root`.
pub fn sub_workflow_conf(
    original: &ValueMap,
    parent: &ValueMap,
    name: &str,
    sim_root: &Path,
    workdir: &Path,
    overrides: &ValueMap,
) -> ValueMap {
    let mut conf: ValueMap = original.clone();
    for (key, value) in parent.iter() {
        if matches!(value, Value::Map(_)) || NOT_INHERITED.contains(&key.as_str()) {
            continue;
        }
        conf.entry(key.clone()).or_insert_with(|| value.clone());
    }
    conf.insert(
        sim_keys::SIM_ROOT.to_string(),
        Value::from(sim_root.to_string_lossy().into_owned()),
    );
    let sim_name: String = conf
        .entry(sim_keys::SIM_NAME.to_string())
        .or_insert_with(|| Value::from(name))
        .to_string();
    conf.entry(sim_keys::LOG_FILE.to_string()).or_insert_with(|| {
        Value::from(sim_root.join(format!("{}.log", sim_name)).to_string_lossy().into_owned())
    });

    for section in port_sections(&conf) {
        if let Some(Value::Map(comp)) = conf.get_mut(&section) {
            comp.insert(
                sim_keys::INPUT_DIR.to_string(),
                Value::from(workdir.join(&section).to_string_lossy().into_owned()),
            );
            if let Some(Value::Map(comp_overrides)) = overrides.get(&section) {
                for (key, value) in comp_overrides.iter() {
                    comp.insert(key.clone(), value.clone());
                }
            }
        }
    }
    for (key, value) in overrides.iter() {
        if matches!(value, Value::Map(_)) && matches!(conf.get(key), Some(Value::Map(_))) {
            continue;
        }
        conf.insert(key.clone(), value.clone());
    }
    conf
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
