// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    config::{
        simulation::absolute,
        yaml::{
            interpolate,
            ConfigFile,
        },
    },
    runtime::{
        fail::Fail,
        value::{
            Value,
            ValueMap,
        },
    },
    services::{
        checkpoint::restart_tag,
        Services,
    },
};
use ::glob::{
    MatchOptions,
    Pattern,
};
use ::std::{
    fs,
    os::unix::fs::symlink,
    path::{
        Component,
        Path,
        PathBuf,
    },
    time::Instant,
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Suffixes tried when an existing file must be kept.
const MAX_VERSIONS: usize = 1000;

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl Services {
    fn output_prefix(&self) -> String {
        self.sim_conf
            .get("OUTPUT_PREFIX")
            .map(Value::to_string)
            .unwrap_or_default()
    }

    /// `<CLASS>_<SUB_CLASS>_<NAME>`, the name of restart and replay directories.
    fn class_tag(&self) -> String {
        ["CLASS", "SUB_CLASS", "NAME"]
            .iter()
            .map(|key| self.config.get(*key).map(Value::to_string).unwrap_or_default())
            .collect::<Vec<String>>()
            .join("_")
    }

    /// Files named by `key` in the component section, else by the configuration parameter.
    fn file_list_param(&mut self, key: &str) -> Result<Vec<String>, Fail> {
        match self.config.get(key) {
            Some(files) => files.to_string_list(),
            None => self.get_config_param(key, false)?.to_string_list(),
        }
    }

    /// Copies the component's INPUT_FILES from INPUT_DIR into the working directory and the simulation setup
    /// directory. Input files of the components of every sub-workflow follow into `<workdir>/<component>`.
    pub fn stage_input_files(&mut self, input_files: &[String]) -> Result<(), Fail> {
        let start: Instant = Instant::now();
        let input_dir: PathBuf = match self.config.get("INPUT_DIR") {
            Some(dir) => absolute(Path::new(&dir.to_string())),
            None => {
                let cause: String = format!("component {} has no INPUT_DIR", self.full_comp_id);
                self.error(&cause);
                return Err(Fail::new(libc::EINVAL, &cause));
            },
        };
        let workdir: PathBuf = self.workdir.clone();
        let setup_dir: PathBuf = self.sim_root.join("simulation_setup").join(&self.full_comp_id);
        let prefix: String = self.output_prefix();

        let result: Result<(), Fail> = (|| {
            copy_files(&input_dir, input_files, &workdir, "", false)?;
            copy_files(&input_dir, input_files, &setup_dir, &prefix, false)?;
            for sub_flow in self.sub_flows.values() {
                for (section, original_dir, files) in sub_flow.component_inputs() {
                    copy_files(&original_dir, &files, &workdir.join(&section), "", false)?;
                }
            }
            Ok(())
        })();
        match result {
            Ok(()) => {
                self.send_event(
                    "IPS_STAGE_INPUTS",
                    &format!(
                        "Elapsed time = {:.3} Path = {} Files = {:?}",
                        start.elapsed().as_secs_f64(),
                        input_dir.display(),
                        input_files
                    ),
                    true,
                );
                Ok(())
            },
            Err(e) => {
                self.send_event(
                    "IPS_STAGE_INPUTS",
                    &format!("Files = {:?} Exception raised : {}", input_files, e.cause),
                    false,
                );
                self.error(&format!("error in stage_input_files(): {}", e.cause));
                Err(e)
            },
        }
    }

    /// Copies output files of physics time `timestamp` into the simulation results, archives the component's state
    /// files and refreshes the time-tagged links of the component.
    pub fn stage_output_files(
        &mut self,
        timestamp: f64,
        output_files: &[String],
        keep_old: bool,
        save_plasma_state: bool,
    ) -> Result<(), Fail> {
        let start: Instant = Instant::now();
        let time: String = time_str(timestamp);
        let results: PathBuf = self.sim_root.join("simulation_results");
        let output_dir: PathBuf = results.join(&time).join("components").join(&self.full_comp_id);
        let prefix: String = self.output_prefix();
        let files: Vec<String> = expand_files(&self.workdir, output_files)?;

        let state_files: Vec<String> = match save_plasma_state {
            true => {
                let listed: Vec<String> = match self
                    .config
                    .get("STATE_FILES")
                    .or_else(|| self.config.get("PLASMA_STATE_FILES"))
                {
                    Some(files) => files.to_string_list()?,
                    None => self.get_config_param("STATE_FILES", true)?.to_string_list()?,
                };
                listed
                    .iter()
                    .filter_map(|file| expand_files(&self.workdir, &[file.clone()]).ok())
                    .flatten()
                    .collect()
            },
            false => Vec::new(),
        };

        let result: Result<(), Fail> = (|| {
            copy_files(&self.workdir, &files, &output_dir, &prefix, keep_old)?;

            let plasma_dir: PathBuf = results.join("plasma_state");
            fs::create_dir_all(&plasma_dir)?;
            for file in state_files.iter() {
                let source: PathBuf = self.workdir.join(file);
                if !source.is_file() {
                    continue;
                }
                let tags: [&str; 2] = [self.full_comp_id.as_str(), time.as_str()];
                let name: String = tagged_name(&format!("{}{}", prefix, file), &tags);
                let target: PathBuf = free_version(&plasma_dir.join(name));
                fs::copy(&source, &target)?;
            }

            let link_dir: PathBuf = results.join(&self.full_comp_id);
            fs::create_dir_all(&link_dir)?;
            for file in files.iter() {
                let real: PathBuf = output_dir.join(format!("{}{}", prefix, file));
                let link: PathBuf = link_dir.join(tagged_name(file, &[time.as_str()]));
                if fs::symlink_metadata(&link).is_ok() {
                    fs::remove_file(&link)?;
                }
                symlink(relative_path(&real, &link_dir), &link)?;
            }
            Ok(())
        })();
        match result {
            Ok(()) => {
                self.send_event(
                    "IPS_STAGE_OUTPUTS",
                    &format!(
                        "Elapsed time = {:.3} Path = {} Files = {:?}",
                        start.elapsed().as_secs_f64(),
                        output_dir.display(),
                        output_files
                    ),
                    true,
                );
                Ok(())
            },
            Err(e) => {
                self.send_event(
                    "IPS_STAGE_OUTPUTS",
                    &format!("Files = {:?} Exception raised : {}", output_files, e.cause),
                    false,
                );
                self.error(&format!("error in stage_output_files(): {}", e.cause));
                Err(e)
            },
        }
    }

    /// Saves restart files of physics time `timestamp` under `<SIM_ROOT>/restart/<time>/<CLASS>_<SUB_CLASS>_<NAME>`.
    /// Does nothing when checkpointing is disabled.
    pub fn save_restart_files(&mut self, timestamp: f64, files: &[String]) -> Result<(), Fail> {
        let num_checkpoint: Option<i64> = match self.sim_conf.get("CHECKPOINT") {
            Some(Value::Map(section)) => section.get("NUM_CHECKPOINT").map(Value::as_int).transpose()?,
            _ => None,
        };
        if num_checkpoint == Some(0) {
            return Ok(());
        }
        let target: PathBuf = self.sim_root.join("restart").join(restart_tag(timestamp)).join(self.class_tag());
        self.debug(&format!("checkpointing: copying {:?} to {:?}", files, target));
        match copy_files(&self.workdir, files, &target, "", false) {
            Ok(_) => {
                self.send_event("IPS_SAVE_RESTART", &format!("Files = {:?}", files), true);
                Ok(())
            },
            Err(e) => {
                self.send_event(
                    "IPS_SAVE_RESTART",
                    &format!("Files = {:?} Exception raised : {}", files, e.cause),
                    false,
                );
                self.error(&format!("error in save_restart_files(): {}", e.cause));
                Err(e)
            },
        }
    }

    /// Copies restart files of physics time `timestamp` from `restart_root` into the working directory.
    pub fn get_restart_files(&mut self, restart_root: &Path, timestamp: f64, files: &[String]) -> Result<(), Fail> {
        let source: PathBuf = absolute(restart_root)
            .join("restart")
            .join(restart_tag(timestamp))
            .join(self.class_tag());
        match copy_files(&source, files, &self.workdir, "", false) {
            Ok(_) => {
                self.send_event("IPS_GET_RESTART", &format!("Files = {:?}", files), true);
                Ok(())
            },
            Err(e) => {
                self.send_event(
                    "IPS_GET_RESTART",
                    &format!("Files = {:?} Exception raised : {}", files, e.cause),
                    false,
                );
                self.error(&format!("error in get_restart_files(): {}", e.cause));
                Err(e)
            },
        }
    }

    fn state_files(&mut self, files: Option<&[String]>) -> Result<Vec<String>, Fail> {
        match files {
            Some(files) if !files.is_empty() => Ok(files
                .iter()
                .flat_map(|f| f.split_whitespace())
                .map(str::to_string)
                .collect()),
            _ => self.file_list_param("STATE_FILES"),
        }
    }

    fn state_work_dir(&mut self) -> Result<PathBuf, Fail> {
        let dir: Value = self.get_config_param("STATE_WORK_DIR", false)?;
        Ok(absolute(Path::new(&dir.to_string())))
    }

    /// Copies the current state files into the working directory.
    pub fn stage_state(&mut self, files: Option<&[String]>) -> Result<(), Fail> {
        let files: Vec<String> = self.state_files(files)?;
        let state_dir: PathBuf = self.state_work_dir()?;
        let workdir: PathBuf = self.workdir.clone();
        self.move_state("stage_state", "IPS_STAGE_PLASMA_STATE", files, &state_dir, &workdir)
    }

    /// Copies the local state files back to the state directory.
    pub fn update_state(&mut self, files: Option<&[String]>) -> Result<(), Fail> {
        let files: Vec<String> = self.state_files(files)?;
        let state_dir: PathBuf = self.state_work_dir()?;
        let workdir: PathBuf = self.workdir.clone();
        self.move_state("update_state", "IPS_UPDATE_PLASMA_STATE", files, &workdir, &state_dir)
    }

    fn move_state(
        &mut self,
        method: &str,
        eventtype: &str,
        files: Vec<String>,
        src: &Path,
        dst: &Path,
    ) -> Result<(), Fail> {
        let start: Instant = Instant::now();
        let args: Vec<Value> = vec![
            Value::from(files.clone()),
            Value::from(src.to_string_lossy().into_owned()),
            Value::from(dst.to_string_lossy().into_owned()),
        ];
        match self.request(method, args) {
            Ok(_) => {
                self.send_event(
                    eventtype,
                    &format!(
                        "Elapsed time = {:.3}  files = {} Success",
                        start.elapsed().as_secs_f64(),
                        files.join(" ")
                    ),
                    true,
                );
                Ok(())
            },
            Err(e) => {
                self.send_event(eventtype, &format!(" Exception raised : {}", e.cause), false);
                self.error(&format!("error in {}(): {}", method, e.cause));
                Err(e)
            },
        }
    }

    /// Merges a partial state file into the current state with `merge_binary` (`update_state` by default).
    pub fn merge_current_state(
        &mut self,
        partial_state_file: &Path,
        logfile: Option<&Path>,
        merge_binary: Option<&str>,
    ) -> Result<(), Fail> {
        let state_dir: PathBuf = self.state_work_dir()?;
        let current: String = self.get_config_param("CURRENT_STATE", false)?.to_string();
        let update_file: PathBuf = self.workdir.join(partial_state_file);
        let binary: PathBuf = self.resolve_binary(merge_binary.unwrap_or("update_state"))?;
        let args: Vec<Value> = vec![
            Value::from(update_file.to_string_lossy().into_owned()),
            Value::from(state_dir.join(&current).to_string_lossy().into_owned()),
            Value::from(logfile.map(|l| l.to_string_lossy().into_owned())),
            Value::from(binary.to_string_lossy().into_owned()),
        ];
        let retval: i64 = match self.request("merge_current_state", args).and_then(|v| v.as_int()) {
            Ok(retval) => retval,
            Err(e) => {
                self.send_event("IPS_MERGE_PLASMA_STATE", &format!(" Exception raised : {}", e.cause), false);
                self.error(&format!("error merging plasma state file {}", partial_state_file.display()));
                return Err(e);
            },
        };
        if retval != 0 {
            let cause: String = format!(
                "error merging update {} into current plasma state file {}",
                partial_state_file.display(),
                current
            );
            self.send_event("IPS_MERGE_PLASMA_STATE", " Error in call to update_state() : ", false);
            self.error(&cause);
            return Err(Fail::new(libc::EIO, &cause));
        }
        self.send_event("IPS_MERGE_PLASMA_STATE", "Success", true);
        Ok(())
    }

    /// Copies the outputs of physics time `timestamp` recorded by an earlier run into the working directory.
    /// Returns the local file names.
    pub fn stage_replay_output_files(&mut self, timestamp: f64) -> Result<Vec<String>, Fail> {
        let required = |config: &ValueMap, key: &str| -> Result<String, Fail> {
            match config.get(key) {
                Some(value) => Ok(value.to_string()),
                None => {
                    let cause: String = format!("missing replay parameter {}", key);
                    error!("stage_replay_output_files(): {}", cause);
                    Err(Fail::new(libc::EINVAL, &cause))
                },
            }
        };
        let replay_root: PathBuf = absolute(Path::new(&required(&self.config, "REPLAY_SIM_ROOT")?));
        let replay_port: String = required(&self.config, "REPLAY_PORT")?;
        let replay_file: PathBuf = absolute(Path::new(&required(&self.config, "REPLAY_CONFIG_FILE")?));
        let mut replay_conf: ValueMap = ConfigFile::new(&replay_file)?.to_map()?;
        interpolate(&mut replay_conf);

        let section: String = match replay_conf.get("PORTS") {
            Some(Value::Map(ports)) => match ports.get(&replay_port) {
                Some(Value::Map(port)) => required(port, "IMPLEMENTATION")?,
                _ => String::new(),
            },
            _ => String::new(),
        };
        let comp_conf: ValueMap = match replay_conf.get(&section) {
            Some(Value::Map(comp_conf)) if !section.is_empty() => comp_conf.clone(),
            _ => {
                let cause: String = format!("error accessing replay component for port {}", replay_port);
                self.error(&cause);
                return Err(Fail::new(libc::EINVAL, &cause));
            },
        };
        let outputs: Vec<String> = match comp_conf.get("OUTPUT_FILES") {
            Some(files) => files.to_string_list()?,
            None => Vec::new(),
        };
        let prefix: String = comp_conf.get("OUTPUT_PREFIX").map(Value::to_string).unwrap_or_default();
        let class_tag: String = ["CLASS", "SUB_CLASS", "NAME"]
            .iter()
            .map(|key| required(&comp_conf, key))
            .collect::<Result<Vec<String>, Fail>>()?
            .join("_");

        let results: PathBuf = replay_root.join("simulation_results");
        let pattern: String = format!(
            "{}/{}_*",
            Pattern::escape(&results.to_string_lossy()),
            Pattern::escape(&class_tag)
        );
        let matches: Vec<String> = glob_paths(&pattern)?
            .iter()
            .filter(|path| path.is_dir())
            .filter_map(|path| path.file_name().map(|name| name.to_string_lossy().into_owned()))
            .collect();
        let replay_comp_id: String = match matches.as_slice() {
            [only] => only.clone(),
            _ => {
                let cause: String = format!(
                    "could not find a single component instance implementing port {}",
                    replay_port
                );
                self.error(&cause);
                return Err(Fail::new(libc::ENOENT, &cause));
            },
        };

        let use_sym_link: bool = self
            .config
            .get("USE_SYM_LINK")
            .map(|v| v.as_bool().unwrap_or(false))
            .unwrap_or(false);
        let link_dir: PathBuf = results.join(&replay_comp_id);
        let time: String = time_str(timestamp);
        let mut local: Vec<String> = Vec::with_capacity(outputs.len());
        for file in outputs.iter() {
            let name: String = format!("{}{}", prefix, file);
            let source: PathBuf = link_dir.join(tagged_name(&name, &[time.as_str()]));
            let target: PathBuf = self.workdir.join(&name);
            let copied: Result<(), Fail> = match use_sym_link && symlink(&source, &target).is_ok() {
                true => Ok(()),
                false => fs::copy(&source, &target).map(|_| ()).map_err(Fail::from),
            };
            if let Err(e) = copied {
                self.error(&format!("error copying replay file from {:?} to {:?}", source, target));
                return Err(e);
            }
            local.push(name);
        }
        self.send_event("IPS_STAGE_REPLAY_OUTPUT_FILES", &format!("Files = {:?}", outputs), true);
        Ok(local)
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Shell rules: wildcards never match a leading dot.
fn shell_options() -> MatchOptions {
    MatchOptions {
        require_literal_leading_dot: true,
        ..MatchOptions::new()
    }
}

/// Whether `name` matches the shell-style `pattern`. A malformed pattern matches nothing.
pub fn wildcard_match(pattern: &str, name: &str) -> bool {
    match Pattern::new(pattern) {
        Ok(pattern) => pattern.matches_with(name, shell_options()),
        Err(_) => false,
    }
}

/// Paths matching `pattern`, sorted.
fn glob_paths(pattern: &str) -> Result<Vec<PathBuf>, Fail> {
    let mut paths: Vec<PathBuf> = match glob::glob_with(pattern, shell_options()) {
        Ok(paths) => paths.filter_map(|entry| entry.ok()).collect(),
        Err(e) => {
            let cause: String = format!("invalid file pattern {}: {}", pattern, e.msg);
            error!("glob_paths(): {}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        },
    };
    paths.sort();
    Ok(paths)
}

/// Resolves `files` against `dir`. Wildcards expand to every match, sorted.
fn glob_files(dir: &Path, files: &[String]) -> Result<Vec<PathBuf>, Fail> {
    let base: String = Pattern::escape(&dir.to_string_lossy());
    let mut found: Vec<PathBuf> = Vec::new();
    for file in files.iter().flat_map(|f| f.split_whitespace()) {
        let path: PathBuf = dir.join(file);
        if path.is_file() {
            found.push(path);
            continue;
        }
        let pattern: String = match Path::new(file).is_absolute() {
            true => file.to_string(),
            false => format!("{}/{}", base, file),
        };
        let matches: Vec<PathBuf> = glob_paths(&pattern)?;
        if matches.is_empty() {
            let cause: String = format!("No such file : {}", path.display());
            error!("glob_files(): {}", cause);
            return Err(Fail::new(libc::ENOENT, &cause));
        }
        found.extend(matches);
    }
    Ok(found)
}

/// Names, relative to `dir`, of the files matched by `files`.
fn expand_files(dir: &Path, files: &[String]) -> Result<Vec<String>, Fail> {
    Ok(glob_files(dir, files)?
        .iter()
        .map(|path| match path.strip_prefix(dir) {
            Ok(rel) => rel.to_string_lossy().into_owned(),
            Err(_) => path.to_string_lossy().into_owned(),
        })
        .collect())
}

/// First of `path`, `path.0`, `path.1`, ... that does not exist.
fn free_version(path: &Path) -> PathBuf {
    if !path.exists() {
        return path.to_path_buf();
    }
    for i in 0..MAX_VERSIONS {
        let candidate: PathBuf = PathBuf::from(format!("{}.{}", path.display(), i));
        if !candidate.exists() {
            return candidate;
        }
    }
    path.to_path_buf()
}

/// Copies `files` from `src_dir` into `target_dir` with `prefix` prepended to each name. Wildcards are expanded.
/// With `keep_old`, existing targets are left alone and the copy gets the first free `.N` suffix. Returns the
/// written paths.
pub fn copy_files(
    src_dir: &Path,
    files: &[String],
    target_dir: &Path,
    prefix: &str,
    keep_old: bool,
) -> Result<Vec<PathBuf>, Fail> {
    if absolute(src_dir) == absolute(target_dir) {
        return Ok(Vec::new());
    }
    let sources: Vec<PathBuf> = glob_files(src_dir, files)?;
    let mut written: Vec<PathBuf> = Vec::with_capacity(sources.len());
    for source in sources {
        let name: String = match source.file_name() {
            Some(name) => format!("{}{}", prefix, name.to_string_lossy()),
            None => continue,
        };
        let mut target: PathBuf = target_dir.join(name);
        if target.is_file() && same_file(&source, &target) {
            continue;
        }
        if keep_old && target.is_file() {
            target = free_version(&target);
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(&source, &target)?;
        written.push(target);
    }
    Ok(written)
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// `name` with `tags` joined in front of its extension: `a.nc` with `["x", "1.0"]` gives `a_x_1.0.nc`.
pub fn tagged_name(name: &str, tags: &[&str]) -> String {
    let (stem, ext): (&str, Option<&str>) = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
        _ => (name, None),
    };
    let mut tagged: String = stem.to_string();
    for tag in tags {
        tagged.push('_');
        tagged.push_str(tag);
    }
    if let Some(ext) = ext {
        tagged.push('.');
        tagged.push_str(ext);
    }
    tagged
}

/// Physics time as it appears in result file names: integral times keep one decimal.
pub fn time_str(t: f64) -> String {
    match t.fract() == 0.0 && t.abs() < 1e16 {
        true => format!("{:.1}", t),
        false => format!("{}", t),
    }
}

/// Path of `target` as seen from directory `from`.
pub fn relative_path(target: &Path, from: &Path) -> PathBuf {
    let target: Vec<Component> = target.components().collect();
    let from: Vec<Component> = from.components().collect();
    let common: usize = target.iter().zip(from.iter()).take_while(|(a, b)| a == b).count();
    let mut path: PathBuf = PathBuf::new();
    for _ in common..from.len() {
        path.push("..");
    }
    for component in &target[common..] {
        path.push(component.as_os_str());
    }
    path
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
