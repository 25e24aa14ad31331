// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    component::Component,
    runtime::{
        fail::Fail,
        message::TaskId,
        value::{
            Value,
            ValueMap,
        },
    },
    services::{
        LaunchOptions,
        Services,
    },
};
use ::std::{
    collections::BTreeMap,
    path::{
        Path,
        PathBuf,
    },
    time::Duration,
};

//======================================================================================================================
// Constants
//======================================================================================================================

const POOL_NAME: &str = "task_runner";

//======================================================================================================================
// Structures
//======================================================================================================================

/// Task Runner
///
/// Runs the configured `BINARY` once per `step`, on `NPROC` processes, in its working directory. With `TASK_COUNT`
/// above one the copies go through a task pool and run side by side. Any non-zero exit fails the step.
pub struct TaskRunner {
    binary: String,
    nproc: usize,
    args: Vec<String>,
    task_count: usize,
    task_ppn: Option<usize>,
    logfile: Option<PathBuf>,
    timeout: Option<Duration>,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl TaskRunner {
    pub fn new(config: &ValueMap) -> Result<Self, Fail> {
        let binary: String = match config.get("BINARY") {
            Some(Value::None) | None => {
                let cause: String = String::from("task runner needs a BINARY");
                error!("new(): {}", cause);
                return Err(Fail::new(libc::EINVAL, &cause));
            },
            Some(binary) => binary.to_string(),
        };
        let count = |key: &str, default: usize| -> Result<usize, Fail> {
            match config.get(key) {
                Some(Value::None) | None => Ok(default),
                Some(value) => value.as_usize(),
            }
        };
        let timeout: Option<Duration> = match config.get("TIMEOUT") {
            Some(Value::None) | None => None,
            Some(value) => Some(value.as_float()?).filter(|s| *s > 0.0).map(Duration::from_secs_f64),
        };
        Ok(Self {
            binary,
            nproc: count("NPROC", 1)?.max(1),
            args: match config.get("ARGS") {
                Some(args) => args.to_string_list()?,
                None => Vec::new(),
            },
            task_count: count("TASK_COUNT", 1)?.max(1),
            task_ppn: match config.get("TASK_PPN") {
                Some(Value::None) | None => None,
                Some(value) => Some(value.as_usize()?),
            },
            logfile: config.get("LOGFILE").map(|l| PathBuf::from(l.to_string())),
            timeout,
        })
    }

    fn options(&self, tag: &str) -> LaunchOptions {
        LaunchOptions {
            task_ppn: self.task_ppn,
            tag: Some(tag.to_string()),
            logfile: self.logfile.clone(),
            timeout: self.timeout,
            ..LaunchOptions::default()
        }
    }

    fn run_single(&self, services: &mut Services, workdir: &Path, timestamp: f64) -> Result<(), Fail> {
        let task_id: TaskId = services.launch_task(
            self.nproc,
            workdir,
            &self.binary,
            &self.args,
            &self.options(&format!("{}", timestamp)),
        )?;
        match services.wait_task(task_id)? {
            0 => Ok(()),
            status => {
                let cause: String = format!("{} exited with {}", self.binary, status);
                services.error(&cause);
                Err(Fail::new(libc::EIO, &cause))
            },
        }
    }

    fn run_pool(&self, services: &mut Services, workdir: &Path, timestamp: f64) -> Result<(), Fail> {
        services.create_task_pool(POOL_NAME)?;
        let result: Result<(), Fail> = self.drive_pool(services, workdir, timestamp);
        if let Err(e) = services.remove_task_pool(POOL_NAME) {
            services.warning(&format!("cannot remove task pool: {}", e.cause));
        }
        result
    }

    fn drive_pool(&self, services: &mut Services, workdir: &Path, timestamp: f64) -> Result<(), Fail> {
        for i in 0..self.task_count {
            let name: String = format!("task_{}", i);
            let options: LaunchOptions = self.options(&format!("{}_{}", timestamp, i));
            services.add_task(POOL_NAME, &name, self.nproc, workdir, &self.binary, &self.args, options)?;
        }
        services.submit_tasks(POOL_NAME, true)?;

        let mut statuses: BTreeMap<String, i64> = BTreeMap::new();
        while statuses.len() < self.task_count {
            statuses.extend(services.get_finished_tasks(POOL_NAME)?);
        }
        let failed: Vec<&String> = statuses.iter().filter(|(_, s)| **s != 0).map(|(name, _)| name).collect();
        if !failed.is_empty() {
            let cause: String = format!("tasks {:?} of {} failed", failed, self.binary);
            services.error(&cause);
            return Err(Fail::new(libc::EIO, &cause));
        }
        Ok(())
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Component for TaskRunner {
    fn init(&mut self, services: &mut Services, _timestamp: f64) -> Result<Value, Fail> {
        let input_files: Vec<String> = match services.config().get("INPUT_FILES") {
            Some(files) => files.to_string_list()?,
            None => Vec::new(),
        };
        if !input_files.is_empty() {
            services.stage_input_files(&input_files)?;
        }
        Ok(Value::None)
    }

    fn step(&mut self, services: &mut Services, timestamp: f64) -> Result<Value, Fail> {
        let workdir: PathBuf = services.get_working_dir();
        if self.task_count > 1 {
            self.run_pool(services, &workdir, timestamp)?;
        } else {
            self.run_single(services, &workdir, timestamp)?;
        }
        let output_files: Vec<String> = match services.config().get("OUTPUT_FILES") {
            Some(files) => files.to_string_list()?,
            None => Vec::new(),
        };
        if !output_files.is_empty() {
            services.stage_output_files(timestamp, &output_files, false, false)?;
        }
        Ok(Value::None)
    }

    fn checkpoint(&mut self, services: &mut Services, timestamp: f64) -> Result<Value, Fail> {
        let files: Vec<String> = match services.config().get("RESTART_FILES") {
            Some(files) => files.to_string_list()?,
            None => Vec::new(),
        };
        services.save_restart_files(timestamp, &files)?;
        Ok(Value::None)
    }

    fn restart(&mut self, services: &mut Services, timestamp: f64) -> Result<Value, Fail> {
        let root: PathBuf = PathBuf::from(services.get_config_param("RESTART_ROOT", false)?.to_string());
        let files: Vec<String> = match services.config().get("RESTART_FILES") {
            Some(files) => files.to_string_list()?,
            None => Vec::new(),
        };
        services.get_restart_files(&root, timestamp, &files)?;
        Ok(Value::None)
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
