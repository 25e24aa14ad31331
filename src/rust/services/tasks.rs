// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    runtime::{
        fail::Fail,
        message::TaskId,
        value::Value,
    },
    services::Services,
    task::{
        TaskLaunch,
        TaskRequest,
    },
};
use ::std::{
    collections::BTreeMap,
    env,
    fs::{
        self,
        File,
        OpenOptions,
    },
    os::unix::{
        fs::PermissionsExt,
        process::ExitStatusExt,
    },
    path::{
        Path,
        PathBuf,
    },
    process::{
        Child,
        Command,
        ExitStatus,
        Stdio,
    },
    thread,
    time::{
        Duration,
        Instant,
    },
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Interval between two sweeps when waiting on several tasks.
pub const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Variable naming the hostfile of a task whose nodes have no usable names.
pub const NODE_FILE_VAR: &str = "IPS_NODE_FILE";

//======================================================================================================================
// Structures
//======================================================================================================================

/// Knobs of [Services::launch_task]. Unset fields take the component's defaults.
#[derive(Clone, Debug)]
pub struct LaunchOptions {
    pub task_ppn: Option<usize>,
    /// Wait for resources instead of failing when they are busy.
    pub block: bool,
    /// Label shown in launch events.
    pub tag: Option<String>,
    /// Where stdout goes. Stderr follows unless `errfile` is set.
    pub logfile: Option<PathBuf>,
    pub errfile: Option<PathBuf>,
    pub whole_nodes: Option<bool>,
    pub whole_sockets: Option<bool>,
    /// Kill the task once it has run this long.
    pub timeout: Option<Duration>,
}

/// A task started by this worker.
pub struct RunningTask {
    pub child: Child,
    pub binary: String,
    pub start: Instant,
    pub timeout: Option<Duration>,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl Services {
    /// Resolves `binary` to an executable: paths are taken as is, bare names are searched in BIN_PATH then PATH.
    pub fn resolve_binary(&mut self, binary: &str) -> Result<PathBuf, Fail> {
        if let Some(path) = self.binary_cache.get(binary) {
            return Ok(path.clone());
        }
        let found: Option<PathBuf> = if binary.contains('/') {
            let path: PathBuf = self.workdir.join(binary);
            is_executable(&path).then_some(path)
        } else {
            let mut dirs: Vec<PathBuf> = Vec::new();
            if let Some(bin_path) = self.config.get("BIN_PATH").or_else(|| self.sim_conf.get("BIN_PATH")) {
                dirs.extend(bin_path.to_string().split(':').filter(|d| !d.is_empty()).map(PathBuf::from));
            }
            if let Some(path) = env::var_os("PATH") {
                dirs.extend(env::split_paths(&path));
            }
            dirs.into_iter().map(|dir| dir.join(binary)).find(|path| is_executable(path))
        };
        match found {
            Some(path) => {
                self.binary_cache.insert(binary.to_string(), path.clone());
                Ok(path)
            },
            None => {
                let cause: String = format!("Program {} is not in path or is not executable", binary);
                self.error(&cause);
                Err(Fail::new(libc::ENOENT, &cause))
            },
        }
    }

    /// Builds the request the framework needs to allocate and compose a task. Extra words in `binary` become
    /// leading arguments.
    pub(super) fn task_request(
        &mut self,
        nproc: usize,
        working_dir: &Path,
        binary: &str,
        args: &[String],
        options: &LaunchOptions,
    ) -> Result<TaskRequest, Fail> {
        let mut words: Vec<String> = binary.split_whitespace().map(str::to_string).collect();
        if words.is_empty() {
            let cause: String = String::from("empty binary");
            self.error(&cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }
        let program: String = words.remove(0);
        let binary: PathBuf = self.resolve_binary(&program)?;
        words.extend(args.iter().cloned());
        Ok(TaskRequest {
            nproc,
            cwd: working_dir.to_string_lossy().into_owned(),
            binary: binary.to_string_lossy().into_owned(),
            args: words,
            task_ppn: options.task_ppn.unwrap_or(self.ppn),
            block: options.block,
            whole_nodes: options.whole_nodes.unwrap_or(!self.shared_nodes),
            whole_sockets: options.whole_sockets.unwrap_or(!self.shared_nodes),
        })
    }

    /// Starts `binary` on `nproc` processes in `working_dir` and returns its task id.
    pub fn launch_task(
        &mut self,
        nproc: usize,
        working_dir: &Path,
        binary: &str,
        args: &[String],
        options: &LaunchOptions,
    ) -> Result<TaskId, Fail> {
        let request: TaskRequest = self.task_request(nproc, working_dir, binary, args, options)?;
        let value: Value = match self.request("init_task", vec![request.to_value()]) {
            Ok(value) => value,
            Err(e) => {
                self.error(&format!("error initializing task {} {:?}: {}", binary, args, e.cause));
                return Err(e);
            },
        };
        let launch: TaskLaunch = TaskLaunch::from_value(&value)?;
        self.start_task(&launch, working_dir, &request.binary, options)?;
        self.send_event(
            "IPS_LAUNCH_TASK",
            &format!(
                "task_id = {} , Tag = {} , nproc = {} , Target = {}",
                launch.task_id,
                options.tag_label(),
                nproc,
                launch.command.argv.join(" ")
            ),
            true,
        );
        Ok(launch.task_id)
    }

    /// Spawns the process of an already allocated task. Hands the allocation back if the process cannot start.
    pub(super) fn start_task(
        &mut self,
        launch: &TaskLaunch,
        working_dir: &Path,
        binary: &str,
        options: &LaunchOptions,
    ) -> Result<(), Fail> {
        let node_file: Option<PathBuf> = match write_node_file(launch, working_dir) {
            Ok(node_file) => node_file,
            Err(e) => {
                let cause: String = format!("cannot write node file of task {}: {}", launch.task_id, e);
                self.error(&cause);
                self.release_task(launch.task_id, -1, false);
                return Err(Fail::new(libc::EIO, &cause));
            },
        };
        let child: Child = match spawn_process(launch, working_dir, node_file.as_deref(), options) {
            Ok(child) => child,
            Err(e) => {
                let cause: String = format!("cannot launch {}: {}", launch.command.display(), e);
                self.error(&cause);
                self.release_task(launch.task_id, -1, false);
                return Err(Fail::new(libc::EIO, &cause));
            },
        };
        self.debug(&format!("launched task {} (pid {})", launch.task_id, child.id()));
        self.running_tasks.insert(
            launch.task_id,
            RunningTask {
                child,
                binary: binary.to_string(),
                start: Instant::now(),
                timeout: options.timeout,
            },
        );
        Ok(())
    }

    /// Tells the framework a task is over so its resources go back to the pool.
    fn release_task(&mut self, task_id: TaskId, status: i64, killed: bool) {
        let args: Vec<Value> = vec![Value::from(task_id), Value::Int(status), Value::Bool(killed)];
        if let Err(e) = self.request("finish_task", args) {
            self.warning(&format!("finish_task of {} failed: {}", task_id, e.cause));
        }
    }

    fn finish(&mut self, task_id: TaskId, task: RunningTask, status: i64, killed: bool) {
        self.release_task(task_id, status, killed);
        self.send_event(
            "IPS_TASK_END",
            &format!(
                "task_id = {}  elapsed time = {:.2} S",
                task_id,
                task.start.elapsed().as_secs_f64()
            ),
            status == 0,
        );
    }

    fn take_running(&mut self, task_id: TaskId) -> Result<RunningTask, Fail> {
        match self.running_tasks.remove(&task_id) {
            Some(task) => Ok(task),
            None => {
                let cause: String = format!("invalid task id {}", task_id);
                self.error(&cause);
                Err(Fail::new(libc::EBADF, &cause))
            },
        }
    }

    /// Blocks until task `task_id` exits and returns its exit status.
    pub fn wait_task(&mut self, task_id: TaskId) -> Result<i64, Fail> {
        let mut task: RunningTask = self.take_running(task_id)?;
        if task.timeout.is_some() {
            self.running_tasks.insert(task_id, task);
            loop {
                if let Some(status) = self.wait_task_nonblocking(task_id)? {
                    return Ok(status);
                }
                thread::sleep(POLL_INTERVAL);
            }
        }
        let status: i64 = match task.child.wait() {
            Ok(status) => exit_code(status),
            Err(e) => {
                self.warning(&format!("wait on task {} failed: {}", task_id, e));
                -1
            },
        };
        self.finish(task_id, task, status, false);
        Ok(status)
    }

    /// Exit status of `task_id` if it is done, `None` otherwise. Tasks that outlive their timeout are killed.
    pub fn wait_task_nonblocking(&mut self, task_id: TaskId) -> Result<Option<i64>, Fail> {
        let mut task: RunningTask = self.take_running(task_id)?;
        let exited: Option<ExitStatus> = match task.child.try_wait() {
            Ok(exited) => exited,
            Err(e) => {
                self.warning(&format!("poll on task {} failed: {}", task_id, e));
                None
            },
        };
        match exited {
            Some(status) => {
                let status: i64 = exit_code(status);
                self.finish(task_id, task, status, false);
                Ok(Some(status))
            },
            None => match task.timeout {
                Some(timeout) if task.start.elapsed() >= timeout => {
                    self.warning(&format!("task {} ran past its timeout of {:?}", task_id, timeout));
                    let _ = task.child.kill();
                    let status: i64 = task.child.wait().map(exit_code).unwrap_or(-1);
                    self.finish(task_id, task, status, true);
                    Ok(Some(status))
                },
                _ => {
                    self.running_tasks.insert(task_id, task);
                    Ok(None)
                },
            },
        }
    }

    /// Exit status of every task in `task_ids` that is done. With `block`, waits until all of them are.
    pub fn wait_tasklist(&mut self, task_ids: &[TaskId], block: bool) -> Result<BTreeMap<TaskId, i64>, Fail> {
        let mut done: BTreeMap<TaskId, i64> = BTreeMap::new();
        loop {
            for task_id in task_ids {
                if done.contains_key(task_id) {
                    continue;
                }
                if let Some(status) = self.wait_task_nonblocking(*task_id)? {
                    done.insert(*task_id, status);
                }
            }
            if !block || done.len() == task_ids.len() {
                return Ok(done);
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Kills task `task_id` and returns its resources.
    pub fn kill_task(&mut self, task_id: TaskId) -> Result<(), Fail> {
        let mut task: RunningTask = self.take_running(task_id)?;
        if let Err(e) = task.child.kill() {
            self.debug(&format!("kill of task {} failed: {}", task_id, e));
        }
        let status: i64 = task.child.wait().map(exit_code).unwrap_or(-1);
        self.release_task(task_id, status, true);
        self.debug(&format!("killed task {} ({})", task_id, task.binary));
        Ok(())
    }

    /// Kills every task this worker still runs.
    pub fn kill_all_tasks(&mut self) {
        let task_ids: Vec<TaskId> = self.running_tasks.keys().copied().collect();
        for task_id in task_ids {
            if let Err(e) = self.kill_task(task_id) {
                warn!("kill_all_tasks(): {:?}", e);
            }
        }
    }

    pub fn running_task_ids(&self) -> Vec<TaskId> {
        self.running_tasks.keys().copied().collect()
    }
}

impl LaunchOptions {
    /// Tag as shown in events, empty when unset.
    pub fn tag_label(&self) -> &str {
        self.tag.as_deref().unwrap_or("")
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            task_ppn: None,
            block: true,
            tag: None,
            logfile: None,
            errfile: None,
            whole_nodes: None,
            whole_sockets: None,
            timeout: None,
        }
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

pub fn is_executable(path: &Path) -> bool {
    match fs::metadata(path) {
        Ok(metadata) => metadata.is_file() && metadata.permissions().mode() & 0o111 != 0,
        Err(_) => false,
    }
}

/// Exit code of a process, or the negated signal number when it was killed.
pub fn exit_code(status: ExitStatus) -> i64 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code as i64,
        (None, Some(signal)) => -(signal as i64),
        (None, None) => -1,
    }
}

fn open_output(path: &Path, cwd: &Path) -> Result<File, Fail> {
    let path: PathBuf = cwd.join(path);
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}

/// Writes the hostfile of `launch` to `.node_file_<task_id>` in `working_dir`, if it has one.
fn write_node_file(launch: &TaskLaunch, working_dir: &Path) -> Result<Option<PathBuf>, Fail> {
    if launch.command.hostfile.is_empty() {
        return Ok(None);
    }
    let path: PathBuf = working_dir.join(format!(".node_file_{}", launch.task_id));
    let mut text: String = launch.command.hostfile.join("\n");
    text.push('\n');
    fs::write(&path, text)?;
    Ok(Some(path))
}

fn spawn_process(
    launch: &TaskLaunch,
    working_dir: &Path,
    node_file: Option<&Path>,
    options: &LaunchOptions,
) -> Result<Child, Fail> {
    let (program, args): (&String, &[String]) = match launch.command.argv.split_first() {
        Some(split) => split,
        None => return Err(Fail::new(libc::EINVAL, "empty launch command")),
    };
    let mut command: Command = Command::new(program);
    command.args(args).current_dir(working_dir).stdin(Stdio::null());
    for (key, value) in launch.command.env.iter() {
        command.env(key, value);
    }
    if let Some(node_file) = node_file {
        command.env(NODE_FILE_VAR, node_file);
    }
    if let Some(logfile) = &options.logfile {
        let out: File = open_output(logfile, working_dir)?;
        let err: File = match &options.errfile {
            Some(errfile) => open_output(errfile, working_dir)?,
            None => out.try_clone()?,
        };
        command.stdout(out).stderr(err);
    } else if let Some(errfile) = &options.errfile {
        command.stderr(open_output(errfile, working_dir)?);
    }
    Ok(command.spawn()?)
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod test {
    use super::*;
    use crate::task::launcher::LaunchCommand;
    use ::anyhow::Result;
    use ::std::process::Command;
    use ::tempfile::TempDir;

    /// Tests that exit codes and signals are both reported.
    #[test]
    fn test_exit_code() -> Result<()> {
        let status: ExitStatus = Command::new("sh").args(["-c", "exit 3"]).status()?;
        crate::ensure_eq!(exit_code(status), 3);
        let status: ExitStatus = Command::new("sh").args(["-c", "kill -9 $$"]).status()?;
        crate::ensure_eq!(exit_code(status), -9);
        Ok(())
    }

    /// Tests that a hostfile is written next to the task only when the launch carries one.
    #[test]
    fn test_write_node_file() -> Result<()> {
        let scratch: TempDir = TempDir::new()?;
        let mut launch: TaskLaunch = TaskLaunch {
            task_id: TaskId::from(5),
            command: LaunchCommand {
                argv: vec!["/bin/app".to_string()],
                ..LaunchCommand::default()
            },
            nodes: vec!["dummy_node0".to_string(), "dummy_node1".to_string()],
        };
        crate::ensure_eq!(write_node_file(&launch, scratch.path())?, None);

        launch.command.hostfile = vec!["dummy_node0 slots=4".to_string(), "dummy_node1 slots=2".to_string()];
        let path: PathBuf = match write_node_file(&launch, scratch.path())? {
            Some(path) => path,
            None => anyhow::bail!("no node file written"),
        };
        crate::ensure_eq!(path, scratch.path().join(".node_file_5"));
        crate::ensure_eq!(fs::read_to_string(&path)?, "dummy_node0 slots=4\ndummy_node1 slots=2\n");
        Ok(())
    }

    /// Tests that an unset tag shows up empty in events.
    #[test]
    fn test_tag_label() -> Result<()> {
        let untagged: LaunchOptions = LaunchOptions::default();
        crate::ensure_eq!(untagged.tag, None);
        crate::ensure_eq!(untagged.tag_label(), "");
        let tagged: LaunchOptions = LaunchOptions {
            tag: Some("0.5".to_string()),
            ..LaunchOptions::default()
        };
        crate::ensure_eq!(tagged.tag_label(), "0.5");
        Ok(())
    }

    /// Tests that only files with an execute bit count as executables.
    #[test]
    fn test_is_executable() -> Result<()> {
        let scratch: TempDir = TempDir::new()?;
        let dir: PathBuf = scratch.path().to_path_buf();
        let script: PathBuf = dir.join("run.sh");
        fs::write(&script, "#!/bin/sh\n")?;
        crate::ensure_eq!(is_executable(&script), false);
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755))?;
        crate::ensure_eq!(is_executable(&script), true);
        crate::ensure_eq!(is_executable(&dir), false);
        Ok(())
    }
}
