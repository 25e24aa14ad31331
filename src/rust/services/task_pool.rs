// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    runtime::{
        fail::Fail,
        message::TaskId,
        value::{
            Value,
            ValueMap,
        },
    },
    services::{
        tasks::{
            LaunchOptions,
            POLL_INTERVAL,
        },
        Services,
    },
    task::{
        TaskLaunch,
        TaskRequest,
    },
};
use ::slab::Slab;
use ::std::{
    collections::{
        BTreeMap,
        HashMap,
    },
    path::{
        Path,
        PathBuf,
    },
    thread,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// A task of a pool, from queued to finished.
#[derive(Clone, Debug)]
pub struct PoolTask {
    pub name: String,
    pub request: TaskRequest,
    pub working_dir: PathBuf,
    pub options: LaunchOptions,
    pub task_id: Option<TaskId>,
    pub status: Option<i64>,
}

/// Task Pool
///
/// Named batch of tasks submitted together. Each task is queued until the framework finds resources for it, then
/// active until it exits, then finished until collected.
pub struct TaskPool {
    name: String,
    tasks: Slab<PoolTask>,
    /// Keys of queued tasks in submission order.
    queued: Vec<usize>,
    active: HashMap<TaskId, usize>,
    finished: Vec<usize>,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl TaskPool {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            tasks: Slab::new(),
            queued: Vec::new(),
            active: HashMap::new(),
            finished: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queues `task`. Names must be unique among queued tasks.
    pub fn add_task(&mut self, task: PoolTask) -> Result<(), Fail> {
        if self.queued.iter().any(|key| self.tasks[*key].name == task.name) {
            let cause: String = format!("duplicate task name {} in pool {}", task.name, self.name);
            error!("add_task(): {}", cause);
            return Err(Fail::new(libc::EEXIST, &cause));
        }
        let key: usize = self.tasks.insert(task);
        self.queued.push(key);
        Ok(())
    }

    pub fn queued_len(&self) -> usize {
        self.queued.len()
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn finished_len(&self) -> usize {
        self.finished.len()
    }

    pub fn active_task_ids(&self) -> Vec<TaskId> {
        self.active.keys().copied().collect()
    }

    /// Queued tasks in submission order.
    pub fn queued_tasks(&self) -> Vec<&PoolTask> {
        self.queued.iter().map(|key| &self.tasks[*key]).collect()
    }

    pub fn get(&self, name: &str) -> Option<&PoolTask> {
        self.tasks.iter().map(|(_, task)| task).find(|task| task.name == name)
    }

    /// Moves queued task `name` to the active set.
    pub fn mark_launched(&mut self, name: &str, task_id: TaskId) -> bool {
        match self.queued.iter().position(|key| self.tasks[*key].name == name) {
            Some(ix) => {
                let key: usize = self.queued.remove(ix);
                self.tasks[key].task_id = Some(task_id);
                self.active.insert(task_id, key);
                true
            },
            None => false,
        }
    }

    /// Records that queued task `name` could not start.
    pub fn mark_failed(&mut self, name: &str, status: i64) {
        if let Some(ix) = self.queued.iter().position(|key| self.tasks[*key].name == name) {
            let key: usize = self.queued.remove(ix);
            self.tasks[key].status = Some(status);
            self.finished.push(key);
        }
    }

    /// Moves active task `task_id` to the finished set.
    pub fn mark_finished(&mut self, task_id: TaskId, status: i64) -> bool {
        match self.active.remove(&task_id) {
            Some(key) => {
                self.tasks[key].status = Some(status);
                self.finished.push(key);
                true
            },
            None => false,
        }
    }

    /// Removes the finished tasks and returns their exit statuses by name.
    pub fn take_finished(&mut self) -> BTreeMap<String, i64> {
        let mut statuses: BTreeMap<String, i64> = BTreeMap::new();
        for key in self.finished.drain(..) {
            let task: PoolTask = self.tasks.remove(key);
            statuses.insert(task.name, task.status.unwrap_or(-1));
        }
        statuses
    }

    /// Forgets every task.
    pub fn clear(&mut self) {
        self.tasks.clear();
        self.queued.clear();
        self.active.clear();
        self.finished.clear();
    }
}

impl Services {
    pub fn create_task_pool(&mut self, pool_name: &str) -> Result<(), Fail> {
        if self.task_pools.contains_key(pool_name) {
            let cause: String = format!("task pool {} already exists", pool_name);
            self.error(&cause);
            return Err(Fail::new(libc::EEXIST, &cause));
        }
        self.task_pools.insert(pool_name.to_string(), TaskPool::new(pool_name));
        Ok(())
    }

    /// Queues a task in `pool_name`. The binary is resolved right away.
    pub fn add_task(
        &mut self,
        pool_name: &str,
        task_name: &str,
        nproc: usize,
        working_dir: &Path,
        binary: &str,
        args: &[String],
        options: LaunchOptions,
    ) -> Result<(), Fail> {
        let request: TaskRequest = self.task_request(nproc, working_dir, binary, args, &options)?;
        let task: PoolTask = PoolTask {
            name: task_name.to_string(),
            request,
            working_dir: working_dir.to_path_buf(),
            options,
            task_id: None,
            status: None,
        };
        self.pool_mut(pool_name)?.add_task(task)
    }

    /// Launches the queued tasks of `pool_name` that fit. With `block`, keeps going as tasks finish until every
    /// queued task has started. Returns the number of tasks started.
    pub fn submit_tasks(&mut self, pool_name: &str, block: bool) -> Result<usize, Fail> {
        let mut pool: TaskPool = match self.task_pools.remove(pool_name) {
            Some(pool) => pool,
            None => return Err(self.unknown_pool(pool_name)),
        };
        let result: Result<usize, Fail> = self.drive_pool(&mut pool, block);
        self.task_pools.insert(pool_name.to_string(), pool);
        result
    }

    fn drive_pool(&mut self, pool: &mut TaskPool, block: bool) -> Result<usize, Fail> {
        let mut submitted: usize = 0;
        loop {
            self.poll_pool(pool)?;
            if pool.queued_len() == 0 {
                break;
            }
            let launched: usize = self.launch_task_pool(pool)?;
            submitted += launched;
            if !block || pool.queued_len() == 0 {
                break;
            }
            if launched == 0 {
                thread::sleep(POLL_INTERVAL);
            }
        }
        self.debug(&format!("submitted {} tasks of pool {}", submitted, pool.name()));
        Ok(submitted)
    }

    /// Asks the framework to place as many queued tasks as possible, then starts them.
    fn launch_task_pool(&mut self, pool: &mut TaskPool) -> Result<usize, Fail> {
        let requests: Vec<Value> = pool
            .queued_tasks()
            .iter()
            .map(|task| Value::List(vec![Value::from(task.name.as_str()), task.request.to_value()]))
            .collect();
        let value: Value = self.request("init_task_pool", vec![Value::List(requests)])?;
        let launches: &ValueMap = value.as_map()?;

        let mut launched: usize = 0;
        for (name, launch) in launches.iter() {
            let launch: TaskLaunch = TaskLaunch::from_value(launch)?;
            let (working_dir, binary, nproc, options): (PathBuf, String, usize, LaunchOptions) = match pool.get(name) {
                Some(task) => (
                    task.working_dir.clone(),
                    task.request.binary.clone(),
                    task.request.nproc,
                    task.options.clone(),
                ),
                None => {
                    self.warning(&format!("framework placed unknown task {} of pool {}", name, pool.name()));
                    continue;
                },
            };
            if let Err(e) = self.start_task(&launch, &working_dir, &binary, &options) {
                self.error(&format!("task {} of pool {} did not start: {}", name, pool.name(), e.cause));
                pool.mark_failed(name, -1);
                continue;
            }
            pool.mark_launched(name, launch.task_id);
            launched += 1;
            self.send_event(
                "IPS_LAUNCH_TASK_POOL",
                &format!(
                    "task_id = {} , Tag = {} , nproc = {} , Target = {} , task_name = {}",
                    launch.task_id,
                    options.tag_label(),
                    nproc,
                    launch.command.argv.join(" "),
                    name
                ),
                true,
            );
        }
        Ok(launched)
    }

    fn poll_pool(&mut self, pool: &mut TaskPool) -> Result<(), Fail> {
        for task_id in pool.active_task_ids() {
            if let Some(status) = self.wait_task_nonblocking(task_id)? {
                pool.mark_finished(task_id, status);
            }
        }
        Ok(())
    }

    /// Waits until at least one task of `pool_name` is finished and collects every finished task's status.
    pub fn get_finished_tasks(&mut self, pool_name: &str) -> Result<BTreeMap<String, i64>, Fail> {
        let mut pool: TaskPool = match self.task_pools.remove(pool_name) {
            Some(pool) => pool,
            None => return Err(self.unknown_pool(pool_name)),
        };
        let result: Result<BTreeMap<String, i64>, Fail> = self.collect_finished(&mut pool);
        self.task_pools.insert(pool_name.to_string(), pool);
        result
    }

    fn collect_finished(&mut self, pool: &mut TaskPool) -> Result<BTreeMap<String, i64>, Fail> {
        if pool.active_len() + pool.finished_len() == 0 {
            let cause: String = format!("no active or finished tasks in pool {}", pool.name());
            self.error(&cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }
        loop {
            self.poll_pool(pool)?;
            if pool.finished_len() > 0 {
                return Ok(pool.take_finished());
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Kills the active tasks of `pool_name` and drops the pool.
    pub fn remove_task_pool(&mut self, pool_name: &str) -> Result<(), Fail> {
        let mut pool: TaskPool = match self.task_pools.remove(pool_name) {
            Some(pool) => pool,
            None => return Err(self.unknown_pool(pool_name)),
        };
        for task_id in pool.active_task_ids() {
            if let Err(e) = self.kill_task(task_id) {
                self.warning(&format!("cannot kill task {} of pool {}: {}", task_id, pool_name, e.cause));
            }
        }
        pool.clear();
        Ok(())
    }

    fn pool_mut(&mut self, pool_name: &str) -> Result<&mut TaskPool, Fail> {
        match self.task_pools.contains_key(pool_name) {
            true => Ok(self.task_pools.entry(pool_name.to_string()).or_insert_with(|| TaskPool::new(pool_name))),
            false => Err(self.unknown_pool(pool_name)),
        }
    }

    fn unknown_pool(&self, pool_name: &str) -> Fail {
        let cause: String = format!("no task pool named {}", pool_name);
        self.error(&cause);
        Fail::new(libc::ENOENT, &cause)
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
