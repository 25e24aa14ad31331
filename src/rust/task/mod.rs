// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

pub mod call;
pub mod launcher;

//==============================================================================
// Imports
//==============================================================================

use self::{
    call::{
        Call,
        CallState,
        CallTable,
    },
    launcher::{
        LaunchCommand,
        Launcher,
    },
};
use crate::{
    component::{
        registry::ComponentRegistry,
        ComponentId,
    },
    resource::{
        Allocation,
        AllocationError,
        AllocationRequest,
        ResourceManager,
    },
    runtime::{
        fail::Fail,
        message::{
            CallId,
            Message,
            MessageId,
            MethodInvoke,
            MethodResult,
            TaskId,
        },
        value::{
            Value,
            ValueMap,
        },
    },
};
use ::std::collections::{
    BTreeMap,
    HashMap,
};

//==============================================================================
// Structures
//==============================================================================

/// Lifecycle of an external task as seen by the task manager.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TaskState {
    Queued,
    Allocated,
    Running,
    Done,
    Killed,
}

/// Parameters of one task launch.
#[derive(Clone, Debug, PartialEq)]
pub struct TaskRequest {
    pub nproc: usize,
    pub cwd: String,
    pub binary: String,
    pub args: Vec<String>,
    pub task_ppn: usize,
    pub block: bool,
    pub whole_nodes: bool,
    pub whole_sockets: bool,
}

/// Everything a worker needs to start a task.
#[derive(Clone, Debug, PartialEq)]
pub struct TaskLaunch {
    pub task_id: TaskId,
    pub command: LaunchCommand,
    pub nodes: Vec<String>,
}

/// Why a task could not be set up.
#[derive(Clone, Debug)]
pub enum InitTaskError {
    Resources(AllocationError),
    Launch(Fail),
}

/// Outcome of looking up a call.
#[derive(Clone, Debug, PartialEq)]
pub enum CallStatus {
    Pending,
    Finished(Result<Value, Fail>),
}

struct TaskRecord {
    owner: ComponentId,
    binary: String,
    state: TaskState,
}

/// Task Manager
///
/// Assigns identifiers to calls and tasks and pairs their completions with
/// whoever started them.
pub struct TaskManager {
    launcher: Launcher,
    next_call_id: u64,
    next_task_id: u64,
    calls: CallTable,
    tasks: HashMap<TaskId, TaskRecord>,
}

//==============================================================================
// Associate Functions
//==============================================================================

impl TaskRequest {
    pub fn to_value(&self) -> Value {
        let mut map: ValueMap = ValueMap::new();
        map.insert("nproc".to_string(), Value::from(self.nproc));
        map.insert("cwd".to_string(), Value::from(self.cwd.as_str()));
        map.insert("binary".to_string(), Value::from(self.binary.as_str()));
        map.insert("args".to_string(), Value::from(self.args.clone()));
        map.insert("task_ppn".to_string(), Value::from(self.task_ppn));
        map.insert("block".to_string(), Value::Bool(self.block));
        map.insert("whole_nodes".to_string(), Value::Bool(self.whole_nodes));
        map.insert("whole_sockets".to_string(), Value::Bool(self.whole_sockets));
        Value::Map(map)
    }

    pub fn from_value(value: &Value) -> Result<Self, Fail> {
        let map: &ValueMap = value.as_map()?;
        let field = |name: &str| -> Result<&Value, Fail> {
            match map.get(name) {
                Some(v) => Ok(v),
                None => Err(Fail::new(libc::EINVAL, &format!("task request lacks {:?}", name))),
            }
        };
        Ok(Self {
            nproc: field("nproc")?.as_usize()?,
            cwd: field("cwd")?.as_str()?.to_string(),
            binary: field("binary")?.as_str()?.to_string(),
            args: field("args")?.to_string_list()?,
            task_ppn: field("task_ppn")?.as_usize()?,
            block: field("block")?.as_bool()?,
            whole_nodes: field("whole_nodes")?.as_bool()?,
            whole_sockets: field("whole_sockets")?.as_bool()?,
        })
    }
}

impl TaskLaunch {
    /// Encodes as `[task_id, argv, env, nodes, hostfile]`.
    pub fn to_value(&self) -> Value {
        let env: ValueMap = self
            .command
            .env
            .iter()
            .map(|(k, v)| (k.clone(), Value::from(v.as_str())))
            .collect();
        Value::List(vec![
            Value::from(self.task_id),
            Value::from(self.command.argv.clone()),
            Value::Map(env),
            Value::from(self.nodes.clone()),
            Value::from(self.command.hostfile.clone()),
        ])
    }

    pub fn from_value(value: &Value) -> Result<Self, Fail> {
        match value.as_list()? {
            [task_id, argv, env, nodes, hostfile] => {
                let mut vars: BTreeMap<String, String> = BTreeMap::new();
                for (k, v) in env.as_map()? {
                    vars.insert(k.clone(), v.to_string());
                }
                Ok(Self {
                    task_id: TaskId::try_from(task_id)?,
                    command: LaunchCommand {
                        argv: argv.to_string_list()?,
                        env: vars,
                        hostfile: hostfile.to_string_list()?,
                    },
                    nodes: nodes.to_string_list()?,
                })
            },
            _ => Err(Fail::new(libc::EINVAL, "malformed task launch")),
        }
    }
}

impl From<Fail> for InitTaskError {
    fn from(e: Fail) -> Self {
        InitTaskError::Launch(e)
    }
}

impl TaskManager {
    pub fn new(launcher: Launcher) -> Self {
        Self {
            launcher,
            next_call_id: 0,
            next_task_id: 0,
            calls: CallTable::new(),
            tasks: HashMap::new(),
        }
    }

    pub fn launcher(&self) -> Launcher {
        self.launcher
    }

    fn fresh_call_id(&mut self) -> CallId {
        self.next_call_id += 1;
        CallId::from(self.next_call_id)
    }

    fn fresh_task_id(&mut self) -> TaskId {
        self.next_task_id += 1;
        TaskId::from(self.next_task_id)
    }

    /// Pushes an invocation of `method` into the callee's queue. When
    /// `manage_return` is set the result is kept for a later [Self::wait_call];
    /// otherwise the caller consumes the [MethodResult] itself.
    pub fn init_call(
        &mut self,
        registry: &ComponentRegistry,
        caller: &ComponentId,
        callee: &ComponentId,
        method: &str,
        args: Vec<Value>,
        kwargs: ValueMap,
        manage_return: bool,
    ) -> Result<CallId, Fail> {
        let call_id: CallId = self.fresh_call_id();
        let invoke: MethodInvoke = MethodInvoke {
            id: MessageId::next(),
            caller: caller.clone(),
            callee: callee.clone(),
            call_id,
            method: method.to_string(),
            args: args.clone(),
            kwargs,
        };
        registry.send_invoke(callee, Message::MethodInvoke(invoke))?;
        trace!("init_call(): call {} {} -> {}.{}", call_id, caller, callee, method);
        if manage_return {
            self.calls.insert(Call {
                call_id,
                caller: caller.clone(),
                callee: callee.clone(),
                method: method.to_string(),
                args,
                state: CallState::Pending,
                result: None,
            });
        }
        Ok(call_id)
    }

    /// Looks up a call made by `caller`.
    pub fn wait_call(&mut self, caller: &ComponentId, call_id: CallId) -> Result<CallStatus, Fail> {
        match self.calls.state(call_id) {
            Some(CallState::Pending) => Ok(CallStatus::Pending),
            Some(CallState::Finished) => match self.calls.take_finished(call_id) {
                Some(call) => {
                    if call.caller != *caller {
                        warn!("wait_call(): call {} made by {} collected by {}", call_id, call.caller, caller);
                    }
                    Ok(CallStatus::Finished(call.result.unwrap_or(Ok(Value::None))))
                },
                None => Ok(CallStatus::Pending),
            },
            None => {
                let cause: String = format!("invalid call id {}", call_id);
                error!("wait_call(): {}", cause);
                Err(Fail::new(libc::EBADF, &cause))
            },
        }
    }

    /// Records the result of a managed call. Returns `false` if the call was
    /// not managed by this table.
    pub fn return_call(&mut self, result: MethodResult) -> bool {
        let known: bool = self.calls.complete(result.call_id, result.result);
        if !known {
            warn!("return_call(): result for unknown call {} from {}", result.call_id, result.callee);
        }
        known
    }

    /// Allocates resources for a task and composes its launch command.
    pub fn init_task(
        &mut self,
        rm: &mut ResourceManager,
        owner: &ComponentId,
        request: &TaskRequest,
    ) -> Result<TaskLaunch, InitTaskError> {
        let task_id: TaskId = self.fresh_task_id();
        let allocation: Allocation = rm
            .get_allocation(&AllocationRequest {
                owner: owner.clone(),
                task_id,
                nproc: request.nproc,
                whole_nodes: request.whole_nodes,
                whole_sockets: request.whole_sockets,
                task_ppn: request.task_ppn,
            })
            .map_err(InitTaskError::Resources)?;

        let smp_node: bool = rm.num_nodes() == 1;
        let command: LaunchCommand = match self.launcher.build(&allocation, &request.binary, &request.args, smp_node)
        {
            Ok(command) => command,
            Err(e) => {
                rm.release_allocation(task_id);
                return Err(InitTaskError::Launch(e));
            },
        };
        self.tasks.insert(
            task_id,
            TaskRecord {
                owner: owner.clone(),
                binary: request.binary.clone(),
                state: TaskState::Allocated,
            },
        );
        debug!("init_task(): task {} for {}: {}", task_id, owner, command.display());
        Ok(TaskLaunch {
            task_id,
            command,
            nodes: allocation.node_names().iter().map(|n| n.to_string()).collect(),
        })
    }

    /// Sets up as many of `requests` as currently fit. Requests that must wait
    /// for resources are left out of the result. A request that can never fit
    /// fails the whole batch.
    pub fn init_task_pool(
        &mut self,
        rm: &mut ResourceManager,
        owner: &ComponentId,
        requests: &[(String, TaskRequest)],
    ) -> Result<BTreeMap<String, TaskLaunch>, Fail> {
        let mut launched: BTreeMap<String, TaskLaunch> = BTreeMap::new();
        for (name, request) in requests {
            match self.init_task(rm, owner, request) {
                Ok(launch) => {
                    launched.insert(name.clone(), launch);
                },
                Err(InitTaskError::Resources(e)) if e.is_recoverable() => {
                    debug!("init_task_pool(): task {} deferred ({})", name, e);
                },
                Err(e) => {
                    for launch in launched.values() {
                        self.forget_task(rm, launch.task_id);
                    }
                    let fail: Fail = match e {
                        InitTaskError::Resources(e) => e.into(),
                        InitTaskError::Launch(e) => e,
                    };
                    error!("init_task_pool(): task {}: {:?}", name, fail);
                    return Err(fail);
                },
            }
        }
        for launch in launched.values() {
            self.mark_running(launch.task_id);
        }
        Ok(launched)
    }

    /// Marks a task as started by its owner.
    pub fn mark_running(&mut self, task_id: TaskId) {
        if let Some(record) = self.tasks.get_mut(&task_id) {
            record.state = TaskState::Running;
        }
    }

    fn forget_task(&mut self, rm: &mut ResourceManager, task_id: TaskId) {
        rm.release_allocation(task_id);
        self.tasks.remove(&task_id);
    }

    /// Returns the resources of a finished task. Repeated calls are harmless.
    pub fn finish_task(&mut self, rm: &mut ResourceManager, task_id: TaskId, status: i64, killed: bool) {
        rm.release_allocation(task_id);
        match self.tasks.get_mut(&task_id) {
            Some(record) if matches!(record.state, TaskState::Done | TaskState::Killed) => (),
            Some(record) => {
                record.state = if killed { TaskState::Killed } else { TaskState::Done };
                debug!(
                    "finish_task(): task {} ({}) of {} exited with {}",
                    task_id, record.binary, record.owner, status
                );
            },
            None => warn!("finish_task(): unknown task {}", task_id),
        }
    }

    pub fn task_state(&self, task_id: TaskId) -> Option<TaskState> {
        self.tasks.get(&task_id).map(|r| r.state)
    }

    /// Drops the bookkeeping of a terminated simulation.
    pub fn forget_simulation(&mut self, sim_name: &str) {
        self.calls.forget_simulation(sim_name);
    }

    pub fn outstanding_calls(&self) -> usize {
        self.calls.outstanding_len()
    }
}

//==============================================================================
// Unit Tests
//==============================================================================
