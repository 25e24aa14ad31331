// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    component::ComponentId,
    config::CreatedSimulation,
    framework::FrameworkCore,
    resource::{
        Allocation,
        AllocationRequest,
    },
    runtime::{
        fail::Fail,
        message::{
            CallId,
            MessageId,
            MethodResult,
            ServiceRequest,
            Status,
            TaskId,
        },
        value::{
            Value,
            ValueMap,
        },
    },
    services::{
        staging::copy_files,
        tasks::exit_code,
    },
    task::{
        CallStatus,
        InitTaskError,
        TaskLaunch,
        TaskRequest,
    },
};
use ::std::{
    collections::{
        BTreeMap,
        HashMap,
    },
    fs::File,
    path::{
        Path,
        PathBuf,
    },
    process::{
        Command,
        ExitStatus,
        Stdio,
    },
};

//======================================================================================================================
// Constants
//======================================================================================================================

const CONFIG_SERVICES: [&str; 13] = [
    "get_port",
    "getTimeLoop",
    "get_time_loop",
    "get_config_parameter",
    "set_config_parameter",
    "get_platform_parameter",
    "create_simulation",
    "create_sub_workflow",
    "get_sim_names",
    "get_component_ids",
    "terminate_sim",
    "get_simulation_components",
    "get_sim_root",
];

const DATA_SERVICES: [&str; 3] = ["stage_state", "update_state", "merge_current_state"];

const TASK_SERVICES: [&str; 6] = [
    "init_call",
    "wait_call",
    "return_call",
    "init_task",
    "init_task_pool",
    "finish_task",
];

const RESOURCE_SERVICES: [&str; 2] = ["get_allocation", "release_allocation"];

//======================================================================================================================
// Structures
//======================================================================================================================

/// Why a service request did not produce a response.
#[derive(Debug)]
pub enum ServiceError {
    /// The request cannot be served yet; the framework retries it later.
    Blocked(String),
    Failed(Fail),
}

/// Serves one framework request on behalf of `request.sender`.
pub type ServiceHandler = fn(&mut FrameworkCore, &ServiceRequest) -> Result<Value, ServiceError>;

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl From<Fail> for ServiceError {
    fn from(e: Fail) -> Self {
        ServiceError::Failed(e)
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Handler of every framework service, by method name.
pub fn handlers() -> HashMap<&'static str, ServiceHandler> {
    let mut table: HashMap<&'static str, ServiceHandler> = HashMap::new();
    let groups: [(&[&'static str], ServiceHandler); 4] = [
        (&CONFIG_SERVICES, config_service),
        (&DATA_SERVICES, data_service),
        (&TASK_SERVICES, task_service),
        (&RESOURCE_SERVICES, resource_service),
    ];
    for (names, handler) in groups {
        for name in names {
            table.insert(*name, handler);
        }
    }
    table
}

fn unknown_method(req: &ServiceRequest) -> ServiceError {
    let cause: String = format!("no handler for service {}", req.method);
    error!("unknown_method(): {}", cause);
    ServiceError::Failed(Fail::new(libc::ENOSYS, &cause))
}

fn optional_bool(req: &ServiceRequest, ix: usize, default: bool) -> Result<bool, Fail> {
    match req.args.get(ix) {
        Some(Value::None) | None => Ok(default),
        Some(value) => value.as_bool(),
    }
}

/// Configuration manager services.
fn config_service(core: &mut FrameworkCore, req: &ServiceRequest) -> Result<Value, ServiceError> {
    let sim_name: String = req.sender.sim_name().to_string();
    match req.method.as_str() {
        "get_port" => Ok(Value::from(core.cm.get_port(&sim_name, req.arg(0)?.as_str()?)?)),
        "getTimeLoop" | "get_time_loop" => Ok(Value::from(core.cm.get_time_loop(&sim_name)?)),
        "get_config_parameter" => {
            let target: String = match req.args.get(1) {
                Some(Value::Str(target)) => target.clone(),
                _ => sim_name,
            };
            Ok(core.cm.get_config_parameter(&target, req.arg(0)?.as_str()?)?)
        },
        "set_config_parameter" => {
            let param: &str = req.arg(0)?.as_str()?;
            let value: Value = req.arg(1)?.clone();
            let target: String = match req.args.get(2) {
                Some(Value::Str(target)) => target.clone(),
                _ => sim_name,
            };
            Ok(core.cm.set_config_parameter(param, value, &target)?)
        },
        "get_platform_parameter" => Ok(core.cm.get_platform_parameter(req.arg(0)?.as_str()?)?),
        "create_simulation" => {
            let config_file: PathBuf = PathBuf::from(req.arg(0)?.as_str()?);
            let overrides: ValueMap = match req.args.get(1) {
                Some(Value::Map(overrides)) => overrides.clone(),
                _ => ValueMap::new(),
            };
            let created: CreatedSimulation = core.cm.create_simulation_from_file(
                &mut core.registry,
                &core.spawner,
                &sim_name,
                &config_file,
                &overrides,
                false,
            )?;
            info!("config_service(): {} created simulation {}", req.sender, created.sim_name);
            Ok(created.to_value())
        },
        "create_sub_workflow" => {
            let conf: ValueMap = req.arg(0)?.as_map()?.clone();
            let config_file: PathBuf = PathBuf::from(req.arg(1)?.as_str()?);
            let created: CreatedSimulation = core.cm.create_simulation(
                &mut core.registry,
                &core.spawner,
                &sim_name,
                conf,
                &config_file,
                &ValueMap::new(),
                true,
            )?;
            let portal_sim_name: String = core.cm.simulation(&created.sim_name)?.portal_sim_name.clone();
            core.events.alias(&created.sim_name, &portal_sim_name);
            info!("config_service(): {} created sub-workflow {}", req.sender, created.sim_name);
            Ok(created.to_value())
        },
        "get_sim_names" => Ok(Value::from(core.cm.sim_names())),
        "get_component_ids" => {
            let target: String = match req.args.first() {
                Some(Value::Str(target)) => target.clone(),
                _ => sim_name,
            };
            Ok(Value::List(
                core.registry
                    .component_ids(&target)
                    .into_iter()
                    .map(Value::from)
                    .collect(),
            ))
        },
        "terminate_sim" => {
            let target: String = req.arg(0)?.as_str()?.to_string();
            core.terminate_sim(&target, Status::Success)?;
            Ok(Value::Bool(true))
        },
        "get_simulation_components" => {
            let mut components: Vec<Value> = Vec::new();
            for (id, config) in core.cm.simulation_components(&core.registry) {
                let sim_root: String = core.cm.simulation(id.sim_name())?.sim_root.to_string_lossy().into_owned();
                components.push(Value::List(vec![Value::from(id), Value::Map(config), Value::from(sim_root)]));
            }
            Ok(Value::List(components))
        },
        "get_sim_root" => Ok(Value::from(
            core.cm.simulation(&sim_name)?.sim_root.to_string_lossy().into_owned(),
        )),
        _ => Err(unknown_method(req)),
    }
}

/// Shared state directory services. Running them here serializes access to the state files.
fn data_service(_core: &mut FrameworkCore, req: &ServiceRequest) -> Result<Value, ServiceError> {
    match req.method.as_str() {
        "stage_state" | "update_state" => {
            let files: Vec<String> = req.arg(0)?.to_string_list()?;
            let src: &str = req.arg(1)?.as_str()?;
            let dst: &str = req.arg(2)?.as_str()?;
            copy_files(Path::new(src), &files, Path::new(dst), "", false)?;
            debug!("data_service(): {} copied {:?} from {} to {}", req.method, files, src, dst);
            Ok(Value::Int(0))
        },
        "merge_current_state" => {
            let partial: PathBuf = PathBuf::from(req.arg(0)?.as_str()?);
            let target: PathBuf = PathBuf::from(req.arg(1)?.as_str()?);
            let binary: &str = req.arg(3)?.as_str()?;
            Ok(Value::Int(merge_state(&partial, &target, req.args.get(2), binary)?))
        },
        _ => Err(unknown_method(req)),
    }
}

/// Runs `binary -input <target> -updates <partial>` in the directory of the partial state. On success the merged
/// state is copied back next to the partial state.
fn merge_state(partial: &Path, target: &Path, logfile: Option<&Value>, binary: &str) -> Result<i64, Fail> {
    let component_dir: PathBuf = match partial.parent() {
        Some(dir) => dir.to_path_buf(),
        None => PathBuf::from("."),
    };
    let mut command: Command = Command::new(binary);
    command
        .arg("-input")
        .arg(target)
        .arg("-updates")
        .arg(partial)
        .current_dir(&component_dir)
        .stdin(Stdio::null());
    if let Some(Value::Str(logfile)) = logfile {
        let out: File = File::create(component_dir.join(logfile))?;
        command.stderr(out.try_clone()?).stdout(out);
    }
    let status: ExitStatus = command.status()?;
    let retval: i64 = exit_code(status);
    if retval == 0 {
        let (state_dir, state_file): (PathBuf, String) = match (target.parent(), target.file_name()) {
            (Some(dir), Some(name)) => (dir.to_path_buf(), name.to_string_lossy().into_owned()),
            _ => return Ok(retval),
        };
        copy_files(&state_dir, &[state_file], &component_dir, "", false)?;
    } else {
        warn!("merge_state(): {} exited with {}", binary, retval);
    }
    Ok(retval)
}

/// Task manager services.
fn task_service(core: &mut FrameworkCore, req: &ServiceRequest) -> Result<Value, ServiceError> {
    match req.method.as_str() {
        "init_call" => {
            let callee: &ComponentId = req.arg(0)?.as_component()?;
            let method: &str = req.arg(1)?.as_str()?;
            let args: Vec<Value> = req.arg(2)?.as_list()?.to_vec();
            let call_id: CallId =
                core.tm
                    .init_call(&core.registry, &req.sender, callee, method, args, req.kwargs.clone(), true)?;
            Ok(Value::from(call_id))
        },
        "wait_call" => {
            let call_id: CallId = CallId::try_from(req.arg(0)?)?;
            let block: bool = optional_bool(req, 1, true)?;
            match core.tm.wait_call(&req.sender, call_id)? {
                CallStatus::Pending if block => Err(ServiceError::Blocked(format!("call {} pending", call_id))),
                CallStatus::Pending => Ok(Value::List(vec![Value::Bool(false), Value::None])),
                CallStatus::Finished(Ok(value)) => Ok(Value::List(vec![Value::Bool(true), value])),
                CallStatus::Finished(Err(e)) => Err(ServiceError::Failed(e)),
            }
        },
        "return_call" => {
            let callee: ComponentId = req.arg(0)?.as_component()?.clone();
            let call_id: CallId = CallId::try_from(req.arg(1)?)?;
            let status: Status = Status::try_from(req.arg(2)?)?;
            let payload: Value = req.args.get(3).cloned().unwrap_or(Value::None);
            let result: Result<Value, Fail> = match status {
                Status::Success => Ok(payload),
                Status::Failure => Err(Fail::new(libc::EIO, &payload.to_string())),
            };
            Ok(Value::Bool(core.tm.return_call(MethodResult {
                id: MessageId::next(),
                callee,
                caller: req.sender.clone(),
                call_id,
                result,
            })))
        },
        "init_task" => {
            let request: TaskRequest = TaskRequest::from_value(req.arg(0)?)?;
            match core.tm.init_task(&mut core.rm, &req.sender, &request) {
                Ok(launch) => {
                    core.tm.mark_running(launch.task_id);
                    Ok(launch.to_value())
                },
                Err(InitTaskError::Resources(e)) if e.is_recoverable() && request.block => {
                    Err(ServiceError::Blocked(e.to_string()))
                },
                Err(InitTaskError::Resources(e)) => Err(ServiceError::Failed(e.into())),
                Err(InitTaskError::Launch(e)) => Err(ServiceError::Failed(e)),
            }
        },
        "init_task_pool" => {
            let mut requests: Vec<(String, TaskRequest)> = Vec::new();
            for entry in req.arg(0)?.as_list()? {
                match entry.as_list()? {
                    [name, request] => requests.push((name.as_str()?.to_string(), TaskRequest::from_value(request)?)),
                    _ => return Err(Fail::new(libc::EINVAL, "malformed task pool entry").into()),
                }
            }
            let launched: BTreeMap<String, TaskLaunch> = core.tm.init_task_pool(&mut core.rm, &req.sender, &requests)?;
            Ok(Value::Map(
                launched.into_iter().map(|(name, launch)| (name, launch.to_value())).collect(),
            ))
        },
        "finish_task" => {
            let task_id: TaskId = TaskId::try_from(req.arg(0)?)?;
            let status: i64 = req.arg(1)?.as_int()?;
            let killed: bool = optional_bool(req, 2, false)?;
            core.tm.finish_task(&mut core.rm, task_id, status, killed);
            Ok(Value::None)
        },
        _ => Err(unknown_method(req)),
    }
}

/// Resource manager services.
fn resource_service(core: &mut FrameworkCore, req: &ServiceRequest) -> Result<Value, ServiceError> {
    match req.method.as_str() {
        "get_allocation" => {
            let request: AllocationRequest = AllocationRequest {
                owner: req.sender.clone(),
                task_id: TaskId::try_from(req.arg(0)?)?,
                nproc: req.arg(1)?.as_usize()?,
                whole_nodes: req.arg(2)?.as_bool()?,
                whole_sockets: req.arg(3)?.as_bool()?,
                task_ppn: req.arg(4)?.as_usize()?,
            };
            let block: bool = optional_bool(req, 5, false)?;
            match core.rm.get_allocation(&request) {
                Ok(allocation) => Ok(allocation_value(&allocation)),
                Err(e) if e.is_recoverable() && block => Err(ServiceError::Blocked(e.to_string())),
                Err(e) => Err(ServiceError::Failed(e.into())),
            }
        },
        "release_allocation" => {
            let task_id: TaskId = TaskId::try_from(req.arg(0)?)?;
            Ok(Value::Bool(core.rm.release_allocation(task_id)))
        },
        _ => Err(unknown_method(req)),
    }
}

/// Encodes an allocation as `[nodes, ppn, max_ppn, accurate, cores per node]`.
pub fn allocation_value(allocation: &Allocation) -> Value {
    let cores: ValueMap = allocation
        .nodes
        .iter()
        .map(|share| (share.name.clone(), Value::from(share.cores.len())))
        .collect();
    Value::List(vec![
        Value::from(allocation.node_names().iter().map(|n| n.to_string()).collect::<Vec<String>>()),
        Value::from(allocation.ppn),
        Value::from(allocation.max_ppn),
        Value::Bool(allocation.accurate),
        Value::Map(cores),
    ])
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod test {
    use super::*;
    use ::anyhow::Result;

    /// Tests that every service is reachable through the handler table.
    #[test]
    fn test_handler_table() -> Result<()> {
        let table: HashMap<&'static str, ServiceHandler> = handlers();
        let expected: usize =
            CONFIG_SERVICES.len() + DATA_SERVICES.len() + TASK_SERVICES.len() + RESOURCE_SERVICES.len();
        crate::ensure_eq!(table.len(), expected);
        for name in ["get_port", "get_time_loop", "init_task_pool", "merge_current_state", "release_allocation"] {
            crate::ensure_eq!(table.contains_key(name), true);
        }
        crate::ensure_eq!(table.contains_key("emit_event"), false);
        Ok(())
    }

    /// Tests that failures convert into non-retryable service errors.
    #[test]
    fn test_fail_is_not_blocked() -> Result<()> {
        let error: ServiceError = Fail::new(libc::EINVAL, "bad").into();
        crate::ensure_eq!(matches!(error, ServiceError::Failed(_)), true);
        Ok(())
    }
}
