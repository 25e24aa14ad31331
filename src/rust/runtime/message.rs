// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use crate::{
    component::ComponentId,
    runtime::{
        fail::Fail,
        value::{
            Value,
            ValueMap,
        },
    },
};
use ::std::{
    fmt,
    sync::atomic::{
        AtomicU64,
        Ordering,
    },
};

//==============================================================================
// Static Variables
//==============================================================================

/// Source of message sequence numbers.
static NEXT_MESSAGE_SEQ: AtomicU64 = AtomicU64::new(1);

//==============================================================================
// Structures
//==============================================================================

/// Message Identifier
///
/// Unique across the process: a monotone counter paired with the framework pid.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct MessageId {
    pid: u32,
    seq: u64,
}

/// Call Identifier
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct CallId(u64);

/// Task Identifier
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

/// Completion status carried by results and `terminate`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Status {
    Success,
    Failure,
}

/// Request for a framework service, sent by a worker to the framework in-queue.
#[derive(Clone, Debug)]
pub struct ServiceRequest {
    pub id: MessageId,
    pub sender: ComponentId,
    /// Component the service acts upon; the framework itself for most services.
    pub target: ComponentId,
    pub method: String,
    pub args: Vec<Value>,
    pub kwargs: ValueMap,
}

/// Answer to a [ServiceRequest], delivered to the sender's response queue.
#[derive(Clone, Debug)]
pub struct ServiceResponse {
    pub id: MessageId,
    pub sender: ComponentId,
    pub receiver: ComponentId,
    pub request_id: MessageId,
    pub result: Result<Value, Fail>,
}

/// Invocation of a component method, delivered to the callee's invocation queue.
#[derive(Clone, Debug)]
pub struct MethodInvoke {
    pub id: MessageId,
    pub caller: ComponentId,
    pub callee: ComponentId,
    pub call_id: CallId,
    pub method: String,
    pub args: Vec<Value>,
    pub kwargs: ValueMap,
}

/// Outcome of a [MethodInvoke], sent by the callee to the framework in-queue.
#[derive(Clone, Debug)]
pub struct MethodResult {
    pub id: MessageId,
    pub callee: ComponentId,
    pub caller: ComponentId,
    pub call_id: CallId,
    pub result: Result<Value, Fail>,
}

/// Messages flowing through framework and worker queues.
#[derive(Clone, Debug)]
pub enum Message {
    ServiceRequest(ServiceRequest),
    ServiceResponse(ServiceResponse),
    MethodInvoke(MethodInvoke),
    MethodResult(MethodResult),
    Exit { id: MessageId, status: Status },
}

//==============================================================================
// Associate Functions
//==============================================================================

impl MessageId {
    /// Draws a fresh message identifier.
    pub fn next() -> Self {
        Self {
            pid: ::std::process::id(),
            seq: NEXT_MESSAGE_SEQ.fetch_add(1, Ordering::Relaxed),
        }
    }
}

impl ServiceRequest {
    pub fn new(sender: ComponentId, target: ComponentId, method: &str, args: Vec<Value>) -> Self {
        Self {
            id: MessageId::next(),
            sender,
            target,
            method: method.to_string(),
            args,
            kwargs: ValueMap::new(),
        }
    }

    /// Positional argument `ix`, failing when absent.
    pub fn arg(&self, ix: usize) -> Result<&Value, Fail> {
        match self.args.get(ix) {
            Some(v) => Ok(v),
            None => {
                let cause: String = format!("{}(): missing argument {}", self.method, ix);
                Err(Fail::new(libc::EINVAL, &cause))
            },
        }
    }

    /// Keyword argument `name`, `Value::None` when absent.
    pub fn kwarg(&self, name: &str) -> &Value {
        self.kwargs.get(name).unwrap_or(&Value::None)
    }
}

impl ServiceResponse {
    /// Builds the answer to `request`, sent on behalf of `sender`.
    pub fn reply(sender: ComponentId, request: &ServiceRequest, result: Result<Value, Fail>) -> Self {
        Self {
            id: MessageId::next(),
            sender,
            receiver: request.sender.clone(),
            request_id: request.id,
            result,
        }
    }

    pub fn status(&self) -> Status {
        Status::of(&self.result)
    }
}

impl MethodResult {
    /// Builds the outcome of `invoke`.
    pub fn reply(invoke: &MethodInvoke, result: Result<Value, Fail>) -> Self {
        Self {
            id: MessageId::next(),
            callee: invoke.callee.clone(),
            caller: invoke.caller.clone(),
            call_id: invoke.call_id,
            result,
        }
    }

    pub fn status(&self) -> Status {
        Status::of(&self.result)
    }
}

impl Status {
    pub fn of<T>(result: &Result<T, Fail>) -> Self {
        match result {
            Ok(_) => Status::Success,
            Err(_) => Status::Failure,
        }
    }
}

impl Message {
    pub fn id(&self) -> MessageId {
        match self {
            Message::ServiceRequest(m) => m.id,
            Message::ServiceResponse(m) => m.id,
            Message::MethodInvoke(m) => m.id,
            Message::MethodResult(m) => m.id,
            Message::Exit { id, .. } => *id,
        }
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.pid, self.seq)
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Success => write!(f, "SUCCESS"),
            Status::Failure => write!(f, "FAILURE"),
        }
    }
}

impl From<u64> for CallId {
    fn from(value: u64) -> Self {
        CallId(value)
    }
}

impl From<CallId> for u64 {
    fn from(value: CallId) -> Self {
        value.0
    }
}

impl From<u64> for TaskId {
    fn from(value: u64) -> Self {
        TaskId(value)
    }
}

impl From<TaskId> for u64 {
    fn from(value: TaskId) -> Self {
        value.0
    }
}

impl From<CallId> for Value {
    fn from(value: CallId) -> Self {
        Value::Int(value.0 as i64)
    }
}

impl From<TaskId> for Value {
    fn from(value: TaskId) -> Self {
        Value::Int(value.0 as i64)
    }
}

impl TryFrom<&Value> for CallId {
    type Error = Fail;

    fn try_from(value: &Value) -> Result<Self, Fail> {
        Ok(CallId(value.as_int()? as u64))
    }
}

impl TryFrom<&Value> for TaskId {
    type Error = Fail;

    fn try_from(value: &Value) -> Result<Self, Fail> {
        Ok(TaskId(value.as_int()? as u64))
    }
}

impl TryFrom<&Value> for Status {
    type Error = Fail;

    fn try_from(value: &Value) -> Result<Self, Fail> {
        match value.as_str()?.to_uppercase().as_str() {
            "SUCCESS" => Ok(Status::Success),
            "FAILURE" => Ok(Status::Failure),
            other => Err(Fail::new(libc::EINVAL, &format!("unknown status {:?}", other))),
        }
    }
}

impl From<Status> for Value {
    fn from(value: Status) -> Self {
        Value::Str(value.to_string())
    }
}
