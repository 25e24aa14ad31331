// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    component::{
        factory::ComponentFactory,
        registry::RegistryEntry,
        Component,
        ComponentId,
    },
    events::MonitorEvent,
    runtime::{
        fail::Fail,
        message::{
            Message,
            MethodInvoke,
            MethodResult,
            ServiceResponse,
            Status,
        },
        value::{
            Value,
            ValueMap,
        },
    },
    services::Services,
};
use ::crossbeam_channel::{
    Receiver,
    Sender,
};
use ::std::{
    any::Any,
    panic::{
        self,
        AssertUnwindSafe,
    },
    thread::{
        self,
        JoinHandle,
    },
    time::{
        Duration,
        Instant,
    },
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// How long [detach] waits for a worker thread to wind down.
const DETACH_GRACE: Duration = Duration::from_millis(500);

const DETACH_POLL: Duration = Duration::from_millis(10);

//======================================================================================================================
// Structures
//======================================================================================================================

/// What every worker shares with the framework.
#[derive(Clone)]
pub struct WorkerContext {
    /// Identity of the framework, the target of service requests.
    pub fwk_id: ComponentId,
    /// Framework in-queue.
    pub fwk_tx: Sender<Message>,
    /// Framework event queue.
    pub event_tx: Sender<MonitorEvent>,
    /// When the framework started.
    pub start: Instant,
}

/// Creates workers: a component instance plus the thread serving its invocation queue.
pub struct WorkerSpawner {
    context: WorkerContext,
    factory: ComponentFactory,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl WorkerSpawner {
    pub fn new(context: WorkerContext, factory: ComponentFactory) -> Self {
        Self { context, factory }
    }

    pub fn context(&self) -> &WorkerContext {
        &self.context
    }

    pub fn factory(&self) -> &ComponentFactory {
        &self.factory
    }

    /// Instantiates the component named by `config` and starts serving it as `id`.
    pub fn spawn(&self, id: ComponentId, config: ValueMap, sim_conf: ValueMap) -> Result<RegistryEntry, Fail> {
        let name: String = match config.get("NAME") {
            Some(name) => name.to_string(),
            None => {
                let cause: String = format!("component section of {} has no NAME", id);
                error!("spawn(): {}", cause);
                return Err(Fail::new(libc::EINVAL, &cause));
            },
        };
        let component: Box<dyn Component> = self.factory.create(&name, &config)?;

        let (invocation_tx, invocation_rx): (Sender<Message>, Receiver<Message>) = crossbeam_channel::unbounded();
        let (response_tx, response_rx): (Sender<ServiceResponse>, Receiver<ServiceResponse>) =
            crossbeam_channel::unbounded();
        let services: Services =
            Services::new(id.clone(), config.clone(), sim_conf, self.context.clone(), response_rx)?;

        let worker: JoinHandle<()> = match thread::Builder::new()
            .name(id.to_string())
            .spawn(move || serve(component, services, invocation_rx))
        {
            Ok(handle) => handle,
            Err(e) => {
                let cause: String = format!("cannot start worker {} ({})", id, e);
                error!("spawn(): {}", cause);
                return Err(Fail::new(libc::EAGAIN, &cause));
            },
        };
        debug!("spawn(): worker {} started for {}", id, name);

        Ok(RegistryEntry {
            invocation_q: invocation_tx,
            response_q: response_tx,
            config,
            worker: Some(worker),
        })
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Lets go of a worker removed from the registry. Asks it to exit and waits briefly for its thread.
pub fn detach(id: &ComponentId, mut entry: RegistryEntry) {
    let _ = entry.invocation_q.send(Message::Exit {
        id: crate::runtime::message::MessageId::next(),
        status: Status::Success,
    });
    if let Some(worker) = entry.worker.take() {
        let deadline: Instant = Instant::now() + DETACH_GRACE;
        while !worker.is_finished() && Instant::now() < deadline {
            thread::sleep(DETACH_POLL);
        }
        if worker.is_finished() {
            if worker.join().is_err() {
                warn!("detach(): worker {} panicked", id);
            }
        } else {
            warn!("detach(): worker {} is still busy, leaving it behind", id);
        }
    }
}

/// Worker main loop.
fn serve(mut component: Box<dyn Component>, mut services: Services, inbox: Receiver<Message>) {
    let id: ComponentId = services.component_id().clone();
    trace!("serve(): worker {} waiting for invocations", id);
    loop {
        let msg: Message = match inbox.recv() {
            Ok(msg) => msg,
            Err(_) => {
                debug!("serve(): inbox of {} closed", id);
                break;
            },
        };
        match msg {
            Message::MethodInvoke(invoke) if invoke.method == "terminate" => {
                let status: Status = match invoke.args.first() {
                    Some(value) => Status::try_from(value).unwrap_or(Status::Failure),
                    None => Status::Success,
                };
                let outcome: Result<Result<(), Fail>, Box<dyn Any + Send>> =
                    panic::catch_unwind(AssertUnwindSafe(|| component.terminate(&mut services, status)));
                match outcome {
                    Ok(Ok(())) => (),
                    Ok(Err(e)) => warn!("serve(): terminate of {} failed: {:?}", id, e),
                    Err(panic) => warn!("serve(): terminate of {} panicked: {}", id, panic_message(&panic)),
                }
                services.cleanup();
                debug!("serve(): worker {} terminated with status {}", id, status);
                return;
            },
            Message::MethodInvoke(invoke) => {
                let result: Result<Value, Fail> = dispatch(component.as_mut(), &mut services, &invoke);
                if let Err(e) = &result {
                    error!("serve(): {}.{}() failed: {:?}", id, invoke.method, e);
                }
                let reply: MethodResult = MethodResult::reply(&invoke, result);
                if services.send_to_framework(Message::MethodResult(reply)).is_err() {
                    warn!("serve(): framework gone, worker {} exits", id);
                    break;
                }
            },
            Message::Exit { status, .. } => {
                debug!("serve(): worker {} asked to exit ({})", id, status);
                break;
            },
            other => warn!("serve(): worker {} ignores message {}", id, other.id()),
        }
    }
    services.cleanup();
}

/// Runs one invocation, trapping panics.
fn dispatch(component: &mut dyn Component, services: &mut Services, invoke: &MethodInvoke) -> Result<Value, Fail> {
    let timestamp: f64 = match invoke.args.first() {
        Some(value) => value.as_float().unwrap_or(0.0),
        None => 0.0,
    };
    services.begin_invocation(&invoke.method);
    let outcome: Result<Result<Value, Fail>, Box<dyn Any + Send>> =
        panic::catch_unwind(AssertUnwindSafe(|| match invoke.method.as_str() {
            "init" => component.init(services, timestamp),
            "step" => component.step(services, timestamp),
            "finalize" => component.finalize(services, timestamp),
            "restart" => component.restart(services, timestamp),
            "checkpoint" => component.checkpoint(services, timestamp),
            method => component.invoke(services, method, &invoke.args, &invoke.kwargs),
        }));
    services.end_invocation();
    match outcome {
        Ok(result) => result,
        Err(panic) => {
            let cause: String = format!("{}() panicked: {}", invoke.method, panic_message(&panic));
            error!("dispatch(): {}", cause);
            Err(Fail::new(libc::EFAULT, &cause))
        },
    }
}

fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        String::from("unknown panic")
    }
}
