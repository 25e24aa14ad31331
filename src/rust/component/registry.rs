// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use crate::{
    component::ComponentId,
    runtime::{
        fail::Fail,
        message::{
            Message,
            ServiceResponse,
        },
        value::ValueMap,
    },
};
use ::crossbeam_channel::Sender;
use ::std::{
    collections::HashMap,
    thread::JoinHandle,
};

//==============================================================================
// Structures
//==============================================================================

/// Everything the framework knows about one worker.
pub struct RegistryEntry {
    /// Inbox of the worker.
    pub invocation_q: Sender<Message>,
    /// Where service responses for the worker go.
    pub response_q: Sender<ServiceResponse>,
    /// Configuration section of the component.
    pub config: ValueMap,
    /// Thread running the worker, if it is still attached.
    pub worker: Option<JoinHandle<()>>,
}

/// Component Registry
#[derive(Default)]
pub struct ComponentRegistry {
    entries: HashMap<ComponentId, RegistryEntry>,
}

//==============================================================================
// Associate Functions
//==============================================================================

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a worker. Identifiers are unique, so a clash is an error.
    pub fn add(&mut self, id: ComponentId, entry: RegistryEntry) -> Result<(), Fail> {
        if self.entries.contains_key(&id) {
            let cause: String = format!("component {} already registered", id);
            error!("add(): {}", cause);
            return Err(Fail::new(libc::EEXIST, &cause));
        }
        self.entries.insert(id, entry);
        Ok(())
    }

    pub fn remove(&mut self, id: &ComponentId) -> Option<RegistryEntry> {
        self.entries.remove(id)
    }

    pub fn get(&self, id: &ComponentId) -> Result<&RegistryEntry, Fail> {
        match self.entries.get(id) {
            Some(entry) => Ok(entry),
            None => {
                let cause: String = format!("unknown component {}", id);
                error!("get(): {}", cause);
                Err(Fail::new(libc::EBADF, &cause))
            },
        }
    }

    pub fn contains(&self, id: &ComponentId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Identifiers of the workers of `sim_name`, in creation order.
    pub fn component_ids(&self, sim_name: &str) -> Vec<ComponentId> {
        let mut ids: Vec<ComponentId> = self.entries.keys().filter(|id| id.sim_name() == sim_name).cloned().collect();
        ids.sort_by_key(ComponentId::seq_num);
        ids
    }

    /// Delivers a message to the inbox of `id`.
    pub fn send_invoke(&self, id: &ComponentId, msg: Message) -> Result<(), Fail> {
        if self.get(id)?.invocation_q.send(msg).is_err() {
            let cause: String = format!("worker {} is gone", id);
            error!("send_invoke(): {}", cause);
            return Err(Fail::new(libc::EPIPE, &cause));
        }
        Ok(())
    }

    /// Delivers a service response to its receiver.
    pub fn send_response(&self, response: ServiceResponse) -> Result<(), Fail> {
        let receiver: ComponentId = response.receiver.clone();
        if self.get(&receiver)?.response_q.send(response).is_err() {
            let cause: String = format!("worker {} is gone", receiver);
            error!("send_response(): {}", cause);
            return Err(Fail::new(libc::EPIPE, &cause));
        }
        Ok(())
    }
}

//==============================================================================
// Unit Tests
//==============================================================================
