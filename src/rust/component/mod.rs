// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

pub mod builtin;
pub mod factory;
pub mod id;
pub mod registry;
pub mod worker;

//======================================================================================================================
// Exports
//======================================================================================================================

pub use self::{
    factory::ComponentFactory,
    id::ComponentId,
    registry::ComponentRegistry,
};

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    runtime::{
        fail::Fail,
        message::Status,
        value::{
            Value,
            ValueMap,
        },
    },
    services::Services,
};

//======================================================================================================================
// Traits
//======================================================================================================================

/// Component
///
/// User code hosted by a worker. The framework drives `init`, `step` and `finalize`; other components reach the rest
/// through [Component::invoke]. Every method receives the worker's [Services].
pub trait Component: Send {
    fn init(&mut self, _services: &mut Services, _timestamp: f64) -> Result<Value, Fail> {
        Ok(Value::None)
    }

    fn step(&mut self, _services: &mut Services, _timestamp: f64) -> Result<Value, Fail> {
        Ok(Value::None)
    }

    fn finalize(&mut self, _services: &mut Services, _timestamp: f64) -> Result<Value, Fail> {
        Ok(Value::None)
    }

    fn restart(&mut self, _services: &mut Services, _timestamp: f64) -> Result<Value, Fail> {
        Ok(Value::None)
    }

    fn checkpoint(&mut self, _services: &mut Services, _timestamp: f64) -> Result<Value, Fail> {
        Ok(Value::None)
    }

    /// Last call before the worker exits. Running tasks are killed afterwards regardless of the outcome.
    fn terminate(&mut self, _services: &mut Services, _status: Status) -> Result<(), Fail> {
        Ok(())
    }

    /// Any other method, by name.
    fn invoke(
        &mut self,
        _services: &mut Services,
        method: &str,
        _args: &[Value],
        _kwargs: &ValueMap,
    ) -> Result<Value, Fail> {
        let cause: String = format!("component does not implement method {:?}", method);
        error!("invoke(): {}", cause);
        Err(Fail::new(libc::ENOSYS, &cause))
    }
}
