// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

mod generic_driver;
mod runspace_init;
mod task_runner;

//======================================================================================================================
// Exports
//======================================================================================================================

pub use self::{
    generic_driver::GenericDriver,
    runspace_init::RunspaceInit,
    task_runner::TaskRunner,
};

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    component::{
        Component,
        ComponentFactory,
    },
    config::RUNSPACE_INIT_NAME,
    runtime::{
        fail::Fail,
        value::ValueMap,
    },
};

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Registers the components shipped with the framework.
pub fn register(factory: &mut ComponentFactory) {
    factory.register(RUNSPACE_INIT_NAME, |config: &ValueMap| -> Result<Box<dyn Component>, Fail> {
        Ok(Box::new(RunspaceInit::new(config)?))
    });
    factory.register("generic_driver", |config: &ValueMap| -> Result<Box<dyn Component>, Fail> {
        Ok(Box::new(GenericDriver::new(config)?))
    });
    factory.register("task_runner", |config: &ValueMap| -> Result<Box<dyn Component>, Fail> {
        Ok(Box::new(TaskRunner::new(config)?))
    });
}
