// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use crate::{
    component::Component,
    runtime::{
        fail::Fail,
        value::ValueMap,
    },
};
use ::std::{
    collections::HashMap,
    sync::Arc,
};

//==============================================================================
// Structures
//==============================================================================

/// Builds a component from its configuration section.
pub type ComponentBuilder = Arc<dyn Fn(&ValueMap) -> Result<Box<dyn Component>, Fail> + Send + Sync>;

/// Component implementations, looked up by the `NAME` of a configuration
/// section.
#[derive(Clone, Default)]
pub struct ComponentFactory {
    builders: HashMap<String, ComponentBuilder>,
}

//==============================================================================
// Associate Functions
//==============================================================================

impl ComponentFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory preloaded with the framework's own components.
    pub fn with_builtins() -> Self {
        let mut factory: Self = Self::new();
        crate::component::builtin::register(&mut factory);
        factory
    }

    /// Registers `builder` under `name`, replacing any earlier registration.
    pub fn register<F>(&mut self, name: impl Into<String>, builder: F)
    where
        F: Fn(&ValueMap) -> Result<Box<dyn Component>, Fail> + Send + Sync + 'static,
    {
        self.builders.insert(name.into(), Arc::new(builder));
    }

    pub fn unregister(&mut self, name: &str) -> bool {
        self.builders.remove(name).is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.builders.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.builders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.builders.is_empty()
    }

    /// Instantiates the implementation registered under `name`.
    pub fn create(&self, name: &str, config: &ValueMap) -> Result<Box<dyn Component>, Fail> {
        match self.builders.get(name) {
            Some(builder) => builder(config),
            None => {
                let cause: String = format!("no component implementation named {:?}", name);
                error!("create(): {}", cause);
                Err(Fail::new(libc::ENOENT, &cause))
            },
        }
    }
}
