// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

#![cfg_attr(feature = "strict", deny(warnings))]
#![deny(clippy::all)]

#[macro_use]
extern crate log;

pub mod component;
pub mod config;
pub mod events;
pub mod framework;
pub mod resource;
pub mod runtime;
pub mod services;
pub mod task;

//======================================================================================================================
// Exports
//======================================================================================================================

pub use self::{
    component::{
        Component,
        ComponentFactory,
        ComponentId,
    },
    framework::{
        Framework,
        FrameworkOptions,
    },
    runtime::{
        fail::Fail,
        value::{
            Value,
            ValueMap,
        },
    },
    services::Services,
};

//======================================================================================================================
// Macros
//======================================================================================================================

/// Fails the enclosing `anyhow` function when the two expressions differ.
#[macro_export]
macro_rules! ensure_eq {
    ($left:expr, $right:expr $(,)?) => {{
        match (&$left, &$right) {
            (left, right) => {
                if !(*left == *right) {
                    ::anyhow::bail!(
                        "ensure failed: `(left == right)` left: `{:?}`, right: `{:?}` at {}:{}",
                        left,
                        right,
                        file!(),
                        line!()
                    );
                }
            },
        }
    }};
}

/// Fails the enclosing `anyhow` function when the two expressions are equal.
#[macro_export]
macro_rules! ensure_neq {
    ($left:expr, $right:expr $(,)?) => {{
        match (&$left, &$right) {
            (left, right) => {
                if *left == *right {
                    ::anyhow::bail!(
                        "ensure failed: `(left != right)` left: `{:?}`, right: `{:?}` at {}:{}",
                        left,
                        right,
                        file!(),
                        line!()
                    );
                }
            },
        }
    }};
}
