// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use crate::{
    component::ComponentId,
    runtime::{
        fail::Fail,
        message::CallId,
        value::Value,
    },
};
use ::std::collections::HashMap;

//==============================================================================
// Structures
//==============================================================================

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CallState {
    Pending,
    Finished,
}

/// Cross-component invocation tracked on behalf of its caller.
#[derive(Clone, Debug)]
pub struct Call {
    pub call_id: CallId,
    pub caller: ComponentId,
    pub callee: ComponentId,
    pub method: String,
    pub args: Vec<Value>,
    pub state: CallState,
    pub result: Option<Result<Value, Fail>>,
}

/// Outstanding and finished calls.
#[derive(Default)]
pub struct CallTable {
    outstanding: HashMap<CallId, Call>,
    finished: HashMap<CallId, Call>,
}

//==============================================================================
// Associate Functions
//==============================================================================

impl CallTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, call: Call) {
        self.outstanding.insert(call.call_id, call);
    }

    /// Records the outcome of an outstanding call. Returns `false` for calls
    /// this table does not know about.
    pub fn complete(&mut self, call_id: CallId, result: Result<Value, Fail>) -> bool {
        match self.outstanding.remove(&call_id) {
            Some(mut call) => {
                call.state = CallState::Finished;
                call.result = Some(result);
                self.finished.insert(call_id, call);
                true
            },
            None => false,
        }
    }

    /// Hands out the outcome of a finished call, forgetting it.
    pub fn take_finished(&mut self, call_id: CallId) -> Option<Call> {
        self.finished.remove(&call_id)
    }

    pub fn state(&self, call_id: CallId) -> Option<CallState> {
        if self.outstanding.contains_key(&call_id) {
            Some(CallState::Pending)
        } else if self.finished.contains_key(&call_id) {
            Some(CallState::Finished)
        } else {
            None
        }
    }

    /// Drops every call made by or to a component of `sim_name`.
    pub fn forget_simulation(&mut self, sim_name: &str) {
        let keep = |call: &Call| call.caller.sim_name() != sim_name && call.callee.sim_name() != sim_name;
        self.outstanding.retain(|_, c| keep(c));
        self.finished.retain(|_, c| keep(c));
    }

    pub fn outstanding_len(&self) -> usize {
        self.outstanding.len()
    }
}

//==============================================================================
// Unit Tests
//==============================================================================
