// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

pub mod fail;
pub mod logging;
pub mod message;
pub mod value;

pub use self::{
    fail::Fail,
    message::{
        CallId,
        Message,
        MessageId,
        MethodInvoke,
        MethodResult,
        ServiceRequest,
        ServiceResponse,
        Status,
        TaskId,
    },
    value::{
        Value,
        ValueMap,
    },
};
