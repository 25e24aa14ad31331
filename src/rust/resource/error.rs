// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use crate::runtime::fail::Fail;
use ::std::{
    error,
    fmt,
};

//==============================================================================
// Structures
//==============================================================================

/// Reasons an allocation request cannot be satisfied.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AllocationError {
    /// The request fits the machine but not its current occupancy.
    Insufficient { nproc: usize, ppn: usize },
    /// More processes than cores exist.
    BadRequest { nproc: usize, total_cores: usize },
    /// Enough cores exist, but not with the requested layout.
    Mismatch { nproc: usize, ppn: usize },
}

//==============================================================================
// Associate Functions
//==============================================================================

impl AllocationError {
    /// Whether waiting for releases could let the request through.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, AllocationError::Insufficient { .. })
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

impl fmt::Display for AllocationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocationError::Insufficient { nproc, ppn } => {
                write!(f, "insufficient resources for {} processes at {} per node", nproc, ppn)
            },
            AllocationError::BadRequest { nproc, total_cores } => write!(
                f,
                "bad resource request: {} processes exceed {} cores",
                nproc, total_cores
            ),
            AllocationError::Mismatch { nproc, ppn } => write!(
                f,
                "resource request mismatch: {} processes cannot be laid out at {} per node",
                nproc, ppn
            ),
        }
    }
}

impl error::Error for AllocationError {}

impl From<AllocationError> for Fail {
    fn from(e: AllocationError) -> Self {
        let errno: i32 = match e {
            AllocationError::Insufficient { .. } => libc::EAGAIN,
            AllocationError::BadRequest { .. } => libc::EINVAL,
            AllocationError::Mismatch { .. } => libc::ERANGE,
        };
        Fail::new(errno, &e.to_string())
    }
}
