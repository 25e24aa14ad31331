// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use crate::runtime::fail::Fail;
use ::std::{
    fmt,
    str::FromStr,
    sync::atomic::{
        AtomicU64,
        Ordering,
    },
};

//==============================================================================
// Static Variables
//==============================================================================

/// Sequence numbers are unique across every simulation in the process.
static NEXT_SEQ_NUM: AtomicU64 = AtomicU64::new(0);

//==============================================================================
// Structures
//==============================================================================

/// Component Identifier
///
/// Assigned when a worker is created and never changed afterwards. The
/// framework itself is identified by the class name [ComponentId::FRAMEWORK_CLASS].
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct ComponentId {
    class_name: String,
    sim_name: String,
    seq_num: u64,
}

//==============================================================================
// Associate Functions
//==============================================================================

impl ComponentId {
    pub const FRAMEWORK_CLASS: &'static str = "FRAMEWORK";

    /// Creates a fresh identifier with the next sequence number.
    pub fn new(class_name: &str, sim_name: &str) -> Self {
        Self {
            class_name: class_name.to_string(),
            sim_name: sim_name.to_string(),
            seq_num: NEXT_SEQ_NUM.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Identifier of the framework acting within simulation `sim_name`.
    pub fn framework(sim_name: &str) -> Self {
        Self::new(Self::FRAMEWORK_CLASS, sim_name)
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn sim_name(&self) -> &str {
        &self.sim_name
    }

    pub fn seq_num(&self) -> u64 {
        self.seq_num
    }

    pub fn is_framework(&self) -> bool {
        self.class_name == Self::FRAMEWORK_CLASS
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

/// Serialized form `<sim>@<class>@<seq>`.
impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}@{}", self.sim_name, self.class_name, self.seq_num)
    }
}

impl FromStr for ComponentId {
    type Err = Fail;

    fn from_str(s: &str) -> Result<Self, Fail> {
        let parts: Vec<&str> = s.rsplitn(3, '@').collect();
        if let [seq, class_name, sim_name] = parts[..] {
            if let Ok(seq_num) = seq.parse::<u64>() {
                return Ok(Self {
                    class_name: class_name.to_string(),
                    sim_name: sim_name.to_string(),
                    seq_num,
                });
            }
        }
        let cause: String = format!("malformed component id {:?}", s);
        error!("from_str(): {}", cause);
        Err(Fail::new(libc::EINVAL, &cause))
    }
}

//==============================================================================
// Unit Tests
//==============================================================================
