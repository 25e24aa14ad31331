// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    component::{
        Component,
        ComponentId,
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
// Constants
//======================================================================================================================

/// Ports the driver never drives itself.
const ENTRY_PORTS: [&str; 2] = ["DRIVER", "INIT"];

//======================================================================================================================
// Structures
//======================================================================================================================

/// Generic Driver
///
/// Drives every other port of its simulation through the time loop: `init` (or `restart` in RESTART mode) at the
/// first time, `step` at each time, `finalize` at the end. Checkpoints are taken after each step when the simulation
/// has a CHECKPOINT section, and the driver's own OUTPUT_FILES are staged.
#[derive(Default)]
pub struct GenericDriver {
    components: Vec<ComponentId>,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl GenericDriver {
    pub fn new(_config: &ValueMap) -> Result<Self, Fail> {
        Ok(Self::default())
    }

    fn resolve_ports(&mut self, services: &mut Services) -> Result<(), Fail> {
        let ports: Vec<String> = match services.sim_conf().get("PORTS") {
            Some(Value::Map(ports)) => match ports.get("NAMES") {
                Some(names) => names.to_string_list()?,
                None => Vec::new(),
            },
            _ => Vec::new(),
        };
        self.components.clear();
        for port in ports.iter().filter(|port| !ENTRY_PORTS.contains(&port.as_str())) {
            let id: ComponentId = services.get_port(port)?;
            self.components.push(id);
        }
        services.debug(&format!("driving ports {:?}", ports));
        Ok(())
    }

    fn call_all(&self, services: &mut Services, method: &str, timestamp: f64) -> Result<(), Fail> {
        for id in self.components.iter() {
            services.call(id, method, vec![Value::Float(timestamp)])?;
        }
        Ok(())
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Component for GenericDriver {
    fn step(&mut self, services: &mut Services, _timestamp: f64) -> Result<Value, Fail> {
        self.resolve_ports(services)?;
        let time_loop: Vec<f64> = services.get_time_loop()?;
        let (first, last): (f64, f64) = match (time_loop.first(), time_loop.last()) {
            (Some(first), Some(last)) => (*first, *last),
            _ => {
                let cause: String = String::from("empty time loop");
                services.error(&cause);
                return Err(Fail::new(libc::EINVAL, &cause));
            },
        };

        let restart_time: Option<f64> = match services.get_config_param("SIMULATION_MODE", true)? {
            Value::Str(mode) if mode.trim().eq_ignore_ascii_case("RESTART") => {
                Some(services.get_config_param("RESTART_TIME", false)?.as_float()?)
            },
            _ => None,
        };
        match restart_time {
            Some(t) => self.call_all(services, "restart", t)?,
            None => self.call_all(services, "init", first)?,
        }

        let output_files: Vec<String> = match services.config().get("OUTPUT_FILES") {
            Some(files) => files.to_string_list()?,
            None => Vec::new(),
        };
        let checkpointing: bool = services.sim_conf().contains_key("CHECKPOINT");
        for t in time_loop.iter().copied().filter(|t| restart_time.map_or(true, |r| *t > r)) {
            services.update_time_stamp(t);
            self.call_all(services, "step", t)?;
            if checkpointing {
                services.checkpoint_components(&self.components, t, false, false)?;
            }
            if !output_files.is_empty() {
                services.stage_output_files(t, &output_files, false, false)?;
            }
        }

        self.call_all(services, "finalize", last)?;
        Ok(Value::None)
    }
}
