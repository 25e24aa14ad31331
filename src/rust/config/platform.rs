// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    config::yaml::{
        interpolate,
        merge_absent,
        ConfigFile,
    },
    resource::detect::{
        DetectionSettings,
        NodeDetection,
    },
    runtime::{
        fail::Fail,
        value::{
            Value,
            ValueMap,
        },
    },
};
use ::std::{
    ffi::CStr,
    os::raw::c_char,
    path::{
        Path,
        PathBuf,
    },
    time::Duration,
};

//======================================================================================================================
// Constants
//======================================================================================================================

mod platform_keys {
    pub const MPIRUN: &str = "MPIRUN";
    pub const MPIRUN_VERSION: &str = "MPIRUN_VERSION";
    pub const NODE_DETECTION: &str = "NODE_DETECTION";
    pub const CORES_PER_NODE: &str = "CORES_PER_NODE";
    pub const SOCKETS_PER_NODE: &str = "SOCKETS_PER_NODE";
    pub const NODE_ALLOCATION_MODE: &str = "NODE_ALLOCATION_MODE";
    pub const HOST: &str = "HOST";
    pub const USER: &str = "USER";
    pub const USE_ACCURATE_NODES: &str = "USE_ACCURATE_NODES";
    pub const TOTAL_PROCS: &str = "TOTAL_PROCS";
    pub const NODES: &str = "NODES";
    pub const PROCS_PER_NODE: &str = "PROCS_PER_NODE";
    pub const METHOD_RESULT_TIMEOUT: &str = "METHOD_RESULT_TIMEOUT";
    pub const USE_PORTAL: &str = "USE_PORTAL";
}

/// Keys every platform file must define.
pub const REQUIRED_PLATFORM_KEYS: [&str; 6] = [
    platform_keys::MPIRUN,
    platform_keys::NODE_DETECTION,
    platform_keys::CORES_PER_NODE,
    platform_keys::SOCKETS_PER_NODE,
    platform_keys::NODE_ALLOCATION_MODE,
    platform_keys::HOST,
];

const DEFAULT_MPIRUN_VERSION: &str = "OpenMPI-generic";

//======================================================================================================================
// Structures
//======================================================================================================================

/// Node sharing policy.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AllocationMode {
    /// A task owns every core of the nodes it lands on.
    Exclusive,
    /// Tasks may share nodes core by core.
    Shared,
}

/// Platform Configuration
///
/// The platform mapping after defaults and environment merging. Simulations see it as their lowest-precedence layer.
#[derive(Clone, Debug)]
pub struct PlatformConfig {
    path: PathBuf,
    conf: ValueMap,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl AllocationMode {
    pub fn parse(text: &str) -> Option<Self> {
        match text.trim().to_uppercase().as_str() {
            "EXCLUSIVE" => Some(AllocationMode::Exclusive),
            "SHARED" => Some(AllocationMode::Shared),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AllocationMode::Exclusive => "EXCLUSIVE",
            AllocationMode::Shared => "SHARED",
        }
    }
}

impl PlatformConfig {
    /// Loads the platform file at `path`, filling in defaults and absent environment variables.
    pub fn load(path: &Path, env: &ValueMap) -> Result<Self, Fail> {
        let file: ConfigFile = ConfigFile::new(path)?;
        for key in REQUIRED_PLATFORM_KEYS {
            ConfigFile::get_option(file.root(), key)?;
        }
        ConfigFile::get_typed_str_option(file.root(), platform_keys::NODE_ALLOCATION_MODE, AllocationMode::parse)?;
        if !file.root()[platform_keys::USE_PORTAL].is_badvalue() {
            ConfigFile::get_bool_option(file.root(), platform_keys::USE_PORTAL)?;
        }
        Self::from_map(file.to_map()?, path, env)
    }

    /// Builds a platform configuration from an already parsed mapping.
    pub fn from_map(mut conf: ValueMap, path: &Path, env: &ValueMap) -> Result<Self, Fail> {
        for key in REQUIRED_PLATFORM_KEYS {
            if !conf.contains_key(key) {
                let cause: String = format!("missing platform parameter {} in {:?}", key, path);
                error!("from_map(): {}", cause);
                return Err(Fail::new(libc::EINVAL, &cause));
            }
        }

        let host_is_empty: bool = match conf.get(platform_keys::HOST) {
            Some(Value::Str(s)) => s.trim().is_empty(),
            Some(Value::None) | None => true,
            Some(_) => false,
        };
        if host_is_empty {
            conf.insert(platform_keys::HOST.to_string(), Value::Str(hostname()));
        }
        if !conf.contains_key(platform_keys::USER) {
            let user: Value = env.get(platform_keys::USER).cloned().unwrap_or(Value::from("UNKNOWN"));
            conf.insert(platform_keys::USER.to_string(), user);
        }

        let defaults: [(&str, Value); 7] = [
            (platform_keys::MPIRUN_VERSION, Value::from(DEFAULT_MPIRUN_VERSION)),
            (platform_keys::USE_ACCURATE_NODES, Value::from("ON")),
            (platform_keys::TOTAL_PROCS, Value::Int(0)),
            (platform_keys::NODES, Value::Int(0)),
            (platform_keys::PROCS_PER_NODE, Value::Int(0)),
            (platform_keys::CORES_PER_NODE, Value::Int(0)),
            (platform_keys::SOCKETS_PER_NODE, Value::Int(0)),
        ];
        for (key, value) in defaults {
            conf.entry(key.to_string()).or_insert(value);
        }
        merge_absent(&mut conf, env);
        interpolate(&mut conf);

        let config: Self = Self {
            path: path.to_path_buf(),
            conf,
        };
        config.allocation_mode()?;
        config.detection_settings()?;
        Ok(config)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The merged platform mapping.
    pub fn conf(&self) -> &ValueMap {
        &self.conf
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.conf.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.conf.contains_key(key)
    }

    /// Replaces a platform parameter, as simulation files are allowed to.
    pub fn set(&mut self, key: &str, value: Value) {
        self.conf.insert(key.to_string(), value);
    }

    pub fn host(&self) -> String {
        self.str_or(platform_keys::HOST, "")
    }

    pub fn mpirun(&self) -> String {
        self.str_or(platform_keys::MPIRUN, "eval")
    }

    pub fn mpirun_version(&self) -> String {
        self.str_or(platform_keys::MPIRUN_VERSION, DEFAULT_MPIRUN_VERSION)
    }

    pub fn node_detection(&self) -> NodeDetection {
        NodeDetection::parse(&self.str_or(platform_keys::NODE_DETECTION, ""))
    }

    pub fn allocation_mode(&self) -> Result<AllocationMode, Fail> {
        let mode: String = self.str_or(platform_keys::NODE_ALLOCATION_MODE, "");
        match AllocationMode::parse(&mode) {
            Some(mode) => Ok(mode),
            None => {
                let cause: String = format!("invalid NODE_ALLOCATION_MODE {:?} (expected EXCLUSIVE or SHARED)", mode);
                error!("allocation_mode(): {}", cause);
                Err(Fail::new(libc::EINVAL, &cause))
            },
        }
    }

    /// `USE_ACCURATE_NODES` holds unless spelled OFF or FALSE.
    pub fn use_accurate_nodes(&self) -> bool {
        let setting: String = self.str_or(platform_keys::USE_ACCURATE_NODES, "ON").to_uppercase();
        !matches!(setting.trim(), "OFF" | "FALSE")
    }

    /// Counts handed to node detection.
    pub fn detection_settings(&self) -> Result<DetectionSettings, Fail> {
        Ok(DetectionSettings {
            nodes: self.count(platform_keys::NODES)?,
            procs_per_node: self.count(platform_keys::PROCS_PER_NODE)?,
            total_procs: self.count(platform_keys::TOTAL_PROCS)?,
            cores_per_node: self.count(platform_keys::CORES_PER_NODE)?,
            sockets_per_node: self.count(platform_keys::SOCKETS_PER_NODE)?,
        })
    }

    pub fn procs_per_node(&self) -> Result<usize, Fail> {
        self.count(platform_keys::PROCS_PER_NODE)
    }

    /// Wait budget for a single method result. An environment variable of the same name overrides the file.
    pub fn method_result_timeout(&self) -> Result<Option<Duration>, Fail> {
        let seconds: f64 = match ConfigFile::get_typed_env_option::<f64>(platform_keys::METHOD_RESULT_TIMEOUT)? {
            Some(seconds) => seconds,
            None => match self.conf.get(platform_keys::METHOD_RESULT_TIMEOUT) {
                Some(value) => value.as_float()?,
                None => 0.0,
            },
        };
        if seconds > 0.0 {
            Ok(Some(Duration::from_secs_f64(seconds)))
        } else {
            Ok(None)
        }
    }

    /// Whether events should also be written to the event file.
    pub fn use_portal(&self) -> bool {
        match self.conf.get(platform_keys::USE_PORTAL) {
            Some(value) => value.as_bool().unwrap_or(false),
            None => false,
        }
    }

    fn str_or(&self, key: &str, default: &str) -> String {
        match self.conf.get(key) {
            Some(Value::None) | None => default.to_string(),
            Some(value) => value.to_string(),
        }
    }

    fn count(&self, key: &str) -> Result<usize, Fail> {
        match self.conf.get(key) {
            Some(Value::None) | None => Ok(0),
            Some(value) => match value.as_usize() {
                Ok(n) => Ok(n),
                Err(_) => {
                    let cause: String = format!("platform parameter {} must be a non-negative integer", key);
                    error!("count(): {}", cause);
                    Err(Fail::new(libc::EINVAL, &cause))
                },
            },
        }
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Name of the machine we run on.
pub fn hostname() -> String {
    let mut buf: [c_char; 256] = [0; 256];
    let rc: libc::c_int = unsafe { libc::gethostname(buf.as_mut_ptr(), buf.len()) };
    if rc != 0 {
        warn!("hostname(): gethostname failed");
        return String::from("localhost");
    }
    buf[buf.len() - 1] = 0;
    let name: &CStr = unsafe { CStr::from_ptr(buf.as_ptr()) };
    name.to_string_lossy().into_owned()
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod test {
    use super::{
        AllocationMode,
        PlatformConfig,
    };
    use crate::{
        config::yaml::ConfigFile,
        runtime::value::{
            Value,
            ValueMap,
        },
    };
    use ::anyhow::Result;
    use ::std::path::Path;

    fn platform(text: &str, env: &ValueMap) -> Result<PlatformConfig> {
        let path: &Path = Path::new("platform.yaml");
        let map: ValueMap = ConfigFile::from_str_at(text, path)?.to_map()?;
        Ok(PlatformConfig::from_map(map, path, env)?)
    }

    /// Tests defaults, host fallback and environment merging.
    #[test]
    fn test_platform_defaults() -> Result<()> {
        let mut env: ValueMap = ValueMap::new();
        env.insert("USER".to_string(), Value::from("alice"));
        env.insert("SCRATCH".to_string(), Value::from("/scratch"));
        env.insert("HOST".to_string(), Value::from("ignored"));
        let config: PlatformConfig = platform(
            "MPIRUN: eval\nNODE_DETECTION: manual\nCORES_PER_NODE: 4\nSOCKETS_PER_NODE: 1\nNODE_ALLOCATION_MODE: \
             shared\nHOST: ''\nWORK: $SCRATCH/w\n",
            &env,
        )?;
        crate::ensure_neq!(config.host(), String::new());
        crate::ensure_neq!(config.host(), "ignored".to_string());
        crate::ensure_eq!(config.get("USER"), Some(&Value::from("alice")));
        crate::ensure_eq!(config.get("WORK"), Some(&Value::from("/scratch/w")));
        crate::ensure_eq!(config.mpirun_version(), "OpenMPI-generic".to_string());
        crate::ensure_eq!(config.allocation_mode()?, AllocationMode::Shared);
        crate::ensure_eq!(config.use_accurate_nodes(), true);
        crate::ensure_eq!(config.detection_settings()?.cores_per_node, 4);
        crate::ensure_eq!(config.detection_settings()?.nodes, 0);
        Ok(())
    }

    /// Tests that missing keys and bad allocation modes are fatal.
    #[test]
    fn test_platform_validation() -> Result<()> {
        let env: ValueMap = ValueMap::new();
        let missing: Result<PlatformConfig> = platform("MPIRUN: eval\nNODE_DETECTION: manual\n", &env);
        crate::ensure_eq!(missing.is_err(), true);
        let bad_mode: Result<PlatformConfig> = platform(
            "MPIRUN: eval\nNODE_DETECTION: manual\nCORES_PER_NODE: 4\nSOCKETS_PER_NODE: 1\nNODE_ALLOCATION_MODE: \
             sometimes\nHOST: h\n",
            &env,
        );
        crate::ensure_eq!(bad_mode.is_err(), true);
        let off = platform(
            "MPIRUN: eval\nNODE_DETECTION: manual\nCORES_PER_NODE: 4\nSOCKETS_PER_NODE: 1\nNODE_ALLOCATION_MODE: \
             EXCLUSIVE\nHOST: h\nUSE_ACCURATE_NODES: 'off'\n",
            &env,
        )?;
        crate::ensure_eq!(off.use_accurate_nodes(), false);
        crate::ensure_eq!(off.host(), "h".to_string());
        Ok(())
    }
}
