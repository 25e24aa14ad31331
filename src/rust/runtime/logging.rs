// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use ::flexi_logger::{
    FileSpec,
    FlexiLoggerError,
    Logger,
    LoggerHandle,
};
use ::std::{
    path::Path,
    sync::{
        Mutex,
        Once,
    },
};

//==============================================================================
// Static Variables
//==============================================================================

/// Guardian to the logging initialize function.
static INIT_LOG: Once = Once::new();

/// Keeps the logger alive for the lifetime of the process.
static LOG_HANDLE: Mutex<Option<LoggerHandle>> = Mutex::new(None);

//==============================================================================
// Standalone Functions
//==============================================================================

/// Initializes logging features.
///
/// `RUST_LOG` takes precedence over `level`. When `file` is given, records go
/// to that file instead of standard error. Only the first call has effect.
pub fn initialize(level: &str, file: Option<&Path>) {
    INIT_LOG.call_once(|| match start(level, file) {
        Ok(handle) => {
            if let Ok(mut slot) = LOG_HANDLE.lock() {
                *slot = Some(handle);
            }
        },
        Err(e) => eprintln!("initialize(): failed to start logger ({:?})", e),
    });
}

fn start(level: &str, file: Option<&Path>) -> Result<LoggerHandle, FlexiLoggerError> {
    let logger: Logger = Logger::try_with_env_or_str(level)?;
    match file {
        Some(path) => logger
            .log_to_file(FileSpec::try_from(path)?)
            .format(::flexi_logger::detailed_format)
            .start(),
        None => logger.start(),
    }
}

/// Maps a component `LOG_LEVEL` value onto a `log` level filter.
pub fn level_filter(name: &str) -> ::log::LevelFilter {
    match name.trim().to_uppercase().as_str() {
        "CRITICAL" | "ERROR" => ::log::LevelFilter::Error,
        "WARNING" | "WARN" => ::log::LevelFilter::Warn,
        "INFO" => ::log::LevelFilter::Info,
        "DEBUG" => ::log::LevelFilter::Debug,
        "TRACE" => ::log::LevelFilter::Trace,
        _ => ::log::LevelFilter::Warn,
    }
}
