// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use crate::runtime::fail::Fail;
use ::std::{
    fs::{
        self,
        File,
    },
    io::Write,
    path::Path,
    time::Instant,
};

//==============================================================================
// Structures
//==============================================================================

/// Snapshot of resource counters written on every change.
#[derive(Clone, Copy, Debug)]
pub struct UsageSample {
    pub avail_cores: usize,
    pub alloc_cores: usize,
    pub total_cores: usize,
    pub processes: usize,
}

/// Resource usage report (`resource_usage` file).
pub struct UsageReport {
    file: File,
    started: Instant,
}

//==============================================================================
// Associate Functions
//==============================================================================

impl UsageReport {
    /// Creates the report at `path` and writes its header.
    pub fn create(path: &Path, host: &str, num_nodes: usize, ppn: usize, accurate: bool) -> Result<Self, Fail> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file: File = File::create(path)?;
        writeln!(file, "# host: {}", host)?;
        writeln!(file, "# total nodes: {}", num_nodes)?;
        writeln!(file, "# processors per node: {}", ppn)?;
        writeln!(file, "using accurate nodes: {}", accurate)?;
        writeln!(
            file,
            "# time (in seconds since the | available | allocated | percent allocated | processes | percent used | notes "
        )?;
        writeln!(
            file,
            "#   resource manager started |           |           |                   |           |              |"
        )?;
        writeln!(file, "#{}", "-".repeat(107))?;
        Ok(Self {
            file,
            started: Instant::now(),
        })
    }

    /// Appends one row.
    pub fn record(&mut self, sample: UsageSample, notes: &str) -> Result<(), Fail> {
        let total: f64 = sample.total_cores.max(1) as f64;
        writeln!(
            self.file,
            " {:27.5} |  {:8} |  {:8} |  {:16.2} |  {:8} |  {:10.2}  #  {}",
            self.started.elapsed().as_secs_f64(),
            sample.avail_cores,
            sample.alloc_cores,
            100.0 * sample.alloc_cores as f64 / total,
            sample.processes,
            100.0 * sample.processes as f64 / total,
            notes
        )?;
        self.file.flush()?;
        Ok(())
    }
}
