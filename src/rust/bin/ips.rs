// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

#![cfg_attr(feature = "strict", deny(warnings))]
#![deny(clippy::all)]

//======================================================================================================================
// Imports
//======================================================================================================================

use ::anyhow::Result;
use ::clap::{
    Arg,
    ArgAction,
    ArgMatches,
    Command,
};
use ::ipsframework::{
    config::RunspaceOptions,
    runtime::logging,
    Framework,
    FrameworkOptions,
};
use ::std::path::{
    Path,
    PathBuf,
};

//======================================================================================================================
// Program Arguments
//======================================================================================================================

/// Program Arguments
#[derive(Debug)]
pub struct ProgramArguments {
    /// Simulation configuration files.
    simulations: Vec<PathBuf>,
    /// Platform configuration file.
    platform: PathBuf,
    /// Component-set configuration files.
    components: Vec<PathBuf>,
    /// Framework log file.
    log: Option<PathBuf>,
    debug: bool,
    nodes: Option<usize>,
    ppn: Option<usize>,
    create_runspace: bool,
    run_setup: bool,
    run: bool,
}

impl ProgramArguments {
    /// Parses the program arguments from the command line interface.
    pub fn new(app_name: &'static str, app_author: &'static str, app_about: &'static str) -> Result<Self> {
        let matches: ArgMatches = Command::new(app_name)
            .author(app_author)
            .about(app_about)
            .arg(
                Arg::new("simulation")
                    .long("simulation")
                    .value_parser(clap::value_parser!(PathBuf))
                    .required(true)
                    .num_args(1..)
                    .action(ArgAction::Append)
                    .value_name("FILE")
                    .help("Sets simulation configuration files"),
            )
            .arg(
                Arg::new("platform")
                    .long("platform")
                    .value_parser(clap::value_parser!(PathBuf))
                    .required(true)
                    .value_name("FILE")
                    .help("Sets platform configuration file"),
            )
            .arg(
                Arg::new("component")
                    .long("component")
                    .value_parser(clap::value_parser!(PathBuf))
                    .required(false)
                    .num_args(1..)
                    .action(ArgAction::Append)
                    .value_name("FILE")
                    .help("Sets component-set configuration files"),
            )
            .arg(
                Arg::new("log")
                    .long("log")
                    .value_parser(clap::value_parser!(PathBuf))
                    .required(false)
                    .value_name("FILE")
                    .help("Sets framework log file"),
            )
            .arg(
                Arg::new("debug")
                    .long("debug")
                    .action(ArgAction::SetTrue)
                    .help("Enables debug output"),
            )
            .arg(
                Arg::new("nodes")
                    .long("nodes")
                    .value_parser(clap::value_parser!(usize))
                    .required(false)
                    .value_name("NUMBER")
                    .help("Overrides the number of nodes"),
            )
            .arg(
                Arg::new("ppn")
                    .long("ppn")
                    .value_parser(clap::value_parser!(usize))
                    .required(false)
                    .value_name("NUMBER")
                    .help("Overrides the number of processes per node"),
            )
            .arg(
                Arg::new("create-runspace")
                    .long("create-runspace")
                    .action(ArgAction::SetTrue)
                    .help("Creates the simulation directories"),
            )
            .arg(
                Arg::new("run-setup")
                    .long("run-setup")
                    .action(ArgAction::SetTrue)
                    .help("Stages component inputs"),
            )
            .arg(
                Arg::new("run")
                    .long("run")
                    .action(ArgAction::SetTrue)
                    .help("Runs the simulations"),
            )
            .get_matches();

        let simulations: Vec<PathBuf> = matches
            .get_many::<PathBuf>("simulation")
            .ok_or(anyhow::anyhow!("missing simulation files"))?
            .cloned()
            .collect();
        let platform: PathBuf = matches
            .get_one::<PathBuf>("platform")
            .ok_or(anyhow::anyhow!("missing platform file"))?
            .clone();
        let components: Vec<PathBuf> = match matches.get_many::<PathBuf>("component") {
            Some(files) => files.cloned().collect(),
            None => Vec::new(),
        };

        // Node overrides.
        let nodes: Option<usize> = matches.get_one::<usize>("nodes").copied();
        let ppn: Option<usize> = matches.get_one::<usize>("ppn").copied();
        if nodes == Some(0) || ppn == Some(0) {
            anyhow::bail!("invalid node override");
        }

        // Phases. None given means all of them.
        let mut create_runspace: bool = matches.get_flag("create-runspace");
        let mut run_setup: bool = matches.get_flag("run-setup");
        let mut run: bool = matches.get_flag("run");
        if !(create_runspace || run_setup || run) {
            create_runspace = true;
            run_setup = true;
            run = true;
        }

        Ok(Self {
            simulations,
            platform,
            components,
            log: matches.get_one::<PathBuf>("log").cloned(),
            debug: matches.get_flag("debug"),
            nodes,
            ppn,
            create_runspace,
            run_setup,
            run,
        })
    }

    /// Returns the `log` command line argument.
    pub fn log(&self) -> Option<&Path> {
        self.log.as_deref()
    }

    /// Returns the `debug` command line argument.
    pub fn debug(&self) -> bool {
        self.debug
    }

    /// Framework options selected on the command line.
    pub fn framework_options(&self) -> FrameworkOptions {
        let mut options: FrameworkOptions = FrameworkOptions::new(self.platform.clone(), self.simulations.clone());
        options.compset_files = self.components.clone();
        options.nodes = self.nodes;
        options.ppn = self.ppn;
        options.runspace = RunspaceOptions {
            create_runspace: self.create_runspace,
            run_setup: self.run_setup,
            debug: self.debug,
        };
        options.run = self.run;
        options
    }
}

//======================================================================================================================
// main
//======================================================================================================================

fn main() -> Result<()> {
    let args: ProgramArguments = ProgramArguments::new(
        "ips",
        "Microsoft Corporation",
        "Runs coupled simulation workflows.",
    )?;
    logging::initialize(if args.debug() { "debug" } else { "info" }, args.log());

    let mut framework: Framework = Framework::new(args.framework_options())?;
    if !framework.run()? {
        anyhow::bail!("simulation failed");
    }
    Ok(())
}
