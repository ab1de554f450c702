// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Daemon binary entry point.
// Author: Lukas Bower

//! Entry point for the `wdhwd` daemon binary.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process;

use clap::{Arg, ArgAction, Command};
use log::{error, LevelFilter};

use wdhwd::config::{Config, DEFAULT_CONFIG_FILE};
use wdhwd::daemon::{WdHwDaemon, EXIT_STARTUP};

fn build_cli() -> Command {
    Command::new("wdhwd")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Hardware controller daemon for WD My Cloud NAS appliances")
        .arg(
            Arg::new("config")
                .short('C')
                .long("config")
                .value_name("CONFIG_FILE")
                .help("configuration file")
                .default_value(DEFAULT_CONFIG_FILE),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::Count)
                .help("raises the console logging verbosity"),
        )
        .arg(
            Arg::new("quiet")
                .short('q')
                .long("quiet")
                .action(ArgAction::SetTrue)
                .help("disables console logging output"),
        )
        .arg(
            Arg::new("debug")
                .short('d')
                .long("debug")
                .action(ArgAction::SetTrue)
                .help("enables debug mode commands"),
        )
}

fn console_level(verbose: u8, quiet: bool) -> LevelFilter {
    if quiet {
        return LevelFilter::Off;
    }
    match verbose {
        0 => LevelFilter::Error,
        1 => LevelFilter::Warn,
        2 => LevelFilter::Info,
        3 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

fn run() -> i32 {
    let matches = build_cli().get_matches();
    let verbose = matches.get_count("verbose");
    let quiet = matches.get_flag("quiet");
    let debug = matches.get_flag("debug");
    let config_path = matches
        .get_one::<String>("config")
        .map(PathBuf::from)
        .expect("config has a default");

    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("wdhwd: {e}");
            return EXIT_STARTUP;
        }
    };

    let mut level = console_level(verbose, quiet);
    if let Ok(configured) = config.log_level() {
        level = level.max(configured);
    }
    if debug {
        level = level.max(LevelFilter::Debug);
    }
    let mut builder = env_logger::Builder::new();
    builder.filter_level(level);
    if let Some(path) = &config.log_file {
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => {
                builder.target(env_logger::Target::Pipe(Box::new(file)));
            }
            Err(e) => eprintln!("wdhwd: cannot open log file {}: {e}", path.display()),
        }
    }
    builder.init();

    match WdHwDaemon::new(config, debug).run() {
        Ok(code) => code,
        Err(e) => {
            error!("daemon failed: {e:#}");
            eprintln!("wdhwd: {e:#}");
            EXIT_STARTUP
        }
    }
}

fn main() {
    process::exit(run());
}
