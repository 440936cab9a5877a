// This file is part of the edge orchestrator, a video-analytics edge appliance runtime.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use base::Error;
use bpaf::{Bpaf, Parser};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use tracing::{debug, error};

mod bus;
mod cameras;
mod cmds;
mod config;
mod detector;
mod muxer;
mod producer;
mod retention;
mod rpc;
mod supervisor;
mod telemetry;
mod transmitter;
mod tunnel;

/// Edge orchestrator: ingests camera streams, detects anomalies locally, and relays events to
/// the backend over a tunnel-gated connection.
#[derive(Bpaf, Debug)]
#[bpaf(options, version(env!("CARGO_PKG_VERSION")))]
enum Args {
    // See docstrings of `cmds::*::Args` structs for a description of the respective subcommands.
    Init(#[bpaf(external(cmds::init::args))] cmds::init::Args),
    Run(#[bpaf(external(cmds::run::args))] cmds::run::Args),
}

impl Args {
    fn run(self) -> Result<i32, Error> {
        match self {
            Args::Init(a) => cmds::init::run(a),
            Args::Run(a) => cmds::run::run(a),
        }
    }
}

fn main() {
    // If using the clock will fail, find out now *before* trying to log anything (with
    // timestamps...) so we can print a helpful error.
    if let Err(e) = nix::time::clock_gettime(nix::time::ClockId::CLOCK_MONOTONIC) {
        eprintln!(
            "clock_gettime failed: {e}\n\n\
             This indicates a broken environment. See the troubleshooting guide."
        );
        std::process::exit(1);
    }

    base::tracing_setup::install();

    // Get the program name from the OS (e.g. if invoked as `target/debug/edged`: `edged`),
    // falling back to the crate name if conversion to a path/UTF-8 string fails.
    let progname = std::env::args_os().next().map(PathBuf::from);
    let progname = progname
        .as_deref()
        .and_then(Path::file_name)
        .and_then(OsStr::to_str)
        .unwrap_or(env!("CARGO_PKG_NAME"));

    let args = match args()
        .fallback_to_usage()
        .run_inner(bpaf::Args::current_args().set_name(progname))
    {
        Ok(a) => a,
        Err(e) => std::process::exit(e.exit_code()),
    };
    tracing::trace!("Parsed command-line arguments: {args:#?}");

    match args.run() {
        Err(e) => {
            error!(err = %e.chain(), "exiting due to error");
            ::std::process::exit(1);
        }
        Ok(rv) => {
            debug!("exiting with status {}", rv);
            std::process::exit(rv)
        }
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn bpaf_invariants() {
        super::args().check_invariants(false);
    }
}
