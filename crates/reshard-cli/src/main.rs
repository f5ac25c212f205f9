//! `reshard`: convert a checkpoint archive between tensor/pipeline-parallel layouts.

mod cli;
mod logging;

use std::process::ExitCode;

use clap::Parser;

use crate::cli::{Args, exit_code, run};
use crate::logging::init_logging;

fn main() -> ExitCode {
    let args = Args::parse();
    if let Err(err) = init_logging(&args.log_level) {
        eprintln!("warning: logging disabled: {err}");
    }

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{err}");
            ExitCode::from(exit_code(&err))
        }
    }
}
