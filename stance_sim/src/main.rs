// stance_sim/src/main.rs

use clap::Parser;
use std::process::ExitCode;
use tracing::error;

use stance_sim::cli::Cli;
use stance_sim::simulation::core::logging::init_logging;
use stance_sim::simulation::runner::run_path;

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = init_logging(&cli.log_level) {
        eprintln!("{e}");
        return ExitCode::FAILURE;
    }

    match run_path(&cli.scenario) {
        Ok(0) => ExitCode::SUCCESS,
        Ok(failures) => {
            error!("{failures} scenario(s) failed");
            ExitCode::FAILURE
        }
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
