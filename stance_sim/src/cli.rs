// stance_sim/src/cli.rs

use clap::Parser;
use std::path::PathBuf;

/// Stance: identify the feedback gains of a standing human from simulated sway.
///
/// This struct defines the command-line arguments of the `stance` binary.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// A scenario TOML file, or a directory searched recursively for them.
    #[arg(short, long, default_value = "assets/scenarios")]
    pub scenario: PathBuf,

    /// Log filter used when `RUST_LOG` is unset (e.g. "info", "stance_core=debug").
    #[arg(short, long, default_value = "info")]
    pub log_level: String,
}
