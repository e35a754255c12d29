//! Command-line interface

use clap::Parser;
use std::path::PathBuf;

/// silt replication daemon.
#[derive(Parser, Debug)]
#[command(name = "siltd", version, about = "CDC replication into analytic databases")]
pub struct Cli {
    /// Path to the YAML configuration file
    #[arg(long, value_name = "FILE", default_value = "etc/silt.yaml")]
    pub config: PathBuf,

    /// Log level when RUST_LOG is not set (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}
