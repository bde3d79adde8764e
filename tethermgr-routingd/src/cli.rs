use clap::Parser;
use std::path::PathBuf;

use tethermgr_lib::socket::routingd;

/// Privileged routing helper for tethermgr - owns the root-only routing
/// socket and translates RoutingRequest RPCs into kernel mutations.
#[derive(Clone, Debug, Parser)]
#[command(version)]
pub struct Cli {
    /// Path to the root-only routing socket
    #[arg(long, env = routingd::ENV_VAR, default_value = routingd::DEFAULT_PATH)]
    pub socket_path: PathBuf,

    /// Write a log file instead of logging to stdout
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Write the daemon's PID to this file on startup
    #[arg(long)]
    pub pid_file: Option<PathBuf>,
}

pub fn parse() -> Cli {
    Cli::parse()
}
