use clap::Parser;
use std::path::PathBuf;

use tethermgr_lib::config;
use tethermgr_lib::socket::{self, routingd};

/// tethermgr - mobile tethering control plane orchestrator daemon.
#[derive(Clone, Debug, Parser)]
#[command(version)]
pub struct Cli {
    /// Path to the control socket this daemon listens on
    #[arg(long, env = socket::ENV_VAR, default_value = socket::DEFAULT_PATH)]
    pub socket_path: PathBuf,

    /// General configuration file
    #[arg(long, env = config::ENV_VAR, default_value = config::DEFAULT_PATH)]
    pub config_path: PathBuf,

    /// Path to the privileged routing helper's socket
    #[arg(long, env = routingd::ENV_VAR, default_value = routingd::DEFAULT_PATH)]
    pub routingd_socket_path: PathBuf,

    /// Write the daemon's PID to this file on startup
    #[arg(long)]
    pub pid_file: Option<PathBuf>,
}

pub fn parse() -> Cli {
    Cli::parse()
}
