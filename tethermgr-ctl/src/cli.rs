use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use tethermgr_lib::caller::{Capability, CallerContext};
use tethermgr_lib::command::Command as LibCommand;
use tethermgr_lib::downstream::{ConnectivityScope, DownstreamType, TetheringRequest};
use tethermgr_lib::socket;

/// tethermgr control interface - starts, stops and inspects tethering
/// downstreams served by the `tethermgr` orchestrator daemon.
#[derive(Debug, Parser)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Path to the control socket
    #[arg(long, env = socket::ENV_VAR, default_value = socket::DEFAULT_PATH)]
    pub socket_path: PathBuf,

    /// Caller UID attached to the request (defaults to the process's own UID)
    #[arg(long, global = true)]
    pub uid: Option<u32>,

    /// Caller package name attached to the request
    #[arg(long, global = true, default_value = "tethermgr-ctl")]
    pub package_name: String,

    /// Grant the request TETHER_PRIVILEGED, as if called by a system component
    #[arg(long, global = true)]
    pub privileged: bool,

    /// Format output as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum DownstreamTypeArg {
    Wifi,
    WifiP2p,
    Usb,
    Ncm,
    Bluetooth,
    Ethernet,
    Virtual,
    Wigig,
}

impl From<DownstreamTypeArg> for DownstreamType {
    fn from(value: DownstreamTypeArg) -> Self {
        match value {
            DownstreamTypeArg::Wifi => DownstreamType::Wifi,
            DownstreamTypeArg::WifiP2p => DownstreamType::WifiP2p,
            DownstreamTypeArg::Usb => DownstreamType::Usb,
            DownstreamTypeArg::Ncm => DownstreamType::Ncm,
            DownstreamTypeArg::Bluetooth => DownstreamType::Bluetooth,
            DownstreamTypeArg::Ethernet => DownstreamType::Ethernet,
            DownstreamTypeArg::Virtual => DownstreamType::Virtual,
            DownstreamTypeArg::Wigig => DownstreamType::Wigig,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum ScopeArg {
    Global,
    Local,
}

impl From<ScopeArg> for ConnectivityScope {
    fn from(value: ScopeArg) -> Self {
        match value {
            ScopeArg::Global => ConnectivityScope::Global,
            ScopeArg::Local => ConnectivityScope::Local,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Mark an already-configured interface as a tethering downstream
    Tether {
        interface_name: String,

        #[arg(value_enum, default_value = "virtual")]
        downstream_type: DownstreamTypeArg,
    },

    /// Stop serving a previously `tether`-ed interface
    Untether { interface_name: String },

    /// Start tethering for a downstream type, bringing up its interface if needed
    StartTethering {
        #[arg(value_enum)]
        downstream_type: DownstreamTypeArg,

        #[arg(long, value_enum)]
        scope: Option<ScopeArg>,

        #[arg(long)]
        interface_name: Option<String>,

        #[arg(long)]
        exempt_from_entitlement_check: bool,
    },

    /// Stop tethering for a downstream type
    StopTethering {
        #[arg(value_enum)]
        downstream_type: DownstreamTypeArg,
    },

    /// Stop every active downstream
    StopAllTethering {},

    /// Force USB tethering on or off
    SetUsbTethering { enable: bool },

    /// Check whether a type's entitlement has been granted
    Entitlement {
        #[arg(value_enum)]
        downstream_type: DownstreamTypeArg,

        #[arg(long)]
        show_ui: bool,
    },

    /// Report whether tethering is supported and which types are available
    IsTetheringSupported {},

    /// Prefer test networks for upstream selection (system-only)
    SetPreferTestNetworks { prefer: bool },

    /// Query orchestrator and per-downstream state
    Status {},

    /// Register for the tether event stream and print events as they arrive
    Watch {},
}

fn caller(cli: &Cli) -> CallerContext {
    let uid = cli.uid.unwrap_or_else(|| unsafe { libc_getuid() });
    let mut ctx = CallerContext::new(uid, cli.package_name.clone());
    if cli.privileged {
        ctx = ctx.with_capability(Capability::TetherPrivileged);
    } else {
        ctx = ctx
            .with_capability(Capability::WriteSettings)
            .with_capability(Capability::AccessNetworkState)
            .with_capability(Capability::NetworkSettings);
    }
    ctx
}

#[cfg(unix)]
unsafe fn libc_getuid() -> u32 {
    unsafe { libc::getuid() }
}

#[cfg(not(unix))]
unsafe fn libc_getuid() -> u32 {
    0
}

impl From<Cli> for LibCommand {
    fn from(cli: Cli) -> Self {
        let caller = caller(&cli);
        match cli.command {
            Command::Tether { interface_name, downstream_type } => {
                let downstream_type = downstream_type.into();
                let request = TetheringRequest::new(downstream_type, caller.uid, caller.package_name.clone())
                    .with_interface_name(interface_name);
                LibCommand::Tether { caller, request }
            }
            Command::Untether { interface_name } => LibCommand::Untether { caller, interface_name },
            Command::StartTethering { downstream_type, scope, interface_name, exempt_from_entitlement_check } => {
                let downstream_type = downstream_type.into();
                let mut request = TetheringRequest::new(downstream_type, caller.uid, caller.package_name.clone());
                if let Some(scope) = scope {
                    request = request.with_scope(scope.into());
                }
                if let Some(interface_name) = interface_name {
                    request = request.with_interface_name(interface_name);
                }
                request.exempt_from_entitlement_check = exempt_from_entitlement_check;
                LibCommand::StartTethering { caller, request }
            }
            Command::StopTethering { downstream_type } => {
                LibCommand::StopTethering { caller, downstream_type: downstream_type.into() }
            }
            Command::StopAllTethering {} => LibCommand::StopAllTethering { caller },
            Command::SetUsbTethering { enable } => LibCommand::SetUsbTethering { caller, enable },
            Command::Entitlement { downstream_type, show_ui } => LibCommand::RequestLatestTetheringEntitlementResult {
                caller,
                downstream_type: downstream_type.into(),
                show_entitlement_ui: show_ui,
            },
            Command::IsTetheringSupported {} => LibCommand::IsTetheringSupported { caller },
            Command::SetPreferTestNetworks { prefer } => LibCommand::SetPreferTestNetworks { caller, prefer },
            Command::Status {} => LibCommand::Status,
            Command::Watch {} => LibCommand::RegisterTetheringEventCallback { caller },
        }
    }
}

pub fn parse() -> Cli {
    Cli::parse()
}
