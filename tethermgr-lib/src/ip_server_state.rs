//! Shared state shape for a single downstream (§3 `IpServerState`, §4.2). The
//! state machine behavior lives in `tethermgr::orchestrator::ip_server`; this
//! module only holds the data both the orchestrator and the IPC boundary
//! need to agree on.

use cidr::Ipv4Cidr;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

use crate::downstream::DownstreamType;
use crate::error::ErrorCode;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum IpServerPhase {
    Unavailable,
    Available,
    Tethered,
    LocalOnly,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ServingMode {
    Tethered,
    LocalOnly,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LinkProperties {
    pub addresses: Vec<Ipv4Addr>,
    pub routes: Vec<Ipv4Cidr>,
    pub dns_servers: Vec<Ipv4Addr>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IpServerState {
    pub phase: IpServerPhase,
    pub last_error: ErrorCode,
    pub assigned_prefix: Option<Ipv4Cidr>,
    pub interface_name: String,
    pub interface_type: DownstreamType,
    pub is_ncm: bool,
    pub serving_mode: Option<ServingMode>,
    pub link_properties: LinkProperties,
}

impl IpServerState {
    pub fn new(interface_name: impl Into<String>, interface_type: DownstreamType, is_ncm: bool) -> Self {
        IpServerState {
            phase: IpServerPhase::Unavailable,
            last_error: ErrorCode::NoError,
            assigned_prefix: None,
            interface_name: interface_name.into(),
            interface_type,
            is_ncm,
            serving_mode: None,
            link_properties: LinkProperties::default(),
        }
    }

    pub fn is_serving(&self) -> bool {
        matches!(self.phase, IpServerPhase::Tethered | IpServerPhase::LocalOnly)
    }

    pub fn wants_forwarding(&self) -> bool {
        matches!(self.phase, IpServerPhase::Tethered)
    }
}
