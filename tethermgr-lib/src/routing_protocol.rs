//! Wire protocol between `tethermgr` and the privileged `tethermgr-routingd`
//! helper (§4.7, §6.4). `tethermgr` owns `AddressCoordinator` itself — those
//! operations never cross this socket (§9's cycle-breaking design note) —
//! so everything here is a pure kernel mutation performed on the helper's
//! netlink/netfilter handles.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use cidr::Ipv4Cidr;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RoutingRequest {
    AddInterfaceToLocalNetwork { interface_name: String, prefix: Ipv4Cidr },
    RemoveInterfaceFromLocalNetwork { interface_name: String },
    AddInterfaceToNetwork { interface_name: String, network_id: u32 },
    RemoveInterfaceFromNetwork { interface_name: String, network_id: u32 },
    AddRoute { interface_name: String, destination: Ipv4Cidr, gateway: Option<Ipv4Addr> },
    RemoveRoute { interface_name: String, destination: Ipv4Cidr },
    SetInterfaceUp { interface_name: String },
    SetInterfaceDown { interface_name: String },
    ConfigureAddress { interface_name: String, address: Ipv4Cidr },
    StartOffload { downstream: String, upstream: String },
    StopOffload { downstream: String },
    SetIpForwarding { enabled: bool },
    /// DNS forwarders for an upstream network (§4.6 `tetherDnsSet`). The
    /// forwarder daemon itself is an external collaborator; this just
    /// records the desired server list for it to pick up.
    SetDnsForwarders { network_id: u32, servers: Vec<Ipv4Addr> },
    TeardownStaleRules,
    Ping,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RoutingResponse {
    Ok,
    Error { message: String },
    Pong,
}

impl fmt::Display for RoutingRequest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let json = serde_json::to_string(self).map_err(|_| fmt::Error)?;
        write!(f, "{json}")
    }
}

impl FromStr for RoutingRequest {
    type Err = serde_json::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_str(s)
    }
}

impl fmt::Display for RoutingResponse {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let json = serde_json::to_string(self).map_err(|_| fmt::Error)?;
        write!(f, "{json}")
    }
}

impl FromStr for RoutingResponse {
    type Err = serde_json::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_str(s)
    }
}
