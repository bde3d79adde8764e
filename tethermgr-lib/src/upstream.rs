//! Upstream network tracking: the candidate networks an `UpstreamMonitor`
//! watches and the subset of their `LinkProperties` the orchestrator cares
//! about (interfaces, prefixes, DNS, default-route membership).

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

use cidr::Ipv4Cidr;

/// Opaque handle identifying one upstream network, stable for its lifetime.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct NetworkId(pub u32);

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum UpstreamKind {
    Cellular,
    Wifi,
    Ethernet,
    Vpn,
    Bluetooth,
}

impl UpstreamKind {
    /// Offload must never be requested while routed through a VPN upstream (§4.4).
    pub fn allows_hardware_offload(self) -> bool {
        !matches!(self, UpstreamKind::Vpn)
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct UpstreamLinkProperties {
    pub interface_name: String,
    pub ipv4_prefixes: Vec<Ipv4Cidr>,
    pub dns_servers: Vec<Ipv4Addr>,
    pub gateway: Option<Ipv4Addr>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UpstreamState {
    pub network_id: NetworkId,
    pub kind: UpstreamKind,
    pub link_properties: UpstreamLinkProperties,
    pub is_default_route: bool,
    pub validated: bool,
}

impl UpstreamState {
    pub fn new(network_id: NetworkId, kind: UpstreamKind, interface_name: impl Into<String>) -> Self {
        UpstreamState {
            network_id,
            kind,
            link_properties: UpstreamLinkProperties {
                interface_name: interface_name.into(),
                ..Default::default()
            },
            is_default_route: false,
            validated: false,
        }
    }

    /// Candidate for selection as the active tethering upstream: validated,
    /// carrying a default route, with at least one usable interface.
    pub fn is_eligible(&self) -> bool {
        self.validated && self.is_default_route && !self.link_properties.interface_name.is_empty()
    }
}
