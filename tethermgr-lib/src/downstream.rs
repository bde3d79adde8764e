//! Downstream-facing data model: the carriers a device can tether over and the
//! requests callers make against them.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Physical or virtual carrier a downstream client attaches through.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum DownstreamType {
    Wifi,
    WifiP2p,
    Usb,
    Ncm,
    Bluetooth,
    Ethernet,
    Virtual,
    Wigig,
}

impl DownstreamType {
    /// Scope a downstream of this type serves unless a request overrides it.
    pub fn default_scope(self) -> ConnectivityScope {
        match self {
            DownstreamType::WifiP2p | DownstreamType::Bluetooth => ConnectivityScope::Local,
            _ => ConnectivityScope::Global,
        }
    }
}

impl fmt::Display for DownstreamType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            DownstreamType::Wifi => "wifi",
            DownstreamType::WifiP2p => "wifi_p2p",
            DownstreamType::Usb => "usb",
            DownstreamType::Ncm => "ncm",
            DownstreamType::Bluetooth => "bluetooth",
            DownstreamType::Ethernet => "ethernet",
            DownstreamType::Virtual => "virtual",
            DownstreamType::Wigig => "wigig",
        };
        write!(f, "{s}")
    }
}

/// Whether a downstream should reach the wider upstream network or only the
/// device itself (e.g. a local-only Wi-Fi P2P group with no internet relay).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ConnectivityScope {
    Global,
    Local,
}

/// Caller-supplied configuration for a soft-AP backed downstream, redacted
/// before being handed to non-privileged listeners (see `CallbackRegistry`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SoftApConfig {
    pub ssid: String,
    pub passphrase: Option<String>,
    pub band_preference: Option<u8>,
}

/// Immutable record of a single caller's ask to start tethering.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TetheringRequest {
    pub downstream_type: DownstreamType,
    pub scope: ConnectivityScope,
    pub interface_name: Option<String>,
    pub soft_ap_config: Option<SoftApConfig>,
    pub exempt_from_entitlement_check: bool,
    pub uid: u32,
    pub package_name: String,
}

impl TetheringRequest {
    pub fn new(downstream_type: DownstreamType, uid: u32, package_name: impl Into<String>) -> Self {
        TetheringRequest {
            scope: downstream_type.default_scope(),
            downstream_type,
            interface_name: None,
            soft_ap_config: None,
            exempt_from_entitlement_check: false,
            uid,
            package_name: package_name.into(),
        }
    }

    pub fn with_scope(mut self, scope: ConnectivityScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_interface_name(mut self, name: impl Into<String>) -> Self {
        self.interface_name = Some(name.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wifi_p2p_and_bluetooth_default_to_local_scope() {
        assert_eq!(DownstreamType::WifiP2p.default_scope(), ConnectivityScope::Local);
        assert_eq!(DownstreamType::Bluetooth.default_scope(), ConnectivityScope::Local);
        assert_eq!(DownstreamType::Usb.default_scope(), ConnectivityScope::Global);
        assert_eq!(DownstreamType::Wifi.default_scope(), ConnectivityScope::Global);
    }

    #[test]
    fn request_builder_defaults_scope_from_type() {
        let req = TetheringRequest::new(DownstreamType::WifiP2p, 1000, "com.example.app");
        assert_eq!(req.scope, ConnectivityScope::Local);
    }
}
