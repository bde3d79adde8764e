use serde::{Deserialize, Serialize};

use crate::upstream::UpstreamKind;

const KNOWN_KEYS: &[&str] = &[
    "version",
    "force_usb_ncm",
    "tethering_supported",
    "allow_vpn_upstreams",
    "dedicated_ip_policy",
    "preferred_upstream_types",
    "legacy_guess_stopped_server",
];

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub version: u8,
    /// Force the USB function into NCM mode regardless of what the host
    /// negotiated (§6.3 `force_usb_ncm`).
    #[serde(default)]
    pub force_usb_ncm: bool,
    #[serde(default = "default_true")]
    pub tethering_supported: bool,
    #[serde(default)]
    pub allow_vpn_upstreams: bool,
    /// §4.1: prefer a fresh prefix on every downstream start rather than
    /// reusing the last-assigned one for the same (type, scope) pair.
    #[serde(default)]
    pub dedicated_ip_policy: bool,
    /// §4.3: upstream selection order when more than one is eligible.
    #[serde(default = "default_preferred_upstream_types")]
    pub preferred_upstream_types: Vec<UpstreamKind>,
    /// §9 open question: rather than guessing at a stopped soft-AP's
    /// interface name on pre-U platforms, stub the disable to a no-op with a
    /// warning when this is set.
    #[serde(default)]
    pub legacy_guess_stopped_server: bool,
}

fn default_true() -> bool {
    true
}

fn default_preferred_upstream_types() -> Vec<UpstreamKind> {
    vec![UpstreamKind::Ethernet, UpstreamKind::Wifi, UpstreamKind::Cellular]
}

impl Default for Config {
    fn default() -> Self {
        Config {
            version: 1,
            force_usb_ncm: false,
            tethering_supported: default_true(),
            allow_vpn_upstreams: false,
            dedicated_ip_policy: false,
            preferred_upstream_types: default_preferred_upstream_types(),
            legacy_guess_stopped_server: false,
        }
    }
}

pub fn wrong_keys(table: &toml::Table) -> Vec<String> {
    table.keys().filter(|k| !KNOWN_KEYS.contains(&k.as_str())).cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_key_is_flagged() {
        let table: toml::Table = "version = 1\nbogus = true".parse().unwrap();
        assert_eq!(wrong_keys(&table), vec!["bogus".to_string()]);
    }

    #[test]
    fn known_keys_are_not_flagged() {
        let table: toml::Table = "version = 1\ntethering_supported = false".parse().unwrap();
        assert!(wrong_keys(&table).is_empty());
    }
}
