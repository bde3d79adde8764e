//! Nat464Controller (§4.5): owns one [`Nat64Machine`] per upstream network
//! that requires clat, creating it when the network connects and discarding
//! it when the network is lost.

use std::collections::HashMap;
use std::net::Ipv6Addr;

use tethermgr_lib::nat64::{Nat64Action, Nat64Machine, Nat64Signals};
use tethermgr_lib::upstream::NetworkId;

#[derive(Debug, Default)]
pub struct Nat464Controller {
    machines: HashMap<NetworkId, Nat64Machine>,
}

impl Nat464Controller {
    pub fn new() -> Self {
        Nat464Controller::default()
    }

    fn stacked_iface_name(base_iface: &str) -> String {
        format!("v4-{base_iface}")
    }

    pub fn update(&mut self, network: NetworkId, base_iface: &str, signals: &Nat64Signals) -> Vec<Nat64Action> {
        let machine = self
            .machines
            .entry(network)
            .or_insert_with(|| Nat64Machine::new(base_iface, Self::stacked_iface_name(base_iface)));
        machine.update(signals)
    }

    /// Records the router-advertisement-learned prefix for a network (RA
    /// takes precedence over DNS64 inside `Nat64Machine::preferred_prefix`).
    /// Does not itself run the state machine; the caller still has to
    /// re-invoke `update` with fresh signals to act on the change.
    pub fn set_ra_prefix(&mut self, network: NetworkId, base_iface: &str, prefix: Option<Ipv6Addr>) {
        let machine = self
            .machines
            .entry(network)
            .or_insert_with(|| Nat64Machine::new(base_iface, Self::stacked_iface_name(base_iface)));
        machine.prefix_from_ra = prefix;
    }

    pub fn on_stacked_interface_up(&mut self, network: NetworkId, iface: &str) -> Option<Nat64Action> {
        self.machines.get_mut(&network)?.on_stacked_interface_up(iface)
    }

    /// Called on network loss: drops the machine entirely (§3 "destroyed on
    /// network loss").
    pub fn destroy(&mut self, network: NetworkId) {
        self.machines.remove(&network);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clat_required_signals() -> Nat64Signals {
        Nat64Signals {
            supported_net_type: true,
            connected: true,
            has_global_ipv6: true,
            has_ipv4: false,
            ..Default::default()
        }
    }

    #[test]
    fn update_creates_a_machine_on_first_use() {
        let mut controller = Nat464Controller::new();
        let actions = controller.update(NetworkId(1), "rmnet0", &clat_required_signals());
        assert_eq!(actions, vec![Nat64Action::StartDiscovery]);
    }

    #[test]
    fn destroy_drops_network_state() {
        let mut controller = Nat464Controller::new();
        controller.update(NetworkId(1), "rmnet0", &clat_required_signals());
        controller.destroy(NetworkId(1));
        assert!(controller.on_stacked_interface_up(NetworkId(1), "v4-rmnet0").is_none());
    }
}
