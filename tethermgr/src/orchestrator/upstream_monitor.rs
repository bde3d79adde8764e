//! UpstreamMonitor (§4.3): tracks candidate upstream networks and answers
//! the orchestrator's upstream-selection queries. Link/capability change
//! notifications arrive as [`UpstreamEvent`]s the orchestrator folds into
//! `TetherOrchestrator::update` in the same serial order they are received.

use std::collections::BTreeMap;

use cidr::Ipv4Cidr;

use tethermgr_lib::upstream::{NetworkId, UpstreamKind, UpstreamState};

#[derive(Clone, Debug)]
pub enum UpstreamEvent {
    LinkPropertiesChanged(NetworkId),
    CapabilitiesChanged(NetworkId),
    Lost(NetworkId),
    DefaultSwitched,
    LocalPrefixes(Vec<Ipv4Cidr>),
}

#[derive(Debug, Default)]
pub struct UpstreamMonitor {
    networks: BTreeMap<NetworkId, UpstreamState>,
    prefer_test_networks: bool,
    try_cell: bool,
}

impl UpstreamMonitor {
    pub fn new() -> Self {
        UpstreamMonitor::default()
    }

    pub fn track(&mut self, upstream: UpstreamState) {
        self.networks.insert(upstream.network_id, upstream);
    }

    pub fn remove(&mut self, network: NetworkId) -> Option<UpstreamState> {
        self.networks.remove(&network)
    }

    pub fn get(&self, network: NetworkId) -> Option<&UpstreamState> {
        self.networks.get(&network)
    }

    pub fn current_networks(&self) -> Vec<NetworkId> {
        self.networks.keys().copied().collect()
    }

    pub fn set_prefer_test_networks(&mut self, prefer: bool) {
        self.prefer_test_networks = prefer;
    }

    pub fn set_try_cell(&mut self, try_cell: bool) {
        self.try_cell = try_cell;
    }

    pub fn try_cell(&self) -> bool {
        self.try_cell
    }

    /// Auto-select mode: the first eligible default-route network, cellular
    /// preferred when `try_cell` is set (§4.6 "try cellular first").
    pub fn get_current_preferred_upstream(&self) -> Option<&UpstreamState> {
        if self.try_cell {
            if let Some(cell) = self
                .networks
                .values()
                .find(|u| u.kind == UpstreamKind::Cellular && u.is_eligible())
            {
                return Some(cell);
            }
        }
        self.networks.values().find(|u| u.is_eligible())
    }

    /// Explicit priority walk over a configured preferred-type ordering.
    pub fn select_preferred_upstream_type(&self, preferred_types: &[UpstreamKind]) -> Option<&UpstreamState> {
        preferred_types
            .iter()
            .find_map(|kind| self.networks.values().find(|u| u.kind == *kind && u.is_eligible()))
    }
}
