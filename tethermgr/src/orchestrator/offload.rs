//! OffloadController client half (§4.4): tracks which downstreams should be
//! fast-pathed to the current upstream and reports status back to the
//! orchestrator. Kernel rule programming happens on the other side of
//! [`RoutingCoordinator`](super::routing_coordinator::RoutingCoordinator); this
//! module only owns the decision of what should be active.

use std::collections::BTreeSet;

use tethermgr_lib::event::OffloadStatus;
use tethermgr_lib::upstream::UpstreamKind;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum OffloadAction {
    StartOffload { downstream: String, upstream: String },
    StopOffload { downstream: String },
}

#[derive(Debug, Default)]
pub struct OffloadController {
    running: bool,
    upstream_iface: Option<String>,
    upstream_kind: Option<UpstreamKind>,
    downstreams: BTreeSet<String>,
    local_prefixes: BTreeSet<String>,
    exempt_prefixes: BTreeSet<String>,
}

impl OffloadController {
    pub fn new() -> Self {
        OffloadController::default()
    }

    pub fn status(&self) -> OffloadStatus {
        if self.running {
            OffloadStatus::Started
        } else {
            OffloadStatus::Stopped
        }
    }

    /// Requests offload to come up against the current upstream. Refuses a
    /// VPN upstream outright (§4.4) and reports `Failed` without emitting an
    /// action.
    pub fn start(&mut self) -> (OffloadStatus, Vec<OffloadAction>) {
        let Some(upstream_iface) = self.upstream_iface.clone() else {
            self.running = false;
            return (OffloadStatus::Failed, Vec::new());
        };
        if self.upstream_kind.is_some_and(|k| !k.allows_hardware_offload()) {
            self.running = false;
            return (OffloadStatus::Failed, Vec::new());
        }

        self.running = true;
        let actions = self
            .downstreams
            .iter()
            .map(|d| OffloadAction::StartOffload { downstream: d.clone(), upstream: upstream_iface.clone() })
            .collect();
        (OffloadStatus::Started, actions)
    }

    pub fn stop(&mut self) -> Vec<OffloadAction> {
        if !self.running {
            return Vec::new();
        }
        self.running = false;
        self.downstreams.iter().map(|d| OffloadAction::StopOffload { downstream: d.clone() }).collect()
    }

    /// Updates the tracked upstream; `None` clears it (e.g. on `LOST`).
    pub fn set_upstream(&mut self, upstream: Option<(UpstreamKind, String)>) {
        match upstream {
            Some((kind, iface)) => {
                self.upstream_kind = Some(kind);
                self.upstream_iface = Some(iface);
            }
            None => {
                self.upstream_kind = None;
                self.upstream_iface = None;
            }
        }
    }

    pub fn notify_downstream(&mut self, interface_name: impl Into<String>) -> Vec<OffloadAction> {
        let interface_name = interface_name.into();
        if !self.downstreams.insert(interface_name.clone()) || !self.running {
            return Vec::new();
        }
        let Some(upstream_iface) = self.upstream_iface.clone() else {
            return Vec::new();
        };
        vec![OffloadAction::StartOffload { downstream: interface_name, upstream: upstream_iface }]
    }

    pub fn remove_downstream(&mut self, interface_name: &str) -> Vec<OffloadAction> {
        if !self.downstreams.remove(interface_name) {
            return Vec::new();
        }
        vec![OffloadAction::StopOffload { downstream: interface_name.to_string() }]
    }

    pub fn set_local_prefixes(&mut self, prefixes: impl IntoIterator<Item = String>) {
        self.local_prefixes = prefixes.into_iter().collect();
    }

    pub fn set_exempt_prefixes(&mut self, prefixes: impl IntoIterator<Item = String>) {
        self.exempt_prefixes = prefixes.into_iter().collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_fails_without_an_upstream() {
        let mut offload = OffloadController::new();
        let (status, actions) = offload.start();
        assert_eq!(status, OffloadStatus::Failed);
        assert!(actions.is_empty());
    }

    #[test]
    fn start_refuses_a_vpn_upstream() {
        let mut offload = OffloadController::new();
        offload.set_upstream(Some((UpstreamKind::Vpn, "tun0".to_string())));
        let (status, _) = offload.start();
        assert_eq!(status, OffloadStatus::Failed);
    }

    #[test]
    fn starting_with_existing_downstreams_programs_them_all() {
        let mut offload = OffloadController::new();
        offload.set_upstream(Some((UpstreamKind::Cellular, "rmnet0".to_string())));
        offload.notify_downstream("wlan0");
        let (status, actions) = offload.start();
        assert_eq!(status, OffloadStatus::Started);
        assert_eq!(
            actions,
            vec![OffloadAction::StartOffload { downstream: "wlan0".to_string(), upstream: "rmnet0".to_string() }]
        );
    }

    #[test]
    fn removing_a_downstream_after_start_stops_its_rule() {
        let mut offload = OffloadController::new();
        offload.set_upstream(Some((UpstreamKind::Cellular, "rmnet0".to_string())));
        offload.start();
        offload.notify_downstream("wlan0");
        let actions = offload.remove_downstream("wlan0");
        assert_eq!(actions, vec![OffloadAction::StopOffload { downstream: "wlan0".to_string() }]);
    }
}
