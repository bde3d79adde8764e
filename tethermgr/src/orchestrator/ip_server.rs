//! Per-downstream state machine (§4.2). Wraps the shared [`IpServerState`]
//! shape with the transition logic the orchestrator drives; the kernel- and
//! DHCP-facing side effects each transition requires are returned as
//! [`IpServerAction`]s rather than performed here, mirroring the
//! action-returning `Nat64Machine::update` already in `tethermgr-lib`.

use cidr::Ipv4Cidr;
use rand::Rng;

use tethermgr_lib::address_coordinator::{AddressCoordinator, ServerId};
use tethermgr_lib::downstream::{ConnectivityScope, DownstreamType, TetheringRequest};
use tethermgr_lib::error::ErrorCode;
use tethermgr_lib::ip_server_state::{IpServerPhase, IpServerState, ServingMode};

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum IpServerAction {
    ConfigureAddress(Ipv4Cidr),
    AddInterfaceToLocalNetwork(Ipv4Cidr),
    RemoveInterfaceFromLocalNetwork,
    StartDhcp(Ipv4Cidr),
    StopDhcp,
    StartRaOffload,
    StopRaOffload,
}

pub struct IpServerRuntime {
    pub state: IpServerState,
}

impl IpServerRuntime {
    pub fn new(interface_name: impl Into<String>, interface_type: DownstreamType, is_ncm: bool) -> Self {
        IpServerRuntime { state: IpServerState::new(interface_name, interface_type, is_ncm) }
    }

    /// UNAVAILABLE -> AVAILABLE, fired when the backing interface appears.
    pub fn start(&mut self) {
        if self.state.phase == IpServerPhase::Unavailable {
            self.state.phase = IpServerPhase::Available;
            self.state.last_error = ErrorCode::NoError;
        }
    }

    /// AVAILABLE -> TETHERED|LOCAL_ONLY (§4.2 steps 1-6). Any step failure
    /// (currently: address exhaustion) reverts to AVAILABLE with `lastError`
    /// set and returns no actions, matching "on any step failure: revert
    /// prior steps, set lastError, move to AVAILABLE".
    pub fn enable(
        &mut self,
        server_id: ServerId,
        mode: ServingMode,
        request: &TetheringRequest,
        coordinator: &mut AddressCoordinator,
        rng: &mut impl Rng,
    ) -> Vec<IpServerAction> {
        if self.state.phase != IpServerPhase::Available {
            return Vec::new();
        }

        let Some(prefix) = coordinator.request_downstream_address(
            server_id,
            request.downstream_type,
            request.scope,
            true,
            rng,
        ) else {
            self.state.last_error = ErrorCode::UnavailIface;
            return Vec::new();
        };

        self.state.assigned_prefix = Some(prefix);
        self.state.serving_mode = Some(mode);
        self.state.phase = match mode {
            ServingMode::Tethered => IpServerPhase::Tethered,
            ServingMode::LocalOnly => IpServerPhase::LocalOnly,
        };
        self.state.last_error = ErrorCode::NoError;

        let mut actions = vec![
            IpServerAction::ConfigureAddress(prefix),
            IpServerAction::AddInterfaceToLocalNetwork(prefix),
            IpServerAction::StartDhcp(prefix),
        ];
        if mode == ServingMode::Tethered {
            actions.push(IpServerAction::StartRaOffload);
        }
        actions
    }

    /// TETHERED|LOCAL_ONLY -> AVAILABLE: stop DHCP, remove routes, release
    /// the assigned prefix.
    pub fn unwanted(&mut self, server_id: ServerId, coordinator: &mut AddressCoordinator) -> Vec<IpServerAction> {
        if !self.state.is_serving() {
            return Vec::new();
        }

        coordinator.release_downstream(server_id);
        let was_tethered = self.state.serving_mode == Some(ServingMode::Tethered);
        self.state.phase = IpServerPhase::Available;
        self.state.assigned_prefix = None;
        self.state.serving_mode = None;

        let mut actions = vec![IpServerAction::StopDhcp, IpServerAction::RemoveInterfaceFromLocalNetwork];
        if was_tethered {
            actions.push(IpServerAction::StopRaOffload);
        }
        actions
    }

    /// AVAILABLE -> UNAVAILABLE, fired when the backing interface disappears.
    pub fn stop(&mut self) {
        self.state.phase = IpServerPhase::Unavailable;
        self.state.assigned_prefix = None;
        self.state.serving_mode = None;
    }

    /// `NOTIFY_PREFIX_CONFLICT`: release the current prefix and re-request.
    /// Without a fresh one, transition to AVAILABLE with `UnavailIface`
    /// (nearest taxonomy member to "no address available").
    pub fn on_prefix_conflict(
        &mut self,
        server_id: ServerId,
        downstream_type: DownstreamType,
        scope: ConnectivityScope,
        coordinator: &mut AddressCoordinator,
        rng: &mut impl Rng,
    ) -> Vec<IpServerAction> {
        if !self.state.is_serving() {
            return Vec::new();
        }

        coordinator.release_downstream(server_id);
        match coordinator.request_downstream_address(server_id, downstream_type, scope, false, rng) {
            Some(prefix) => {
                self.state.assigned_prefix = Some(prefix);
                vec![
                    IpServerAction::RemoveInterfaceFromLocalNetwork,
                    IpServerAction::ConfigureAddress(prefix),
                    IpServerAction::AddInterfaceToLocalNetwork(prefix),
                    IpServerAction::StartDhcp(prefix),
                ]
            }
            None => {
                let was_tethered = self.state.serving_mode == Some(ServingMode::Tethered);
                self.state.phase = IpServerPhase::Available;
                self.state.assigned_prefix = None;
                self.state.serving_mode = None;
                self.state.last_error = ErrorCode::UnavailIface;
                let mut actions =
                    vec![IpServerAction::StopDhcp, IpServerAction::RemoveInterfaceFromLocalNetwork];
                if was_tethered {
                    actions.push(IpServerAction::StopRaOffload);
                }
                actions
            }
        }
    }
}
