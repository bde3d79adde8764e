//! TetherOrchestrator (§3, §4.6, §5): the single state machine the daemon's
//! cooperative event loop drives. Folds `Command`s from the control socket
//! and `Event`s from the bus in the exact order they arrive and turns them
//! into `IpServerRuntime`/`OffloadController`/`Nat464Controller` transitions,
//! applying whatever actions those return through `RoutingOps`. Like the
//! per-component state machines it wraps, nothing in here blocks: every
//! `RoutingOps` call is a single bounded-time RPC the caller already pays for
//! on the tethering thread (§5's "no component may block the main loop for
//! longer than a single bounded RPC").

pub mod callback_registry;
pub mod event_bus;
pub mod ip_server;
pub mod nat464;
pub mod offload;
pub mod routing_coordinator;
pub mod upstream_monitor;

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::Duration;

use tethermgr_lib::address_coordinator::{AddressCoordinator, ServerId};
use tethermgr_lib::caller::CallerContext;
use tethermgr_lib::command::{Command, Response};
use tethermgr_lib::config::Config;
use tethermgr_lib::downstream::{ConnectivityScope, DownstreamType, SoftApConfig, TetheringRequest};
use tethermgr_lib::error::ErrorCode;
use tethermgr_lib::event::{IpServerSnapshot, UpstreamSummary};
use tethermgr_lib::ip_server_state::ServingMode;
use tethermgr_lib::nat64::Nat64Signals;
use tethermgr_lib::orchestrator_state::OrchestratorState;
use tethermgr_lib::upstream::{NetworkId, UpstreamKind, UpstreamState};
use tethermgr_lib::usb::UsbFunctionState;

use callback_registry::{CallbackRegistry, ListenerId};
use event_bus::Event;
use ip_server::{IpServerAction, IpServerRuntime};
use nat464::Nat464Controller;
use offload::{OffloadAction, OffloadController};
use routing_coordinator::RoutingOps;
use upstream_monitor::{UpstreamEvent, UpstreamMonitor};

/// Used for `tetherDnsSet` (§4.6) when the selected upstream's link
/// properties carry no DNS servers of their own.
const DEFAULT_DNS_SERVERS: [Ipv4Addr; 2] = [Ipv4Addr::new(8, 8, 8, 8), Ipv4Addr::new(8, 8, 4, 4)];

/// §4.6 upstream-selection step 3: how long to wait before re-running
/// `choose_upstream` after a selection attempt finds no candidate and isn't
/// already trying cellular.
const RETRY_UPSTREAM_DELAY: Duration = Duration::from_secs(10);

struct ServerEntry {
    server_id: ServerId,
    owner_uid: u32,
    scope: ConnectivityScope,
    soft_ap_config: Option<SoftApConfig>,
    runtime: IpServerRuntime,
}

fn snapshot(interface_name: &str, entry: &ServerEntry) -> IpServerSnapshot {
    IpServerSnapshot {
        interface_name: interface_name.to_string(),
        downstream_type: entry.runtime.state.interface_type,
        phase: entry.runtime.state.phase,
        serving_mode: entry.runtime.state.serving_mode,
        last_error: entry.runtime.state.last_error,
        soft_ap_config: entry.soft_ap_config.clone(),
    }
}

/// Conventional interface name used when a caller doesn't name one
/// explicitly (`startTethering`/`setUsbTethering`); a real platform binds
/// this from the gadget/hostapd config that actually brought the interface
/// up, which this process does not own (§9).
fn default_interface_name(downstream_type: DownstreamType, usb: UsbFunctionState) -> String {
    match downstream_type {
        DownstreamType::Wifi => "wlan0".to_string(),
        DownstreamType::WifiP2p => "p2p0".to_string(),
        DownstreamType::Usb => {
            if usb.ncm {
                "ncm0".to_string()
            } else {
                "usb0".to_string()
            }
        }
        DownstreamType::Ncm => "ncm0".to_string(),
        DownstreamType::Bluetooth => "bt-pan0".to_string(),
        DownstreamType::Ethernet => "eth0".to_string(),
        DownstreamType::Virtual => "tether-virtual0".to_string(),
        DownstreamType::Wigig => "wigig0".to_string(),
    }
}

/// `Tether`/`StartTethering` naming an explicit interface require system
/// permission (§6.1); the type-only form only needs change permission.
fn check_caller_for_request(caller: &CallerContext, request: &TetheringRequest) -> Result<(), ErrorCode> {
    if request.interface_name.is_some() {
        caller.check_system_permission()
    } else {
        caller.check_change_permission(false)
    }
}

pub struct TetherOrchestrator<S> {
    config: Config,
    state: OrchestratorState,
    servers: HashMap<String, ServerEntry>,
    next_server_id: ServerId,
    coordinator: AddressCoordinator,
    upstreams: UpstreamMonitor,
    offload: OffloadController,
    nat464: Nat464Controller,
    listeners: CallbackRegistry<S>,
    routing: Box<dyn RoutingOps>,
    usb: UsbFunctionState,
    current_upstream: Option<NetworkId>,
    /// Set by `choose_upstream` when selection comes up empty without
    /// trying cellular; drained by the daemon loop to arm a delayed
    /// `Event::RetryUpstream` (§4.6 step 3).
    pending_retry: Option<Duration>,
}

impl<S> TetherOrchestrator<S>
where
    S: Fn(tethermgr_lib::event::TetherEvent),
{
    pub fn new(config: Config, routing: Box<dyn RoutingOps>) -> Self {
        let coordinator = AddressCoordinator::new(config.dedicated_ip_policy);
        TetherOrchestrator {
            config,
            state: OrchestratorState::Initial,
            servers: HashMap::new(),
            next_server_id: 1,
            coordinator,
            upstreams: UpstreamMonitor::new(),
            offload: OffloadController::new(),
            nat464: Nat464Controller::new(),
            listeners: CallbackRegistry::new(),
            routing,
            usb: UsbFunctionState::none(),
            current_upstream: None,
            pending_retry: None,
        }
    }

    pub fn state(&self) -> OrchestratorState {
        self.state
    }

    /// Drained by the daemon loop after every command/event dispatch; `Some`
    /// means `choose_upstream` found nothing without trying cellular and the
    /// caller should arm a one-shot timer that redelivers
    /// `Event::RetryUpstream` after the returned delay (§4.6 step 3).
    pub fn take_pending_retry(&mut self) -> Option<Duration> {
        self.pending_retry.take()
    }

    /// Drops any upstream-prefix bookkeeping for networks gone since the
    /// last run, called once at daemon startup (§9).
    pub fn prune_stale_upstreams(&mut self, current_networks: &[NetworkId]) {
        self.coordinator.maybe_remove_deprecated_upstreams(current_networks);
    }

    pub fn check_callback_permission(&self, caller: &CallerContext) -> Result<(), ErrorCode> {
        caller.check_callback_permission()
    }

    pub fn register_listener(&mut self, uid: u32, has_system_privilege: bool, make_sink: impl FnOnce(ListenerId) -> S) -> ListenerId {
        self.listeners.register_with(uid, has_system_privilege, make_sink)
    }

    pub fn unregister_listener(&mut self, id: ListenerId) {
        self.listeners.unregister(id);
    }

    fn status_snapshot(&self) -> Vec<IpServerSnapshot> {
        self.servers.iter().map(|(name, entry)| snapshot(name, entry)).collect()
    }

    fn interface_for_type(&self, downstream_type: DownstreamType) -> Option<String> {
        self.servers
            .iter()
            .find(|(_, entry)| entry.runtime.state.interface_type == downstream_type && entry.runtime.state.is_serving())
            .map(|(name, _)| name.clone())
    }

    fn set_state(&mut self, state: OrchestratorState) {
        if self.state != state {
            self.state = state;
            self.listeners.orchestrator_state_changed(state);
        }
    }

    fn emit_tether_states_changed(&self) {
        let servers: Vec<(IpServerSnapshot, u32)> =
            self.servers.iter().map(|(name, entry)| (snapshot(name, entry), entry.owner_uid)).collect();
        self.listeners.tether_states_changed(&servers);
    }

    fn apply_ip_server_actions(&self, interface_name: &str, actions: Vec<IpServerAction>) {
        for action in actions {
            let result = match action {
                IpServerAction::ConfigureAddress(prefix) => self.routing.configure_address(interface_name, prefix),
                IpServerAction::AddInterfaceToLocalNetwork(prefix) => {
                    self.routing.add_interface_to_local_network(interface_name, prefix)
                }
                IpServerAction::RemoveInterfaceFromLocalNetwork => {
                    self.routing.remove_interface_from_local_network(interface_name)
                }
                // DHCP and RA offload are owned by daemons outside this
                // process; there is no routing-socket request for them.
                IpServerAction::StartDhcp(_) | IpServerAction::StopDhcp => Ok(()),
                IpServerAction::StartRaOffload | IpServerAction::StopRaOffload => Ok(()),
            };
            if let Err(error) = result {
                tracing::warn!(interface = %interface_name, %error, "failed to apply ip server action");
            }
        }
    }

    fn apply_offload_actions(&self, actions: Vec<OffloadAction>) {
        if actions.is_empty() {
            return;
        }
        for action in &actions {
            let result = match action {
                OffloadAction::StartOffload { downstream, upstream } => self.routing.start_offload(downstream, upstream),
                OffloadAction::StopOffload { downstream } => self.routing.stop_offload(downstream),
            };
            if let Err(error) = result {
                tracing::warn!(%error, "failed to apply offload action");
            }
        }
        self.listeners.offload_status_changed(self.offload.status());
    }

    fn apply_nat64_action(&self, network: NetworkId, action: tethermgr_lib::nat64::Nat64Action) {
        use tethermgr_lib::nat64::Nat64Action;
        // Prefix discovery and clat lifecycle are driven by a dns64/clatd
        // process this orchestrator does not own; logging is the full
        // extent of what it can do from here.
        match action {
            Nat64Action::StartDiscovery => tracing::info!(network = network.0, "starting nat64 prefix discovery"),
            Nat64Action::StopDiscovery => tracing::info!(network = network.0, "stopping nat64 prefix discovery"),
            Nat64Action::StartClat { prefix } => tracing::info!(network = network.0, %prefix, "starting clat"),
            Nat64Action::StopClat => tracing::info!(network = network.0, "stopping clat"),
            Nat64Action::AttachStackedInterface { prefix } => {
                tracing::info!(network = network.0, %prefix, "attaching clat stacked interface")
            }
        }
    }

    fn nat64_signals_for(upstream: &UpstreamState) -> Nat64Signals {
        Nat64Signals {
            supported_net_type: matches!(upstream.kind, UpstreamKind::Cellular | UpstreamKind::Wifi),
            connected: true,
            // No IPv6-reachability signal is modeled on `UpstreamLinkProperties`;
            // harmless to assume true here since `has_ipv4` being set already
            // rules clat out on any genuinely IPv4-only network.
            has_global_ipv6: true,
            has_ipv4: !upstream.link_properties.ipv4_prefixes.is_empty(),
            skip_464xlat: false,
            destroyed: false,
            cellular: matches!(upstream.kind, UpstreamKind::Cellular),
            cellular_enabled: true,
        }
    }

    fn refresh_nat464(&mut self, network: NetworkId) {
        let Some(upstream) = self.upstreams.get(network).cloned() else {
            return;
        };
        let signals = Self::nat64_signals_for(&upstream);
        let actions = self.nat464.update(network, &upstream.link_properties.interface_name, &signals);
        for action in actions {
            self.apply_nat64_action(network, action);
        }
    }

    fn resolve_prefix_conflicts(&mut self, server_ids: Vec<ServerId>) {
        if server_ids.is_empty() {
            return;
        }
        let mut rng = rand::rng();
        for server_id in server_ids {
            let Some((interface_name, downstream_type, scope)) = self.servers.iter().find_map(|(name, entry)| {
                (entry.server_id == server_id).then(|| (name.clone(), entry.runtime.state.interface_type, entry.scope))
            }) else {
                continue;
            };
            let Some(entry) = self.servers.get_mut(&interface_name) else {
                continue;
            };
            let actions = entry.runtime.on_prefix_conflict(server_id, downstream_type, scope, &mut self.coordinator, &mut rng);
            self.apply_ip_server_actions(&interface_name, actions);
        }
        self.refresh_offload_local_prefixes();
        self.sync_tether_mode();
        self.emit_tether_states_changed();
    }

    fn start_downstream(&mut self, request: &TetheringRequest, owner_uid: u32) -> ErrorCode {
        if !self.config.tethering_supported {
            return ErrorCode::Unsupported;
        }

        let interface_name =
            request.interface_name.clone().unwrap_or_else(|| default_interface_name(request.downstream_type, self.usb));

        let server_id = if let Some(entry) = self.servers.get(&interface_name) {
            entry.server_id
        } else {
            let id = self.next_server_id;
            self.next_server_id += 1;
            self.servers.insert(
                interface_name.clone(),
                ServerEntry {
                    server_id: id,
                    owner_uid,
                    scope: request.scope,
                    soft_ap_config: request.soft_ap_config.clone(),
                    runtime: IpServerRuntime::new(interface_name.clone(), request.downstream_type, self.usb.ncm),
                },
            );
            id
        };

        if let Some(entry) = self.servers.get_mut(&interface_name) {
            entry.owner_uid = owner_uid;
            entry.scope = request.scope;
            entry.soft_ap_config = request.soft_ap_config.clone();
            entry.runtime.start();
        }

        let mode = match request.scope {
            ConnectivityScope::Global => ServingMode::Tethered,
            ConnectivityScope::Local => ServingMode::LocalOnly,
        };

        let mut rng = rand::rng();
        let Some(entry) = self.servers.get_mut(&interface_name) else {
            return ErrorCode::InternalError;
        };
        let actions = entry.runtime.enable(server_id, mode, request, &mut self.coordinator, &mut rng);
        let last_error = entry.runtime.state.last_error;

        self.apply_ip_server_actions(&interface_name, actions);
        self.refresh_offload_local_prefixes();
        self.sync_tether_mode();

        if mode == ServingMode::Tethered {
            let offload_actions = self.offload.notify_downstream(interface_name.clone());
            self.apply_offload_actions(offload_actions);
        }

        self.emit_tether_states_changed();
        last_error
    }

    fn stop_downstream(&mut self, interface_name: &str) -> ErrorCode {
        let Some(entry) = self.servers.get_mut(interface_name) else {
            return ErrorCode::UnknownIface;
        };
        let server_id = entry.server_id;
        let was_serving = entry.runtime.state.is_serving();
        let actions = entry.runtime.unwanted(server_id, &mut self.coordinator);
        entry.runtime.stop();

        self.apply_ip_server_actions(interface_name, actions);
        if was_serving {
            let offload_actions = self.offload.remove_downstream(interface_name);
            self.apply_offload_actions(offload_actions);
        }
        self.refresh_offload_local_prefixes();
        self.sync_tether_mode();
        self.emit_tether_states_changed();
        ErrorCode::NoError
    }

    fn set_usb_tethering(&mut self, enable: bool, owner_uid: u32) -> ErrorCode {
        if enable {
            self.usb = UsbFunctionState::requested(false, self.config.force_usb_ncm);
            let downstream_type = if self.usb.ncm { DownstreamType::Ncm } else { DownstreamType::Usb };
            let request = TetheringRequest::new(downstream_type, owner_uid, "tethermgr");
            self.start_downstream(&request, owner_uid)
        } else {
            let iface = self.interface_for_type(DownstreamType::Usb).or_else(|| self.interface_for_type(DownstreamType::Ncm));
            self.usb = UsbFunctionState::none();
            match iface {
                Some(iface) => self.stop_downstream(&iface),
                None => ErrorCode::NoError,
            }
        }
    }

    fn supported_types(&self) -> Vec<DownstreamType> {
        if !self.config.tethering_supported {
            return Vec::new();
        }
        vec![
            DownstreamType::Wifi,
            DownstreamType::Usb,
            DownstreamType::Ncm,
            DownstreamType::Bluetooth,
            DownstreamType::Ethernet,
            DownstreamType::WifiP2p,
        ]
    }

    /// §4.6 "chooseUpstream(tryCell)": `try_cell` is step 1's re-read DUN
    /// setting, not a standing preference, so every caller passes the value
    /// its own triggering event calls for.
    fn choose_upstream(&mut self, try_cell: bool) {
        self.upstreams.set_try_cell(try_cell);
        let preferred = self.config.preferred_upstream_types.clone();
        let chosen = self
            .upstreams
            .select_preferred_upstream_type(&preferred)
            .or_else(|| self.upstreams.get_current_preferred_upstream())
            .cloned();

        match chosen {
            Some(upstream) if !upstream.kind.allows_hardware_offload() && !self.config.allow_vpn_upstreams => {
                self.teardown_upstream();
            }
            Some(upstream) => {
                // Step 4: a non-cellular pick means the DUN request that
                // brought cellular up (if any) is no longer needed.
                if upstream.kind != UpstreamKind::Cellular {
                    self.upstreams.set_try_cell(false);
                }
                self.adopt_upstream(upstream);
            }
            None => {
                self.teardown_upstream();
                // Step 3: already trying cellular means a candidate may still
                // arrive as a connectivity event; only the "give up and poll
                // again" path needs a delayed retry.
                if !try_cell {
                    self.pending_retry = Some(RETRY_UPSTREAM_DELAY);
                }
            }
        }
    }

    fn adopt_upstream(&mut self, upstream: UpstreamState) {
        let network = upstream.network_id;
        let changed = self.current_upstream != Some(network);
        self.current_upstream = Some(network);

        if changed {
            let dns_servers = if upstream.link_properties.dns_servers.is_empty() {
                DEFAULT_DNS_SERVERS.to_vec()
            } else {
                upstream.link_properties.dns_servers.clone()
            };
            if let Err(error) = self.routing.set_dns_forwarders(network.0, &dns_servers) {
                tracing::warn!(%error, "failed to install dns forwarders");
                self.set_state(OrchestratorState::DnsForwardersError);
                return;
            }

            self.offload.set_upstream(Some((upstream.kind, upstream.link_properties.interface_name.clone())));
            let (status, actions) = self.offload.start();
            self.apply_offload_actions(actions);
            self.listeners.offload_status_changed(status);

            let summary =
                UpstreamSummary { interface_name: upstream.link_properties.interface_name.clone(), kind: format!("{:?}", upstream.kind) };
            self.listeners.upstream_changed(Some(summary));
        }

        self.refresh_nat464(network);
    }

    /// Tears down the upstream-specific wiring (offload, 464xlat, the
    /// upstream-changed broadcast) without touching ip forwarding or
    /// `self.state` — those only ever follow notifyList, never the presence
    /// of a chosen upstream (§4.6 entry actions, invariant #4).
    fn teardown_upstream(&mut self) {
        let Some(network) = self.current_upstream.take() else {
            return;
        };
        self.offload.set_upstream(None);
        let actions = self.offload.stop();
        self.apply_offload_actions(actions);
        self.listeners.upstream_changed(None);
        self.nat464.destroy(network);
    }

    /// Enables ip forwarding and enters `TetherModeAlive` the moment
    /// notifyList (any serving `IpServer`) becomes non-empty, and reverses
    /// both the moment it empties again — independent of whether an upstream
    /// has been chosen yet (§4.6 entry action #1, testable property #4).
    /// Called after every change to a server's serving phase.
    fn sync_tether_mode(&mut self) {
        let notify_list_nonempty = self.servers.values().any(|entry| entry.runtime.state.is_serving());
        match self.state {
            OrchestratorState::Initial if notify_list_nonempty => match self.routing.set_ip_forwarding(true) {
                Ok(()) => {
                    self.set_state(OrchestratorState::TetherModeAlive);
                    self.choose_upstream(false);
                }
                Err(error) => {
                    tracing::warn!(%error, "failed to enable ip forwarding");
                    self.set_state(OrchestratorState::IpForwardEnableError);
                }
            },
            OrchestratorState::TetherModeAlive if !notify_list_nonempty => {
                self.teardown_upstream();
                match self.routing.set_ip_forwarding(false) {
                    Ok(()) => self.set_state(OrchestratorState::Initial),
                    Err(error) => {
                        tracing::warn!(%error, "failed to disable ip forwarding");
                        self.set_state(OrchestratorState::IpForwardDisableError);
                    }
                }
            }
            _ => {}
        }
    }

    /// Feeds the offload controller's local-prefix set (§4.4) with this
    /// device's own currently-assigned downstream prefixes, so hardware
    /// offload never fast-paths traffic addressed to this device's own
    /// tethering subnets.
    fn refresh_offload_local_prefixes(&mut self) {
        let prefixes = self.coordinator.active_prefixes().iter().map(ToString::to_string).collect::<Vec<_>>();
        self.offload.set_local_prefixes(prefixes);
    }

    fn apply_config(&mut self, config: Config) {
        self.coordinator.set_dedicated_ip_policy(config.dedicated_ip_policy);
        self.config = config;
        self.listeners.configuration_changed();
        self.listeners.supported_types_changed(self.supported_types());
        self.choose_upstream(false);
    }

    fn handle_upstream_event(&mut self, event: UpstreamEvent) {
        match event {
            UpstreamEvent::Lost(network) => {
                if self.upstreams.remove(network).is_some() {
                    self.coordinator.remove_upstream_prefix(network);
                    self.nat464.destroy(network);
                    if self.current_upstream == Some(network) {
                        self.current_upstream = None;
                        self.offload.set_upstream(None);
                        let actions = self.offload.stop();
                        self.apply_offload_actions(actions);
                        self.listeners.upstream_changed(None);
                    }
                }
                // "on U+, immediately try DUN" (§4.6 LOST handler).
                self.choose_upstream(true);
            }
            // "DEFAULT_SWITCHED (auto-upstream mode) → reselect, try cell".
            UpstreamEvent::DefaultSwitched => self.choose_upstream(true),
            UpstreamEvent::LinkPropertiesChanged(_) | UpstreamEvent::CapabilitiesChanged(_) => {
                self.choose_upstream(false);
            }
            // "LOCAL_PREFIXES → forward to offload exempt set" (§4.6); this is
            // the on-device reserved-prefix list UpstreamMonitor reports, not
            // this device's own downstream prefixes (those feed
            // `set_local_prefixes` via `refresh_offload_local_prefixes`).
            UpstreamEvent::LocalPrefixes(prefixes) => {
                let prefixes = prefixes.iter().map(ToString::to_string).collect::<Vec<_>>();
                self.offload.set_exempt_prefixes(prefixes);
            }
        }
    }

    /// Called directly by whatever component maintains upstream network
    /// state (§4.3); it is not itself routed through the `Event` bus because
    /// it carries the full `UpstreamState` payload rather than a bare
    /// signal. Resolves any prefix conflicts the new prefixes introduce
    /// before re-running upstream selection.
    pub fn track_upstream(&mut self, upstream: UpstreamState) {
        let network = upstream.network_id;
        let kind = upstream.kind;
        let prefixes = upstream.link_properties.ipv4_prefixes.clone();
        self.upstreams.track(upstream);
        let conflicted = self.coordinator.update_upstream_prefix(network, kind, prefixes);
        self.resolve_prefix_conflicts(conflicted);
        self.choose_upstream(false);
    }

    pub fn handle_event(&mut self, event: Event) {
        match event {
            Event::Upstream(upstream_event) => self.handle_upstream_event(upstream_event),
            // The retry itself is the ¬tryCell path; it reschedules itself
            // via `pending_retry` if selection still finds nothing.
            Event::RetryUpstream => self.choose_upstream(false),
            Event::ClearError => {
                if self.state.is_error() {
                    self.set_state(OrchestratorState::Initial);
                }
            }
            Event::Nat64RouterAdvertisement { network, prefix } => {
                if let Some(upstream) = self.upstreams.get(network) {
                    let iface = upstream.link_properties.interface_name.clone();
                    self.nat464.set_ra_prefix(network, &iface, Some(prefix));
                    self.refresh_nat464(network);
                }
            }
            Event::Nat64PrefixWithdrawn { network } => {
                if let Some(upstream) = self.upstreams.get(network) {
                    let iface = upstream.link_properties.interface_name.clone();
                    self.nat464.set_ra_prefix(network, &iface, None);
                    self.refresh_nat464(network);
                }
            }
            Event::Nat64StackedInterfaceUp { network, interface_name } => {
                if let Some(action) = self.nat464.on_stacked_interface_up(network, &interface_name) {
                    self.apply_nat64_action(network, action);
                }
            }
            Event::ConfigReloaded(config) => self.apply_config(config),
            Event::ListenerDisconnected(id) => self.listeners.unregister(id),
        }
    }
}

impl<S> TetherOrchestrator<S>
where
    S: Fn(tethermgr_lib::event::TetherEvent),
{
    pub fn handle_command(&mut self, cmd: Command) -> Response {
        match cmd {
            Command::Tether { caller, request } => {
                let code = match caller.check_system_permission() {
                    Ok(()) => self.start_downstream(&request, caller.uid),
                    Err(code) => code,
                };
                Response::Result { code }
            }
            Command::Untether { caller, interface_name } => {
                let code = match caller.check_system_permission() {
                    Ok(()) => self.stop_downstream(&interface_name),
                    Err(code) => code,
                };
                Response::Result { code }
            }
            Command::StartTethering { caller, request } => {
                let code = match check_caller_for_request(&caller, &request) {
                    Ok(()) => self.start_downstream(&request, caller.uid),
                    Err(code) => code,
                };
                Response::Result { code }
            }
            Command::StopTethering { caller, downstream_type } => {
                let code = match caller.check_change_permission(false) {
                    Ok(()) => match self.interface_for_type(downstream_type) {
                        Some(iface) => self.stop_downstream(&iface),
                        None => ErrorCode::UnknownIface,
                    },
                    Err(code) => code,
                };
                Response::Result { code }
            }
            Command::StopAllTethering { caller } => {
                let code = match caller.check_change_permission(false) {
                    Ok(()) => {
                        let interfaces: Vec<String> = self.servers.keys().cloned().collect();
                        for iface in interfaces {
                            self.stop_downstream(&iface);
                        }
                        ErrorCode::NoError
                    }
                    Err(code) => code,
                };
                Response::Result { code }
            }
            Command::SetUsbTethering { caller, enable } => {
                let code = match caller.check_change_permission(false) {
                    Ok(()) => self.set_usb_tethering(enable, caller.uid),
                    Err(code) => code,
                };
                Response::Result { code }
            }
            Command::RequestLatestTetheringEntitlementResult { caller, downstream_type, .. } => {
                match caller.check_change_permission(false) {
                    Ok(()) => {
                        let entitled = self.config.tethering_supported && self.supported_types().contains(&downstream_type);
                        Response::EntitlementResult { code: ErrorCode::NoError, entitled: Some(entitled) }
                    }
                    Err(code) => Response::EntitlementResult { code, entitled: None },
                }
            }
            Command::RegisterTetheringEventCallback { caller } => match caller.check_callback_permission() {
                Ok(()) => Response::Registered,
                Err(code) => Response::Result { code },
            },
            Command::UnregisterTetheringEventCallback { caller } => {
                self.listeners.unregister_by_uid(caller.uid);
                Response::Result { code: ErrorCode::NoError }
            }
            Command::IsTetheringSupported { .. } => {
                Response::TetheringSupported { supported: self.config.tethering_supported, types: self.supported_types() }
            }
            Command::SetPreferTestNetworks { caller, prefer } => {
                let code = match caller.check_system_permission() {
                    Ok(()) => {
                        self.upstreams.set_prefer_test_networks(prefer);
                        ErrorCode::NoError
                    }
                    Err(code) => code,
                };
                Response::Result { code }
            }
            Command::Status => Response::Status { orchestrator_state: self.state, servers: self.status_snapshot() },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use routing_coordinator::mocks::MockRoutingOps;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::Arc;
    use tethermgr_lib::caller::Capability;
    use tethermgr_lib::event::TetherEvent;
    use tethermgr_lib::ip_server_state::IpServerPhase;

    type TestSink = Box<dyn Fn(TetherEvent)>;

    fn orchestrator_with_mock() -> (TetherOrchestrator<TestSink>, Arc<MockRoutingOps>) {
        let mock = Arc::new(MockRoutingOps::default());
        let routing: Box<dyn RoutingOps> = Box::new(SharedMock(mock.clone()));
        (TetherOrchestrator::new(Config::default(), routing), mock)
    }

    /// Wraps an `Arc<MockRoutingOps>` so the orchestrator can own a
    /// `Box<dyn RoutingOps>` while the test keeps its own handle to inspect
    /// recorded calls.
    struct SharedMock(Arc<MockRoutingOps>);

    impl RoutingOps for SharedMock {
        fn ping(&self) -> Result<(), routing_coordinator::Error> {
            self.0.ping()
        }
        fn add_interface_to_local_network(&self, i: &str, p: cidr::Ipv4Cidr) -> Result<(), routing_coordinator::Error> {
            self.0.add_interface_to_local_network(i, p)
        }
        fn remove_interface_from_local_network(&self, i: &str) -> Result<(), routing_coordinator::Error> {
            self.0.remove_interface_from_local_network(i)
        }
        fn add_interface_to_network(&self, i: &str, n: u32) -> Result<(), routing_coordinator::Error> {
            self.0.add_interface_to_network(i, n)
        }
        fn remove_interface_from_network(&self, i: &str, n: u32) -> Result<(), routing_coordinator::Error> {
            self.0.remove_interface_from_network(i, n)
        }
        fn configure_address(&self, i: &str, a: cidr::Ipv4Cidr) -> Result<(), routing_coordinator::Error> {
            self.0.configure_address(i, a)
        }
        fn set_interface_up(&self, i: &str) -> Result<(), routing_coordinator::Error> {
            self.0.set_interface_up(i)
        }
        fn set_interface_down(&self, i: &str) -> Result<(), routing_coordinator::Error> {
            self.0.set_interface_down(i)
        }
        fn add_route(
            &self,
            i: &str,
            d: cidr::Ipv4Cidr,
            g: Option<std::net::Ipv4Addr>,
        ) -> Result<(), routing_coordinator::Error> {
            self.0.add_route(i, d, g)
        }
        fn remove_route(&self, i: &str, d: cidr::Ipv4Cidr) -> Result<(), routing_coordinator::Error> {
            self.0.remove_route(i, d)
        }
        fn start_offload(&self, d: &str, u: &str) -> Result<(), routing_coordinator::Error> {
            self.0.start_offload(d, u)
        }
        fn stop_offload(&self, d: &str) -> Result<(), routing_coordinator::Error> {
            self.0.stop_offload(d)
        }
        fn set_ip_forwarding(&self, enabled: bool) -> Result<(), routing_coordinator::Error> {
            self.0.set_ip_forwarding(enabled)
        }
        fn set_dns_forwarders(&self, n: u32, s: &[std::net::Ipv4Addr]) -> Result<(), routing_coordinator::Error> {
            self.0.set_dns_forwarders(n, s)
        }
        fn teardown_stale_rules(&self) -> Result<(), routing_coordinator::Error> {
            self.0.teardown_stale_rules()
        }
    }

    fn privileged_caller() -> CallerContext {
        CallerContext::new(1000, "com.example.app")
            .with_capability(Capability::TetherPrivileged)
            .with_capability(Capability::NetworkStack)
    }

    fn wifi_upstream() -> UpstreamState {
        let mut upstream = UpstreamState::new(NetworkId(1), UpstreamKind::Wifi, "wlan1");
        upstream.validated = true;
        upstream.is_default_route = true;
        upstream
    }

    #[test]
    fn tether_then_untether_round_trips_phase() {
        let (mut orch, _mock) = orchestrator_with_mock();
        let request = TetheringRequest::new(DownstreamType::Wifi, 1000, "com.example.app").with_interface_name("wlan0");
        let resp = orch.handle_command(Command::Tether { caller: privileged_caller(), request });
        assert!(matches!(resp, Response::Result { code: ErrorCode::NoError }));

        match orch.handle_command(Command::Status) {
            Response::Status { servers, .. } => {
                assert_eq!(servers.len(), 1);
                assert_eq!(servers[0].phase, IpServerPhase::Tethered);
            }
            _ => panic!("wrong response"),
        }

        let resp = orch.handle_command(Command::Untether { caller: privileged_caller(), interface_name: "wlan0".to_string() });
        assert!(matches!(resp, Response::Result { code: ErrorCode::NoError }));
        match orch.handle_command(Command::Status) {
            Response::Status { servers, .. } => assert_eq!(servers[0].phase, IpServerPhase::Unavailable),
            _ => panic!("wrong response"),
        }
    }

    #[test]
    fn unprivileged_caller_cannot_tether_an_explicit_interface() {
        let (mut orch, _mock) = orchestrator_with_mock();
        let caller = CallerContext::new(10_100, "com.example.app");
        let request = TetheringRequest::new(DownstreamType::Wifi, 10_100, "com.example.app").with_interface_name("wlan0");
        let resp = orch.handle_command(Command::Tether { caller, request });
        assert!(matches!(resp, Response::Result { code: ErrorCode::NoChangeTetheringPermission }));
    }

    #[test]
    fn tracking_an_upstream_alone_does_not_enable_ip_forwarding() {
        let (mut orch, mock) = orchestrator_with_mock();
        orch.track_upstream(wifi_upstream());
        assert!(!mock.ip_forwarding_enabled());
        assert_eq!(orch.state(), OrchestratorState::Initial);
    }

    #[test]
    fn first_active_downstream_enables_ip_forwarding_before_any_upstream_is_chosen() {
        let (mut orch, mock) = orchestrator_with_mock();
        let request = TetheringRequest::new(DownstreamType::Wifi, 1000, "com.example.app").with_interface_name("wlan0");
        orch.handle_command(Command::Tether { caller: privileged_caller(), request });
        assert!(mock.ip_forwarding_enabled());
        assert_eq!(orch.state(), OrchestratorState::TetherModeAlive);
    }

    #[test]
    fn adopting_an_upstream_installs_default_dns_forwarders_when_none_advertised() {
        let (mut orch, mock) = orchestrator_with_mock();
        orch.track_upstream(wifi_upstream());
        let forwarders = mock.dns_forwarders.lock().unwrap();
        assert_eq!(forwarders.len(), 1);
        assert_eq!(forwarders[0].0, 1);
        assert_eq!(forwarders[0].1, vec![std::net::Ipv4Addr::new(8, 8, 8, 8), std::net::Ipv4Addr::new(8, 8, 4, 4)]);
    }

    #[test]
    fn dns_forwarder_failure_moves_to_dns_forwarders_error() {
        let (mut orch, mock) = orchestrator_with_mock();
        *mock.fail_next.lock().unwrap() = Some("netd refused".to_string());
        orch.track_upstream(wifi_upstream());
        assert_eq!(orch.state(), OrchestratorState::DnsForwardersError);
        assert!(!mock.ip_forwarding_enabled());
    }

    #[test]
    fn stopping_the_last_downstream_disables_ip_forwarding() {
        let (mut orch, mock) = orchestrator_with_mock();
        let request = TetheringRequest::new(DownstreamType::Wifi, 1000, "com.example.app").with_interface_name("wlan0");
        orch.handle_command(Command::Tether { caller: privileged_caller(), request });
        assert!(mock.ip_forwarding_enabled());

        orch.handle_command(Command::Untether { caller: privileged_caller(), interface_name: "wlan0".to_string() });
        assert!(!mock.ip_forwarding_enabled());
        assert_eq!(orch.state(), OrchestratorState::Initial);
    }

    #[test]
    fn losing_the_only_upstream_does_not_disable_ip_forwarding_while_a_downstream_still_serves() {
        let (mut orch, mock) = orchestrator_with_mock();
        let request = TetheringRequest::new(DownstreamType::Wifi, 1000, "com.example.app").with_interface_name("wlan0");
        orch.handle_command(Command::Tether { caller: privileged_caller(), request });
        orch.track_upstream(wifi_upstream());
        assert!(mock.ip_forwarding_enabled());

        orch.handle_event(Event::Upstream(UpstreamEvent::Lost(NetworkId(1))));
        assert!(mock.ip_forwarding_enabled(), "a served downstream keeps forwarding up even with no upstream adopted");
        assert_eq!(orch.state(), OrchestratorState::TetherModeAlive);
    }

    #[test]
    fn vpn_upstream_without_opt_in_is_not_adopted() {
        let (mut orch, mock) = orchestrator_with_mock();
        let mut vpn = UpstreamState::new(NetworkId(3), UpstreamKind::Vpn, "tun0");
        vpn.validated = true;
        vpn.is_default_route = true;
        orch.track_upstream(vpn);
        assert!(!mock.ip_forwarding_enabled());
        assert_eq!(orch.state(), OrchestratorState::Initial);
    }

    #[test]
    fn set_usb_tethering_enable_honors_force_usb_ncm() {
        let mut config = Config::default();
        config.force_usb_ncm = true;
        let mock = Arc::new(MockRoutingOps::default());
        let routing: Box<dyn RoutingOps> = Box::new(SharedMock(mock));
        let mut orch: TetherOrchestrator<TestSink> = TetherOrchestrator::new(config, routing);

        let resp = orch.handle_command(Command::SetUsbTethering { caller: privileged_caller(), enable: true });
        assert!(matches!(resp, Response::Result { code: ErrorCode::NoError }));
        match orch.handle_command(Command::Status) {
            Response::Status { servers, .. } => {
                assert_eq!(servers.len(), 1);
                assert_eq!(servers[0].interface_name, "ncm0");
                assert_eq!(servers[0].downstream_type, DownstreamType::Ncm);
            }
            _ => panic!("wrong response"),
        }
    }

    #[test]
    fn registering_a_listener_delivers_future_broadcasts() {
        let (mut orch, _mock) = orchestrator_with_mock();
        let received: Rc<RefCell<Vec<TetherEvent>>> = Rc::new(RefCell::new(Vec::new()));
        let sink_events = received.clone();
        orch.register_listener(1000, true, move |_id| -> TestSink { Box::new(move |event| sink_events.borrow_mut().push(event)) });

        orch.track_upstream(wifi_upstream());
        assert!(!received.borrow().is_empty());
    }

    #[test]
    fn unregister_by_uid_stops_future_delivery() {
        let (mut orch, _mock) = orchestrator_with_mock();
        let received: Rc<RefCell<Vec<TetherEvent>>> = Rc::new(RefCell::new(Vec::new()));
        let sink_events = received.clone();
        orch.register_listener(1000, true, move |_id| -> TestSink { Box::new(move |event| sink_events.borrow_mut().push(event)) });
        orch.handle_command(Command::UnregisterTetheringEventCallback { caller: privileged_caller() });

        orch.track_upstream(wifi_upstream());
        assert!(received.borrow().is_empty());
    }
}
