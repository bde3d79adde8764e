//! Shared scaffolding for driving `TetherOrchestrator` in-process against a
//! mocked `RoutingOps`, without a live `tethermgr-routingd` or root. Mirrors
//! the `orchestrator_with_mock`/`SharedMock` pattern `tethermgr`'s own
//! orchestrator test module uses, just with the `Arc<MockRoutingOps>` handle
//! kept outside the crate the orchestrator lives in.

use std::net::Ipv4Addr;
use std::sync::Arc;

use cidr::Ipv4Cidr;

use tethermgr::orchestrator::TetherOrchestrator;
use tethermgr::orchestrator::routing_coordinator::{self, RoutingOps, mocks::MockRoutingOps};
use tethermgr_lib::caller::{CallerContext, Capability};
use tethermgr_lib::config::Config;
use tethermgr_lib::event::TetherEvent;
use tethermgr_lib::upstream::{NetworkId, UpstreamKind, UpstreamState};

pub type TestSink = Box<dyn Fn(TetherEvent)>;
pub type Orchestrator = TetherOrchestrator<TestSink>;

/// Wraps an `Arc<MockRoutingOps>` so the orchestrator can own a
/// `Box<dyn RoutingOps>` while the test keeps its own handle to inspect
/// recorded calls.
pub struct SharedMock(pub Arc<MockRoutingOps>);

impl RoutingOps for SharedMock {
    fn ping(&self) -> Result<(), routing_coordinator::Error> {
        self.0.ping()
    }
    fn add_interface_to_local_network(&self, i: &str, p: Ipv4Cidr) -> Result<(), routing_coordinator::Error> {
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
    fn configure_address(&self, i: &str, a: Ipv4Cidr) -> Result<(), routing_coordinator::Error> {
        self.0.configure_address(i, a)
    }
    fn set_interface_up(&self, i: &str) -> Result<(), routing_coordinator::Error> {
        self.0.set_interface_up(i)
    }
    fn set_interface_down(&self, i: &str) -> Result<(), routing_coordinator::Error> {
        self.0.set_interface_down(i)
    }
    fn add_route(&self, i: &str, d: Ipv4Cidr, g: Option<Ipv4Addr>) -> Result<(), routing_coordinator::Error> {
        self.0.add_route(i, d, g)
    }
    fn remove_route(&self, i: &str, d: Ipv4Cidr) -> Result<(), routing_coordinator::Error> {
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
    fn set_dns_forwarders(&self, n: u32, s: &[Ipv4Addr]) -> Result<(), routing_coordinator::Error> {
        self.0.set_dns_forwarders(n, s)
    }
    fn teardown_stale_rules(&self) -> Result<(), routing_coordinator::Error> {
        self.0.teardown_stale_rules()
    }
}

pub fn orchestrator_with_mock() -> (Orchestrator, Arc<MockRoutingOps>) {
    orchestrator_with_config(Config::default())
}

pub fn orchestrator_with_config(config: Config) -> (Orchestrator, Arc<MockRoutingOps>) {
    let mock = Arc::new(MockRoutingOps::default());
    let routing: Box<dyn RoutingOps> = Box::new(SharedMock(mock.clone()));
    (TetherOrchestrator::new(config, routing), mock)
}

/// A caller holding the platform's own `TETHER_PRIVILEGED`/`NETWORK_STACK`
/// identity, the way the orchestrator's own process would act on its behalf.
pub fn privileged_caller() -> CallerContext {
    CallerContext::new(1000, "com.android.settings")
        .with_capability(Capability::TetherPrivileged)
        .with_capability(Capability::NetworkStack)
        .with_capability(Capability::AccessNetworkState)
}

/// An ordinary third-party app: no elevated capabilities.
pub fn app_caller(uid: u32) -> CallerContext {
    CallerContext::new(uid, "com.example.app")
}

pub fn wifi_upstream(network: u32, interface_name: impl Into<String>) -> UpstreamState {
    let mut upstream = UpstreamState::new(NetworkId(network), UpstreamKind::Wifi, interface_name);
    upstream.validated = true;
    upstream.is_default_route = true;
    upstream
}

pub fn cellular_upstream(network: u32, interface_name: impl Into<String>) -> UpstreamState {
    let mut upstream = UpstreamState::new(NetworkId(network), UpstreamKind::Cellular, interface_name);
    upstream.validated = true;
    upstream.is_default_route = true;
    upstream
}

/// The three reserved private pools `AddressCoordinator` draws downstream
/// prefixes from (§4.1); an upstream claiming all three leaves no prefix a
/// downstream can be assigned, forcing the `NOTIFY_PREFIX_CONFLICT` fallback
/// path instead of a reassignment.
pub fn every_private_pool() -> Vec<Ipv4Cidr> {
    vec![
        "10.0.0.0/8".parse().unwrap(),
        "172.16.0.0/12".parse().unwrap(),
        "192.168.0.0/16".parse().unwrap(),
    ]
}
