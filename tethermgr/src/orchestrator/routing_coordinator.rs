//! RoutingCoordinator (§4.7): the orchestrator's only window onto kernel
//! state. Narrow, bounded-time RPCs to the privileged `tethermgr-routingd`
//! helper over the routing socket (§6.4, §6.5) — never netlink/nftables
//! calls made in-process. `AddressCoordinator` is deliberately NOT behind
//! this facade (see `tethermgr_lib::routing_protocol`'s module doc): the
//! orchestrator owns it directly and calls it synchronously, which is how
//! the server/orchestrator/coordinator reference cycle is broken (§9).
//!
//! Exposed as the [`RoutingOps`] trait so `TetherOrchestrator` can be driven
//! in tests against [`mocks::MockRoutingOps`] without a live `tethermgr-routingd`
//! or root, mirroring the `NetlinkOps`/`NfTablesOps` split in that helper.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use cidr::Ipv4Cidr;
use thiserror::Error;

use tethermgr_lib::routing_protocol::{RoutingRequest, RoutingResponse};
use tethermgr_lib::socket::routingd;

#[derive(Debug, Error)]
pub enum Error {
    #[error("routing helper client error: {0}")]
    Client(#[from] routingd::Error),
    #[error("routing helper refused the request: {0}")]
    Remote(String),
    #[error("failed to start routing-coordinator runtime: {0}")]
    Runtime(#[source] std::io::Error),
}

pub trait RoutingOps {
    fn ping(&self) -> Result<(), Error>;
    fn add_interface_to_local_network(&self, interface_name: &str, prefix: Ipv4Cidr) -> Result<(), Error>;
    fn remove_interface_from_local_network(&self, interface_name: &str) -> Result<(), Error>;
    fn add_interface_to_network(&self, interface_name: &str, network_id: u32) -> Result<(), Error>;
    fn remove_interface_from_network(&self, interface_name: &str, network_id: u32) -> Result<(), Error>;
    fn configure_address(&self, interface_name: &str, address: Ipv4Cidr) -> Result<(), Error>;
    fn set_interface_up(&self, interface_name: &str) -> Result<(), Error>;
    fn set_interface_down(&self, interface_name: &str) -> Result<(), Error>;
    fn add_route(&self, interface_name: &str, destination: Ipv4Cidr, gateway: Option<Ipv4Addr>) -> Result<(), Error>;
    fn remove_route(&self, interface_name: &str, destination: Ipv4Cidr) -> Result<(), Error>;
    fn start_offload(&self, downstream: &str, upstream: &str) -> Result<(), Error>;
    fn stop_offload(&self, downstream: &str) -> Result<(), Error>;
    fn set_ip_forwarding(&self, enabled: bool) -> Result<(), Error>;
    fn set_dns_forwarders(&self, network_id: u32, servers: &[Ipv4Addr]) -> Result<(), Error>;
    fn teardown_stale_rules(&self) -> Result<(), Error>;
}

/// A bounded-time, synchronous-looking facade over the async routingd
/// client: the tethering thread is not itself async (§5's cooperative
/// single-thread model uses `crossbeam_channel::select!`), so each call
/// blocks on a dedicated single-threaded tokio runtime for the one RPC
/// round-trip rather than pulling the whole event loop onto tokio.
pub struct RoutingCoordinator {
    socket_path: PathBuf,
    rt: tokio::runtime::Runtime,
}

impl RoutingCoordinator {
    pub fn new(socket_path: impl Into<PathBuf>) -> Result<Self, Error> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .enable_time()
            .build()
            .map_err(Error::Runtime)?;
        Ok(RoutingCoordinator { socket_path: socket_path.into(), rt })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    fn call(&self, request: RoutingRequest) -> Result<(), Error> {
        match self.rt.block_on(routingd::process_request(&self.socket_path, &request))? {
            RoutingResponse::Ok | RoutingResponse::Pong => Ok(()),
            RoutingResponse::Error { message } => Err(Error::Remote(message)),
        }
    }
}

impl RoutingOps for RoutingCoordinator {
    fn ping(&self) -> Result<(), Error> {
        self.call(RoutingRequest::Ping)
    }

    fn add_interface_to_local_network(&self, interface_name: &str, prefix: Ipv4Cidr) -> Result<(), Error> {
        self.call(RoutingRequest::AddInterfaceToLocalNetwork { interface_name: interface_name.to_string(), prefix })
    }

    fn remove_interface_from_local_network(&self, interface_name: &str) -> Result<(), Error> {
        self.call(RoutingRequest::RemoveInterfaceFromLocalNetwork { interface_name: interface_name.to_string() })
    }

    fn add_interface_to_network(&self, interface_name: &str, network_id: u32) -> Result<(), Error> {
        self.call(RoutingRequest::AddInterfaceToNetwork { interface_name: interface_name.to_string(), network_id })
    }

    fn remove_interface_from_network(&self, interface_name: &str, network_id: u32) -> Result<(), Error> {
        self.call(RoutingRequest::RemoveInterfaceFromNetwork {
            interface_name: interface_name.to_string(),
            network_id,
        })
    }

    fn configure_address(&self, interface_name: &str, address: Ipv4Cidr) -> Result<(), Error> {
        self.call(RoutingRequest::ConfigureAddress { interface_name: interface_name.to_string(), address })
    }

    fn set_interface_up(&self, interface_name: &str) -> Result<(), Error> {
        self.call(RoutingRequest::SetInterfaceUp { interface_name: interface_name.to_string() })
    }

    fn set_interface_down(&self, interface_name: &str) -> Result<(), Error> {
        self.call(RoutingRequest::SetInterfaceDown { interface_name: interface_name.to_string() })
    }

    fn add_route(&self, interface_name: &str, destination: Ipv4Cidr, gateway: Option<Ipv4Addr>) -> Result<(), Error> {
        self.call(RoutingRequest::AddRoute { interface_name: interface_name.to_string(), destination, gateway })
    }

    fn remove_route(&self, interface_name: &str, destination: Ipv4Cidr) -> Result<(), Error> {
        self.call(RoutingRequest::RemoveRoute { interface_name: interface_name.to_string(), destination })
    }

    fn start_offload(&self, downstream: &str, upstream: &str) -> Result<(), Error> {
        self.call(RoutingRequest::StartOffload { downstream: downstream.to_string(), upstream: upstream.to_string() })
    }

    fn stop_offload(&self, downstream: &str) -> Result<(), Error> {
        self.call(RoutingRequest::StopOffload { downstream: downstream.to_string() })
    }

    fn set_ip_forwarding(&self, enabled: bool) -> Result<(), Error> {
        self.call(RoutingRequest::SetIpForwarding { enabled })
    }

    fn set_dns_forwarders(&self, network_id: u32, servers: &[Ipv4Addr]) -> Result<(), Error> {
        self.call(RoutingRequest::SetDnsForwarders { network_id, servers: servers.to_vec() })
    }

    fn teardown_stale_rules(&self) -> Result<(), Error> {
        self.call(RoutingRequest::TeardownStaleRules)
    }
}

/// In-memory [`RoutingOps`] recording every call instead of performing I/O,
/// so `TetherOrchestrator` can be driven end-to-end in tests (the
/// `tethermgr-system-tests` crate) without root or a live `tethermgr-routingd`.
pub mod mocks {
    use super::*;
    use std::collections::BTreeSet;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    pub struct MockRoutingOps {
        pub ip_forwarding: Mutex<bool>,
        pub local_networks: Mutex<BTreeSet<String>>,
        pub offloaded: Mutex<BTreeSet<String>>,
        pub dns_forwarders: Mutex<Vec<(u32, Vec<Ipv4Addr>)>>,
        pub teardown_count: Mutex<u32>,
        pub fail_next: Mutex<Option<String>>,
    }

    impl MockRoutingOps {
        fn maybe_fail(&self) -> Result<(), Error> {
            if let Some(message) = self.fail_next.lock().expect("mutex poisoned").take() {
                return Err(Error::Remote(message));
            }
            Ok(())
        }

        pub fn ip_forwarding_enabled(&self) -> bool {
            *self.ip_forwarding.lock().expect("mutex poisoned")
        }
    }

    impl RoutingOps for MockRoutingOps {
        fn ping(&self) -> Result<(), Error> {
            self.maybe_fail()
        }

        fn add_interface_to_local_network(&self, interface_name: &str, _prefix: Ipv4Cidr) -> Result<(), Error> {
            self.maybe_fail()?;
            self.local_networks.lock().expect("mutex poisoned").insert(interface_name.to_string());
            Ok(())
        }

        fn remove_interface_from_local_network(&self, interface_name: &str) -> Result<(), Error> {
            self.maybe_fail()?;
            self.local_networks.lock().expect("mutex poisoned").remove(interface_name);
            Ok(())
        }

        fn add_interface_to_network(&self, _interface_name: &str, _network_id: u32) -> Result<(), Error> {
            self.maybe_fail()
        }

        fn remove_interface_from_network(&self, _interface_name: &str, _network_id: u32) -> Result<(), Error> {
            self.maybe_fail()
        }

        fn configure_address(&self, _interface_name: &str, _address: Ipv4Cidr) -> Result<(), Error> {
            self.maybe_fail()
        }

        fn set_interface_up(&self, _interface_name: &str) -> Result<(), Error> {
            self.maybe_fail()
        }

        fn set_interface_down(&self, _interface_name: &str) -> Result<(), Error> {
            self.maybe_fail()
        }

        fn add_route(&self, _interface_name: &str, _destination: Ipv4Cidr, _gateway: Option<Ipv4Addr>) -> Result<(), Error> {
            self.maybe_fail()
        }

        fn remove_route(&self, _interface_name: &str, _destination: Ipv4Cidr) -> Result<(), Error> {
            self.maybe_fail()
        }

        fn start_offload(&self, downstream: &str, _upstream: &str) -> Result<(), Error> {
            self.maybe_fail()?;
            self.offloaded.lock().expect("mutex poisoned").insert(downstream.to_string());
            Ok(())
        }

        fn stop_offload(&self, downstream: &str) -> Result<(), Error> {
            self.maybe_fail()?;
            self.offloaded.lock().expect("mutex poisoned").remove(downstream);
            Ok(())
        }

        fn set_ip_forwarding(&self, enabled: bool) -> Result<(), Error> {
            self.maybe_fail()?;
            *self.ip_forwarding.lock().expect("mutex poisoned") = enabled;
            Ok(())
        }

        fn set_dns_forwarders(&self, network_id: u32, servers: &[Ipv4Addr]) -> Result<(), Error> {
            self.maybe_fail()?;
            self.dns_forwarders.lock().expect("mutex poisoned").push((network_id, servers.to_vec()));
            Ok(())
        }

        fn teardown_stale_rules(&self) -> Result<(), Error> {
            self.maybe_fail()?;
            *self.teardown_count.lock().expect("mutex poisoned") += 1;
            Ok(())
        }
    }
}
