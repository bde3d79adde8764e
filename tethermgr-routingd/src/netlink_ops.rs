//! Abstraction over rtnetlink operations, decoupled from the wire format so
//! `RoutingRequest` handling can be unit-tested against a stateful mock
//! without a real netlink socket or root.
//!
//! Production code uses [`RealNetlinkOps`], which wraps an `rtnetlink::Handle`.

use async_trait::async_trait;
use cidr::Ipv4Cidr;
use std::net::Ipv4Addr;

use crate::error::Error;

#[async_trait]
pub trait NetlinkOps: Send + Sync {
    async fn link_set_up(&self, interface_name: &str) -> Result<(), Error>;
    async fn link_set_down(&self, interface_name: &str) -> Result<(), Error>;
    async fn addr_add(&self, interface_name: &str, address: Ipv4Cidr) -> Result<(), Error>;
    async fn route_add(&self, interface_name: &str, destination: Ipv4Cidr, gateway: Option<Ipv4Addr>) -> Result<(), Error>;
    async fn route_del(&self, interface_name: &str, destination: Ipv4Cidr) -> Result<(), Error>;
    /// Toggles the kernel's global IPv4 forwarding sysctl (§4.6 entry/exit
    /// actions of `TetherModeAlive`); the only process-wide kernel knob this
    /// helper owns outside of per-interface state.
    async fn set_ip_forwarding(&self, enabled: bool) -> Result<(), Error>;
}

#[cfg(target_os = "linux")]
mod real {
    use super::*;
    use futures::TryStreamExt;

    /// Production [`NetlinkOps`] backed by an `rtnetlink::Handle`.
    #[derive(Clone)]
    pub struct RealNetlinkOps {
        handle: rtnetlink::Handle,
    }

    impl RealNetlinkOps {
        /// Spawns the netlink connection task and returns a handle-backed client.
        pub fn new() -> Result<Self, Error> {
            let (connection, handle, _) =
                rtnetlink::new_connection().map_err(|e| Error::Netlink(e.to_string()))?;
            tokio::spawn(connection);
            Ok(RealNetlinkOps { handle })
        }

        async fn link_index(&self, interface_name: &str) -> Result<u32, Error> {
            let mut links = self.handle.link().get().match_name(interface_name.to_string()).execute();
            match links.try_next().await.map_err(Error::from)? {
                Some(msg) => Ok(msg.header.index),
                None => Err(Error::NoSuchInterface(interface_name.to_string())),
            }
        }
    }

    #[async_trait]
    impl NetlinkOps for RealNetlinkOps {
        async fn link_set_up(&self, interface_name: &str) -> Result<(), Error> {
            let index = self.link_index(interface_name).await?;
            self.handle.link().set(index).up().execute().await.map_err(Error::from)
        }

        async fn link_set_down(&self, interface_name: &str) -> Result<(), Error> {
            let index = self.link_index(interface_name).await?;
            self.handle.link().set(index).down().execute().await.map_err(Error::from)
        }

        async fn addr_add(&self, interface_name: &str, address: Ipv4Cidr) -> Result<(), Error> {
            let index = self.link_index(interface_name).await?;
            self.handle
                .address()
                .add(index, std::net::IpAddr::V4(address.first_address()), address.network_length())
                .execute()
                .await
                .map_err(Error::from)
        }

        async fn route_add(
            &self,
            interface_name: &str,
            destination: Ipv4Cidr,
            gateway: Option<Ipv4Addr>,
        ) -> Result<(), Error> {
            let index = self.link_index(interface_name).await?;
            let mut builder = rtnetlink::RouteMessageBuilder::<Ipv4Addr>::default()
                .destination_prefix(destination.first_address(), destination.network_length())
                .output_interface(index);
            if let Some(gw) = gateway {
                builder = builder.gateway(gw);
            }
            self.handle.route().add(builder.build()).execute().await.map_err(Error::from)
        }

        async fn route_del(&self, interface_name: &str, destination: Ipv4Cidr) -> Result<(), Error> {
            let index = self.link_index(interface_name).await?;
            let message = rtnetlink::RouteMessageBuilder::<Ipv4Addr>::default()
                .destination_prefix(destination.first_address(), destination.network_length())
                .output_interface(index)
                .build();
            self.handle.route().del(message).execute().await.map_err(Error::from)
        }

        async fn set_ip_forwarding(&self, enabled: bool) -> Result<(), Error> {
            let value = if enabled { "1" } else { "0" };
            tokio::fs::write("/proc/sys/net/ipv4/ip_forward", value).await.map_err(Error::from)
        }
    }
}

#[cfg(target_os = "linux")]
pub use real::RealNetlinkOps;

#[cfg(test)]
pub mod mocks {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    pub struct MockNetlinkOps {
        pub up: Mutex<HashSet<String>>,
        pub addresses: Mutex<Vec<(String, Ipv4Cidr)>>,
        pub routes: Mutex<Vec<(String, Ipv4Cidr, Option<Ipv4Addr>)>>,
        pub ip_forwarding: Mutex<bool>,
        pub fail_next: Mutex<bool>,
    }

    impl MockNetlinkOps {
        fn maybe_fail(&self) -> Result<(), Error> {
            let mut fail = self.fail_next.lock().expect("mutex poisoned");
            if *fail {
                *fail = false;
                return Err(Error::Netlink("injected failure".into()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl NetlinkOps for MockNetlinkOps {
        async fn link_set_up(&self, interface_name: &str) -> Result<(), Error> {
            self.maybe_fail()?;
            self.up.lock().expect("mutex poisoned").insert(interface_name.to_string());
            Ok(())
        }

        async fn link_set_down(&self, interface_name: &str) -> Result<(), Error> {
            self.maybe_fail()?;
            self.up.lock().expect("mutex poisoned").remove(interface_name);
            Ok(())
        }

        async fn addr_add(&self, interface_name: &str, address: Ipv4Cidr) -> Result<(), Error> {
            self.maybe_fail()?;
            self.addresses.lock().expect("mutex poisoned").push((interface_name.to_string(), address));
            Ok(())
        }

        async fn route_add(
            &self,
            interface_name: &str,
            destination: Ipv4Cidr,
            gateway: Option<Ipv4Addr>,
        ) -> Result<(), Error> {
            self.maybe_fail()?;
            self.routes.lock().expect("mutex poisoned").push((interface_name.to_string(), destination, gateway));
            Ok(())
        }

        async fn route_del(&self, interface_name: &str, destination: Ipv4Cidr) -> Result<(), Error> {
            self.maybe_fail()?;
            self.routes
                .lock()
                .expect("mutex poisoned")
                .retain(|(iface, dest, _)| !(iface == interface_name && *dest == destination));
            Ok(())
        }

        async fn set_ip_forwarding(&self, enabled: bool) -> Result<(), Error> {
            self.maybe_fail()?;
            *self.ip_forwarding.lock().expect("mutex poisoned") = enabled;
            Ok(())
        }
    }

    #[tokio::test]
    async fn mock_tracks_link_state() {
        let ops = MockNetlinkOps::default();
        ops.link_set_up("wlan0").await.unwrap();
        assert!(ops.up.lock().unwrap().contains("wlan0"));
        ops.link_set_down("wlan0").await.unwrap();
        assert!(!ops.up.lock().unwrap().contains("wlan0"));
    }

    #[tokio::test]
    async fn mock_can_inject_a_single_failure() {
        let ops = MockNetlinkOps::default();
        *ops.fail_next.lock().unwrap() = true;
        assert!(ops.link_set_up("wlan0").await.is_err());
        assert!(ops.link_set_up("wlan0").await.is_ok());
    }
}
