//! AddressCoordinator (§4.1): assigns non-conflicting IPv4 /24 prefixes to
//! downstreams and tracks upstream prefixes to detect conflicts. Pure logic,
//! no I/O — the orchestrator calls this synchronously on the tethering
//! thread and owns the only handle to it (see design note on breaking the
//! server/orchestrator/coordinator reference cycle).

use cidr::Ipv4Cidr;
use rand::Rng;
use std::collections::HashMap;
use std::net::Ipv4Addr;

use crate::downstream::{ConnectivityScope, DownstreamType};
use crate::upstream::{NetworkId, UpstreamKind};

pub type ServerId = u32;

/// Reserved for Wi-Fi Direct groups when the dedicated-IP policy is enabled.
pub const WIFI_P2P_RESERVED: [u8; 4] = [192, 168, 49, 1];
/// Default for global-scope Bluetooth PAN, unless it conflicts with an upstream.
pub const BLUETOOTH_RESERVED: [u8; 4] = [192, 168, 44, 1];

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Pool {
    TenEight,
    OneSeventyTwoSixteen,
    OneNinetyTwoSixtyEight,
}

const POOLS: [Pool; 3] = [Pool::TenEight, Pool::OneSeventyTwoSixteen, Pool::OneNinetyTwoSixtyEight];

fn pool_from_random_bits(bits: u32) -> Pool {
    let bits = bits & 0x00FF_FFFF;
    if bits > 0x000F_FFFF {
        Pool::TenEight
    } else if bits > 0x0000_FFFF {
        Pool::OneSeventyTwoSixteen
    } else {
        Pool::OneNinetyTwoSixtyEight
    }
}

fn random_candidate(pool: Pool, rng: &mut impl Rng) -> Ipv4Addr {
    match pool {
        Pool::TenEight => Ipv4Addr::new(10, rng.random(), rng.random(), 0),
        Pool::OneSeventyTwoSixteen => Ipv4Addr::new(172, rng.random_range(16..=31), rng.random(), 0),
        Pool::OneNinetyTwoSixtyEight => Ipv4Addr::new(192, 168, rng.random(), 0),
    }
}

fn is_rejected_candidate(pool: Pool, addr: Ipv4Addr) -> bool {
    let octets = addr.octets();
    let varying = octets[2];
    if matches!(varying, 0 | 1 | 255) {
        return true;
    }
    match pool {
        Pool::TenEight => octets[1] <= 10,
        Pool::OneNinetyTwoSixtyEight => matches!(varying, 88 | 100),
        Pool::OneSeventyTwoSixteen => false,
    }
}

fn to_cidr(addr: Ipv4Addr) -> Ipv4Cidr {
    Ipv4Cidr::new(addr, 24).expect("constructed /24 candidates are always valid")
}

/// Two prefixes conflict iff the shorter-prefix one contains the other's base address.
pub fn prefixes_conflict(a: Ipv4Cidr, b: Ipv4Cidr) -> bool {
    let (shorter, longer) = if a.network_length() <= b.network_length() {
        (a, b)
    } else {
        (b, a)
    };
    shorter.contains(&longer.first_address())
}

#[derive(Debug, Default)]
pub struct AddressCoordinator {
    dedicated_ip_policy: bool,
    active: HashMap<ServerId, Ipv4Cidr>,
    cached: HashMap<(DownstreamType, ConnectivityScope), Ipv4Cidr>,
    upstream_prefixes: HashMap<NetworkId, Vec<Ipv4Cidr>>,
}

impl AddressCoordinator {
    pub fn new(dedicated_ip_policy: bool) -> Self {
        AddressCoordinator {
            dedicated_ip_policy,
            ..Default::default()
        }
    }

    pub fn set_dedicated_ip_policy(&mut self, enabled: bool) {
        self.dedicated_ip_policy = enabled;
    }

    fn conflicts_with_upstreams(&self, candidate: Ipv4Cidr) -> bool {
        self.upstream_prefixes
            .values()
            .flatten()
            .any(|p| prefixes_conflict(candidate, *p))
    }

    fn conflicts_with_active(&self, candidate: Ipv4Cidr, excluding: ServerId) -> bool {
        self.active
            .iter()
            .filter(|(id, _)| **id != excluding)
            .any(|(_, p)| prefixes_conflict(candidate, *p))
    }

    /// Assigns (or reuses) an IPv4 /24 for a downstream. Mirrors §4.1's
    /// weighted pool walk: a 24-bit random draw picks a starting pool
    /// (~94% 10/8, ~6% 172.16/12, ~0.4% 192.168/16), then up to 20 random
    /// /24 candidates are tried per pool, wrapping through all three.
    pub fn request_downstream_address(
        &mut self,
        server_id: ServerId,
        downstream_type: DownstreamType,
        scope: ConnectivityScope,
        use_last: bool,
        rng: &mut impl Rng,
    ) -> Option<Ipv4Cidr> {
        if downstream_type == DownstreamType::WifiP2p && self.dedicated_ip_policy {
            let cidr = to_cidr(Ipv4Addr::from(WIFI_P2P_RESERVED));
            self.active.insert(server_id, cidr);
            self.cached.insert((downstream_type, scope), cidr);
            return Some(cidr);
        }

        if downstream_type == DownstreamType::Bluetooth && scope == ConnectivityScope::Global {
            let cidr = to_cidr(Ipv4Addr::from(BLUETOOTH_RESERVED));
            if !self.conflicts_with_upstreams(cidr) && !self.conflicts_with_active(cidr, server_id) {
                self.active.insert(server_id, cidr);
                self.cached.insert((downstream_type, scope), cidr);
                return Some(cidr);
            }
        }

        if use_last {
            if let Some(&cached) = self.cached.get(&(downstream_type, scope)) {
                if !self.conflicts_with_upstreams(cached) && !self.conflicts_with_active(cached, server_id) {
                    self.active.insert(server_id, cached);
                    return Some(cached);
                }
            }
        }

        let start_bits: u32 = rng.random();
        let start_pool = pool_from_random_bits(start_bits);
        let start_idx = POOLS.iter().position(|p| *p == start_pool).unwrap_or(0);

        for offset in 0..POOLS.len() {
            let pool = POOLS[(start_idx + offset) % POOLS.len()];
            for _ in 0..20 {
                let addr = random_candidate(pool, rng);
                if is_rejected_candidate(pool, addr) {
                    continue;
                }
                let cidr = to_cidr(addr);
                if self.conflicts_with_upstreams(cidr) || self.conflicts_with_active(cidr, server_id) {
                    continue;
                }
                self.active.insert(server_id, cidr);
                self.cached.insert((downstream_type, scope), cidr);
                return Some(cidr);
            }
        }

        None
    }

    /// Removes the server from the active set. The cached reservation for its
    /// (type, scope) is retained so a future `use_last` request can reclaim it.
    pub fn release_downstream(&mut self, server_id: ServerId) {
        self.active.remove(&server_id);
    }

    /// Replaces a network's tracked IPv4 prefixes and returns the servers
    /// whose currently assigned prefix now conflicts (they must be sent
    /// `NOTIFY_PREFIX_CONFLICT`). A VPN upstream is treated as a removal.
    pub fn update_upstream_prefix(
        &mut self,
        network: NetworkId,
        kind: UpstreamKind,
        prefixes: Vec<Ipv4Cidr>,
    ) -> Vec<ServerId> {
        if matches!(kind, UpstreamKind::Vpn) {
            self.remove_upstream_prefix(network);
            return Vec::new();
        }
        self.upstream_prefixes.insert(network, prefixes.clone());
        self.active
            .iter()
            .filter(|(_, assigned)| prefixes.iter().any(|p| prefixes_conflict(**assigned, *p)))
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn remove_upstream_prefix(&mut self, network: NetworkId) {
        self.upstream_prefixes.remove(&network);
    }

    /// Drops any tracked network not present in `current_networks`, called on
    /// orchestrator start to discard stale state from a previous run.
    pub fn maybe_remove_deprecated_upstreams(&mut self, current_networks: &[NetworkId]) {
        self.upstream_prefixes.retain(|net, _| current_networks.contains(net));
    }

    pub fn active_prefix(&self, server_id: ServerId) -> Option<Ipv4Cidr> {
        self.active.get(&server_id).copied()
    }

    /// Every prefix currently assigned to a downstream, fed to the offload
    /// controller's local-prefix set (§4.4) so hardware offload never
    /// fast-paths traffic addressed to this device's own tethering subnets.
    pub fn active_prefixes(&self) -> Vec<Ipv4Cidr> {
        self.active.values().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(42)
    }

    #[test]
    fn pool_weighting_matches_spec_thresholds() {
        assert_eq!(pool_from_random_bits(0x00FF_FFFF), Pool::TenEight);
        assert_eq!(pool_from_random_bits(0x0010_0000), Pool::TenEight);
        assert_eq!(pool_from_random_bits(0x0000_FFFF), Pool::OneSeventyTwoSixteen);
        assert_eq!(pool_from_random_bits(0x0000_0001), Pool::OneNinetyTwoSixtyEight);
        assert_eq!(pool_from_random_bits(0x0000_0000), Pool::OneNinetyTwoSixtyEight);
    }

    #[test]
    fn ten_eight_pool_rejects_reserved_and_bypassed_ranges() {
        assert!(is_rejected_candidate(Pool::TenEight, Ipv4Addr::new(10, 5, 0, 0)));
        assert!(is_rejected_candidate(Pool::TenEight, Ipv4Addr::new(10, 10, 255, 0)));
        assert!(!is_rejected_candidate(Pool::TenEight, Ipv4Addr::new(10, 11, 0, 0)));
        assert!(is_rejected_candidate(Pool::TenEight, Ipv4Addr::new(10, 50, 1, 0)));
        assert!(is_rejected_candidate(Pool::TenEight, Ipv4Addr::new(10, 50, 255, 0)));
    }

    #[test]
    fn one_ninety_two_pool_rejects_named_subnets() {
        for third in [0u8, 1, 88, 100] {
            assert!(is_rejected_candidate(
                Pool::OneNinetyTwoSixtyEight,
                Ipv4Addr::new(192, 168, third, 0)
            ));
        }
        assert!(!is_rejected_candidate(
            Pool::OneNinetyTwoSixtyEight,
            Ipv4Addr::new(192, 168, 43, 0)
        ));
    }

    #[test]
    fn wifi_p2p_returns_dedicated_address_when_policy_enabled() {
        let mut coord = AddressCoordinator::new(true);
        let mut r = rng();
        let cidr = coord
            .request_downstream_address(1, DownstreamType::WifiP2p, ConnectivityScope::Local, false, &mut r)
            .expect("address assigned");
        assert_eq!(cidr.first_address(), Ipv4Addr::new(192, 168, 49, 1));
    }

    #[test]
    fn wifi_p2p_does_not_use_dedicated_address_when_policy_disabled() {
        let mut coord = AddressCoordinator::new(false);
        let mut r = rng();
        let cidr = coord
            .request_downstream_address(1, DownstreamType::WifiP2p, ConnectivityScope::Local, false, &mut r)
            .expect("address assigned");
        assert_ne!(cidr.first_address(), Ipv4Addr::new(192, 168, 49, 1));
    }

    #[test]
    fn assigned_prefixes_are_pairwise_non_overlapping() {
        let mut coord = AddressCoordinator::new(false);
        let mut r = rng();
        let a = coord
            .request_downstream_address(1, DownstreamType::Wifi, ConnectivityScope::Global, false, &mut r)
            .expect("a assigned");
        let b = coord
            .request_downstream_address(2, DownstreamType::Usb, ConnectivityScope::Global, false, &mut r)
            .expect("b assigned");
        assert!(!prefixes_conflict(a, b));
    }

    #[test]
    fn upstream_conflict_is_reported_for_active_downstream() {
        let mut coord = AddressCoordinator::new(false);
        let mut r = rng();
        let assigned = coord
            .request_downstream_address(1, DownstreamType::Wifi, ConnectivityScope::Global, false, &mut r)
            .expect("assigned");

        let conflicting = vec![assigned];
        let affected = coord.update_upstream_prefix(NetworkId(7), UpstreamKind::Cellular, conflicting);
        assert_eq!(affected, vec![1]);
    }

    #[test]
    fn vpn_upstream_is_treated_as_removal() {
        let mut coord = AddressCoordinator::new(false);
        let prefixes = vec![Ipv4Cidr::new(Ipv4Addr::new(10, 1, 1, 0), 24).unwrap()];
        coord.update_upstream_prefix(NetworkId(1), UpstreamKind::Cellular, prefixes);
        let affected = coord.update_upstream_prefix(NetworkId(1), UpstreamKind::Vpn, vec![]);
        assert!(affected.is_empty());
        coord.maybe_remove_deprecated_upstreams(&[]);
    }

    #[test]
    fn release_retains_cache_for_use_last() {
        let mut coord = AddressCoordinator::new(false);
        let mut r = rng();
        let first = coord
            .request_downstream_address(1, DownstreamType::Wifi, ConnectivityScope::Global, false, &mut r)
            .expect("assigned");
        coord.release_downstream(1);
        assert!(coord.active_prefix(1).is_none());

        let reused = coord
            .request_downstream_address(1, DownstreamType::Wifi, ConnectivityScope::Global, true, &mut r)
            .expect("reused");
        assert_eq!(first, reused);
    }

    #[test]
    fn deprecated_upstream_networks_are_dropped() {
        let mut coord = AddressCoordinator::new(false);
        let prefixes = vec![Ipv4Cidr::new(Ipv4Addr::new(10, 2, 2, 0), 24).unwrap()];
        coord.update_upstream_prefix(NetworkId(9), UpstreamKind::Wifi, prefixes);
        coord.maybe_remove_deprecated_upstreams(&[]);
        assert!(coord.upstream_prefixes.is_empty());
    }
}
