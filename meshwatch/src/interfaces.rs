//! Interface enumeration and interlink-subnet neighbor discovery.
//!
//! Only IPv4 is surfaced here — the mesh has no use for address families
//! other than IPv4 (spec non-goals).

use std::{
    collections::HashMap,
    fmt,
    net::Ipv4Addr,
};

pub(crate) use ipnet::Ipv4Net;

/// A network interface, as reported by the OS.
#[derive(Debug, Clone)]
pub struct Interface {
    iface: netdev::interface::Interface,
}

impl fmt::Display for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}. {} ipv4={:?}",
            self.iface.index, self.iface.name, self.iface.ipv4
        )
    }
}

impl PartialEq for Interface {
    fn eq(&self, other: &Self) -> bool {
        self.iface.index == other.iface.index && self.iface.name == other.iface.name
    }
}
impl Eq for Interface {}

impl Interface {
    pub fn is_up(&self) -> bool {
        self.iface.flags & libc::IFF_UP as u32 != 0
    }

    pub fn name(&self) -> &str {
        &self.iface.name
    }

    /// IPv4 networks directly configured on this interface.
    pub fn ipv4_nets(&self) -> impl Iterator<Item = Ipv4Net> + '_ {
        self.iface.ipv4.iter().cloned()
    }

    /// Creates a fake interface for tests, independent of the host's own
    /// interfaces.
    pub fn fake(name: &str, net: Ipv4Net) -> Self {
        use netdev::{interface::InterfaceType, mac::MacAddr};

        Self {
            iface: netdev::Interface {
                index: 2,
                name: name.to_string(),
                friendly_name: None,
                description: None,
                if_type: InterfaceType::Ethernet,
                mac_addr: Some(MacAddr::new(2, 3, 4, 5, 6, 7)),
                ipv4: vec![net],
                ipv6: vec![],
                flags: libc::IFF_UP as u32 | libc::IFF_RUNNING as u32,
                transmit_speed: None,
                receive_speed: None,
                gateway: None,
                dns_servers: vec![],
                default: false,
            },
        }
    }
}

/// A snapshot of this machine's network interfaces.
#[derive(Debug, Clone)]
pub struct State {
    pub interfaces: HashMap<String, Interface>,
}

impl State {
    /// Enumerates the machine's current interfaces.
    pub fn new() -> Self {
        let mut interfaces = HashMap::new();
        for iface in netdev::interface::get_interfaces() {
            let ni = Interface { iface };
            interfaces.insert(ni.iface.name.clone(), ni);
        }
        State { interfaces }
    }

    pub fn fake(iface: Interface) -> Self {
        let name = iface.name().to_string();
        State {
            interfaces: [(name, iface)].into_iter().collect(),
        }
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

/// One discovered interlink neighbor: the interface it was found on, our own
/// address in that subnet, and the neighbor's candidate address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterlinkNeighbor {
    pub iface: String,
    pub own_addr: Ipv4Addr,
    pub neighbor_addr: Ipv4Addr,
}

/// Finds every interlink subnet (prefix length `>= interlink_netmask` and
/// `< 32`) among the machine's directly-attached IPv4 networks, and yields a
/// candidate neighbor for every other host address in that subnet's host
/// range. Matches the Lifecycle description in §3: "every directly-attached
/// subnet whose prefix length is ≥ `interlink_netmask` and < 32 contributes a
/// Neighbor entry for every other host address in that subnet's host range."
pub fn interlink_neighbors(state: &State, interlink_netmask: u8) -> Vec<InterlinkNeighbor> {
    let mut out = Vec::new();
    for iface in state.interfaces.values() {
        if !iface.is_up() {
            continue;
        }
        for net in iface.ipv4_nets() {
            let prefix = net.prefix_len();
            if prefix < interlink_netmask || prefix >= 32 {
                continue;
            }
            let own = net.addr();
            for host in net.hosts() {
                if host != own {
                    out.push(InterlinkNeighbor {
                        iface: iface.name().to_string(),
                        own_addr: own,
                        neighbor_addr: host,
                    });
                }
            }
        }
    }
    out
}

/// Every directly-attached IPv4 network, suitable for the "direct net"
/// exclusion in route derivation (§4.5 step 4).
pub fn direct_nets(state: &State) -> Vec<Ipv4Net> {
    state
        .interfaces
        .values()
        .filter(|i| i.is_up())
        .flat_map(|i| i.ipv4_nets())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> Ipv4Net {
        s.parse().unwrap()
    }

    #[test]
    fn interlink_neighbors_enumerates_host_range_excluding_self() {
        let iface = Interface::fake("eth0", net("172.16.0.1/28"));
        let state = State::fake(iface);
        let neighbors = interlink_neighbors(&state, 28);
        // /28 has 16 addresses, 14 usable hosts, minus ourselves = 13.
        assert_eq!(neighbors.len(), 13);
        assert!(neighbors.iter().all(|n| n.own_addr == net("172.16.0.1/28").addr()));
        assert!(neighbors
            .iter()
            .all(|n| n.neighbor_addr != net("172.16.0.1/28").addr()));
    }

    #[test]
    fn narrower_than_interlink_netmask_is_skipped() {
        let iface = Interface::fake("eth0", net("172.16.0.1/26"));
        let state = State::fake(iface);
        assert!(interlink_neighbors(&state, 28).is_empty());
    }

    #[test]
    fn slash_thirty_one_treats_both_endpoints_as_hosts() {
        let iface = Interface::fake("eth0", net("172.16.0.0/31"));
        let state = State::fake(iface);
        let neighbors = interlink_neighbors(&state, 28);
        assert_eq!(neighbors.len(), 1);
        assert_eq!(
            neighbors[0].neighbor_addr,
            "172.16.0.1".parse::<Ipv4Addr>().unwrap()
        );
    }
}
