//! Network interface enumeration

use crate::util::iface_name_to_index;
use std::{
    collections::BTreeMap,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
};

/// The [`if_addrs`](https://crates.io/crates/if_addrs) crate is used to
/// discover network interfaces on the system.
pub use if_addrs;

#[derive(Clone, Debug, PartialEq, Eq)]
/// A network interface that mDNS traffic can be sent and received on.
pub struct NetInterface {
    /// The interface name, e.g. `eth0`.
    pub name: String,

    /// The OS interface index, used as the IPv6 multicast scope.
    pub index: u32,

    /// IPv4 addresses assigned to the interface.
    pub v4: Vec<Ipv4Addr>,

    /// IPv6 addresses assigned to the interface.
    pub v6: Vec<Ipv6Addr>,
}

impl NetInterface {
    /// All addresses of the interface, IPv4 first.
    pub fn addrs(&self) -> impl Iterator<Item = IpAddr> + '_ {
        self.v4
            .iter()
            .copied()
            .map(IpAddr::V4)
            .chain(self.v6.iter().copied().map(IpAddr::V6))
    }

    pub fn has_v4(&self) -> bool {
        !self.v4.is_empty()
    }

    pub fn has_v6(&self) -> bool {
        !self.v6.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn named(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            index: 0,
            v4: Vec::new(),
            v6: Vec::new(),
        }
    }
}

/// Enumerates the network interfaces usable for multicast DNS: up, with at
/// least one routable address. Loopback interfaces are skipped unless the
/// filter names them explicitly; an empty filter accepts every interface.
pub fn multicast_interfaces(filter: &[String]) -> Result<Vec<NetInterface>, std::io::Error> {
    let mut grouped: BTreeMap<String, NetInterface> = BTreeMap::new();

    for iface in if_addrs::get_if_addrs()? {
        if iface.is_loopback() && !filter.iter().any(|name| *name == iface.name) {
            continue;
        }

        if !filter.is_empty() && !filter.iter().any(|name| *name == iface.name) {
            continue;
        }

        let entry = grouped
            .entry(iface.name.clone())
            .or_insert_with(|| NetInterface {
                index: iface_name_to_index(&iface.name).map(|i| i.get()).unwrap_or(0),
                name: iface.name.clone(),
                v4: Vec::new(),
                v6: Vec::new(),
            });

        match iface.ip() {
            IpAddr::V4(addr) => entry.v4.push(addr),
            IpAddr::V6(addr) => entry.v6.push(addr),
        }
    }

    Ok(grouped.into_values().collect())
}
