//! Zero-configuration service discovery over Multicast DNS (RFC 6762) and
//! DNS-SD (RFC 6763).
//!
//! A host can both advertise services on the local link ([`Responder`]) and
//! discover services advertised by others ([`Browser`] for continuous
//! browsing, [`Resolver`] for one-shot instance lookup). No central
//! infrastructure is required.

use std::net::{Ipv4Addr, Ipv6Addr};

#[macro_use]
extern crate thiserror;

mod browse;
mod cache;
mod conn;
mod net;
mod probe;
mod records;
mod resolve;
mod respond;
mod service;
mod socket;
mod util;

pub mod errors;

pub use browse::{BrowseEntry, BrowseEvent, Browser, BrowserBuilder, BrowserHandle};
pub use conn::InboundRequest;
pub use resolve::{Resolver, ResolverBuilder};
pub use respond::{Responder, ResponderBuilder, ResponderHandle, ServiceHandle};
pub use service::{Service, ServiceBuilder};

pub const MDNS_PORT: u16 = 5353;
pub const MDNS_V4_IP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);
pub const MDNS_V6_IP: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0xfb);

pub mod dns {
    pub use trust_dns_client::{
        self, op::Message as DnsMessage, rr::DNSClass as DnsClass, rr::IntoName as IntoDnsName,
        rr::Name as DnsName, rr::RData as DnsRData, rr::Record as DnsRecord,
        rr::RecordType as DnsRecordType,
    };
}

pub mod iface {
    pub use crate::net::{multicast_interfaces, NetInterface};
    pub use if_addrs;
}

#[cfg(test)]
mod tests;
