//! Per-interface multicast socket plumbing.
//!
//! One IPv4 and one IPv6 socket is bound per multicast interface, each
//! joined to the mDNS group on that interface only and bound to its
//! device (`SO_BINDTODEVICE` on Linux, `IP_BOUND_IF` on Apple systems).
//! Device binding is what makes the arrival socket a reliable record of
//! the arrival interface: without it, a group join on any interface
//! delivers every matching datagram to every socket on the port.
//!
//! Sockets are created as blocking std sockets first, so bind errors
//! surface from construction, and converted to tokio sockets once a
//! runtime is available.

use crate::{net::NetInterface, MDNS_PORT, MDNS_V4_IP, MDNS_V6_IP};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use tokio::net::UdpSocket as AsyncUdpSocket;

pub(crate) struct MdnsSocket {
    pub(crate) ifaces: Vec<IfaceSocket>,
}

pub(crate) struct IfaceSocket {
    pub(crate) iface: NetInterface,
    pub(crate) v4: Option<UdpSocket>,
    pub(crate) v6: Option<UdpSocket>,
}

pub(crate) struct AsyncMdnsSocket {
    pub(crate) ifaces: Vec<AsyncIfaceSocket>,
}

pub(crate) struct AsyncIfaceSocket {
    pub(crate) iface: NetInterface,
    pub(crate) v4: Option<std::sync::Arc<AsyncUdpSocket>>,
    pub(crate) v6: Option<std::sync::Arc<AsyncUdpSocket>>,
}

impl MdnsSocket {
    /// Binds mDNS sockets on every given interface. Any bind or join error
    /// is fatal.
    pub fn bind(ifaces: Vec<NetInterface>, loopback: bool) -> Result<Self, std::io::Error> {
        let mut bound = Vec::with_capacity(ifaces.len());

        for iface in ifaces {
            let v4 = if iface.has_v4() {
                Some(Self::bind_v4(&iface, loopback)?)
            } else {
                None
            };

            let v6 = if iface.has_v6() {
                Some(Self::bind_v6(&iface, loopback)?)
            } else {
                None
            };

            if v4.is_none() && v6.is_none() {
                continue;
            }

            bound.push(IfaceSocket { iface, v4, v6 });
        }

        Ok(Self { ifaces: bound })
    }

    fn bind_v4(iface: &NetInterface, loopback: bool) -> Result<UdpSocket, std::io::Error> {
        let Some(&iface_addr) = iface.v4.first() else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "interface has no IPv4 address",
            ));
        };

        let socket = socket2::Socket::new(
            socket2::Domain::IPV4,
            socket2::Type::DGRAM,
            Some(socket2::Protocol::UDP),
        )?;
        socket.set_reuse_address(true)?;

        #[cfg(unix)]
        {
            socket.set_reuse_port(true)?;
        }

        bind_to_device(&socket, iface, false)?;

        socket.bind(&socket2::SockAddr::from(SocketAddr::new(
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            MDNS_PORT,
        )))?;

        socket.join_multicast_v4(&MDNS_V4_IP, &iface_addr)?;
        socket.set_multicast_if_v4(&iface_addr)?;
        // RFC 6762 §11: mDNS messages are sent with an IP TTL of 255.
        socket.set_multicast_ttl_v4(255)?;
        socket.set_ttl(255)?;
        socket.set_multicast_loop_v4(loopback)?;
        socket.set_nonblocking(true)?;

        Ok(socket.into())
    }

    fn bind_v6(iface: &NetInterface, loopback: bool) -> Result<UdpSocket, std::io::Error> {
        let socket = socket2::Socket::new(
            socket2::Domain::IPV6,
            socket2::Type::DGRAM,
            Some(socket2::Protocol::UDP),
        )?;
        socket.set_reuse_address(true)?;
        socket.set_only_v6(true)?;

        #[cfg(unix)]
        {
            socket.set_reuse_port(true)?;
        }

        bind_to_device(&socket, iface, true)?;

        socket.bind(&socket2::SockAddr::from(SocketAddr::new(
            IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            MDNS_PORT,
        )))?;

        socket.join_multicast_v6(&MDNS_V6_IP, iface.index)?;
        socket.set_multicast_if_v6(iface.index)?;
        socket.set_multicast_hops_v6(255)?;
        socket.set_unicast_hops_v6(255)?;
        socket.set_multicast_loop_v6(loopback)?;
        socket.set_nonblocking(true)?;

        Ok(socket.into())
    }

    pub fn is_empty(&self) -> bool {
        self.ifaces.is_empty()
    }

    /// Converts the bound std sockets into tokio sockets. Must run inside a
    /// tokio runtime.
    pub fn into_async(self) -> Result<AsyncMdnsSocket, std::io::Error> {
        let mut ifaces = Vec::with_capacity(self.ifaces.len());

        for socket in self.ifaces {
            ifaces.push(AsyncIfaceSocket {
                iface: socket.iface,
                v4: socket
                    .v4
                    .map(AsyncUdpSocket::from_std)
                    .transpose()?
                    .map(std::sync::Arc::new),
                v6: socket
                    .v6
                    .map(AsyncUdpSocket::from_std)
                    .transpose()?
                    .map(std::sync::Arc::new),
            });
        }

        Ok(AsyncMdnsSocket { ifaces })
    }
}

/// Restricts a socket to one network interface, so it only ever sees
/// datagrams that actually arrived there.
#[cfg(any(target_os = "android", target_os = "fuchsia", target_os = "linux"))]
fn bind_to_device(
    socket: &socket2::Socket,
    iface: &NetInterface,
    _v6: bool,
) -> Result<(), std::io::Error> {
    socket.bind_device(Some(iface.name.as_bytes()))
}

#[cfg(any(
    target_os = "ios",
    target_os = "macos",
    target_os = "tvos",
    target_os = "watchos"
))]
fn bind_to_device(
    socket: &socket2::Socket,
    iface: &NetInterface,
    v6: bool,
) -> Result<(), std::io::Error> {
    let Some(index) = std::num::NonZeroU32::new(iface.index) else {
        return Ok(());
    };

    if v6 {
        socket.bind_device_by_index_v6(Some(index))
    } else {
        socket.bind_device_by_index_v4(Some(index))
    }
}

/// Platforms without per-device socket binding (notably Windows) fall back
/// to per-interface group joins alone; with several multicast interfaces,
/// arrival attribution there is best-effort.
#[cfg(not(any(
    target_os = "android",
    target_os = "fuchsia",
    target_os = "linux",
    target_os = "ios",
    target_os = "macos",
    target_os = "tvos",
    target_os = "watchos"
)))]
fn bind_to_device(
    _socket: &socket2::Socket,
    _iface: &NetInterface,
    _v6: bool,
) -> Result<(), std::io::Error> {
    Ok(())
}

impl AsyncIfaceSocket {
    /// Sends a datagram to the mDNS multicast groups on this interface,
    /// IPv4 and IPv6 alike.
    pub async fn send_multicast(&self, packet: &[u8]) -> Result<(), std::io::Error> {
        if let Some(v4) = &self.v4 {
            v4.send_to(packet, SocketAddr::new(IpAddr::V4(MDNS_V4_IP), MDNS_PORT))
                .await?;
        }

        if let Some(v6) = &self.v6 {
            v6.send_to(packet, SocketAddr::new(IpAddr::V6(MDNS_V6_IP), MDNS_PORT))
                .await?;
        }

        Ok(())
    }

    /// Sends a datagram to a unicast destination via the socket matching
    /// the address family.
    pub async fn send_unicast(
        &self,
        packet: &[u8],
        addr: SocketAddr,
    ) -> Result<(), std::io::Error> {
        let socket = match addr {
            SocketAddr::V4(_) => self.v4.as_ref(),
            SocketAddr::V6(_) => self.v6.as_ref(),
        };

        match socket {
            Some(socket) => socket.send_to(packet, addr).await.map(|_| ()),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "no socket for address family",
            )),
        }
    }
}
