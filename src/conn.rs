//! The multicast connection: fans every inbound datagram into one channel
//! tagged with its arrival interface, and routes outbound messages to one
//! or all interfaces, multicast or unicast.

use crate::{
    net::NetInterface,
    records,
    socket::{AsyncIfaceSocket, AsyncMdnsSocket},
    MDNS_PORT,
};
use std::net::SocketAddr;
use tokio::sync::broadcast;
use tracing::{debug, trace};
use trust_dns_client::op::Message as DnsMessage;
use trust_dns_proto::serialize::binary::{BinDecodable, BinEncodable};

/// Largest payload sent in a single datagram; anything bigger is split
/// across consecutive datagrams with the Truncated flag.
pub(crate) const MAX_PAYLOAD: usize = 1472;

const RECV_BUFFER: usize = 4096;
const INBOUND_CAPACITY: usize = 256;
const DRAIN_QUIESCENCE: std::time::Duration = std::time::Duration::from_millis(100);

/// An inbound DNS message together with its source address and the
/// interface it arrived on.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub(crate) msg: DnsMessage,
    pub(crate) from: SocketAddr,
    pub(crate) iface: String,
}

impl InboundRequest {
    /// The decoded DNS message.
    pub fn message(&self) -> &DnsMessage {
        &self.msg
    }

    /// The datagram's source address.
    pub fn from(&self) -> SocketAddr {
        self.from
    }

    /// The name of the interface the datagram arrived on.
    pub fn iface(&self) -> &str {
        &self.iface
    }

    /// A querier not bound to port 5353 speaks legacy unicast DNS and
    /// expects a unicast answer with short TTLs (RFC 6762 §6.7).
    pub fn is_legacy(&self) -> bool {
        self.from.port() != MDNS_PORT
    }
}

/// An outbound query: broadcast on one interface, or all when unset.
pub(crate) struct OutQuery {
    pub msg: DnsMessage,
    pub iface: Option<String>,
}

/// An outbound response: unicast to `addr` when set, otherwise multicast
/// on `iface` (or all interfaces when that is unset too).
pub(crate) struct OutResponse {
    pub msg: DnsMessage,
    pub addr: Option<SocketAddr>,
    pub iface: Option<String>,
}

pub(crate) enum Conn {
    Mdns(MdnsConn),
    #[cfg(test)]
    Pipe(pipe::PipeConn),
}

impl Conn {
    /// A fresh subscription to the inbound stream. Messages published
    /// before the call are not observed.
    pub fn subscribe(&self) -> broadcast::Receiver<InboundRequest> {
        match self {
            Conn::Mdns(conn) => conn.inbound.subscribe(),
            #[cfg(test)]
            Conn::Pipe(conn) => conn.subscribe(),
        }
    }

    /// The interfaces this connection is bound to.
    pub fn interfaces(&self) -> Vec<NetInterface> {
        match self {
            Conn::Mdns(conn) => conn.sockets.iter().map(|s| s.iface.clone()).collect(),
            #[cfg(test)]
            Conn::Pipe(conn) => vec![conn.iface.clone()],
        }
    }

    pub fn interface(&self, name: &str) -> Option<NetInterface> {
        self.interfaces().into_iter().find(|i| i.name == name)
    }

    pub async fn send_query(&self, query: OutQuery) -> Result<(), std::io::Error> {
        match self {
            Conn::Mdns(conn) => conn.send(&query.msg, query.iface.as_deref(), None).await,
            #[cfg(test)]
            Conn::Pipe(conn) => {
                conn.send(&query.msg);
                Ok(())
            }
        }
    }

    pub async fn send_response(&self, response: OutResponse) -> Result<(), std::io::Error> {
        match self {
            Conn::Mdns(conn) => {
                conn.send(&response.msg, response.iface.as_deref(), response.addr)
                    .await
            }
            #[cfg(test)]
            Conn::Pipe(conn) => {
                conn.send(&response.msg);
                Ok(())
            }
        }
    }

    /// Discards buffered inbound messages until none arrives within a
    /// short quiescence window.
    pub async fn drain(&self, rx: &mut broadcast::Receiver<InboundRequest>) {
        loop {
            match tokio::time::timeout(DRAIN_QUIESCENCE, rx.recv()).await {
                Ok(Ok(req)) => trace!(iface = %req.iface, "drained inbound message"),
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => return,
            }
        }
    }

    /// Stops the socket reader tasks.
    pub fn close(&self) {
        if let Conn::Mdns(conn) = self {
            for reader in conn.readers.lock().unwrap().drain(..) {
                reader.abort();
            }
        }
    }
}

/// Receives the next inbound request from a subscription, skipping over
/// lag gaps. `None` once the connection is gone.
pub(crate) async fn next_request(
    rx: &mut broadcast::Receiver<InboundRequest>,
) -> Option<InboundRequest> {
    loop {
        match rx.recv().await {
            Ok(req) => return Some(req),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "inbound stream lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

pub(crate) struct MdnsConn {
    sockets: Vec<AsyncIfaceSocket>,
    inbound: broadcast::Sender<InboundRequest>,
    readers: std::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl MdnsConn {
    /// Starts one reader task per bound socket. Must run inside a runtime.
    pub fn new(socket: AsyncMdnsSocket) -> Self {
        let (inbound, _) = broadcast::channel(INBOUND_CAPACITY);

        let mut readers = Vec::new();
        for iface_socket in &socket.ifaces {
            for udp in [iface_socket.v4.as_ref(), iface_socket.v6.as_ref()]
                .into_iter()
                .flatten()
            {
                readers.push(tokio::spawn(Self::read_loop(
                    udp.clone(),
                    iface_socket.iface.name.clone(),
                    inbound.clone(),
                )));
            }
        }

        Self {
            sockets: socket.ifaces,
            inbound,
            readers: std::sync::Mutex::new(readers),
        }
    }

    async fn read_loop(
        socket: std::sync::Arc<tokio::net::UdpSocket>,
        iface: String,
        inbound: broadcast::Sender<InboundRequest>,
    ) {
        let mut buf = vec![0u8; RECV_BUFFER];
        loop {
            let (count, from) = match socket.recv_from(&mut buf).await {
                Ok(recv) => recv,
                Err(err) => {
                    debug!(%iface, %err, "socket receive failed, stopping reader");
                    return;
                }
            };

            if count == 0 {
                continue;
            }

            let msg = match DnsMessage::from_bytes(&buf[..count]) {
                Ok(msg) => msg,
                Err(err) => {
                    debug!(%iface, %from, %err, "dropping undecodable message");
                    continue;
                }
            };

            inbound
                .send(InboundRequest {
                    msg,
                    from,
                    iface: iface.clone(),
                })
                .ok();
        }
    }

    async fn send(
        &self,
        msg: &DnsMessage,
        iface: Option<&str>,
        addr: Option<SocketAddr>,
    ) -> Result<(), std::io::Error> {
        for part in records::split_message(msg, MAX_PAYLOAD) {
            let bytes = part
                .to_bytes()
                .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;

            match addr {
                Some(addr) => {
                    let socket = self
                        .sockets
                        .iter()
                        .find(|s| iface.map_or(true, |name| s.iface.name == name))
                        .ok_or_else(|| {
                            std::io::Error::new(std::io::ErrorKind::NotFound, "no such interface")
                        })?;
                    socket.send_unicast(&bytes, addr).await?;
                }

                None => {
                    for socket in self
                        .sockets
                        .iter()
                        .filter(|s| iface.map_or(true, |name| s.iface.name == name))
                    {
                        socket.send_multicast(&bytes).await?;
                    }
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod pipe {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    /// An in-memory transport: two crossed ends, each delivering what the
    /// other sends, tagged with a fixed loopback-style interface.
    pub(crate) struct PipeConn {
        peer: broadcast::Sender<InboundRequest>,
        inbound: broadcast::Sender<InboundRequest>,
        from: SocketAddr,
        pub(crate) iface: NetInterface,
    }

    impl PipeConn {
        pub fn subscribe(&self) -> broadcast::Receiver<InboundRequest> {
            self.inbound.subscribe()
        }

        pub fn send(&self, msg: &DnsMessage) {
            self.peer
                .send(InboundRequest {
                    msg: msg.clone(),
                    from: self.from,
                    iface: self.iface.name.clone(),
                })
                .ok();
        }
    }

    /// Two connections wired back to back on a fake `lo0` interface.
    pub(crate) fn pair() -> (Conn, Conn) {
        let (a, _) = broadcast::channel(INBOUND_CAPACITY);
        let (b, _) = broadcast::channel(INBOUND_CAPACITY);
        let iface = NetInterface::named("lo0");

        let left = PipeConn {
            peer: b.clone(),
            inbound: a.clone(),
            from: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), MDNS_PORT),
            iface: iface.clone(),
        };

        let right = PipeConn {
            peer: a,
            inbound: b,
            from: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 2)), MDNS_PORT),
            iface,
        };

        (Conn::Pipe(left), Conn::Pipe(right))
    }
}
