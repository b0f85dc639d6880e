//! One-shot resolution of a service instance name.

use crate::{
    cache::Cache,
    conn::{next_request, Conn, MdnsConn, OutQuery},
    errors::ResolveError,
    net::multicast_interfaces,
    service::{parse_instance_name, Service},
    socket::MdnsSocket,
};
use std::time::Duration;
use tracing::debug;
use trust_dns_client::{
    op::{Message as DnsMessage, MessageType as DnsMessageType, Query as DnsQuery},
    rr::{DNSClass as DnsClass, Name as DnsName, RecordType as DnsRecordType},
};

/// Resolves a fully-qualified service instance name, e.g.
/// `Test._http._tcp.local.`, into a [`Service`] with host, port, TXT data
/// and addresses.
pub struct Resolver {
    socket: MdnsSocket,
    timeout: Duration,
}

impl Resolver {
    pub fn builder() -> ResolverBuilder {
        ResolverBuilder::new()
    }

    /// Runs the lookup until the instance is known or the timeout fires.
    pub fn resolve(self, instance: &str) -> Result<Service, ResolveError> {
        let name = DnsName::from_utf8(instance)
            .map_err(|_| ResolveError::BadInstanceName(instance.to_owned()))?;
        if parse_instance_name(&name).is_none() {
            return Err(ResolveError::BadInstanceName(instance.to_owned()));
        }

        let Resolver { socket, timeout } = self;

        tokio::runtime::Builder::new_current_thread()
            .thread_name("lantern mDNS resolver (Tokio)")
            .enable_all()
            .build()
            .expect("tokio runtime")
            .block_on(async move {
                let conn = Conn::Mdns(MdnsConn::new(socket.into_async()?));

                let resolved = tokio::time::timeout(timeout, lookup_instance(&conn, &name))
                    .await
                    .map_err(|_| ResolveError::Timeout)?;
                conn.close();
                resolved
            })
    }
}

/// Builder for a [`Resolver`].
pub struct ResolverBuilder {
    ifaces: Vec<String>,
    loopback: bool,
    timeout: Duration,
}

impl ResolverBuilder {
    pub fn new() -> Self {
        Self {
            ifaces: Vec::new(),
            loopback: false,
            timeout: Duration::from_secs(5),
        }
    }

    /// Restricts the lookup to the named interface. May be repeated.
    pub fn interface(mut self, name: impl Into<String>) -> Self {
        self.ifaces.push(name.into());
        self
    }

    /// Receives multicast sent by this host, useful when the service runs
    /// on the same machine.
    pub fn loopback(mut self) -> Self {
        self.loopback = true;
        self
    }

    /// How long to wait before giving up. Defaults to five seconds.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn build(self) -> Result<Resolver, ResolveError> {
        let ifaces = multicast_interfaces(&self.ifaces)?;
        if ifaces.is_empty() {
            return Err(ResolveError::NoInterfaces);
        }

        Ok(Resolver {
            socket: MdnsSocket::bind(ifaces, self.loopback)?,
            timeout: self.timeout,
        })
    }
}

impl Default for ResolverBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Sends SRV and TXT questions with the unicast-response bit on every
/// interface and reads responses until the instance is fully known.
pub(crate) async fn lookup_instance(
    conn: &Conn,
    instance: &DnsName,
) -> Result<Service, ResolveError> {
    let mut cache = Cache::new();
    let mut rx = conn.subscribe();

    let msg = instance_query(instance);
    for iface in conn.interfaces() {
        if let Err(err) = conn
            .send_query(OutQuery {
                msg: msg.clone(),
                iface: Some(iface.name.clone()),
            })
            .await
        {
            debug!(%err, iface = %iface.name, "lookup send failed");
        }
    }

    loop {
        let Some(req) = next_request(&mut rx).await else {
            return Err(ResolveError::Timeout);
        };

        if req.message().message_type() != DnsMessageType::Response {
            continue;
        }

        cache.update_from(req.message(), req.iface());

        if let Some(entry) = cache.get(instance) {
            if !entry.host().is_empty() && entry.port() != 0 {
                return Ok(entry.clone());
            }
        }
    }
}

fn instance_query(instance: &DnsName) -> DnsMessage {
    let mut msg = DnsMessage::new();

    for ty in [DnsRecordType::SRV, DnsRecordType::TXT] {
        let mut query = DnsQuery::new();
        query
            .set_name(instance.clone())
            .set_query_type(ty)
            .set_query_class(DnsClass::IN)
            .set_mdns_unicast_response(true);
        msg.add_query(query);
    }

    msg
}
