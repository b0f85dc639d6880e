//! Continuous browsing for instances of a service type.

use crate::{
    cache::Cache,
    conn::{next_request, Conn, MdnsConn, OutQuery},
    records,
    service::name_from_labels,
    socket::MdnsSocket,
};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;
use trust_dns_client::{
    op::{Message as DnsMessage, MessageType as DnsMessageType, Query as DnsQuery},
    rr::{DNSClass as DnsClass, Name as DnsName, RecordType as DnsRecordType},
};

mod builder;
pub use builder::BrowserBuilder;

mod event;
pub use event::{BrowseEntry, BrowseEvent};
pub(crate) use event::EventHandler;

mod handle;
pub use handle::BrowserHandle;
use handle::*;

/// Query cadence per RFC 6762 §5.2: one second, doubling up to an hour.
const QUERY_INTERVAL_FLOOR: Duration = Duration::from_secs(1);
const QUERY_INTERVAL_CEIL: Duration = Duration::from_secs(60 * 60);

/// Browses the local link for service instances of one type, reporting an
/// [`BrowseEvent::Added`] per `(instance, interface)` as long as the
/// instance is alive and a [`BrowseEvent::Removed`] once it expires or
/// says goodbye.
pub struct Browser {
    socket: MdnsSocket,
    ty: String,
    domain: String,
}

impl Browser {
    pub fn builder(ty: impl Into<String>) -> BrowserBuilder {
        BrowserBuilder::new(ty)
    }

    pub fn run_in_background<F>(self, handler: F) -> BrowserHandle
    where
        F: Fn(BrowseEvent) + Send + Sync + 'static,
    {
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

        let thread = std::thread::spawn(move || {
            tokio::runtime::Builder::new_current_thread()
                .thread_name("lantern mDNS browser (Tokio)")
                .enable_all()
                .build()
                .expect("tokio runtime")
                .block_on(self.impl_run(std::sync::Arc::new(handler), Some(shutdown_rx)))
        });

        BrowserHandle(BrowserHandleDrop(Some(BrowserHandleInner {
            thread,
            shutdown_tx,
        })))
    }

    pub fn run<F>(self, handler: F) -> Result<(), std::io::Error>
    where
        F: Fn(BrowseEvent) + Send + Sync + 'static,
    {
        tokio::runtime::Builder::new_current_thread()
            .thread_name("lantern mDNS browser (Tokio)")
            .enable_all()
            .build()
            .expect("tokio runtime")
            .block_on(self.impl_run(std::sync::Arc::new(handler), None))
    }

    async fn impl_run(
        self,
        handler: EventHandler,
        shutdown_rx: Option<tokio::sync::oneshot::Receiver<()>>,
    ) -> Result<(), std::io::Error> {
        let Browser { socket, ty, domain } = self;

        let conn = Conn::Mdns(MdnsConn::new(socket.into_async()?));

        let shutdown = async move {
            if let Some(shutdown_rx) = shutdown_rx {
                shutdown_rx.await.ok();
            } else {
                std::future::pending::<()>().await
            }
        };

        let res = tokio::select! {
            biased;
            res = browse_loop(&conn, &ty, &domain, handler) => res,
            _ = shutdown => Ok(()),
        };

        conn.close();
        res
    }
}

pub(crate) async fn browse_loop(
    conn: &Conn,
    ty: &str,
    domain: &str,
    handler: EventHandler,
) -> Result<(), std::io::Error> {
    let service_name = service_type_name(ty, domain)
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err))?;

    let mut cache = Cache::new();
    let mut known: Vec<BrowseEntry> = Vec::new();
    let mut rx = conn.subscribe();

    let mut interval = QUERY_INTERVAL_FLOOR;
    let mut next_query = Instant::now();

    loop {
        tokio::select! {
            biased;
            req = next_request(&mut rx) => {
                let Some(req) = req else { return Ok(()) };
                if req.message().message_type() != DnsMessageType::Response {
                    continue;
                }

                cache.update_from(req.message(), req.iface());
                sync_entries(&cache, &service_name, &mut known, &handler).await;
            }

            _ = tokio::time::sleep_until(next_query) => {
                let msg = browse_query(&service_name, &cache);
                for iface in conn.interfaces() {
                    if let Err(err) = conn
                        .send_query(OutQuery { msg: msg.clone(), iface: Some(iface.name.clone()) })
                        .await
                    {
                        debug!(%err, iface = %iface.name, "browse send failed");
                    }
                }

                next_query = Instant::now() + interval;
                interval = (interval * 2).min(QUERY_INTERVAL_CEIL);
            }
        }
    }
}

/// The periodic PTR query, carrying known answers whose remaining lifetime
/// is still above half the original TTL (RFC 6762 §7.1).
fn browse_query(service_name: &DnsName, cache: &Cache) -> DnsMessage {
    let mut msg = DnsMessage::new();

    let mut query = DnsQuery::new();
    query
        .set_name(service_name.clone())
        .set_query_type(DnsRecordType::PTR)
        .set_query_class(DnsClass::IN);
    msg.add_query(query);

    let now = Instant::now();
    for entry in cache.services() {
        if entry.service_name() != *service_name {
            continue;
        }

        let Some(expires_at) = entry.expires_at else { continue };
        let remaining = expires_at.saturating_duration_since(now);
        if remaining <= entry.ttl / 2 {
            continue;
        }

        let mut rr = records::ptr(entry);
        rr.set_ttl(remaining.as_secs() as u32);
        msg.add_answer(rr);
    }

    msg
}

/// Diffs the live cache against the entries reported so far, emitting Add
/// and Remove events.
async fn sync_entries(
    cache: &Cache,
    service_name: &DnsName,
    known: &mut Vec<BrowseEntry>,
    handler: &EventHandler,
) {
    let mut events = Vec::new();

    for service in cache.services() {
        if service.service_name() != *service_name {
            continue;
        }

        for (iface, ips) in &service.iface_ips {
            let seen = known
                .iter()
                .any(|e| e.name == service.name() && e.iface == *iface);
            if !seen {
                let entry = BrowseEntry::new(service, iface.clone(), ips.clone());
                known.push(entry.clone());
                events.push(BrowseEvent::Added(entry));
            }
        }
    }

    known.retain(|entry| {
        let alive = cache
            .services()
            .any(|service| service.unescaped_instance_name() == entry.instance_name());
        if !alive {
            events.push(BrowseEvent::Removed(entry.clone()));
        }
        alive
    });

    for event in events {
        let handler = handler.clone();
        tokio::task::spawn_blocking(move || handler(event)).await.ok();
    }
}

fn service_type_name(
    ty: &str,
    domain: &str,
) -> Result<DnsName, trust_dns_proto::error::ProtoError> {
    let labels = ty
        .split('.')
        .chain(domain.split('.'))
        .filter(|label| !label.is_empty())
        .map(str::as_bytes);
    name_from_labels(labels)
}
