//! Probing verifies that a service's instance name and host name are
//! unique on the link before they are claimed (RFC 6762 §8).

use crate::{
    conn::{next_request, Conn, OutQuery},
    errors::ProbeError,
    net::NetInterface,
    service::Service,
};
use rand::{rngs::StdRng, Rng};
use std::{
    cmp::Ordering,
    net::{Ipv4Addr, Ipv6Addr},
    time::Duration,
};
use tracing::debug;
use trust_dns_client::{
    op::{Message as DnsMessage, Query as DnsQuery},
    rr::{rdata::SRV, DNSClass as DnsClass, RData, RecordType as DnsRecordType},
};

/// RFC 6762 §9: after one minute of failed probing, give up.
const PROBE_DEADLINE: Duration = Duration::from_secs(60);

const PROBE_INTERVAL: Duration = Duration::from_millis(250);

/// Deferral after losing a tie-break (RFC 6762 §8.2).
const CONFLICT_BACKOFF: Duration = Duration::from_secs(1);

const MAX_ROUNDS: u32 = 100;

#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct ProbeConflict {
    pub host: bool,
    pub instance: bool,
}

impl ProbeConflict {
    fn any(self) -> bool {
        self.host || self.instance
    }
}

/// Probes for the service's host name and instance name. On success the
/// returned service is unique on the link, possibly under bumped names.
pub(crate) async fn probe_service(
    conn: &Conn,
    service: &Service,
    rng: &mut StdRng,
) -> Result<Service, ProbeError> {
    // Hosts starting to probe concurrently de-synchronize through an
    // initial random delay (RFC 6762 §8.1).
    let jitter = Duration::from_millis(rng.gen_range(0..250));
    debug!(?jitter, instance = %service.unescaped_instance_name(), "probing");
    tokio::time::sleep(jitter).await;

    tokio::time::timeout(PROBE_DEADLINE, probe_rounds(conn, service, false))
        .await
        .map_err(|_| ProbeError::Timeout)?
}

/// Like [`probe_service`], but renames immediately on the first conflict:
/// the service already lost its name once.
pub(crate) async fn reprobe_service(conn: &Conn, service: &Service) -> Result<Service, ProbeError> {
    tokio::time::timeout(PROBE_DEADLINE, probe_rounds(conn, service, true))
        .await
        .map_err(|_| ProbeError::Timeout)?
}

async fn probe_rounds(
    conn: &Conn,
    service: &Service,
    probe_once: bool,
) -> Result<Service, ProbeError> {
    let mut candidate = service.clone();
    let mut prev = ProbeConflict::default();
    let mut host_conflicts = 0u32;
    let mut name_conflicts = 0u32;

    for _ in 0..MAX_ROUNDS {
        let mut conflict = probe_round(conn, &candidate).await?;
        if !conflict.any() {
            return Ok(candidate);
        }

        // A conflict only forces a rename once it repeats; the first
        // occurrence may just be a probe tie-break we lost.
        if conflict.host && (prev.host || probe_once) {
            host_conflicts += 1;
            candidate.host = bump_label(service.host(), host_conflicts + 1);
            conflict.host = false;
            debug!(host = %candidate.host, "host name conflict, renamed");
        }

        if conflict.instance && (prev.instance || probe_once) {
            name_conflicts += 1;
            candidate.name = bump_label(service.name(), name_conflicts + 1);
            candidate.wire_instance = None;
            conflict.instance = false;
            debug!(name = %candidate.name, "instance name conflict, renamed");
        }

        prev = conflict;

        let delay = if conflict.any() {
            // Our data was lexicographically earlier; the winner keeps the
            // name and we retry in a second (RFC 6762 §8.2).
            CONFLICT_BACKOFF
        } else {
            PROBE_INTERVAL
        };
        tokio::time::sleep(delay).await;
    }

    Err(ProbeError::ConflictExhausted)
}

async fn probe_round(conn: &Conn, candidate: &Service) -> Result<ProbeConflict, ProbeError> {
    for iface in conn.interfaces() {
        if !candidate.visible_at(&iface.name) {
            continue;
        }

        let conflict = probe_at_interface(conn, candidate, &iface).await?;
        if conflict.any() {
            return Ok(conflict);
        }
    }

    Ok(ProbeConflict::default())
}

async fn probe_at_interface(
    conn: &Conn,
    service: &Service,
    iface: &NetInterface,
) -> Result<ProbeConflict, ProbeError> {
    let msg = probe_message(service, iface);

    let ours = OwnRecords::of(service, iface);

    let mut rx = conn.subscribe();
    // Responses received before our first probe packet must be ignored
    // (RFC 6762 §8.1).
    conn.drain(&mut rx).await;

    let mut conflict = ProbeConflict::default();
    let mut queries_sent = 0u8;
    let mut next_query = tokio::time::Instant::now() + Duration::from_millis(1);

    loop {
        tokio::select! {
            req = next_request(&mut rx) => {
                let Some(req) = req else { return Err(ProbeError::Shutdown) };
                if req.iface() != iface.name {
                    continue;
                }

                ours.check(req.message(), service, &mut conflict);
            }

            _ = tokio::time::sleep_until(next_query) => {
                if conflict.any() || queries_sent >= 3 {
                    return Ok(conflict);
                }

                queries_sent += 1;
                if let Err(err) = conn
                    .send_query(OutQuery { msg: msg.clone(), iface: Some(iface.name.clone()) })
                    .await
                {
                    debug!(%err, iface = %iface.name, "probe send failed");
                }

                next_query = tokio::time::Instant::now() + PROBE_INTERVAL;
            }
        }
    }
}

/// The probe query: ANY questions for the names we want to claim, with the
/// records we intend to publish in the Authority section.
fn probe_message(service: &Service, iface: &NetInterface) -> DnsMessage {
    let mut msg = DnsMessage::new();

    for name in [service.instance_name(), service.hostname()] {
        let mut query = DnsQuery::new();
        query
            .set_name(name)
            .set_query_type(DnsRecordType::ANY)
            .set_query_class(DnsClass::IN);
        msg.add_query(query);
    }

    msg.add_name_server(crate::records::srv(service));
    for rr in crate::records::a(service, iface) {
        msg.add_name_server(rr);
    }
    for rr in crate::records::aaaa(service, iface) {
        msg.add_name_server(rr);
    }

    msg
}

/// The records we intend to claim at one interface, in comparable form.
pub(crate) struct OwnRecords {
    v4: Vec<Ipv4Addr>,
    v6: Vec<Ipv6Addr>,
    srv: SRV,
}

impl OwnRecords {
    pub fn of(service: &Service, iface: &NetInterface) -> Self {
        let mut v4 = Vec::new();
        let mut v6 = Vec::new();
        for ip in service.ips_at_interface(iface) {
            match ip {
                std::net::IpAddr::V4(addr) => v4.push(addr),
                std::net::IpAddr::V6(addr) => v6.push(addr),
            }
        }

        Self {
            v4,
            v6,
            srv: SRV::new(0, 0, service.port(), service.hostname()),
        }
    }

    /// Flags conflicts raised by the records of an inbound message against
    /// what we intend to claim.
    pub fn check(&self, msg: &DnsMessage, service: &Service, conflict: &mut ProbeConflict) {
        let (peer_v4, peer_v6, peer_srvs) = relevant_records(msg, service);

        if !peer_v4.is_empty() && !same_v4_set(&peer_v4, &self.v4) {
            debug!(?peer_v4, ours = ?self.v4, "A records deny our host name");
            conflict.host = true;
        } else if !peer_v6.is_empty() && !same_v6_set(&peer_v6, &self.v6) {
            debug!(?peer_v6, ours = ?self.v6, "AAAA records deny our host name");
            conflict.host = true;
        }

        for peer in &peer_srvs {
            if denies_srv(peer, &self.srv) {
                debug!(target = %peer.target(), "SRV denies our instance name");
                conflict.instance = true;
            }
        }
    }

    /// True when the message claims our names with data that is not ours.
    /// Used by the responder for post-announcement conflict detection.
    pub fn denied_by(&self, msg: &DnsMessage, service: &Service) -> bool {
        let mut conflict = ProbeConflict::default();
        self.check(msg, service, &mut conflict);
        conflict.any()
    }
}

/// Extracts the records of the message that speak about this service: SRV
/// records for its instance name, address records for its host name. All
/// message sections count.
fn relevant_records(
    msg: &DnsMessage,
    service: &Service,
) -> (Vec<Ipv4Addr>, Vec<Ipv6Addr>, Vec<SRV>) {
    let instance = service.instance_name();
    let hostname = service.try_hostname();

    let mut v4 = Vec::new();
    let mut v6 = Vec::new();
    let mut srvs = Vec::new();

    for rr in msg
        .answers()
        .iter()
        .chain(msg.name_servers())
        .chain(msg.additionals())
    {
        match rr.data() {
            Some(RData::A(addr)) if hostname.as_ref() == Some(rr.name()) => v4.push(*addr),
            Some(RData::AAAA(addr)) if hostname.as_ref() == Some(rr.name()) => v6.push(*addr),
            Some(RData::SRV(srv)) if *rr.name() == instance => srvs.push(srv.clone()),
            _ => {}
        }
    }

    (v4, v6, srvs)
}

/// True if the peer's SRV record denies ours: an invalid record always
/// does, otherwise the lexicographically greater one wins (RFC 6762 §8.2).
pub(crate) fn denies_srv(peer: &SRV, ours: &SRV) -> bool {
    if !is_valid_srv(peer) {
        return true;
    }

    compare_srv(peer, ours) == Ordering::Greater
}

fn is_valid_srv(srv: &SRV) -> bool {
    srv.port() != 0 && srv.target().num_labels() > 0
}

/// Lexicographic SRV ordering: priority, weight, port, then target name.
pub(crate) fn compare_srv(a: &SRV, b: &SRV) -> Ordering {
    a.priority()
        .cmp(&b.priority())
        .then(a.weight().cmp(&b.weight()))
        .then(a.port().cmp(&b.port()))
        .then_with(|| {
            a.target()
                .to_utf8()
                .to_ascii_lowercase()
                .cmp(&b.target().to_utf8().to_ascii_lowercase())
        })
}

fn same_v4_set(peer: &[Ipv4Addr], ours: &[Ipv4Addr]) -> bool {
    let mut peer: Vec<_> = peer.to_vec();
    let mut ours: Vec<_> = ours.to_vec();
    peer.sort_unstable();
    peer.dedup();
    ours.sort_unstable();
    ours.dedup();
    peer == ours
}

fn same_v6_set(peer: &[Ipv6Addr], ours: &[Ipv6Addr]) -> bool {
    let mut peer: Vec<_> = peer.to_vec();
    let mut ours: Vec<_> = ours.to_vec();
    peer.sort_unstable();
    peer.dedup();
    ours.sort_unstable();
    ours.dedup();
    peer == ours
}

/// Appends "-N" to a label, truncating the base so the result stays within
/// the 63-byte DNS label limit.
fn bump_label(base: &str, n: u32) -> String {
    let suffix = format!("-{n}");
    let mut cut = 63usize.saturating_sub(suffix.len()).min(base.len());
    while !base.is_char_boundary(cut) {
        cut -= 1;
    }

    format!("{}{}", &base[..cut], suffix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use trust_dns_client::rr::Name as DnsName;

    fn srv_record(priority: u16, weight: u16, port: u16, target: &str) -> SRV {
        SRV::new(priority, weight, port, DnsName::from_utf8(target).unwrap())
    }

    #[test]
    fn lexicographically_greater_srv_denies() {
        let ours = srv_record(0, 0, 1000, "alpha.local.");

        assert!(denies_srv(&srv_record(0, 0, 2000, "alpha.local."), &ours));
        assert!(denies_srv(&srv_record(1, 0, 1000, "alpha.local."), &ours));
        assert!(denies_srv(&srv_record(0, 0, 1000, "beta.local."), &ours));

        assert!(!denies_srv(&srv_record(0, 0, 500, "alpha.local."), &ours));
        assert!(!denies_srv(&srv_record(0, 0, 1000, "alpha.local."), &ours));
    }

    #[test]
    fn invalid_srv_always_denies() {
        let ours = srv_record(0, 0, 1000, "alpha.local.");
        assert!(denies_srv(&srv_record(0, 0, 0, "alpha.local."), &ours));
    }

    #[test]
    fn srv_target_compares_case_insensitively() {
        let a = srv_record(0, 0, 1000, "Alpha.local.");
        let b = srv_record(0, 0, 1000, "alpha.LOCAL.");
        assert_eq!(compare_srv(&a, &b), Ordering::Equal);
    }

    #[test]
    fn address_sets_compare_as_multisets() {
        let a = [Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2)];
        let b = [Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(10, 0, 0, 1)];
        assert!(same_v4_set(&a, &b));
        assert!(!same_v4_set(&a, &b[..1]));
    }

    #[test]
    fn bumped_labels_stay_within_dns_limits() {
        assert_eq!(bump_label("Alpha", 2), "Alpha-2");
        assert_eq!(bump_label("Alpha", 3), "Alpha-3");

        let long = "x".repeat(63);
        let bumped = bump_label(&long, 2);
        assert_eq!(bumped.len(), 63);
        assert!(bumped.ends_with("-2"));
    }
}
