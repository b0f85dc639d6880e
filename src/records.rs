//! Resource record construction and DNS message helpers.

use crate::{net::NetInterface, service::Service};
use trust_dns_client::{
    op::{Message as DnsMessage, MessageType as DnsMessageType, OpCode as DnsOpCode},
    rr::{
        rdata::{SRV, TXT},
        DNSClass as DnsClass, RData, Record as DnsRecord, RecordType as DnsRecordType,
    },
};
use trust_dns_proto::{
    rr::dnssec::rdata::{DNSSECRData, NSEC},
    serialize::binary::BinEncodable,
};

/// TTL for shared records (PTR, TXT), RFC 6762 §10.
pub(crate) const TTL_DEFAULT: u32 = 75 * 60;

/// TTL for records naming the host (SRV, A, AAAA, NSEC), RFC 6762 §10.
pub(crate) const TTL_HOSTNAME: u32 = 120;

/// Legacy unicast responses must not outlive the querier's interest
/// (RFC 6762 §6.7).
pub(crate) const TTL_LEGACY: u32 = 10;

/// The PTR record `<type>.<domain>. → <instance>.<type>.<domain>.`.
pub(crate) fn ptr(service: &Service) -> DnsRecord {
    let mut record = DnsRecord::new();
    record
        .set_name(service.service_name())
        .set_rr_type(DnsRecordType::PTR)
        .set_dns_class(DnsClass::IN)
        .set_ttl(TTL_DEFAULT)
        .set_data(Some(RData::PTR(service.instance_name())));
    record
}

/// The SRV record for the instance, pointing at the host and port.
pub(crate) fn srv(service: &Service) -> DnsRecord {
    let mut record = DnsRecord::new();
    record
        .set_name(service.instance_name())
        .set_rr_type(DnsRecordType::SRV)
        .set_dns_class(DnsClass::IN)
        .set_ttl(TTL_HOSTNAME)
        .set_data(Some(RData::SRV(SRV::new(
            0,
            0,
            service.port(),
            service.hostname(),
        ))));
    record
}

/// The TXT record for the instance, one `key=value` string per pair.
pub(crate) fn txt(service: &Service) -> DnsRecord {
    let strings: Vec<String> = service
        .txt()
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect();

    let mut record = DnsRecord::new();
    record
        .set_name(service.instance_name())
        .set_rr_type(DnsRecordType::TXT)
        .set_dns_class(DnsClass::IN)
        .set_ttl(TTL_DEFAULT)
        .set_data(Some(RData::TXT(TXT::new(strings))));
    record
}

/// A records for the host at the given interface.
pub(crate) fn a(service: &Service, iface: &NetInterface) -> Vec<DnsRecord> {
    service
        .ips_at_interface(iface)
        .into_iter()
        .filter_map(|ip| match ip {
            std::net::IpAddr::V4(addr) => Some(addr),
            std::net::IpAddr::V6(_) => None,
        })
        .map(|addr| {
            let mut record = DnsRecord::new();
            record
                .set_name(service.hostname())
                .set_rr_type(DnsRecordType::A)
                .set_dns_class(DnsClass::IN)
                .set_ttl(TTL_HOSTNAME)
                .set_data(Some(RData::A(addr)));
            record
        })
        .collect()
}

/// AAAA records for the host at the given interface.
pub(crate) fn aaaa(service: &Service, iface: &NetInterface) -> Vec<DnsRecord> {
    service
        .ips_at_interface(iface)
        .into_iter()
        .filter_map(|ip| match ip {
            std::net::IpAddr::V6(addr) => Some(addr),
            std::net::IpAddr::V4(_) => None,
        })
        .map(|addr| {
            let mut record = DnsRecord::new();
            record
                .set_name(service.hostname())
                .set_rr_type(DnsRecordType::AAAA)
                .set_dns_class(DnsClass::IN)
                .set_ttl(TTL_HOSTNAME)
                .set_data(Some(RData::AAAA(addr)));
            record
        })
        .collect()
}

/// NSEC record asserting that the instance name only carries SRV and TXT
/// (RFC 6762 §6.1).
pub(crate) fn nsec_instance(service: &Service) -> DnsRecord {
    let owner = service.instance_name();

    let mut record = DnsRecord::new();
    record
        .set_name(owner.clone())
        .set_rr_type(DnsRecordType::NSEC)
        .set_dns_class(DnsClass::IN)
        .set_ttl(TTL_HOSTNAME)
        .set_data(Some(RData::DNSSEC(DNSSECRData::NSEC(NSEC::new(
            owner,
            vec![DnsRecordType::TXT, DnsRecordType::SRV],
        )))));
    record
}

/// NSEC record listing the address record types present at the host name,
/// or `None` when the interface carries no addresses for the service.
pub(crate) fn nsec_host(service: &Service, iface: &NetInterface) -> Option<DnsRecord> {
    let ips = service.ips_at_interface(iface);

    let mut types = Vec::new();
    if ips.iter().any(|ip| ip.is_ipv4()) {
        types.push(DnsRecordType::A);
    }
    if ips.iter().any(|ip| ip.is_ipv6()) {
        types.push(DnsRecordType::AAAA);
    }

    if types.is_empty() {
        return None;
    }

    let owner = service.hostname();
    let mut record = DnsRecord::new();
    record
        .set_name(owner.clone())
        .set_rr_type(DnsRecordType::NSEC)
        .set_dns_class(DnsClass::IN)
        .set_ttl(TTL_HOSTNAME)
        .set_data(Some(RData::DNSSEC(DNSSECRData::NSEC(NSEC::new(
            owner, types,
        )))));
    Some(record)
}

/// The enumeration PTR `_services._dns-sd._udp.<domain>. → <type>.<domain>.`
/// answering service meta queries (RFC 6763 §9).
pub(crate) fn meta_ptr(service: &Service) -> DnsRecord {
    let mut record = DnsRecord::new();
    record
        .set_name(service.meta_query_name())
        .set_rr_type(DnsRecordType::PTR)
        .set_dns_class(DnsClass::IN)
        .set_ttl(TTL_DEFAULT)
        .set_data(Some(RData::PTR(service.service_name())));
    record
}

/// The full record set announced for a service at one interface.
pub(crate) fn announcement(service: &Service, iface: &NetInterface) -> Vec<DnsRecord> {
    let mut records = vec![srv(service), ptr(service), txt(service)];
    records.extend(a(service, iface));
    records.extend(aaaa(service, iface));
    records
}

/// The same record set with TTL 0, retracting the service (RFC 6762 §10.1).
pub(crate) fn goodbye(service: &Service, iface: &NetInterface) -> Vec<DnsRecord> {
    let mut records = announcement(service, iface);
    for record in &mut records {
        record.set_ttl(0);
    }
    records
}

/// Marks every unique record with the cache-flush bit. PTR records are
/// shared and stay unmarked (RFC 6762 §10.2).
pub(crate) fn set_cache_flush(records: &mut [DnsRecord]) {
    for record in records {
        if record.rr_type() != DnsRecordType::PTR {
            record.set_mdns_cache_flush(true);
        }
    }
}

/// Clamps record TTLs for a legacy unicast response (RFC 6762 §6.7).
pub(crate) fn clamp_legacy_ttl(records: &mut [DnsRecord]) {
    for record in records {
        if record.ttl() > TTL_LEGACY {
            record.set_ttl(TTL_LEGACY);
        }
    }
}

/// True when the two records carry the same name, type and data. TTL and
/// the cache-flush bit do not contribute to identity.
pub(crate) fn records_match(a: &DnsRecord, b: &DnsRecord) -> bool {
    a.name() == b.name() && a.rr_type() == b.rr_type() && a.data() == b.data()
}

/// Known-answer suppression: drops every answer already present in the
/// request's Answer section (RFC 6762 §7.1).
pub(crate) fn suppress_known(known: &[DnsRecord], answers: Vec<DnsRecord>) -> Vec<DnsRecord> {
    answers
        .into_iter()
        .filter(|answer| !known.iter().any(|k| records_match(k, answer)))
        .collect()
}

/// Starts an authoritative mDNS response echoing the request id.
pub(crate) fn response_message(id: u16) -> DnsMessage {
    let mut msg = DnsMessage::new();
    msg.set_id(id)
        .set_message_type(DnsMessageType::Response)
        .set_op_code(DnsOpCode::Query)
        .set_authoritative(true);
    msg
}

/// Merges a truncated message with its continuation from the same source:
/// questions and record sections concatenate, the truncation flag clears
/// (RFC 6762 §18.5).
pub(crate) fn merge_truncated(first: &DnsMessage, second: &DnsMessage) -> DnsMessage {
    let mut merged = DnsMessage::new();
    merged
        .set_id(second.id())
        .set_message_type(second.message_type())
        .set_op_code(second.op_code())
        .set_authoritative(second.authoritative());

    for part in [first, second] {
        for query in part.queries() {
            merged.add_query(query.clone());
        }
        for record in part.answers() {
            merged.add_answer(record.clone());
        }
        for record in part.name_servers() {
            merged.add_name_server(record.clone());
        }
        for record in part.additionals() {
            merged.add_additional(record.clone());
        }
    }

    merged
}

/// Splits a message into datagrams no larger than `max_payload`. Every part
/// except the last carries the Truncated flag; the receive side merges them
/// back together. Questions ride in the first part.
pub(crate) fn split_message(msg: &DnsMessage, max_payload: usize) -> Vec<DnsMessage> {
    match msg.to_bytes() {
        Ok(bytes) if bytes.len() <= max_payload => return vec![msg.clone()],
        Err(_) => return vec![msg.clone()],
        Ok(_) => {}
    }

    let base = |with_questions: bool| {
        let mut part = DnsMessage::new();
        part.set_id(msg.id())
            .set_message_type(msg.message_type())
            .set_op_code(msg.op_code())
            .set_authoritative(msg.authoritative());
        if with_questions {
            for query in msg.queries() {
                part.add_query(query.clone());
            }
        }
        part
    };

    enum Section {
        Answer,
        NameServer,
        Additional,
    }

    let records = msg
        .answers()
        .iter()
        .map(|r| (Section::Answer, r))
        .chain(msg.name_servers().iter().map(|r| (Section::NameServer, r)))
        .chain(msg.additionals().iter().map(|r| (Section::Additional, r)));

    let mut parts = Vec::new();
    let mut current = base(true);
    let mut current_len = current.to_bytes().map(|b| b.len()).unwrap_or(12);

    for (section, record) in records {
        let record_len = record.to_bytes().map(|b| b.len()).unwrap_or(0);
        if current_len + record_len > max_payload && current_len > 12 {
            current.set_truncated(true);
            parts.push(current);
            current = base(false);
            current_len = 12;
        }

        match section {
            Section::Answer => current.add_answer(record.clone()),
            Section::NameServer => current.add_name_server(record.clone()),
            Section::Additional => current.add_additional(record.clone()),
        };
        current_len += record_len;
    }

    parts.push(current);
    parts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::ServiceBuilder;

    fn test_service() -> Service {
        ServiceBuilder::new("Test", "_asdf._tcp", 1234)
            .host("Computer")
            .txt("key", "value")
            .build()
            .unwrap()
    }

    #[test]
    fn known_answers_are_suppressed() {
        let service = test_service();

        let known = vec![srv(&service), txt(&service)];
        let answers = vec![srv(&service), txt(&service), ptr(&service)];

        let remaining = suppress_known(&known, answers);
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].rr_type(), DnsRecordType::PTR);
    }

    #[test]
    fn cache_flush_skips_shared_records() {
        let service = test_service();
        let iface = crate::net::NetInterface::named("lo0");

        let mut records = announcement(&service, &iface);
        set_cache_flush(&mut records);

        for record in &records {
            let expect_flush = record.rr_type() != DnsRecordType::PTR;
            assert_eq!(record.mdns_cache_flush(), expect_flush);
        }
    }

    #[test]
    fn goodbye_zeroes_every_ttl() {
        let service = test_service();
        let iface = crate::net::NetInterface::named("lo0");

        for record in goodbye(&service, &iface) {
            assert_eq!(record.ttl(), 0);
        }
    }

    #[test]
    fn oversized_messages_are_split_and_flagged() {
        let service = test_service();
        let mut msg = response_message(0);
        for _ in 0..64 {
            msg.add_answer(txt(&service));
        }

        let parts = split_message(&msg, 512);
        assert!(parts.len() > 1);

        for part in &parts[..parts.len() - 1] {
            assert!(part.truncated());
        }
        assert!(!parts.last().unwrap().truncated());

        let total: usize = parts.iter().map(|p| p.answers().len()).sum();
        assert_eq!(total, 64);
    }

    #[test]
    fn truncated_messages_merge_into_one() {
        let service = test_service();

        let mut first = response_message(7);
        first.set_truncated(true);
        first.add_answer(srv(&service));

        let mut second = response_message(7);
        second.add_answer(txt(&service));

        let merged = merge_truncated(&first, &second);
        assert!(!merged.truncated());
        assert_eq!(merged.answers().len(), 2);
    }
}
