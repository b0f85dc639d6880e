//! Cache of service instances observed on the network.

use crate::service::{insert_txt, Service};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::time::Instant;
use trust_dns_client::{
    op::Message as DnsMessage,
    rr::{RData, Record as DnsRecord, RecordType as DnsRecordType},
};

#[derive(Default)]
pub(crate) struct Cache {
    services: HashMap<trust_dns_client::rr::Name, Service>,
}

impl Cache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn services(&self) -> impl Iterator<Item = &Service> {
        self.services.values()
    }

    pub fn get(&self, instance: &trust_dns_client::rr::Name) -> Option<&Service> {
        self.services.get(instance)
    }

    /// Folds the records of one message into the cache, attributing
    /// addresses to the arrival interface. Returns the entries created and
    /// the entries that expired during this update.
    pub fn update_from(
        &mut self,
        msg: &DnsMessage,
        iface: &str,
    ) -> (Vec<Service>, Vec<Service>) {
        let now = Instant::now();
        let mut added = Vec::new();

        // SRV and PTR create entries; A/AAAA/TXT only attach to existing
        // ones, so they are processed last.
        let mut records: Vec<&DnsRecord> = msg
            .answers()
            .iter()
            .chain(msg.name_servers())
            .chain(msg.additionals())
            .collect();
        records.sort_by_key(|rr| {
            !matches!(rr.rr_type(), DnsRecordType::SRV | DnsRecordType::PTR)
        });

        for rr in records {
            let ttl = Duration::from_secs(u64::from(rr.ttl()));

            match rr.data() {
                Some(RData::PTR(ptr)) => {
                    if !self.services.contains_key(ptr) {
                        if ttl.is_zero() {
                            continue;
                        }
                        let Some(entry) = Service::from_instance(ptr) else { continue };
                        added.push(ptr.clone());
                        self.services.insert(ptr.clone(), entry);
                    }

                    let entry = self.services.get_mut(ptr).expect("entry just ensured");
                    entry.ttl = ttl;
                    entry.expires_at = Some(now + ttl);
                }

                Some(RData::SRV(srv)) => {
                    if !self.services.contains_key(rr.name()) {
                        if ttl.is_zero() {
                            continue;
                        }
                        let Some(entry) = Service::from_instance(rr.name()) else { continue };
                        added.push(rr.name().clone());
                        self.services.insert(rr.name().clone(), entry);
                    }

                    let entry = self.services.get_mut(rr.name()).expect("entry just ensured");
                    entry.set_hostname(srv.target());
                    entry.port = srv.port();
                    entry.ttl = ttl;
                    entry.expires_at = Some(now + ttl);
                }

                Some(RData::A(addr)) => {
                    for entry in self.services.values_mut() {
                        if entry.try_hostname().as_ref() == Some(rr.name()) {
                            entry.add_ip(std::net::IpAddr::V4(*addr), iface);
                        }
                    }
                }

                Some(RData::AAAA(addr)) => {
                    for entry in self.services.values_mut() {
                        if entry.try_hostname().as_ref() == Some(rr.name()) {
                            entry.add_ip(std::net::IpAddr::V6(*addr), iface);
                        }
                    }
                }

                Some(RData::TXT(txt)) => {
                    if let Some(entry) = self.services.get_mut(rr.name()) {
                        let mut text = BTreeMap::new();
                        for data in txt.txt_data() {
                            let string = String::from_utf8_lossy(data);
                            if let Some((key, value)) = string.split_once('=') {
                                insert_txt(&mut text, key.to_owned(), value.to_owned());
                            }
                        }

                        entry.txt = text;
                        entry.ttl = ttl;
                        entry.expires_at = Some(now + ttl);
                    }
                }

                _ => {}
            }
        }

        let added = added
            .iter()
            .filter_map(|key| self.services.get(key).cloned())
            .collect();

        (added, self.remove_expired(now))
    }

    /// Removes and returns every entry whose lifetime has run out.
    pub fn remove_expired(&mut self, now: Instant) -> Vec<Service> {
        let expired: Vec<trust_dns_client::rr::Name> = self
            .services
            .iter()
            .filter(|(_, entry)| entry.expires_at.map_or(false, |at| now >= at))
            .map(|(key, _)| key.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|key| self.services.remove(&key))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records;
    use crate::service::ServiceBuilder;
    use std::net::{IpAddr, Ipv4Addr};

    fn test_service() -> Service {
        ServiceBuilder::new("Test", "_asdf._tcp", 1234)
            .host("Computer")
            .txt("key", "value")
            .interface_ips("lo0", vec![IpAddr::V4(Ipv4Addr::new(192, 168, 0, 123))])
            .build()
            .unwrap()
    }

    fn announcement_message(service: &Service) -> DnsMessage {
        let mut msg = records::response_message(0);
        let iface = crate::net::NetInterface::named("lo0");
        for rr in records::announcement(service, &iface) {
            msg.add_answer(rr);
        }
        msg
    }

    #[tokio::test(start_paused = true)]
    async fn announcement_populates_an_entry() {
        let service = test_service();
        let mut cache = Cache::new();

        let (added, removed) = cache.update_from(&announcement_message(&service), "lo0");
        assert_eq!(added.len(), 1);
        assert!(removed.is_empty());

        let entry = cache.get(&service.instance_name()).unwrap();
        assert_eq!(entry.name(), "Test");
        assert_eq!(entry.service_type(), "_asdf._tcp");
        assert_eq!(entry.host(), "Computer");
        assert_eq!(entry.port(), 1234);
        assert_eq!(entry.txt().get("key").map(String::as_str), Some("value"));
        assert_eq!(
            entry.ips_at_interface(&crate::net::NetInterface::named("lo0")),
            vec![IpAddr::V4(Ipv4Addr::new(192, 168, 0, 123))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_their_ttl() {
        let service = test_service();
        let mut cache = Cache::new();
        cache.update_from(&announcement_message(&service), "lo0");

        let removed = cache.remove_expired(
            Instant::now() + Duration::from_secs(u64::from(records::TTL_DEFAULT) + 1),
        );
        assert_eq!(removed.len(), 1);
        assert!(cache.get(&service.instance_name()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn goodbye_removes_the_entry() {
        let service = test_service();
        let mut cache = Cache::new();
        cache.update_from(&announcement_message(&service), "lo0");

        let mut goodbye = records::response_message(0);
        let mut rr = records::ptr(&service);
        rr.set_ttl(0);
        goodbye.add_answer(rr);

        let (added, removed) = cache.update_from(&goodbye, "lo0");
        assert!(added.is_empty());
        assert_eq!(removed.len(), 1);
        assert!(cache.get(&service.instance_name()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn deep_instance_names_keep_their_wire_form() {
        let first = "a".repeat(40);
        let second = "b".repeat(40);
        let instance = crate::service::name_from_labels([
            first.as_bytes(),
            second.as_bytes(),
            b"_asdf",
            b"_tcp",
            b"local",
        ])
        .unwrap();

        let mut msg = records::response_message(0);
        let mut record = trust_dns_client::rr::Record::new();
        record
            .set_name(
                crate::service::name_from_labels([&b"_asdf"[..], b"_tcp", b"local"]).unwrap(),
            )
            .set_rr_type(DnsRecordType::PTR)
            .set_dns_class(trust_dns_client::rr::DNSClass::IN)
            .set_ttl(4500)
            .set_data(Some(RData::PTR(instance.clone())));
        msg.add_answer(record);

        let mut cache = Cache::new();
        let (added, _) = cache.update_from(&msg, "lo0");
        assert_eq!(added.len(), 1);

        // The joined visible name is longer than one DNS label allows, so
        // the entry must answer with the name it arrived under.
        let entry = cache.get(&instance).unwrap();
        assert_eq!(entry.instance_name(), instance);
        assert_eq!(entry.name(), format!("{first}.{second}"));
    }

    #[tokio::test(start_paused = true)]
    async fn goodbye_for_an_unknown_instance_is_ignored() {
        let service = test_service();
        let mut cache = Cache::new();

        let mut goodbye = records::response_message(0);
        let mut rr = records::ptr(&service);
        rr.set_ttl(0);
        goodbye.add_answer(rr);

        let (added, removed) = cache.update_from(&goodbye, "lo0");
        assert!(added.is_empty());
        assert!(removed.is_empty());
    }
}
