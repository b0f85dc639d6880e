use crate::{errors::ConfigError, net::NetInterface, util};
use std::{
    collections::{BTreeMap, HashMap},
    net::IpAddr,
    time::Duration,
};
use tokio::time::Instant;
use trust_dns_client::rr::Name as DnsName;

/// A DNS-SD service instance descriptor.
///
/// Built with a [`ServiceBuilder`]; also produced by the browser and
/// resolver for instances observed on the network.
///
/// The instance name is kept in its visible form. Dots inside it are only
/// escaped at the DNS name boundary (RFC 6763 §4.3), so `name()` always
/// returns what a user would expect to read.
#[derive(Debug, Clone)]
pub struct Service {
    pub(crate) name: String,
    pub(crate) ty: String,
    pub(crate) domain: String,
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) txt: BTreeMap<String, String>,
    pub(crate) ifaces: Vec<String>,
    pub(crate) ips: Vec<IpAddr>,
    pub(crate) iface_ips: HashMap<String, Vec<IpAddr>>,

    /// The instance name exactly as observed on the wire. Set for entries
    /// built from network data, where re-deriving the name from its parsed
    /// parts could exceed DNS label limits.
    pub(crate) wire_instance: Option<DnsName>,

    // Cache bookkeeping, unused for services built locally.
    pub(crate) ttl: Duration,
    pub(crate) expires_at: Option<Instant>,
}

impl Service {
    /// Starts building a service with the given instance name, service type
    /// (e.g. `_http._tcp`) and port.
    pub fn builder(name: impl Into<String>, ty: impl Into<String>, port: u16) -> ServiceBuilder {
        ServiceBuilder::new(name, ty, port)
    }

    #[inline(always)]
    /// The visible (unescaped) instance name.
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline(always)]
    /// The service type, e.g. `_http._tcp`.
    pub fn service_type(&self) -> &str {
        &self.ty
    }

    #[inline(always)]
    /// The domain, `local` unless configured otherwise.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    #[inline(always)]
    /// The unqualified host name the service lives on.
    pub fn host(&self) -> &str {
        &self.host
    }

    #[inline(always)]
    /// The port the service listens on.
    pub fn port(&self) -> u16 {
        self.port
    }

    #[inline(always)]
    /// TXT records as an ordered key → value map.
    pub fn txt(&self) -> &BTreeMap<String, String> {
        &self.txt
    }

    #[inline(always)]
    /// The interface allow-list; empty means every multicast interface.
    pub fn ifaces(&self) -> &[String] {
        &self.ifaces
    }

    #[inline(always)]
    /// Explicitly configured addresses plus addresses observed in cache
    /// contexts.
    pub fn ips(&self) -> &[IpAddr] {
        &self.ips
    }

    #[inline(always)]
    /// Time to live of the most recent record that fed this entry. Only
    /// meaningful for services read back from the network.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// The service instance name `<instance>.<type>.<domain>.` as a DNS
    /// name, with dots in the instance label escaped on the wire. Entries
    /// observed on the network keep the name they arrived with.
    pub fn instance_name(&self) -> DnsName {
        if let Some(wire) = &self.wire_instance {
            return wire.clone();
        }

        let mut labels: Vec<&[u8]> = vec![self.name.as_bytes()];
        labels.extend(split_labels(&self.ty));
        labels.extend(split_labels(&self.domain));
        name_from_labels(labels).expect("validated service labels")
    }

    /// The service name `<type>.<domain>.` as a DNS name.
    pub fn service_name(&self) -> DnsName {
        let mut labels: Vec<&[u8]> = Vec::new();
        labels.extend(split_labels(&self.ty));
        labels.extend(split_labels(&self.domain));
        name_from_labels(labels).expect("validated service labels")
    }

    /// The host name `<host>.<domain>.` as a DNS name.
    pub fn hostname(&self) -> DnsName {
        self.try_hostname().expect("validated host label")
    }

    pub(crate) fn try_hostname(&self) -> Option<DnsName> {
        if self.host.is_empty() {
            return None;
        }

        let mut labels: Vec<&[u8]> = vec![self.host.as_bytes()];
        labels.extend(split_labels(&self.domain));
        name_from_labels(labels).ok()
    }

    /// The DNS-SD meta-query name `_services._dns-sd._udp.<domain>.`.
    pub fn meta_query_name(&self) -> DnsName {
        let mut labels: Vec<&[u8]> = vec![b"_services", b"_dns-sd", b"_udp"];
        labels.extend(split_labels(&self.domain));
        name_from_labels(labels).expect("validated domain labels")
    }

    /// `<instance>.<type>.<domain>.` with the instance in its visible form,
    /// no escape characters.
    pub fn unescaped_instance_name(&self) -> String {
        format!("{}.{}.{}.", self.name, self.ty, self.domain)
    }

    /// True if the service is advertised at the named interface.
    pub fn visible_at(&self, iface_name: &str) -> bool {
        self.ifaces.is_empty() || self.ifaces.iter().any(|name| name == iface_name)
    }

    /// The addresses advertised at a specific interface: the per-interface
    /// set if one is known, otherwise the explicitly configured addresses,
    /// otherwise the interface's own addresses.
    pub fn ips_at_interface(&self, iface: &NetInterface) -> Vec<IpAddr> {
        if let Some(ips) = self.iface_ips.get(&iface.name) {
            return ips.clone();
        }

        if !self.ips.is_empty() {
            return self.ips.clone();
        }

        iface.addrs().collect()
    }

    pub(crate) fn add_ip(&mut self, ip: IpAddr, iface_name: &str) {
        if !self.ips.contains(&ip) {
            self.ips.push(ip);
        }

        let ips = self.iface_ips.entry(iface_name.to_owned()).or_default();
        if !ips.contains(&ip) {
            ips.push(ip);
        }
    }

    /// Adopts `target` as the host name if its domain matches ours.
    pub(crate) fn set_hostname(&mut self, target: &DnsName) {
        let (host, domain) = parse_hostname(target);
        if domain.eq_ignore_ascii_case(&self.domain) {
            self.host = host;
        }
    }

    /// An empty entry for an instance name observed on the wire. `None`
    /// when the name does not parse as `<instance>.<type>.<domain>.`.
    pub(crate) fn from_instance(instance: &DnsName) -> Option<Self> {
        let (name, ty, domain) = parse_instance_name(instance)?;
        Some(Self {
            name,
            ty,
            domain,
            host: String::new(),
            port: 0,
            txt: BTreeMap::new(),
            ifaces: Vec::new(),
            ips: Vec::new(),
            iface_ips: HashMap::new(),
            wire_instance: Some(instance.clone()),
            ttl: Duration::ZERO,
            expires_at: None,
        })
    }
}

/// Builder for a [`Service`].
pub struct ServiceBuilder(Service);

impl ServiceBuilder {
    /// Creates a builder for a service with the given instance name, type
    /// and port. The name is the visible one; dots need no escaping here.
    pub fn new(name: impl Into<String>, ty: impl Into<String>, port: u16) -> Self {
        Self(Service {
            name: name.into(),
            ty: ty.into(),
            domain: String::new(),
            host: String::new(),
            port,
            txt: BTreeMap::new(),
            ifaces: Vec::new(),
            ips: Vec::new(),
            iface_ips: HashMap::new(),
            wire_instance: None,
            ttl: Duration::ZERO,
            expires_at: None,
        })
    }

    /// Sets the domain. Defaults to `local`.
    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.0.domain = domain.into();
        self
    }

    /// Sets the host name (unqualified, no trailing dot). Defaults to the
    /// sanitized OS host name.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.0.host = host.into();
        self
    }

    /// Adds a TXT key/value pair. Keys are unique case-insensitively; the
    /// first value wins.
    pub fn txt(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        insert_txt(&mut self.0.txt, key.into(), value.into());
        self
    }

    /// Restricts advertisement to the named interface. May be called
    /// multiple times; no call means every multicast interface.
    pub fn interface(mut self, name: impl Into<String>) -> Self {
        self.0.ifaces.push(name.into());
        self
    }

    /// Advertises an explicit address instead of the interface addresses.
    pub fn ip(mut self, ip: IpAddr) -> Self {
        self.0.ips.push(ip);
        self
    }

    /// Pins the addresses advertised at one specific interface.
    pub fn interface_ips(mut self, iface: impl Into<String>, ips: Vec<IpAddr>) -> Self {
        self.0.iface_ips.insert(iface.into(), ips);
        self
    }

    /// Validates and builds the [`Service`].
    pub fn build(mut self) -> Result<Service, ConfigError> {
        if self.0.name.is_empty() {
            return Err(ConfigError::MissingName);
        }

        if self.0.ty.is_empty() {
            return Err(ConfigError::MissingType);
        }

        if self.0.port == 0 {
            return Err(ConfigError::InvalidPort);
        }

        if self.0.domain.is_empty() {
            self.0.domain = "local".to_owned();
        }

        if self.0.host.is_empty() {
            self.0.host = util::local_host_label();
        }

        for label in [self.0.name.as_str()]
            .into_iter()
            .chain(self.0.ty.split('.'))
            .chain(self.0.domain.split('.'))
            .chain([self.0.host.as_str()])
        {
            if label.is_empty() || label.len() > 63 {
                return Err(ConfigError::BadLabel(label.to_owned()));
            }
        }

        Ok(self.0)
    }
}

/// Inserts a TXT pair; keys are compared case-insensitively and the first
/// value wins.
pub(crate) fn insert_txt(txt: &mut BTreeMap<String, String>, key: String, value: String) {
    if txt.keys().any(|k| k.eq_ignore_ascii_case(&key)) {
        return;
    }
    txt.insert(key, value);
}

fn split_labels(name: &str) -> impl Iterator<Item = &[u8]> {
    name.split('.')
        .filter(|label| !label.is_empty())
        .map(str::as_bytes)
}

/// Builds a fully-qualified DNS name from raw labels. Dots inside a label
/// stay inside it, which is exactly the RFC 6763 §4.3 escaping rule.
pub(crate) fn name_from_labels<'a, I>(labels: I) -> Result<DnsName, trust_dns_proto::error::ProtoError>
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let mut name = DnsName::from_labels(labels)?;
    name.set_fqdn(true);
    Ok(name)
}

/// Splits a service instance name into its visible instance name, service
/// type and domain. Works backwards from the domain label, so instance
/// labels containing (escaped) dots survive.
pub(crate) fn parse_instance_name(name: &DnsName) -> Option<(String, String, String)> {
    let labels: Vec<String> = name
        .iter()
        .map(|label| String::from_utf8_lossy(label).into_owned())
        .collect();

    if labels.len() < 4 {
        return None;
    }

    let n = labels.len();
    let domain = labels[n - 1].clone();
    let ty = format!("{}.{}", labels[n - 3], labels[n - 2]);
    let instance = labels[..n - 3].join(".");

    if instance.is_empty() {
        return None;
    }

    Some((instance, ty, domain))
}

/// Splits `<host>.<domain>.` into host and domain labels.
pub(crate) fn parse_hostname(name: &DnsName) -> (String, String) {
    let mut labels = name.iter().map(|label| String::from_utf8_lossy(label).into_owned());

    let host = labels.next().unwrap_or_default();
    let domain = labels.next().unwrap_or_default();
    (host, domain)
}
