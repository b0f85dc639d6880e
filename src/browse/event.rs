use crate::service::Service;
use std::{collections::BTreeMap, net::IpAddr, sync::Arc};

pub(crate) type EventHandler = Arc<dyn Fn(BrowseEvent) + Send + Sync + 'static>;

#[derive(Debug, Clone)]
/// An event reported while browsing.
pub enum BrowseEvent {
    /// An instance became visible at an interface.
    Added(BrowseEntry),

    /// An instance said goodbye or its records expired.
    Removed(BrowseEntry),
}

#[derive(Debug, Clone)]
/// One service instance as seen from one interface.
pub struct BrowseEntry {
    /// The visible (unescaped) instance name.
    pub name: String,

    /// The service type, e.g. `_http._tcp`.
    pub ty: String,

    /// The domain the instance was found in.
    pub domain: String,

    /// The advertised host name, unqualified.
    pub host: String,

    /// The advertised port.
    pub port: u16,

    /// The interface the instance was seen on.
    pub iface: String,

    /// Addresses observed at that interface.
    pub ips: Vec<IpAddr>,

    /// TXT data of the instance.
    pub txt: BTreeMap<String, String>,
}

impl BrowseEntry {
    pub(super) fn new(service: &Service, iface: String, ips: Vec<IpAddr>) -> Self {
        Self {
            name: service.name().to_owned(),
            ty: service.service_type().to_owned(),
            domain: service.domain().to_owned(),
            host: service.host().to_owned(),
            port: service.port(),
            iface,
            ips,
            txt: service.txt().clone(),
        }
    }

    /// `<instance>.<type>.<domain>.` with the instance in its visible form.
    pub fn instance_name(&self) -> String {
        format!("{}.{}.{}.", self.name, self.ty, self.domain)
    }
}
