use super::Browser;
use crate::{errors::BrowseError, net::multicast_interfaces, socket::MdnsSocket};

/// Builder for a [`Browser`].
pub struct BrowserBuilder {
    ty: String,
    domain: String,
    ifaces: Vec<String>,
    loopback: bool,
}

impl BrowserBuilder {
    /// Creates a builder browsing for the given service type, e.g.
    /// `_http._tcp`.
    pub fn new(ty: impl Into<String>) -> Self {
        Self {
            ty: ty.into(),
            domain: "local".to_owned(),
            ifaces: Vec::new(),
            loopback: false,
        }
    }

    /// Sets the domain to browse in. Defaults to `local`.
    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    /// Restricts browsing to the named interface. May be repeated.
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

    pub fn build(self) -> Result<Browser, BrowseError> {
        let BrowserBuilder {
            ty,
            domain,
            ifaces,
            loopback,
        } = self;

        let ifaces = multicast_interfaces(&ifaces)?;
        if ifaces.is_empty() {
            return Err(BrowseError::NoInterfaces);
        }

        Ok(Browser {
            socket: MdnsSocket::bind(ifaces, loopback)?,
            ty,
            domain,
        })
    }
}
