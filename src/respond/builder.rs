use super::Responder;
use crate::{errors::RespondError, net::multicast_interfaces, socket::MdnsSocket};

/// Builder for a [`Responder`].
pub struct ResponderBuilder {
    ifaces: Vec<String>,
    loopback: bool,
}

impl ResponderBuilder {
    pub fn new() -> Self {
        Self {
            ifaces: Vec::new(),
            loopback: false,
        }
    }

    /// Restricts the responder to the named interface. May be repeated; no
    /// call means every multicast interface.
    pub fn interface(mut self, name: impl Into<String>) -> Self {
        self.ifaces.push(name.into());
        self
    }

    /// Also receives multicast sent by this host. Required when a browser
    /// or resolver runs on the same machine.
    pub fn loopback(mut self) -> Self {
        self.loopback = true;
        self
    }

    pub fn build(self) -> Result<Responder, RespondError> {
        let ifaces = multicast_interfaces(&self.ifaces)?;
        if ifaces.is_empty() {
            return Err(RespondError::NoInterfaces);
        }

        let socket = MdnsSocket::bind(ifaces, self.loopback)?;
        if socket.is_empty() {
            return Err(RespondError::NoInterfaces);
        }

        Ok(Responder::from_parts(Some(socket), None))
    }
}

impl Default for ResponderBuilder {
    fn default() -> Self {
        Self::new()
    }
}
