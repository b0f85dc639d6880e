//! Errors that can occur when using this crate

use std::any::Any;

#[derive(Debug, Error)]
/// A service descriptor failed validation
pub enum ConfigError {
    #[error("Service name must not be empty")]
    /// The instance name is empty
    MissingName,

    #[error("Service type must not be empty")]
    /// The service type is empty
    MissingType,

    #[error("Service port must not be zero")]
    /// The port is zero
    InvalidPort,

    #[error("{0} is not a valid DNS label")]
    /// A name component does not form a valid DNS label
    BadLabel(String),
}

#[derive(Debug, Error)]
/// Probing for a unique service instance name failed
pub enum ProbeError {
    #[error("Probing did not settle on a unique name within one minute")]
    /// RFC 6762 §9: after one minute of probing, give up
    Timeout,

    #[error("Probing gave up after 100 conflicted rounds")]
    /// The name kept conflicting through every rename attempt
    ConflictExhausted,

    #[error("The responder shut down while probing")]
    /// The responder was stopped before probing finished
    Shutdown,

    #[error("I/O error: {0}")]
    /// An I/O error occurred while probing
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
/// An error occurred while constructing or running a [`Responder`](crate::Responder)
pub enum RespondError {
    #[error("No multicast-capable network interface available")]
    /// Interface enumeration produced no usable interface
    NoInterfaces,

    #[error("{0}")]
    /// A service failed to claim a unique name
    Probe(#[from] ProbeError),

    #[error("I/O error: {0}")]
    /// Binding the multicast sockets failed
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
/// An error occurred while resolving a service instance
pub enum ResolveError {
    #[error("The instance was not resolved before the deadline")]
    /// No SRV and TXT data arrived in time
    Timeout,

    #[error("{0} is not a service instance name")]
    /// The queried name does not parse as `<instance>.<type>.<domain>.`
    BadInstanceName(String),

    #[error("No multicast-capable network interface available")]
    /// Interface enumeration produced no usable interface
    NoInterfaces,

    #[error("I/O error: {0}")]
    /// An I/O error occurred
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
/// An error occurred while constructing or running a [`Browser`](crate::Browser)
pub enum BrowseError {
    #[error("No multicast-capable network interface available")]
    /// Interface enumeration produced no usable interface
    NoInterfaces,

    #[error("I/O error: {0}")]
    /// An I/O error occurred
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
/// An error occurred while shutting down a responder or browser
pub enum ShutdownError {
    #[error("Thread panicked")]
    /// The underlying thread panicked
    ThreadJoinError(Box<dyn Any + Send + 'static>),

    #[error("I/O error occurred during background thread execution: {0}")]
    /// An I/O error occurred
    IoError(#[from] std::io::Error),

    #[error("{0}")]
    /// The responder exited with an error
    Respond(#[from] RespondError),
}
