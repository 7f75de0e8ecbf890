//! The interface for identifying and talking to backend endpoints.

use crate::message::{Fault, Message};

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O Error")]
    Io(#[from] std::io::Error),

    #[error("Channel is not open")]
    NotConnected,

    #[error(transparent)]
    Other(anyhow::Error),
}

/// Describes the name of a backend endpoint.
///
/// Connection pools are keyed by this name.
#[derive(Clone, PartialEq, Eq, Ord, PartialOrd, Debug, Hash)]
pub struct Name(pub Arc<str>);

impl Name {
    pub fn new(name: impl ToString) -> Self {
        Self(name.to_string().into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Name {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for Name {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.0.serialize(serializer)
    }
}

impl From<String> for Name {
    fn from(s: String) -> Self {
        Self(s.into())
    }
}

impl From<&'_ str> for Name {
    fn from(s: &'_ str) -> Self {
        Self(s.into())
    }
}

impl std::borrow::Borrow<str> for Name {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// A single network endpoint: a service host, or a relay in front of one.
#[derive(Clone, PartialEq, Eq, Debug, Hash, Ord, PartialOrd)]
pub struct Backend {
    pub name: Name,
    pub address: SocketAddr,
}

impl Backend {
    /// Creates a backend named after its address.
    pub fn new(address: SocketAddr) -> Self {
        Self {
            name: Name::new(address),
            address,
        }
    }

    pub fn named(name: impl Into<Name>, address: SocketAddr) -> Self {
        Self {
            name: name.into(),
            address,
        }
    }
}

/// The result of sending one request over a channel.
///
/// Transports report every reply through this type rather than through
/// error variants, so callers must decide explicitly how each kind of
/// failure affects the connection it occurred on.
#[derive(Debug)]
pub enum Outcome {
    /// The backend answered.
    Response(Message),

    /// The backend's own logic raised a fault, carried back over a healthy
    /// channel.
    ApplicationFault(Fault),

    /// The channel itself broke: reset, broken pipe, failed handshake.
    TransportFault(Error),

    /// No answer arrived in time. This says nothing about channel health.
    Timeout,
}

impl Outcome {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Outcome::Response(_) => "Response",
            Outcome::ApplicationFault(_) => "ApplicationFault",
            Outcome::TransportFault(_) => "TransportFault",
            Outcome::Timeout => "Timeout",
        }
    }
}

/// Interface for raw channels.
///
/// Channels are shared between every request checked out against the same
/// pooled connection, so they must tolerate concurrent use.
pub trait Channel: Send + Sync + 'static {}

impl<T> Channel for T where T: Send + Sync + 'static {}

/// Describes how channels to a [Backend] are opened, used and closed.
#[async_trait]
pub trait Transport: Send + Sync {
    type Channel: Channel;

    /// Opens a channel to a backend.
    async fn open(&self, backend: &Backend) -> Result<Self::Channel, Error>;

    /// Sends one request and waits for its reply.
    async fn send(&self, channel: &Self::Channel, request: Message) -> Outcome;

    /// Sends a no-op message to check that the channel is still usable.
    ///
    /// This method is called by the [crate::monitor::LivenessMonitor] every
    /// [crate::policy::LivenessConfig::ping_interval], and can run for
    /// [crate::policy::LivenessConfig::probe_timeout] before the result is
    /// treated as inconclusive.
    ///
    /// By default this method does nothing.
    async fn probe(&self, _channel: &Self::Channel) -> Result<(), Error> {
        Ok(())
    }

    /// Tears the channel down.
    ///
    /// Errors returned here are logged and otherwise ignored.
    ///
    /// By default this method does nothing, leaving cleanup to `Drop`.
    async fn close(&self, _channel: &Self::Channel) -> Result<(), Error> {
        Ok(())
    }
}

pub type SharedTransport<Chan> = Arc<dyn Transport<Channel = Chan>>;
