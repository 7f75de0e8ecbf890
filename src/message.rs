//! Request and response envelopes exchanged with backends.

use std::collections::BTreeMap;
use uuid::Uuid;

/// Identifies a client request, and every response produced for it.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CorrelationId(pub Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// An opaque payload plus the metadata needed to route it.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Message {
    pub correlation_id: CorrelationId,
    pub headers: BTreeMap<String, String>,
    pub payload: Vec<u8>,
}

impl Message {
    /// Creates a request with a fresh correlation id.
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            correlation_id: CorrelationId::new(),
            headers: BTreeMap::new(),
            payload: payload.into(),
        }
    }

    /// Creates a reply to `request`, echoing its correlation id.
    pub fn reply_to(request: &Message, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            correlation_id: request.correlation_id,
            headers: BTreeMap::new(),
            payload: payload.into(),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }
}

/// A fault raised by backend application logic.
///
/// Faults are forwarded to clients verbatim.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Fault {
    pub code: i32,
    pub reason: String,
}

impl Fault {
    pub fn new(code: i32, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "fault {}: {}", self.code, self.reason)
    }
}
