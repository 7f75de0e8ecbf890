//! Interface for dispatch targets
use crate::backend::Backend;
use std::sync::Arc;

/// Describes the name of a dispatch target
#[derive(Clone, Debug, PartialEq, Eq, Ord, PartialOrd, Hash)]
pub struct Name(pub Arc<str>);

impl Name {
    pub fn new(s: impl ToString) -> Self {
        Self(Arc::from(s.to_string()))
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

impl From<String> for Name {
    fn from(s: String) -> Self {
        Self(Arc::from(s))
    }
}

impl From<&'_ str> for Name {
    fn from(s: &'_ str) -> Self {
        Self(Arc::from(s))
    }
}

impl std::borrow::Borrow<str> for Name {
    fn borrow(&self) -> &str {
        &self.0
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

/// The scheduler's identifier for the task running on a target.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Ord, PartialOrd, Hash)]
pub struct TaskId(pub u64);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// A backend host allocated to the job.
///
/// `endpoint` is where connections are actually opened. For hosts reached
/// directly this is the host itself; for relayed hosts it is the relay, and
/// `address` is the host the relay forwards to.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Target {
    pub name: Name,
    pub task_id: Option<TaskId>,
    pub endpoint: Backend,
    pub address: std::net::SocketAddr,
}

impl Target {
    /// A target reached directly at its own endpoint.
    pub fn direct(name: impl Into<Name>, endpoint: Backend) -> Self {
        let address = endpoint.address;
        Self {
            name: name.into(),
            task_id: None,
            endpoint,
            address,
        }
    }

    /// A target reached through a relay at `endpoint`.
    pub fn relayed(name: impl Into<Name>, endpoint: Backend, address: std::net::SocketAddr) -> Self {
        Self {
            name: name.into(),
            task_id: None,
            endpoint,
            address,
        }
    }

    pub fn with_task_id(mut self, task_id: TaskId) -> Self {
        self.task_id = Some(task_id);
        self
    }
}
