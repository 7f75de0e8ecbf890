//! How requests are stamped and replies interpreted, per backend flavour.
//!
//! Dispatchers talk to backends either directly or through a relay that
//! forwards to the real host. The two differ only at the edges: what goes
//! onto a request before it is sent, and how a reply is read once it comes
//! back. Those two edges are the [RequestSender] and [ResponseReceiver]
//! pair that make up a [Strategy].

use crate::backend::{self, Outcome};
use crate::message::{Fault, Message};
use crate::target::Target;

use std::sync::Arc;

/// Header naming the host a relay should forward a request to.
pub const RELAY_TARGET_HEADER: &str = "x-relay-target";

/// Header naming the target a relayed request is meant for.
pub const RELAY_HOST_HEADER: &str = "x-relay-host";

/// Header with which a relay marks a response as carrying a backend fault.
pub const RELAY_FAULT_HEADER: &str = "x-relay-fault";

/// Fault code used when a relayed fault does not carry a readable code.
pub const UNKNOWN_FAULT_CODE: i32 = -1;

/// What a dispatcher should do with a reply.
#[derive(Debug)]
pub enum Verdict {
    /// Hand the response to the client.
    Respond(Message),

    /// Hand the fault to the client. The connection is healthy.
    Forward(Fault),

    /// The connection is broken. Clean up and retry elsewhere.
    Reconnect(backend::Error),

    /// The reply did not arrive in time.
    TimedOut,
}

/// Prepares a request for the wire.
pub trait RequestSender: Send + Sync {
    fn prepare(&self, request: Message, target: &Target) -> Message;
}

/// Decides what a reply means.
pub trait ResponseReceiver: Send + Sync {
    fn classify(&self, outcome: Outcome) -> Verdict;
}

/// The pair of edges used by one dispatcher.
#[derive(Clone)]
pub struct Strategy {
    pub sender: Arc<dyn RequestSender>,
    pub receiver: Arc<dyn ResponseReceiver>,
}

impl Strategy {
    /// For backends reached directly.
    pub fn direct() -> Self {
        Self {
            sender: Arc::new(Direct),
            receiver: Arc::new(Direct),
        }
    }

    /// For backends reached through a relay.
    pub fn relayed() -> Self {
        Self {
            sender: Arc::new(Relayed),
            receiver: Arc::new(Relayed),
        }
    }
}

impl std::fmt::Debug for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Strategy").finish_non_exhaustive()
    }
}

/// Sends requests unchanged, and takes outcomes at face value.
#[derive(Clone, Copy, Debug, Default)]
pub struct Direct;

impl RequestSender for Direct {
    fn prepare(&self, request: Message, _target: &Target) -> Message {
        request
    }
}

impl ResponseReceiver for Direct {
    fn classify(&self, outcome: Outcome) -> Verdict {
        match outcome {
            Outcome::Response(message) => Verdict::Respond(message),
            Outcome::ApplicationFault(fault) => Verdict::Forward(fault),
            Outcome::TransportFault(err) => Verdict::Reconnect(err),
            Outcome::Timeout => Verdict::TimedOut,
        }
    }
}

/// Addresses requests to the host behind a relay, and recognises faults
/// the relay passes back on the backend's behalf.
///
/// A relayed fault arrives as an ordinary response over a healthy channel
/// to the relay, so it is forwarded to the client rather than treated as a
/// broken connection.
#[derive(Clone, Copy, Debug, Default)]
pub struct Relayed;

impl RequestSender for Relayed {
    fn prepare(&self, request: Message, target: &Target) -> Message {
        request
            .with_header(RELAY_TARGET_HEADER, target.address.to_string())
            .with_header(RELAY_HOST_HEADER, target.name.as_str())
    }
}

impl ResponseReceiver for Relayed {
    fn classify(&self, outcome: Outcome) -> Verdict {
        match outcome {
            Outcome::Response(message) => match message.header(RELAY_FAULT_HEADER) {
                Some(code) => Verdict::Forward(Fault::new(
                    code.parse().unwrap_or(UNKNOWN_FAULT_CODE),
                    String::from_utf8_lossy(&message.payload),
                )),
                None => Verdict::Respond(message),
            },
            other => Direct.classify(other),
        }
    }
}
