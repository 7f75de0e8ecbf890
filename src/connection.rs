//! A single pooled connection to a backend endpoint.

use crate::backend::{self, Backend, Channel, Outcome, SharedTransport};
use crate::message::Message;
#[cfg(feature = "probes")]
use crate::probes;

use debug_ignore::DebugIgnore;
use derive_where::derive_where;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{Duration, Instant};
use tracing::{event, instrument, Level};

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Failed to open channel")]
    Open(#[source] Arc<backend::Error>),

    #[error("Timed out waiting for channel to open")]
    OpenTimeout,

    #[error("Connection closed")]
    Closed,
}

impl Error {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Error::Open(_) => "Open",
            Error::OpenTimeout => "OpenTimeout",
            Error::Closed => "Closed",
        }
    }
}

/// An arbitrary opaque identifier for a connection, unique within its pool.
pub type ConnectionId = u64;

/// The observable lifecycle of a connection.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Created,
    Opening,
    Ready,
    Faulted,
    Closed,
}

/// The result of a liveness probe.
#[derive(Debug)]
pub enum Probe {
    /// The channel answered.
    Healthy,

    /// The channel did not answer in time. It may simply be busy.
    Inconclusive,

    /// The channel reported an error, and the connection is now faulted.
    Failed(backend::Error),

    /// The connection is not open, so there was nothing to probe.
    Skipped,
}

type OpenResult = Option<Result<(), Error>>;

#[derive_where(Debug)]
enum State<Chan: Channel> {
    // No channel has been opened yet.
    //
    // - (On open) State becomes Opening
    Created,

    // A task is opening a channel. Everyone who calls "open" in the meantime
    // waits on this receiver rather than opening another channel.
    //
    // - (On success) State becomes Ready
    // - (On failure) State becomes Faulted
    Opening(watch::Receiver<OpenResult>),

    // The channel is open and may carry requests.
    //
    // - (On transport fault or failed probe) State becomes Faulted
    Ready(DebugIgnore<Arc<Chan>>),

    // The last channel broke. The next "open" replaces it in place.
    Faulted,

    // Final state.
    Closed,
}

impl<Chan: Channel> State<Chan> {
    fn observe(&self) -> ConnectionState {
        match self {
            State::Created => ConnectionState::Created,
            State::Opening(_) => ConnectionState::Opening,
            State::Ready(_) => ConnectionState::Ready,
            State::Faulted => ConnectionState::Faulted,
            State::Closed => ConnectionState::Closed,
        }
    }
}

struct Slot<Chan: Channel> {
    state: State<Chan>,
    last_activity: Instant,
}

struct Inner<Chan: Channel> {
    id: ConnectionId,
    backend: Backend,
    transport: SharedTransport<Chan>,
    slot: Mutex<Slot<Chan>>,
}

/// A connection to one backend endpoint, which may or may not be open.
///
/// Cloning a connection yields another handle to the same underlying
/// channel. The channel is replaced in place when it breaks, so a
/// connection keeps its identity (and its place in the pool) across
/// reconnects.
pub struct Connection<Chan: Channel> {
    inner: Arc<Inner<Chan>>,
}

impl<Chan: Channel> Clone for Connection<Chan> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<Chan: Channel> std::fmt::Debug for Connection<Chan> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("backend", &self.inner.backend.name)
            .field("state", &self.state())
            .finish()
    }
}

impl<Chan: Channel> Connection<Chan> {
    pub(crate) fn new(id: ConnectionId, backend: Backend, transport: SharedTransport<Chan>) -> Self {
        Self {
            inner: Arc::new(Inner {
                id,
                backend,
                transport,
                slot: Mutex::new(Slot {
                    state: State::Created,
                    last_activity: Instant::now(),
                }),
            }),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn backend(&self) -> &Backend {
        &self.inner.backend
    }

    /// Returns true if both handles refer to the same connection.
    pub fn same(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.slot.lock().unwrap().state.observe()
    }

    /// Returns true if the channel is open, without waiting on anything.
    pub fn is_ready(&self) -> bool {
        matches!(self.inner.slot.lock().unwrap().state, State::Ready(_))
    }

    /// The last time a request completed on this connection.
    pub fn last_activity(&self) -> Instant {
        self.inner.slot.lock().unwrap().last_activity
    }

    /// Opens the channel, if it is not already open.
    ///
    /// At most one open is in flight per connection. Callers which arrive
    /// while an open is in progress wait for it, and all of them observe
    /// its outcome. `timeout` only bounds how long this caller waits; the
    /// open keeps running for everyone else.
    #[instrument(
        level = "debug",
        skip(self),
        fields(conn_id = self.inner.id),
        err,
        name = "Connection::open"
    )]
    pub async fn open(&self, timeout: Duration) -> Result<(), Error> {
        let mut rx = {
            let mut slot = self.inner.slot.lock().unwrap();
            match &slot.state {
                State::Ready(_) => return Ok(()),
                State::Closed => return Err(Error::Closed),
                State::Opening(rx) => rx.clone(),
                State::Created | State::Faulted => {
                    let (tx, rx) = watch::channel(None);
                    slot.state = State::Opening(rx.clone());
                    tokio::task::spawn(self.clone().open_channel(tx));
                    rx
                }
            }
        };

        let result = match tokio::time::timeout(timeout, rx.wait_for(Option::is_some)).await {
            Err(_) => Err(Error::OpenTimeout),
            // The opening task went away without reporting back.
            Ok(Err(_)) => Err(Error::Closed),
            Ok(Ok(result)) => result.clone().unwrap_or(Err(Error::Closed)),
        };
        result
    }

    // Runs in its own task, so that an abandoned caller cannot strand the
    // connection in "Opening".
    async fn open_channel(self, tx: watch::Sender<OpenResult>) {
        #[cfg(feature = "probes")]
        probes::open__start!(|| (self.inner.backend.name.as_str(), self.inner.id));

        let result = self.inner.transport.open(&self.inner.backend).await;

        let (outcome, orphan) = {
            let mut slot = self.inner.slot.lock().unwrap();
            let opening = matches!(slot.state, State::Opening(_));
            match result {
                Ok(chan) if opening => {
                    slot.state = State::Ready(DebugIgnore(Arc::new(chan)));
                    slot.last_activity = Instant::now();
                    (Ok(()), None)
                }
                // Closed while we were opening; nobody else will close this.
                Ok(chan) => (Err(Error::Closed), Some(chan)),
                Err(err) => {
                    event!(
                        Level::WARN,
                        err = ?err,
                        backend = ?self.inner.backend,
                        "Failed to open channel"
                    );
                    if opening {
                        slot.state = State::Faulted;
                    }
                    (Err(Error::Open(Arc::new(err))), None)
                }
            }
        };

        #[cfg(feature = "probes")]
        match &outcome {
            Ok(()) => probes::open__done!(|| (self.inner.backend.name.as_str(), self.inner.id)),
            Err(err) => probes::open__failed!(|| (
                self.inner.backend.name.as_str(),
                self.inner.id,
                err.as_str()
            )),
        }

        if let Some(chan) = orphan {
            self.close_channel(&chan).await;
        }
        tx.send_replace(Some(outcome));
    }

    fn channel(&self) -> Option<Arc<Chan>> {
        match &self.inner.slot.lock().unwrap().state {
            State::Ready(DebugIgnore(chan)) => Some(chan.clone()),
            _ => None,
        }
    }

    // Marks the connection faulted, if `chan` is still its current channel.
    //
    // The broken channel is closed in the background.
    fn fault(&self, chan: &Arc<Chan>) {
        {
            let mut slot = self.inner.slot.lock().unwrap();
            let State::Ready(DebugIgnore(current)) = &slot.state else {
                return;
            };
            if !Arc::ptr_eq(current, chan) {
                return;
            }
            slot.state = State::Faulted;
        }
        event!(Level::WARN, conn_id = self.inner.id, "Connection faulted");
        let conn = self.clone();
        let chan = chan.clone();
        tokio::task::spawn(async move { conn.close_channel(&chan).await });
    }

    /// Sends one request on the open channel.
    ///
    /// A [Outcome::TransportFault] leaves the connection faulted. Timeouts
    /// and application faults leave it as it was.
    #[instrument(level = "trace", skip(self, request), fields(conn_id = self.inner.id))]
    pub async fn send(&self, request: Message, timeout: Duration) -> Outcome {
        let Some(chan) = self.channel() else {
            return Outcome::TransportFault(backend::Error::NotConnected);
        };

        let outcome = match tokio::time::timeout(timeout, self.inner.transport.send(&chan, request))
            .await
        {
            Ok(outcome) => outcome,
            Err(_) => Outcome::Timeout,
        };

        match &outcome {
            Outcome::TransportFault(err) => {
                event!(Level::WARN, err = ?err, conn_id = self.inner.id, "Transport fault");
                self.fault(&chan);
            }
            Outcome::Response(_) | Outcome::ApplicationFault(_) => {
                self.inner.slot.lock().unwrap().last_activity = Instant::now();
            }
            Outcome::Timeout => (),
        }
        outcome
    }

    /// Sends a liveness probe, if the channel is open.
    #[instrument(level = "trace", skip(self), fields(conn_id = self.inner.id))]
    pub async fn probe(&self, timeout: Duration) -> Probe {
        let Some(chan) = self.channel() else {
            return Probe::Skipped;
        };

        #[cfg(feature = "probes")]
        probes::probe__start!(|| (self.inner.backend.name.as_str(), self.inner.id));

        match tokio::time::timeout(timeout, self.inner.transport.probe(&chan)).await {
            Ok(Ok(())) => {
                #[cfg(feature = "probes")]
                probes::probe__done!(|| (self.inner.backend.name.as_str(), self.inner.id));
                Probe::Healthy
            }
            Ok(Err(err)) => {
                #[cfg(feature = "probes")]
                probes::probe__failed!(|| (
                    self.inner.backend.name.as_str(),
                    self.inner.id,
                    "ProbeError"
                ));
                self.fault(&chan);
                Probe::Failed(err)
            }
            Err(_) => {
                event!(
                    Level::DEBUG,
                    conn_id = self.inner.id,
                    "Probe timed out; treating as inconclusive"
                );
                Probe::Inconclusive
            }
        }
    }

    /// Closes the connection for good.
    ///
    /// Only the first caller performs the close; later calls return
    /// immediately. Errors from the transport are logged and swallowed.
    pub async fn close(&self) {
        let previous = {
            let mut slot = self.inner.slot.lock().unwrap();
            std::mem::replace(&mut slot.state, State::Closed)
        };
        match previous {
            State::Ready(DebugIgnore(chan)) => {
                event!(Level::DEBUG, conn_id = self.inner.id, "Closing connection");
                self.close_channel(&chan).await;
            }
            // An in-flight open notices "Closed" and cleans up after itself.
            State::Created | State::Opening(_) | State::Faulted | State::Closed => (),
        }
    }

    /// Closes the connection from a background task.
    pub fn close_in_background(&self) {
        let conn = self.clone();
        tokio::task::spawn(async move { conn.close().await });
    }

    async fn close_channel(&self, chan: &Chan) {
        if let Err(err) = self.inner.transport.close(chan).await {
            event!(
                Level::WARN,
                err = ?err,
                conn_id = self.inner.id,
                "Error while closing channel"
            );
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::message::Fault;
    use crate::test_utils::{test_backend, FakeTransport, SendMode};

    fn connection(transport: &Arc<FakeTransport>) -> Connection<crate::test_utils::FakeChannel> {
        Connection::new(1, test_backend(8080), transport.clone())
    }

    #[tokio::test]
    async fn open_is_idempotent_under_concurrency() {
        let transport = Arc::new(FakeTransport::new());
        transport.set_open_delay(Duration::from_millis(20));
        let conn = connection(&transport);

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let conn = conn.clone();
                tokio::task::spawn(async move { conn.open(Duration::from_secs(5)).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().expect("every caller should see the open succeed");
        }

        assert_eq!(transport.opens(), 1);
        assert_eq!(conn.state(), ConnectionState::Ready);
        assert!(conn.is_ready());

        // Already open: no new transport open.
        conn.open(Duration::from_secs(5)).await.unwrap();
        assert_eq!(transport.opens(), 1);
    }

    #[tokio::test]
    async fn concurrent_waiters_share_open_failure() {
        let transport = Arc::new(FakeTransport::new());
        transport.set_open_delay(Duration::from_millis(20));
        transport.fail_opens(true);
        let conn = connection(&transport);

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let conn = conn.clone();
                tokio::task::spawn(async move { conn.open(Duration::from_secs(5)).await })
            })
            .collect();
        for task in tasks {
            let err = task.await.unwrap().unwrap_err();
            assert!(matches!(err, Error::Open(_)), "Unexpected error: {err:?}");
        }

        assert_eq!(transport.opens(), 1);
        assert_eq!(conn.state(), ConnectionState::Faulted);
    }

    #[tokio::test(start_paused = true)]
    async fn open_timeout_bounds_only_the_caller() {
        let transport = Arc::new(FakeTransport::new());
        transport.set_open_delay(Duration::from_secs(10));
        let conn = connection(&transport);

        let err = conn.open(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, Error::OpenTimeout));
        assert_eq!(conn.state(), ConnectionState::Opening);

        // A later caller joins the same open rather than starting another.
        conn.open(Duration::from_secs(30)).await.unwrap();
        assert_eq!(transport.opens(), 1);
    }

    #[tokio::test]
    async fn transport_fault_reopens_in_place() {
        let transport = Arc::new(FakeTransport::new());
        let conn = connection(&transport);
        conn.open(Duration::from_secs(5)).await.unwrap();

        transport.set_send_mode(SendMode::Break);
        let outcome = conn.send(Message::new("hi"), Duration::from_secs(1)).await;
        assert!(matches!(outcome, Outcome::TransportFault(_)));
        assert_eq!(conn.state(), ConnectionState::Faulted);

        transport.set_send_mode(SendMode::Echo);
        conn.open(Duration::from_secs(5)).await.unwrap();
        assert_eq!(transport.opens(), 2);
        assert_eq!(conn.id(), 1);

        let request = Message::new("again");
        let Outcome::Response(response) = conn.send(request.clone(), Duration::from_secs(1)).await
        else {
            panic!("Expected a response after reopening");
        };
        assert_eq!(response.payload, request.payload);
    }

    #[tokio::test]
    async fn application_fault_keeps_connection_ready() {
        let transport = Arc::new(FakeTransport::new());
        let conn = connection(&transport);
        conn.open(Duration::from_secs(5)).await.unwrap();

        transport.set_send_mode(SendMode::Fault(Fault::new(7, "bad input")));
        let outcome = conn.send(Message::new("hi"), Duration::from_secs(1)).await;
        assert!(matches!(outcome, Outcome::ApplicationFault(ref f) if f.code == 7));
        assert!(conn.is_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn send_timeout_keeps_connection_ready() {
        let transport = Arc::new(FakeTransport::new());
        let conn = connection(&transport);
        conn.open(Duration::from_secs(5)).await.unwrap();

        transport.set_send_mode(SendMode::Stall);
        let outcome = conn.send(Message::new("hi"), Duration::from_millis(100)).await;
        assert!(matches!(outcome, Outcome::Timeout));
        assert!(conn.is_ready());
    }

    #[tokio::test]
    async fn send_before_open_is_a_transport_fault() {
        let transport = Arc::new(FakeTransport::new());
        let conn = connection(&transport);
        let outcome = conn.send(Message::new("hi"), Duration::from_secs(1)).await;
        assert!(matches!(
            outcome,
            Outcome::TransportFault(backend::Error::NotConnected)
        ));
        assert_eq!(conn.state(), ConnectionState::Created);
    }

    #[tokio::test]
    async fn close_runs_once() {
        let transport = Arc::new(FakeTransport::new());
        let conn = connection(&transport);
        conn.open(Duration::from_secs(5)).await.unwrap();

        futures::future::join_all((0..8).map(|_| conn.close())).await;
        conn.close().await;

        assert_eq!(transport.total_closes(), 1);
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(matches!(
            conn.open(Duration::from_secs(1)).await,
            Err(Error::Closed)
        ));
    }

    #[tokio::test]
    async fn close_never_fails() {
        let transport = Arc::new(FakeTransport::new());
        transport.fail_closes(true);
        let conn = connection(&transport);
        conn.open(Duration::from_secs(5)).await.unwrap();
        conn.close().await;
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn probe_classifies_results() {
        let transport = Arc::new(FakeTransport::new());
        let conn = connection(&transport);
        assert!(matches!(
            conn.probe(Duration::from_secs(1)).await,
            Probe::Skipped
        ));

        conn.open(Duration::from_secs(5)).await.unwrap();
        assert!(matches!(
            conn.probe(Duration::from_secs(1)).await,
            Probe::Healthy
        ));

        transport.break_channel(0);
        assert!(matches!(
            conn.probe(Duration::from_secs(1)).await,
            Probe::Failed(_)
        ));
        assert_eq!(conn.state(), ConnectionState::Faulted);
    }
}
