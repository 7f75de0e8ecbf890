//! A pool of connections to one backend endpoint, shared by every
//! dispatcher which targets that endpoint.

use crate::backend::{self, Backend, Channel, SharedTransport};
use crate::claim;
use crate::connection::{Connection, ConnectionId};
use crate::policy::PoolConfig;
#[cfg(feature = "probes")]
use crate::probes;

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{event, instrument, Level};

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("The pool is full, and all claims on its connections are used")]
    AllClaimsUsed,

    #[error("Pool terminated")]
    Terminated,
}

impl Error {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Error::AllClaimsUsed => "AllClaimsUsed",
            Error::Terminated => "Terminated",
        }
    }
}

/// Describes the state of the connections in a pool.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    /// Connections currently tracked by the pool, in any state.
    pub connections: usize,

    /// Connections with an open channel.
    pub ready_connections: usize,

    /// Checkouts currently held, summed over all connections.
    pub claims: usize,

    /// Dispatchers currently attached to the pool.
    pub attached: usize,

    /// The total number of checkouts made from the pool so far.
    pub total_checkouts: usize,
}

// A pooled connection and the number of checkouts currently holding it.
//
// Keeping the two together means there is exactly one count per connection.
struct Entry<Chan: Channel> {
    conn: Connection<Chan>,
    claims: usize,
}

struct PoolInner<Chan: Channel> {
    entries: Vec<Entry<Chan>>,

    // Index of the entry the next round-robin checkout starts from.
    cursor: usize,

    // Dispatchers attached to this pool.
    attached: usize,

    next_connection_id: ConnectionId,
    terminated: bool,
}

impl<Chan: Channel> PoolInner<Chan> {
    fn position(&self, conn: &Connection<Chan>) -> Option<usize> {
        self.entries.iter().position(|entry| entry.conn.same(conn))
    }

    fn remove_at(&mut self, index: usize) -> Connection<Chan> {
        let entry = self.entries.remove(index);
        if index < self.cursor {
            self.cursor -= 1;
        }
        if self.cursor >= self.entries.len() {
            self.cursor = 0;
        }
        entry.conn
    }
}

/// Manages the connections to a single endpoint.
///
/// Every method here only touches bookkeeping under a short-lived lock.
/// Opening, using and closing connections is left to callers, outside of
/// that lock, so a slow endpoint never stalls checkouts or releases.
pub struct Pool<Chan: Channel> {
    backend: Backend,
    transport: SharedTransport<Chan>,
    config: PoolConfig,
    inner: Mutex<PoolInner<Chan>>,

    // Signalled whenever a claim is released or a connection leaves the
    // pool, either of which may let a waiting checkout proceed.
    released: Notify,

    total_checkouts: AtomicUsize,
}

impl<Chan: Channel> Pool<Chan> {
    pub fn new(backend: Backend, transport: SharedTransport<Chan>, config: PoolConfig) -> Self {
        Self {
            backend,
            transport,
            config,
            inner: Mutex::new(PoolInner {
                entries: Vec::new(),
                cursor: 0,
                attached: 0,
                next_connection_id: 0,
                terminated: false,
            }),
            released: Notify::new(),
            total_checkouts: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &backend::Name {
        &self.backend.name
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    /// The maximum number of connections this pool will hold.
    pub fn capacity(&self) -> usize {
        self.config.max_connections
    }

    /// The number of connections currently in the pool.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Takes a connection without waiting.
    ///
    /// Below capacity, this always creates a new connection, which the
    /// caller must open. At capacity, connections are handed out in
    /// round-robin order, skipping any which have reached
    /// [PoolConfig::max_claims_per_connection].
    pub fn try_checkout(&self) -> Result<Connection<Chan>, Error> {
        #[cfg(feature = "probes")]
        probes::checkout__start!(|| self.backend.name.as_str());

        let conn = {
            let mut inner = self.inner.lock().unwrap();
            if inner.terminated {
                return Err(Error::Terminated);
            }

            if inner.entries.len() < self.config.max_connections {
                let id = inner.next_connection_id;
                inner.next_connection_id += 1;
                let conn = Connection::new(id, self.backend.clone(), self.transport.clone());
                event!(Level::DEBUG, conn_id = id, endpoint = %self.backend.name, "Creating connection");
                inner.entries.push(Entry {
                    conn: conn.clone(),
                    claims: 1,
                });
                conn
            } else {
                let len = inner.entries.len();
                let limit = self.config.max_claims_per_connection;
                let start = inner.cursor;
                let chosen = (0..len)
                    .map(|offset| (start + offset) % len)
                    .find(|&index| limit.map_or(true, |limit| inner.entries[index].claims < limit));
                let Some(index) = chosen else {
                    return Err(Error::AllClaimsUsed);
                };
                inner.cursor = (index + 1) % len;
                let entry = &mut inner.entries[index];
                entry.claims += 1;
                entry.conn.clone()
            }
        };

        self.total_checkouts.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "probes")]
        probes::checkout__done!(|| (self.backend.name.as_str(), conn.id()));
        Ok(conn)
    }

    /// Takes a connection, waiting until `deadline` for a claim to free up
    /// if every connection is at its claim limit.
    ///
    /// The returned handle releases the connection when dropped.
    #[instrument(level = "trace", skip(self), fields(endpoint = %self.backend.name), err)]
    pub async fn checkout(self: &Arc<Self>, deadline: Instant) -> Result<claim::Handle<Chan>, Error> {
        loop {
            // Register interest before looking, so a release between the
            // look and the wait still wakes us.
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            match self.try_checkout() {
                Ok(conn) => return Ok(claim::Handle::new(self.clone(), conn)),
                Err(Error::AllClaimsUsed) => (),
                Err(err) => return Err(err),
            }

            if tokio::time::timeout_at(deadline, released).await.is_err() {
                return Err(Error::AllClaimsUsed);
            }
        }
    }

    /// Gives back one checkout of `conn`.
    ///
    /// The connection stays open and pooled even when nothing holds it.
    /// Releasing a connection which is no longer pooled does nothing, and
    /// the count never drops below zero.
    pub fn release(&self, conn: &Connection<Chan>) {
        {
            let mut inner = self.inner.lock().unwrap();
            let Some(index) = inner.position(conn) else {
                return;
            };
            let entry = &mut inner.entries[index];
            if entry.claims == 0 {
                event!(
                    Level::WARN,
                    conn_id = conn.id(),
                    "Released a connection with no outstanding claims"
                );
            }
            entry.claims = entry.claims.saturating_sub(1);
        }
        self.released.notify_waiters();
    }

    /// Removes `conn` from the pool, regardless of how many checkouts hold
    /// it. Returns whether it was present.
    ///
    /// The caller is responsible for closing the connection.
    pub fn remove(&self, conn: &Connection<Chan>) -> bool {
        let removed = {
            let mut inner = self.inner.lock().unwrap();
            match inner.position(conn) {
                Some(index) => {
                    inner.remove_at(index);
                    true
                }
                None => false,
            }
        };
        if removed {
            event!(Level::DEBUG, conn_id = conn.id(), endpoint = %self.backend.name, "Removed connection");
            self.released.notify_waiters();
        }
        removed
    }

    /// If `conn` is pooled, empties the pool and returns every connection
    /// it held, `conn` included, for the caller to close.
    ///
    /// One broken connection is taken as evidence that all connections to
    /// the endpoint are suspect.
    pub fn clear(&self, conn: &Connection<Chan>) -> Option<Vec<Connection<Chan>>> {
        let condemned: Vec<_> = {
            let mut inner = self.inner.lock().unwrap();
            inner.position(conn)?;
            inner.cursor = 0;
            std::mem::take(&mut inner.entries)
                .into_iter()
                .map(|entry| entry.conn)
                .collect()
        };
        event!(
            Level::WARN,
            endpoint = %self.backend.name,
            count = condemned.len(),
            "Cleared pool"
        );
        #[cfg(feature = "probes")]
        probes::pool__cleared!(|| (self.backend.name.as_str(), condemned.len() as u64));
        self.released.notify_waiters();
        Some(condemned)
    }

    /// Adds a connection made elsewhere to this pool, with no claims.
    ///
    /// Returns false, leaving the pool unchanged, if the pool is terminated
    /// or full, or already holds `conn`.
    pub fn adopt(&self, conn: &Connection<Chan>) -> bool {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.terminated
                || inner.entries.len() >= self.config.max_connections
                || inner.position(conn).is_some()
            {
                return false;
            }
            inner.entries.push(Entry {
                conn: conn.clone(),
                claims: 0,
            });
        }
        self.released.notify_waiters();
        true
    }

    /// Returns true if `conn` is currently pooled.
    pub fn contains(&self, conn: &Connection<Chan>) -> bool {
        self.inner.lock().unwrap().position(conn).is_some()
    }

    /// The number of checkouts currently holding `conn`, if it is pooled.
    pub fn claims(&self, conn: &Connection<Chan>) -> Option<usize> {
        let inner = self.inner.lock().unwrap();
        inner.position(conn).map(|index| inner.entries[index].claims)
    }

    /// Copies out the pooled connections.
    pub fn snapshot(&self) -> Vec<Connection<Chan>> {
        self.inner
            .lock()
            .unwrap()
            .entries
            .iter()
            .map(|entry| entry.conn.clone())
            .collect()
    }

    /// Records another dispatcher using this pool, returning the new count.
    pub fn attach_ref(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        inner.attached += 1;
        inner.attached
    }

    /// Records a dispatcher no longer using this pool, returning the new
    /// count.
    pub fn detach_ref(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        inner.attached = inner.attached.saturating_sub(1);
        inner.attached
    }

    /// Stops handing out connections, and returns all pooled connections
    /// for the caller to close.
    pub(crate) fn terminate(&self) -> Vec<Connection<Chan>> {
        let conns = {
            let mut inner = self.inner.lock().unwrap();
            inner.terminated = true;
            inner.cursor = 0;
            std::mem::take(&mut inner.entries)
                .into_iter()
                .map(|entry| entry.conn)
                .collect()
        };
        self.released.notify_waiters();
        conns
    }

    /// Samples the pool's state at a single point in time.
    pub fn stats(&self) -> Stats {
        let inner = self.inner.lock().unwrap();
        Stats {
            connections: inner.entries.len(),
            ready_connections: inner
                .entries
                .iter()
                .filter(|entry| entry.conn.is_ready())
                .count(),
            claims: inner.entries.iter().map(|entry| entry.claims).sum(),
            attached: inner.attached,
            total_checkouts: self.total_checkouts.load(Ordering::Relaxed),
        }
    }
}
