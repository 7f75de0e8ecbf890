//! Tracks one connection pool per endpoint, shared by all dispatchers.

use crate::backend::{self, Backend, Channel, SharedTransport};
use crate::connection::Connection;
use crate::policy::PoolConfig;
use crate::pool::{self, Pool};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{event, instrument, Level};

/// The set of live connection pools, keyed by endpoint name.
///
/// A pool is created when the first dispatcher attaches to its endpoint and
/// torn down when the last one detaches. Registries are plain values owned
/// by a [crate::broker::Broker], so independent brokers never share pools.
pub struct PoolRegistry<Chan: Channel> {
    transport: SharedTransport<Chan>,
    config: PoolConfig,
    pools: Mutex<HashMap<backend::Name, Arc<Pool<Chan>>>>,
}

impl<Chan: Channel> PoolRegistry<Chan> {
    pub fn new(transport: SharedTransport<Chan>, config: PoolConfig) -> Self {
        Self {
            transport,
            config,
            pools: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the pool for `backend`, creating it if necessary, and counts
    /// the caller as attached to it.
    #[instrument(level = "debug", skip(self), name = "PoolRegistry::attach")]
    pub fn attach(&self, backend: &Backend) -> Arc<Pool<Chan>> {
        let mut pools = self.pools.lock().unwrap();
        let pool = pools
            .entry(backend.name.clone())
            .or_insert_with(|| {
                event!(Level::INFO, endpoint = %backend.name, "Creating pool");
                Arc::new(Pool::new(
                    backend.clone(),
                    self.transport.clone(),
                    self.config.clone(),
                ))
            })
            .clone();
        pool.attach_ref();
        pool
    }

    /// Counts the caller as no longer attached to `pool`. When nobody is
    /// left, the pool is removed and all of its connections are closed.
    ///
    /// Attach and detach serialize on the registry lock, so a pool which
    /// reached zero is never handed out again.
    #[instrument(level = "debug", skip(self, pool), fields(endpoint = %pool.name()), name = "PoolRegistry::detach")]
    pub async fn detach(&self, pool: &Arc<Pool<Chan>>) {
        let condemned = {
            let mut pools = self.pools.lock().unwrap();
            if pool.detach_ref() > 0 {
                return;
            }
            let registered = pools
                .get(pool.name())
                .is_some_and(|current| Arc::ptr_eq(current, pool));
            if registered {
                pools.remove(pool.name());
            }
            pool.terminate()
        };
        event!(
            Level::INFO,
            endpoint = %pool.name(),
            connections = condemned.len(),
            "Last dispatcher detached; tearing down pool"
        );
        close_all(condemned).await;
    }

    pub fn get(&self, name: &backend::Name) -> Option<Arc<Pool<Chan>>> {
        self.pools.lock().unwrap().get(name).cloned()
    }

    /// Copies out every registered pool.
    pub fn snapshot(&self) -> Vec<Arc<Pool<Chan>>> {
        self.pools.lock().unwrap().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.pools.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes `conn` from every pool which holds it, returning how many
    /// did. The caller is responsible for closing it.
    pub fn evict(&self, conn: &Connection<Chan>) -> usize {
        self.snapshot()
            .iter()
            .filter(|pool| pool.remove(conn))
            .count()
    }

    /// Samples the stats of every registered pool.
    pub fn stats(&self) -> HashMap<backend::Name, pool::Stats> {
        self.snapshot()
            .into_iter()
            .map(|pool| (pool.name().clone(), pool.stats()))
            .collect()
    }

    /// Tears down every pool, regardless of who is attached.
    pub async fn terminate(&self) {
        let condemned: Vec<_> = {
            let mut pools = self.pools.lock().unwrap();
            pools
                .drain()
                .flat_map(|(_, pool)| pool.terminate())
                .collect()
        };
        close_all(condemned).await;
    }
}

async fn close_all<Chan: Channel>(conns: Vec<Connection<Chan>>) {
    futures::future::join_all(conns.iter().map(|conn| conn.close())).await;
}
