//! Creates and retires the dispatchers for a job's targets.

use crate::backend::Channel;
use crate::dispatcher::Dispatcher;
use crate::oracle::SharedOracle;
use crate::policy::Policy;
use crate::registry::PoolRegistry;
use crate::strategy::Strategy;
use crate::target::{self, Target};

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};
use tracing::{event, instrument, Level};

/// The dispatchers of one broker, at most one per target.
pub struct DispatcherSet<Chan: Channel> {
    registry: Arc<PoolRegistry<Chan>>,
    strategy: Strategy,
    oracle: Option<SharedOracle>,
    policy: Policy,
    dispatchers: RwLock<BTreeMap<target::Name, Arc<Dispatcher<Chan>>>>,
}

impl<Chan: Channel> DispatcherSet<Chan> {
    pub fn new(
        registry: Arc<PoolRegistry<Chan>>,
        strategy: Strategy,
        oracle: Option<SharedOracle>,
        policy: Policy,
    ) -> Self {
        Self {
            registry,
            strategy,
            oracle,
            policy,
            dispatchers: RwLock::new(BTreeMap::new()),
        }
    }

    /// Returns the dispatcher for `target`, creating it if necessary.
    ///
    /// Concurrent callers asking for the same target all receive the same
    /// dispatcher, and only one is ever constructed. A target already known
    /// by name keeps its existing dispatcher.
    pub fn get_or_create(&self, target: &Target) -> Arc<Dispatcher<Chan>> {
        if let Some(dispatcher) = self.get(&target.name) {
            return dispatcher;
        }

        let mut dispatchers = self.dispatchers.write().unwrap();
        // Someone may have created it while we waited for the lock.
        dispatchers
            .entry(target.name.clone())
            .or_insert_with(|| {
                Arc::new(Dispatcher::new(
                    target.clone(),
                    self.registry.clone(),
                    self.strategy.clone(),
                    self.oracle.clone(),
                    self.policy.clone(),
                ))
            })
            .clone()
    }

    pub fn get(&self, name: &target::Name) -> Option<Arc<Dispatcher<Chan>>> {
        self.dispatchers.read().unwrap().get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.dispatchers.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The names of all current targets, in order.
    pub fn names(&self) -> Vec<target::Name> {
        self.dispatchers.read().unwrap().keys().cloned().collect()
    }

    /// Disposes of every dispatcher whose target is not in `active`, and
    /// returns their names. Dispatchers for active targets are kept.
    #[instrument(skip(self, active), name = "DispatcherSet::retire_unused")]
    pub async fn retire_unused(&self, active: &[target::Name]) -> Vec<target::Name> {
        let active: BTreeSet<_> = active.iter().collect();
        let retired: Vec<_> = {
            let mut dispatchers = self.dispatchers.write().unwrap();
            let names: Vec<_> = dispatchers
                .keys()
                .filter(|name| !active.contains(name))
                .cloned()
                .collect();
            names
                .into_iter()
                .filter_map(|name| dispatchers.remove(&name).map(|d| (name, d)))
                .collect()
        };

        for (name, dispatcher) in &retired {
            event!(Level::INFO, target_name = %name, "Retiring dispatcher");
            dispatcher.dispose().await;
        }
        retired.into_iter().map(|(name, _)| name).collect()
    }

    /// Disposes of every dispatcher.
    pub async fn terminate(&self) {
        let all: Vec<_> = std::mem::take(&mut *self.dispatchers.write().unwrap())
            .into_values()
            .collect();
        futures::future::join_all(all.iter().map(|dispatcher| dispatcher.dispose())).await;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dispatcher::State;
    use crate::test_utils::{test_backend, FakeChannel, FakeTransport};

    fn set(transport: &Arc<FakeTransport>) -> DispatcherSet<FakeChannel> {
        let policy = Policy::default();
        let registry = Arc::new(PoolRegistry::new(transport.clone(), policy.pool.clone()));
        DispatcherSet::new(registry, Strategy::direct(), None, policy)
    }

    fn target(name: &str, port: u16) -> Target {
        Target::direct(name, test_backend(port))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_share_one_dispatcher() {
        let transport = Arc::new(FakeTransport::new());
        let set = Arc::new(set(&transport));
        let target = target("node-1", 1000);

        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let set = set.clone();
                let target = target.clone();
                tokio::task::spawn(async move { set.get_or_create(&target) })
            })
            .collect();
        let mut dispatchers = vec![];
        for task in tasks {
            dispatchers.push(task.await.unwrap());
        }

        assert!(dispatchers.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(set.len(), 1);
        // Only one dispatcher was ever attached to the pool.
        assert_eq!(dispatchers[0].pool().stats().attached, 1);
    }

    #[tokio::test]
    async fn retire_unused_keeps_the_intersection() {
        let transport = Arc::new(FakeTransport::new());
        let set = set(&transport);
        let a = set.get_or_create(&target("a", 1000));
        let b = set.get_or_create(&target("b", 2000));
        let c = set.get_or_create(&target("c", 3000));

        let retired = set
            .retire_unused(&["a".into(), "d".into()])
            .await;
        assert_eq!(retired, vec![target::Name::from("b"), target::Name::from("c")]);
        assert_eq!(set.names(), vec![target::Name::from("a")]);

        assert_eq!(a.state(), State::Idle);
        assert_eq!(b.state(), State::Disposed);
        assert_eq!(c.state(), State::Disposed);
        assert!(set.get(&"a".into()).is_some());

        // Retiring nothing is a no-op.
        assert!(set.retire_unused(&["a".into()]).await.is_empty());
    }

    #[tokio::test]
    async fn targets_sharing_an_endpoint_share_a_pool() {
        let transport = Arc::new(FakeTransport::new());
        let set = set(&transport);
        let relay = test_backend(443);
        let a = set.get_or_create(&Target::relayed(
            "a",
            relay.clone(),
            "10.0.0.1:9000".parse().unwrap(),
        ));
        let b = set.get_or_create(&Target::relayed(
            "b",
            relay,
            "10.0.0.2:9000".parse().unwrap(),
        ));
        assert!(Arc::ptr_eq(a.pool(), b.pool()));
        assert_eq!(a.pool().stats().attached, 2);

        set.retire_unused(&["b".into()]).await;
        assert_eq!(b.pool().stats().attached, 1);

        set.terminate().await;
        assert!(set.is_empty());
        assert_eq!(b.state(), State::Disposed);
    }
}
