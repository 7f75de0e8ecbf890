//! The top-level scope which owns a job's pools and dispatchers.

use crate::backend::{self, Channel, SharedTransport};
use crate::dispatcher::{self, Dispatcher};
use crate::factory::DispatcherSet;
use crate::message::Message;
use crate::monitor::{self, LivenessMonitor, SweepReport};
use crate::oracle::SharedOracle;
use crate::policy::{self, Policy};
use crate::pool;
use crate::registry::PoolRegistry;
use crate::strategy::Strategy;
use crate::target::{self, Target};

use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{event, instrument, Level};

#[derive(Error, Debug)]
pub enum Error {
    #[error("No dispatcher for target {0}")]
    UnknownTarget(target::Name),

    #[error("Invalid policy")]
    InvalidPolicy(#[from] policy::Error),

    #[error(transparent)]
    Dispatch(#[from] dispatcher::Error),
}

/// Fans requests out to a job's targets.
///
/// Each broker owns its registries outright. Two brokers never share pools
/// or dispatchers, even when they point at the same endpoints.
pub struct Broker<Chan: Channel> {
    policy: Policy,
    registry: Arc<PoolRegistry<Chan>>,
    dispatchers: DispatcherSet<Chan>,
    monitor: LivenessMonitor,
}

impl<Chan: Channel> Broker<Chan> {
    /// Creates a new broker, and starts its liveness monitor.
    ///
    /// Must be called from within a tokio runtime.
    #[instrument(skip(transport, strategy, oracle), name = "Broker::new")]
    pub fn new(
        transport: SharedTransport<Chan>,
        strategy: Strategy,
        oracle: Option<SharedOracle>,
        policy: Policy,
    ) -> Result<Self, Error> {
        policy.validate()?;

        #[cfg(feature = "probes")]
        if let Err(err) = usdt::register_probes() {
            event!(Level::WARN, err = ?err, "Failed to register USDT probes");
        }

        let registry = Arc::new(PoolRegistry::new(transport, policy.pool.clone()));
        let dispatchers =
            DispatcherSet::new(registry.clone(), strategy, oracle, policy.clone());
        let monitor = LivenessMonitor::new(registry.clone(), policy.liveness.clone());
        Ok(Self {
            policy,
            registry,
            dispatchers,
            monitor,
        })
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn registry(&self) -> &Arc<PoolRegistry<Chan>> {
        &self.registry
    }

    pub fn dispatcher(&self, name: &target::Name) -> Option<Arc<Dispatcher<Chan>>> {
        self.dispatchers.get(name)
    }

    /// The names of the targets currently served.
    pub fn targets(&self) -> Vec<target::Name> {
        self.dispatchers.names()
    }

    /// Starts serving `target`, if it is not served already.
    pub fn add_target(&self, target: &Target) -> Arc<Dispatcher<Chan>> {
        self.dispatchers.get_or_create(target)
    }

    /// Makes `targets` the complete set of targets served.
    ///
    /// New targets get dispatchers, and dispatchers for targets which are
    /// no longer listed are disposed. Returns the retired names.
    #[instrument(skip(self, targets), fields(count = targets.len()), name = "Broker::set_targets")]
    pub async fn set_targets(&self, targets: &[Target]) -> Vec<target::Name> {
        for target in targets {
            self.dispatchers.get_or_create(target);
        }
        let active: Vec<_> = targets.iter().map(|target| target.name.clone()).collect();
        let retired = self.dispatchers.retire_unused(&active).await;
        event!(
            Level::INFO,
            targets = active.len(),
            retired = retired.len(),
            "Updated targets"
        );
        retired
    }

    /// Sends `request` to the named target.
    pub async fn dispatch(
        &self,
        request: Message,
        target: &target::Name,
        deadline: Option<Instant>,
    ) -> Result<Message, Error> {
        let dispatcher = self
            .dispatchers
            .get(target)
            .ok_or_else(|| Error::UnknownTarget(target.clone()))?;
        Ok(dispatcher.dispatch(request, deadline).await?)
    }

    /// Probes every pooled connection now, without waiting for the
    /// monitor's next sweep.
    pub async fn sweep_now(&self) -> SweepReport {
        monitor::sweep(&self.registry, self.policy.liveness.probe_timeout).await
    }

    /// Samples the stats of every pool.
    pub fn stats(&self) -> HashMap<backend::Name, pool::Stats> {
        self.registry.stats()
    }

    /// Stops the liveness monitor, disposes every dispatcher, and closes
    /// every connection.
    pub async fn terminate(&self) {
        self.monitor.terminate().await;
        self.dispatchers.terminate().await;
        self.registry.terminate().await;
    }
}
