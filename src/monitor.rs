//! Periodically probes every pooled connection, evicting the broken ones.

use crate::backend::Channel;
use crate::connection::Probe;
use crate::policy::LivenessConfig;
use crate::registry::PoolRegistry;

use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::{Arc, Mutex};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{event, instrument, Level};

/// Counts what happened during one sweep.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub healthy: usize,
    pub inconclusive: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Probes every connection in every pool once.
///
/// Pool locks are only held while copying out connections. Probes run
/// concurrently, each bounded by `probe_timeout`, so one hung connection
/// cannot hold up the rest. A failed probe evicts the connection from
/// every pool holding it, and closes it. Timeouts are inconclusive and
/// change nothing. Nothing found here is reported to clients.
#[instrument(level = "debug", skip(registry), name = "LivenessMonitor::sweep")]
pub async fn sweep<Chan: Channel>(
    registry: &PoolRegistry<Chan>,
    probe_timeout: Duration,
) -> SweepReport {
    let conns: Vec<_> = registry
        .snapshot()
        .iter()
        .flat_map(|pool| pool.snapshot())
        .collect();

    let mut probes: FuturesUnordered<_> = conns
        .into_iter()
        .map(|conn| async move {
            let result = conn.probe(probe_timeout).await;
            (conn, result)
        })
        .collect();

    let mut report = SweepReport::default();
    while let Some((conn, result)) = probes.next().await {
        match result {
            Probe::Healthy => report.healthy += 1,
            Probe::Inconclusive => report.inconclusive += 1,
            Probe::Skipped => report.skipped += 1,
            Probe::Failed(err) => {
                report.failed += 1;
                event!(
                    Level::WARN,
                    err = ?err,
                    conn_id = conn.id(),
                    endpoint = %conn.backend().name,
                    "Probe failed; evicting connection"
                );
                registry.evict(&conn);
                conn.close_in_background();
            }
        }
    }

    event!(Level::DEBUG, report = ?report, "Sweep finished");
    report
}

/// Runs [sweep] in the background, every
/// [LivenessConfig::ping_interval].
///
/// The background task stops when the monitor is terminated or dropped.
pub struct LivenessMonitor {
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl LivenessMonitor {
    pub fn new<Chan: Channel>(registry: Arc<PoolRegistry<Chan>>, config: LivenessConfig) -> Self {
        let handle = tokio::task::spawn(async move {
            let mut ticker = interval(config.ping_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; nothing is pooled yet.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                sweep(&registry, config.probe_timeout).await;
            }
        });
        Self {
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Stops the background sweep, waiting for it to exit.
    pub async fn terminate(&self) {
        let Some(handle) = self.handle.lock().unwrap().take() else {
            return;
        };
        handle.abort();
        propagate_panics(handle.await);
    }
}

impl Drop for LivenessMonitor {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.lock().unwrap().take() {
            handle.abort();
        }
    }
}

fn propagate_panics(result: Result<(), JoinError>) {
    match result {
        Ok(()) => (),
        Err(err) if err.is_cancelled() => (),
        Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
        Err(err) => panic!("Unexpected join error from liveness sweep: {err}"),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::connection::ConnectionState;
    use crate::policy::PoolConfig;
    use crate::test_utils::{test_backend, wait_for, FakeChannel, FakeTransport};

    fn registry(transport: &Arc<FakeTransport>) -> Arc<PoolRegistry<FakeChannel>> {
        Arc::new(PoolRegistry::new(
            transport.clone(),
            PoolConfig {
                max_connections: 3,
                max_claims_per_connection: None,
            },
        ))
    }

    #[tokio::test]
    async fn sweep_evicts_only_failed_connections() {
        let transport = Arc::new(FakeTransport::new());
        let registry = registry(&transport);
        let pool = registry.attach(&test_backend(1000));

        let conns: Vec<_> = (0..3).map(|_| pool.try_checkout().unwrap()).collect();
        for conn in &conns {
            conn.open(Duration::from_secs(1)).await.unwrap();
        }
        // Channels are numbered in open order.
        transport.break_channel(1);

        let report = sweep(&registry, Duration::from_secs(1)).await;
        assert_eq!(
            report,
            SweepReport {
                healthy: 2,
                failed: 1,
                ..Default::default()
            }
        );

        let broken = conns
            .iter()
            .find(|conn| !pool.contains(conn))
            .expect("one connection should be evicted");
        assert_eq!(pool.len(), 2);
        wait_for(Duration::from_secs(1), || {
            broken.state() == ConnectionState::Closed
        })
        .await;

        // Evicted connections are not probed again.
        let report = sweep(&registry, Duration::from_secs(1)).await;
        assert_eq!(report.healthy, 2);
        assert_eq!(report.failed, 0);
    }

    #[tokio::test]
    async fn sweep_skips_unopened_connections() {
        let transport = Arc::new(FakeTransport::new());
        let registry = registry(&transport);
        let pool = registry.attach(&test_backend(1000));
        let _conn = pool.try_checkout().unwrap();

        let report = sweep(&registry, Duration::from_secs(1)).await;
        assert_eq!(report.skipped, 1);
        assert_eq!(transport.probes(), 0);
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn probe_timeouts_are_inconclusive() {
        let transport = Arc::new(FakeTransport::new());
        let registry = registry(&transport);
        let pool = registry.attach(&test_backend(1000));
        let conn = pool.try_checkout().unwrap();
        conn.open(Duration::from_secs(1)).await.unwrap();

        transport.stall_probes(true);
        let report = sweep(&registry, Duration::from_millis(100)).await;
        assert_eq!(report.inconclusive, 1);
        assert!(pool.contains(&conn));
        assert!(conn.is_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn hung_endpoint_does_not_block_others() {
        let transport = Arc::new(FakeTransport::new());
        let stalled = Arc::new(FakeTransport::new());
        stalled.stall_probes(true);

        let healthy_registry = registry(&transport);
        let pool = healthy_registry.attach(&test_backend(1000));
        let conn = pool.try_checkout().unwrap();
        conn.open(Duration::from_secs(1)).await.unwrap();

        let stalled_registry = registry(&stalled);
        let stalled_pool = stalled_registry.attach(&test_backend(2000));
        let stalled_conn = stalled_pool.try_checkout().unwrap();
        stalled_conn.open(Duration::from_secs(1)).await.unwrap();

        let start = tokio::time::Instant::now();
        let (healthy, hung) = tokio::join!(
            sweep(&healthy_registry, Duration::from_secs(10)),
            sweep(&stalled_registry, Duration::from_secs(10)),
        );
        assert_eq!(healthy.healthy, 1);
        assert_eq!(hung.inconclusive, 1);
        assert!(start.elapsed() <= Duration::from_secs(11));
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_sweeps_on_interval() {
        let transport = Arc::new(FakeTransport::new());
        let registry = registry(&transport);
        let pool = registry.attach(&test_backend(1000));
        let conn = pool.try_checkout().unwrap();
        conn.open(Duration::from_secs(1)).await.unwrap();

        let monitor = LivenessMonitor::new(
            registry.clone(),
            LivenessConfig {
                ping_interval: Duration::from_secs(25),
                probe_timeout: Duration::from_secs(5),
            },
        );

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(transport.probes(), 0);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(transport.probes(), 1);

        transport.break_channel(0);
        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(transport.probes(), 2);
        assert!(pool.is_empty());

        monitor.terminate().await;
        monitor.terminate().await;
    }
}
