//! Configuration options which can alter the behavior of dispatchers and pools.

use thiserror::Error;
use tokio::time::Duration;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("A pool must allow at least one connection")]
    NoConnectionsAllowed,

    #[error("A connection must allow at least one claim")]
    NoClaimsAllowed,

    #[error("At least one dispatch attempt is required")]
    NoAttemptsAllowed,

    #[error("The ping interval must be non-zero")]
    ZeroPingInterval,
}

/// Policy which is applicable to a broker and everything it owns.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct Policy {
    /// Configuration for each per-endpoint connection pool.
    pub pool: PoolConfig,

    /// Configuration for the background liveness sweep.
    pub liveness: LivenessConfig,

    /// How failed dispatches are retried.
    pub retry: RetryPolicy,

    /// Bounds a dispatch when the caller does not supply a deadline.
    pub operation_timeout: Duration,

    /// How long a single caller waits for a channel to open.
    ///
    /// The open itself keeps running for other waiters.
    pub open_timeout: Duration,

    /// If true, transport faults that may stem from task preemption are
    /// checked against the task's error code before being retried.
    pub message_level_preemption: bool,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            liveness: LivenessConfig::default(),
            retry: RetryPolicy::default(),
            operation_timeout: Duration::from_secs(60),
            open_timeout: Duration::from_secs(30),
            message_level_preemption: false,
        }
    }
}

impl Policy {
    /// Rejects configurations which could never dispatch a request.
    pub fn validate(&self) -> Result<(), Error> {
        if self.pool.max_connections == 0 {
            return Err(Error::NoConnectionsAllowed);
        }
        if self.pool.max_claims_per_connection == Some(0) {
            return Err(Error::NoClaimsAllowed);
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::NoAttemptsAllowed);
        }
        if self.liveness.ping_interval.is_zero() {
            return Err(Error::ZeroPingInterval);
        }
        Ok(())
    }
}

/// Configuration for the connections to a single endpoint.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct PoolConfig {
    /// The maximum number of connections which can be opened to the endpoint.
    pub max_connections: usize,

    /// The maximum number of requests which may share one connection.
    ///
    /// `None` lets every checkout share a connection once the pool is full.
    pub max_claims_per_connection: Option<usize>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 8,
            max_claims_per_connection: None,
        }
    }
}

/// Configuration for the liveness sweep over pooled connections.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct LivenessConfig {
    /// Time between sweeps. Keep this under the idle timeout of any load
    /// balancer between the broker and its backends.
    pub ping_interval: Duration,

    /// How long a probe may take before its result is treated as
    /// inconclusive.
    pub probe_timeout: Duration,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(25),
            probe_timeout: Duration::from_secs(5),
        }
    }
}

/// How transport failures are retried.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct RetryPolicy {
    /// The total number of attempts made for one request, including the
    /// first one.
    pub max_attempts: u32,

    /// The wait inserted between consecutive attempts.
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::default(),
        }
    }
}

/// The shape of the wait between attempts.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Backoff {
    /// Waits `initial`, then doubles after every attempt, up to `max`.
    Exponential {
        initial: Duration,
        max: Duration,
        spread: Duration,
    },

    /// Waits `step` times the number of failed attempts, up to `max`.
    Linear {
        step: Duration,
        max: Duration,
        spread: Duration,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Exponential {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(5),
            spread: Duration::from_millis(50),
        }
    }
}
