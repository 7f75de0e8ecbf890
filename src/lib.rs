//! soa-dispatch fans batches of RPC-style requests out to backend hosts.
//!
//! It uses the following terminology:
//! * Targets are the backend hosts (or relays) a job may dispatch to.
//!   Each target is served by exactly one [dispatcher::Dispatcher].
//! * Endpoints are the network addresses connections are opened against.
//!   Several targets may share an endpoint, for example when a relaying
//!   proxy fronts many hosts; they then share one [pool::Pool].
//!
//! # Usage
//!
//! * The main interface for this crate is [broker::Broker].
//! * To construct a broker, you must supply a [backend::Transport], which
//!   describes how to open, use, probe and close a channel to an endpoint,
//!   and a [strategy::Strategy] describing how requests are stamped and
//!   replies interpreted for the backend flavour in use.
//! * The broker owns a [registry::PoolRegistry] of per-endpoint pools, a
//!   [factory::DispatcherSet] of per-target dispatchers, and a
//!   [monitor::LivenessMonitor] which periodically probes pooled
//!   connections and evicts the broken ones.
//!
//! # Failure handling
//!
//! Every reply from a transport is an explicit [backend::Outcome]. The
//! dispatcher forwards application faults untouched, surfaces timeouts
//! without condemning the connection, and answers transport faults by
//! clearing the whole pool for that endpoint and retrying on a fresh
//! connection, within the configured [policy::RetryPolicy].
//!
//! # DTrace probes
//!
//! With the default `"probes"` feature, the crate fires USDT probes as it
//! checks out connections, opens channels, dispatches requests and probes
//! liveness:
//!
//! - `checkout-start`, `checkout-done`: around taking a connection from a pool.
//! - `open-start`, `open-done`, `open-failed`: around opening a channel.
//! - `dispatch-start`, `dispatch-done`, `dispatch-failed`: around one
//!   client request, including all of its retries.
//! - `probe-start`, `probe-done`, `probe-failed`: around a liveness probe.
//! - `pool-cleared`: when a transport fault condemns a whole pool.
//!
//! [broker::Broker::new] registers the probes. If registration fails the
//! failure is logged, and the broker runs without them.

// Public API
pub mod backend;
pub mod broker;
pub mod claim;
pub mod connection;
pub mod dispatcher;
pub mod factory;
pub mod message;
pub mod monitor;
pub mod oracle;
pub mod policy;
pub mod pool;
pub mod registry;
pub mod strategy;
pub mod target;

// Necessary for implementation
mod backoff;
#[cfg(test)]
mod test_utils;

// Default implementations of generic interfaces
pub mod transports;

/// USDT probes for tracing how requests move through dispatchers and pools.
#[cfg(feature = "probes")]
#[usdt::provider(provider = "soa_dispatch")]
mod probes {
    /// Fires right before taking a connection out of a pool.
    fn checkout__start(endpoint: &str) {}

    /// Fires once a connection has been handed out, with its identifier.
    fn checkout__done(endpoint: &str, conn_id: u64) {}

    /// Fires right before opening a channel to an endpoint.
    fn open__start(endpoint: &str, conn_id: u64) {}

    /// Fires after a channel opened successfully.
    fn open__done(endpoint: &str, conn_id: u64) {}

    /// Fires after a channel failed to open, with the reason.
    fn open__failed(endpoint: &str, conn_id: u64, reason: &str) {}

    /// Fires when a dispatcher accepts a client request.
    fn dispatch__start(target: &str, correlation_id: &str) {}

    /// Fires when a dispatcher returns a response, with the attempt count.
    fn dispatch__done(target: &str, correlation_id: &str, attempts: u64) {}

    /// Fires when a dispatcher returns a fault, with the fault kind.
    fn dispatch__failed(target: &str, correlation_id: &str, reason: &str) {}

    /// Fires right before a liveness probe is sent on a connection.
    fn probe__start(endpoint: &str, conn_id: u64) {}

    /// Fires after a liveness probe came back healthy.
    fn probe__done(endpoint: &str, conn_id: u64) {}

    /// Fires after a liveness probe failed, with the reason.
    fn probe__failed(endpoint: &str, conn_id: u64, reason: &str) {}

    /// Fires when a transport fault causes an entire pool to be discarded.
    fn pool__cleared(endpoint: &str, connections: u64) {}
}
