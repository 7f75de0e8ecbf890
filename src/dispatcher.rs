//! Routes one target's requests through its endpoint's connection pool.

use crate::backend::{self, Channel};
use crate::claim;
use crate::connection;
use crate::message::{Fault, Message};
use crate::oracle::SharedOracle;
use crate::policy::Policy;
use crate::pool::{self, Pool};
#[cfg(feature = "probes")]
use crate::probes;
use crate::registry::PoolRegistry;
use crate::strategy::{Strategy, Verdict};
use crate::target::Target;

use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{event, instrument, Level};

/// A failure which a retry on another connection may get past.
#[derive(Error, Debug)]
pub enum Failure {
    #[error("Transport fault")]
    Transport(#[source] backend::Error),

    #[error("Failed to connect")]
    Connect(#[source] connection::Error),
}

impl Failure {
    /// The error reported by the transport, if there was one.
    pub fn backend_error(&self) -> Option<&backend::Error> {
        match self {
            Failure::Transport(err) => Some(err),
            Failure::Connect(connection::Error::Open(err)) => Some(err.as_ref()),
            Failure::Connect(_) => None,
        }
    }
}

/// The faults a client may see from a dispatch.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Backend raised {0}")]
    Application(Fault),

    #[error("Deadline expired before a response arrived")]
    Timeout,

    #[error("Every connection to the endpoint was at its claim limit")]
    Saturated,

    #[error("Gave up after {attempts} attempts")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Failure,
    },

    #[error("Task was preempted with error code {code}")]
    Preempted { code: i32 },

    #[error("Dispatcher disposed")]
    Disposed,
}

impl Error {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Error::Application(_) => "Application",
            Error::Timeout => "Timeout",
            Error::Saturated => "Saturated",
            Error::RetriesExhausted { .. } => "RetriesExhausted",
            Error::Preempted { .. } => "Preempted",
            Error::Disposed => "Disposed",
        }
    }
}

/// The lifecycle of a dispatcher, as seen through [Dispatcher::monitor].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum State {
    /// At least one request is in flight.
    Active,

    /// Nothing is in flight; the dispatcher may be retired.
    Idle,

    /// The dispatcher has detached from its pool, and accepts no requests.
    Disposed,
}

// How a single attempt ended, if it did not produce a response.
enum Step {
    Fatal(Error),
    Retry(Failure),
}

struct Outstanding {
    requests: usize,
    disposed: bool,
}

/// Sends requests for one [Target], retrying transport faults on fresh
/// connections.
pub struct Dispatcher<Chan: Channel> {
    target: Target,
    pool: Arc<Pool<Chan>>,
    registry: Arc<PoolRegistry<Chan>>,
    strategy: Strategy,
    oracle: Option<SharedOracle>,
    policy: Policy,
    outstanding: Mutex<Outstanding>,
    state_tx: watch::Sender<State>,
}

// Marks a request in flight until dropped.
struct InFlight<'a, Chan: Channel> {
    dispatcher: &'a Dispatcher<Chan>,
}

impl<Chan: Channel> Drop for InFlight<'_, Chan> {
    fn drop(&mut self) {
        let mut outstanding = self.dispatcher.outstanding.lock().unwrap();
        outstanding.requests -= 1;
        if outstanding.requests == 0 && !outstanding.disposed {
            self.dispatcher.state_tx.send_replace(State::Idle);
        }
    }
}

impl<Chan: Channel> Dispatcher<Chan> {
    /// Creates a dispatcher for `target`, attaching it to the pool for the
    /// target's endpoint.
    pub fn new(
        target: Target,
        registry: Arc<PoolRegistry<Chan>>,
        strategy: Strategy,
        oracle: Option<SharedOracle>,
        policy: Policy,
    ) -> Self {
        let pool = registry.attach(&target.endpoint);
        let (state_tx, _) = watch::channel(State::Idle);
        event!(
            Level::INFO,
            target_name = %target.name,
            endpoint = %target.endpoint.name,
            "Created dispatcher"
        );
        Self {
            target,
            pool,
            registry,
            strategy,
            oracle,
            policy,
            outstanding: Mutex::new(Outstanding {
                requests: 0,
                disposed: false,
            }),
            state_tx,
        }
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    /// The pool this dispatcher draws connections from.
    pub fn pool(&self) -> &Arc<Pool<Chan>> {
        &self.pool
    }

    pub fn state(&self) -> State {
        *self.state_tx.borrow()
    }

    /// Returns a receiver which observes every state change.
    pub fn monitor(&self) -> watch::Receiver<State> {
        self.state_tx.subscribe()
    }

    /// The number of requests currently in flight.
    pub fn outstanding(&self) -> usize {
        self.outstanding.lock().unwrap().requests
    }

    fn begin(&self) -> Result<InFlight<'_, Chan>, Error> {
        let mut outstanding = self.outstanding.lock().unwrap();
        if outstanding.disposed {
            return Err(Error::Disposed);
        }
        outstanding.requests += 1;
        if outstanding.requests == 1 {
            self.state_tx.send_replace(State::Active);
        }
        Ok(InFlight { dispatcher: self })
    }

    /// Sends `request` to the target, and returns its response.
    ///
    /// The response always carries the request's correlation id.
    /// `deadline` bounds the whole call, retries and backoff included;
    /// without one, [Policy::operation_timeout] applies.
    #[instrument(
        level = "debug",
        skip(self, request),
        fields(target_name = %self.target.name, correlation_id = %request.correlation_id),
        err,
        name = "Dispatcher::dispatch"
    )]
    pub async fn dispatch(
        &self,
        request: Message,
        deadline: Option<Instant>,
    ) -> Result<Message, Error> {
        #[cfg(feature = "probes")]
        let correlation_id = request.correlation_id.to_string();
        #[cfg(feature = "probes")]
        probes::dispatch__start!(|| (self.target.name.as_str(), correlation_id.as_str()));

        let mut attempts = 0;
        let result = match self.begin() {
            Ok(_in_flight) => {
                let deadline =
                    deadline.unwrap_or_else(|| Instant::now() + self.policy.operation_timeout);
                self.dispatch_with_retries(request, deadline, &mut attempts)
                    .await
            }
            Err(err) => Err(err),
        };

        #[cfg(feature = "probes")]
        match &result {
            Ok(_) => probes::dispatch__done!(|| (
                self.target.name.as_str(),
                correlation_id.as_str(),
                u64::from(attempts)
            )),
            Err(err) => probes::dispatch__failed!(|| (
                self.target.name.as_str(),
                correlation_id.as_str(),
                err.as_str()
            )),
        }
        event!(Level::TRACE, attempts, ok = result.is_ok(), "Dispatch finished");
        result
    }

    async fn dispatch_with_retries(
        &self,
        request: Message,
        deadline: Instant,
        attempts: &mut u32,
    ) -> Result<Message, Error> {
        loop {
            *attempts += 1;
            let failure = match self.attempt(&request, deadline).await {
                Ok(response) => return Ok(response),
                Err(Step::Fatal(err)) => return Err(err),
                Err(Step::Retry(failure)) => failure,
            };

            if let Some(code) = self.preemption_code(&failure, deadline).await {
                return Err(Error::Preempted { code });
            }

            if *attempts >= self.policy.retry.max_attempts {
                event!(
                    Level::WARN,
                    attempts = *attempts,
                    err = ?failure,
                    "Retries exhausted"
                );
                return Err(Error::RetriesExhausted {
                    attempts: *attempts,
                    last: failure,
                });
            }

            let delay = self.policy.retry.backoff.delay(*attempts);
            if Instant::now() + delay >= deadline {
                return Err(Error::Timeout);
            }
            event!(
                Level::DEBUG,
                attempt = *attempts,
                delay = ?delay,
                err = ?failure,
                "Retrying after failure"
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn attempt(&self, request: &Message, deadline: Instant) -> Result<Message, Step> {
        let conn = match self.pool.checkout(deadline).await {
            Ok(conn) => conn,
            Err(pool::Error::AllClaimsUsed) => return Err(Step::Fatal(Error::Saturated)),
            Err(pool::Error::Terminated) => return Err(Step::Fatal(Error::Disposed)),
        };

        let remaining = deadline.saturating_duration_since(Instant::now());
        match conn.open(remaining.min(self.policy.open_timeout)).await {
            Ok(()) => (),
            Err(connection::Error::OpenTimeout) if Instant::now() >= deadline => {
                return Err(Step::Fatal(Error::Timeout));
            }
            // A handshake which hangs past `open_timeout` says the endpoint is
            // down, the same as one which fails outright.
            Err(err @ (connection::Error::Open(_) | connection::Error::OpenTimeout)) => {
                self.cleanup_client(&conn);
                return Err(Step::Retry(Failure::Connect(err)));
            }
            Err(err @ connection::Error::Closed) => {
                return Err(Step::Retry(Failure::Connect(err)));
            }
        }

        let prepared = self.strategy.sender.prepare(request.clone(), &self.target);
        let remaining = deadline.saturating_duration_since(Instant::now());
        let outcome = conn.send(prepared, remaining).await;

        match self.strategy.receiver.classify(outcome) {
            Verdict::Respond(mut response) => {
                response.correlation_id = request.correlation_id;
                Ok(response)
            }
            Verdict::Forward(fault) => Err(Step::Fatal(Error::Application(fault))),
            Verdict::TimedOut => Err(Step::Fatal(Error::Timeout)),
            Verdict::Reconnect(err) => {
                self.cleanup_client(&conn);
                Err(Step::Retry(Failure::Transport(err)))
            }
        }
    }

    // Treats one broken connection as evidence that every connection to the
    // endpoint is broken: empties the pool and closes all of them.
    fn cleanup_client(&self, conn: &claim::Handle<Chan>) {
        match conn.pool().clear(conn) {
            Some(condemned) => {
                for conn in condemned {
                    conn.close_in_background();
                }
            }
            // Someone else already cleared the pool.
            None => conn.close_in_background(),
        }
    }

    // Asks the oracle whether the failure is the task having been
    // cancelled, rather than a network problem.
    async fn preemption_code(&self, failure: &Failure, deadline: Instant) -> Option<i32> {
        if !self.policy.message_level_preemption {
            return None;
        }
        let oracle = self.oracle.as_ref()?;
        let task_id = self.target.task_id?;
        let err = failure.backend_error()?;
        if !oracle.should_check_error_code(err) {
            return None;
        }
        let code = tokio::time::timeout_at(deadline, oracle.task_error_code(task_id))
            .await
            .ok()
            .flatten()?;
        event!(
            Level::WARN,
            task_id = %task_id,
            code,
            "Failure correlates with task preemption"
        );
        Some(code)
    }

    /// Stops accepting requests and detaches from the pool.
    ///
    /// If this was the last dispatcher attached, the pool is torn down and
    /// its connections closed. Requests already in flight run to
    /// completion or fail as the pool goes away.
    #[instrument(skip(self), fields(target_name = %self.target.name), name = "Dispatcher::dispose")]
    pub async fn dispose(&self) {
        {
            let mut outstanding = self.outstanding.lock().unwrap();
            if outstanding.disposed {
                return;
            }
            outstanding.disposed = true;
        }
        self.state_tx.send_replace(State::Disposed);
        self.registry.detach(&self.pool).await;
    }
}

impl<Chan: Channel> Drop for Dispatcher<Chan> {
    fn drop(&mut self) {
        let disposed = std::mem::replace(&mut self.outstanding.lock().unwrap().disposed, true);
        if disposed {
            return;
        }
        // Dropped without being disposed; detach from wherever we can.
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let registry = self.registry.clone();
            let pool = self.pool.clone();
            runtime.spawn(async move { registry.detach(&pool).await });
        }
    }
}
