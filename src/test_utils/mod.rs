//! Utilities to help with testing dispatchers and pools

use crate::backend::{self, Backend, Outcome, Transport};
use crate::message::{Fault, Message};
use crate::oracle::ErrorCodeOracle;
use crate::target::TaskId;

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::time::Duration;

/// Header through which a request asks the fake backend to take some time.
pub const PROCESSING_MS_HEADER: &str = "x-processing-ms";

pub fn test_backend(port: u16) -> Backend {
    Backend::new(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port))
}

/// A channel handed out by [FakeTransport], numbered in open order from 0.
#[derive(Debug)]
pub struct FakeChannel {
    pub id: usize,
}

/// How [FakeTransport] answers requests.
#[derive(Clone, Debug)]
pub enum SendMode {
    /// Reply with the request payload.
    Echo,
    /// Fail every send as if the channel broke.
    Break,
    /// Answer every send with this application fault.
    Fault(Fault),
    /// Never answer.
    Stall,
}

/// A test-only transport with scripted failures, which counts every
/// operation made through it.
pub struct FakeTransport {
    next_channel: AtomicUsize,
    opens: AtomicUsize,
    sends: AtomicUsize,
    probes: AtomicUsize,
    closes: Mutex<BTreeMap<usize, usize>>,

    open_delay_ms: AtomicU64,
    fail_opens: AtomicBool,
    fail_closes: AtomicBool,
    stall_probes: AtomicBool,
    send_mode: Mutex<SendMode>,
    broken_channels: Mutex<BTreeSet<usize>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self {
            next_channel: AtomicUsize::new(0),
            opens: AtomicUsize::new(0),
            sends: AtomicUsize::new(0),
            probes: AtomicUsize::new(0),
            closes: Mutex::new(BTreeMap::new()),
            open_delay_ms: AtomicU64::new(0),
            fail_opens: AtomicBool::new(false),
            fail_closes: AtomicBool::new(false),
            stall_probes: AtomicBool::new(false),
            send_mode: Mutex::new(SendMode::Echo),
            broken_channels: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn set_open_delay(&self, delay: Duration) {
        self.open_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn fail_opens(&self, fail: bool) {
        self.fail_opens.store(fail, Ordering::SeqCst);
    }

    pub fn fail_closes(&self, fail: bool) {
        self.fail_closes.store(fail, Ordering::SeqCst);
    }

    pub fn stall_probes(&self, stall: bool) {
        self.stall_probes.store(stall, Ordering::SeqCst);
    }

    pub fn set_send_mode(&self, mode: SendMode) {
        *self.send_mode.lock().unwrap() = mode;
    }

    /// Makes every send and probe on one channel fail.
    pub fn break_channel(&self, id: usize) {
        self.broken_channels.lock().unwrap().insert(id);
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn sends(&self) -> usize {
        self.sends.load(Ordering::SeqCst)
    }

    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    pub fn closes_of(&self, id: usize) -> usize {
        self.closes.lock().unwrap().get(&id).copied().unwrap_or(0)
    }

    pub fn total_closes(&self) -> usize {
        self.closes.lock().unwrap().values().sum()
    }

    fn is_broken(&self, id: usize) -> bool {
        self.broken_channels.lock().unwrap().contains(&id)
    }

    fn broken() -> backend::Error {
        backend::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "connection reset by peer",
        ))
    }
}

#[async_trait]
impl Transport for FakeTransport {
    type Channel = FakeChannel;

    async fn open(&self, _backend: &Backend) -> Result<Self::Channel, backend::Error> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let delay_ms = self.open_delay_ms.load(Ordering::SeqCst);
        if delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
        if self.fail_opens.load(Ordering::SeqCst) {
            return Err(backend::Error::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "connection refused",
            )));
        }
        Ok(FakeChannel {
            id: self.next_channel.fetch_add(1, Ordering::SeqCst),
        })
    }

    async fn send(&self, channel: &Self::Channel, request: Message) -> Outcome {
        self.sends.fetch_add(1, Ordering::SeqCst);
        if self.is_broken(channel.id) {
            return Outcome::TransportFault(Self::broken());
        }
        let mode = self.send_mode.lock().unwrap().clone();
        match mode {
            SendMode::Echo => {
                let processing_ms = request
                    .header(PROCESSING_MS_HEADER)
                    .and_then(|ms| ms.parse::<u64>().ok())
                    .unwrap_or(0);
                if processing_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(processing_ms)).await;
                }
                let mut response = Message::reply_to(&request, request.payload.clone());
                response.headers = request.headers;
                Outcome::Response(response)
            }
            SendMode::Break => Outcome::TransportFault(Self::broken()),
            SendMode::Fault(fault) => Outcome::ApplicationFault(fault),
            SendMode::Stall => std::future::pending().await,
        }
    }

    async fn probe(&self, channel: &Self::Channel) -> Result<(), backend::Error> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if self.stall_probes.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.is_broken(channel.id) {
            return Err(Self::broken());
        }
        Ok(())
    }

    async fn close(&self, channel: &Self::Channel) -> Result<(), backend::Error> {
        *self.closes.lock().unwrap().entry(channel.id).or_insert(0) += 1;
        if self.fail_closes.load(Ordering::SeqCst) {
            return Err(backend::Error::Other(anyhow::anyhow!("close failed")));
        }
        Ok(())
    }
}

/// A test-only oracle reporting a fixed error code for every task.
pub struct FixedOracle {
    pub check: bool,
    pub code: Option<i32>,
    pub lookups: AtomicUsize,
}

impl FixedOracle {
    pub fn new(check: bool, code: Option<i32>) -> Self {
        Self {
            check,
            code,
            lookups: AtomicUsize::new(0),
        }
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ErrorCodeOracle for FixedOracle {
    fn should_check_error_code(&self, _error: &backend::Error) -> bool {
        self.check
    }

    async fn task_error_code(&self, _task_id: TaskId) -> Option<i32> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.code
    }
}

/// Polls `f` until it holds, or panics after `timeout`.
pub async fn wait_for<F>(timeout: Duration, f: F)
where
    F: Fn() -> bool,
{
    tokio::time::timeout(timeout, async {
        while !f() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition did not hold in time");
}

pub fn setup_tracing_subscriber() {
    use tracing_subscriber::fmt::format::FmtSpan;
    let _ = tracing_subscriber::fmt()
        .with_thread_names(true)
        .with_span_events(FmtSpan::ENTER)
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .try_init();
}
