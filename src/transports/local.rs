//! Implementation of [Transport] which calls an in-process service.
//!
//! Useful for embedding backends in the same process as the broker, and
//! for measuring the broker's own overhead.

use crate::backend::{Backend, Error, Outcome, Transport};
use crate::message::{Fault, Message};

use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A backend living in this process.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    async fn call(&self, request: Message) -> Result<Message, Fault>;
}

#[async_trait]
impl<F, Fut> Service for F
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Message, Fault>> + Send,
{
    async fn call(&self, request: Message) -> Result<Message, Fault> {
        self(request).await
    }
}

pub struct LocalChannel {
    service: Arc<dyn Service>,
    closed: AtomicBool,
}

/// Opens channels which all lead to the same [Service].
pub struct LocalTransport {
    service: Arc<dyn Service>,
}

impl LocalTransport {
    pub fn new(service: impl Service) -> Self {
        Self {
            service: Arc::new(service),
        }
    }
}

#[async_trait]
impl Transport for LocalTransport {
    type Channel = LocalChannel;

    async fn open(&self, _backend: &Backend) -> Result<Self::Channel, Error> {
        Ok(LocalChannel {
            service: self.service.clone(),
            closed: AtomicBool::new(false),
        })
    }

    async fn send(&self, channel: &Self::Channel, request: Message) -> Outcome {
        if channel.closed.load(Ordering::Acquire) {
            return Outcome::TransportFault(Error::NotConnected);
        }
        match channel.service.call(request).await {
            Ok(response) => Outcome::Response(response),
            Err(fault) => Outcome::ApplicationFault(fault),
        }
    }

    async fn probe(&self, channel: &Self::Channel) -> Result<(), Error> {
        if channel.closed.load(Ordering::Acquire) {
            return Err(Error::NotConnected);
        }
        Ok(())
    }

    async fn close(&self, channel: &Self::Channel) -> Result<(), Error> {
        channel.closed.store(true, Ordering::Release);
        Ok(())
    }
}
