//! Transport abstractions and broker backends.
//!
//! Outbound, this module defines a Tower-compatible transport layer used to
//! hand [`Outgoing`] frames to a broker channel. Inbound, a [`Receiver`]
//! yields [`Delivery`] values and settles them with ack or reject.
//!
//! The outbound side is built around Tower's `Service` abstraction, enabling
//! middleware composition (retries, timeouts, rate limits) while keeping
//! sender implementations backend-agnostic.
//!
//! ## Key components
//!
//! - [`Transport`]: Public-facing wrapper implementing `tower::Service`
//! - [`SenderService`]: Adapter from a [`Sender`] to a Tower service
//! - [`Sender`]: Trait implemented by concrete sender backends
//! - [`Channels`]: Channel-name to transport table used by the publisher
//! - [`Receiver`]: Trait implemented by concrete consuming backends
//! - [`TransportError`]: Unified error type with tracing context

pub mod inmemory;

#[cfg(feature = "kafka")]
pub mod kafka;

#[cfg(feature = "rabbitmq")]
pub mod rabbitmq;

use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use futures_core::stream::BoxStream;
use tokio_util::sync::CancellationToken;
use tower::{Service, ServiceExt as _, util::BoxCloneSyncService};
use tracing_error::SpanTrace;

use crate::{
    codec::Frame,
    routing::{Route, RoutingError, RoutingErrorKind},
};

pub use inmemory::InMemoryBroker;

/// A wire frame addressed to a broker destination.
#[derive(Debug, Clone, PartialEq)]
pub struct Outgoing {
    pub route: Route,
    pub frame: Frame,
}

/// Type-erased transport stored in [`Channels`].
pub type BoxTransport = Transport<BoxCloneSyncService<Outgoing, (), tower::BoxError>>;

/// Generic Tower-compatible transport wrapper.
///
/// `Transport` is the main entry point for sending frames. It wraps an
/// underlying Tower `Service` and:
///
/// - Normalizes errors into [`TransportError`]
/// - Supports Tower middleware via layers
/// - Provides a convenience [`send`](Transport::send) API
///
/// Typically constructed from a concrete [`Sender`] implementation.
#[derive(Clone)]
pub struct Transport<S> {
    service: S,
}

impl<D> Transport<SenderService<D>> {
    /// Create a new transport from a concrete sender backend.
    pub fn new(driver: D) -> Self {
        Self {
            service: SenderService::new(driver),
        }
    }
}

impl<S> Transport<S> {
    /// Apply a Tower layer to the transport.
    pub fn layer<L>(self, layer: L) -> Transport<L::Service>
    where
        L: tower::Layer<S>,
    {
        Transport {
            service: layer.layer(self.service),
        }
    }

    /// Erase the service type so transports with different stacks can share
    /// one [`Channels`] table.
    pub fn boxed(self) -> BoxTransport
    where
        S: Service<Outgoing, Response = ()> + Clone + Send + Sync + 'static,
        S::Error: Into<tower::BoxError>,
        S::Future: Send + 'static,
    {
        let service = self
            .service
            .map_err(|err: S::Error| -> tower::BoxError { err.into() });
        Transport {
            service: BoxCloneSyncService::new(service),
        }
    }

    /// Send a frame through the transport.
    pub async fn send(&mut self, outgoing: Outgoing) -> Result<(), TransportError>
    where
        S: Service<Outgoing> + Clone + Send + 'static,
        S::Future: Send + 'static,
        S::Error: Into<tower::BoxError>,
    {
        let mut service = self.service.clone();
        service
            .ready()
            .await
            .map_err(|e| TransportError::sender(e.into()))?
            .call(outgoing)
            .await
            .map_err(|e| TransportError::sender(e.into()))?;
        Ok(())
    }
}

/// Tower `Service` implementation for `Transport`.
///
/// Delegates readiness and request handling to the inner service while mapping
/// all errors into [`TransportError`].
impl<S> Service<Outgoing> for Transport<S>
where
    S: Service<Outgoing> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<tower::BoxError>,
{
    type Response = ();
    type Error = TransportError;
    type Future = Pin<Box<dyn Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service
            .poll_ready(cx)
            .map_err(|e| TransportError::sender(e.into()))
    }

    fn call(&mut self, req: Outgoing) -> Self::Future {
        let clone = self.service.clone();
        let mut service = std::mem::replace(&mut self.service, clone);

        Box::pin(async move {
            service
                .call(req)
                .await
                .map_err(|e| TransportError::sender(e.into()))?;
            Ok(())
        })
    }
}

/// Channel name to transport table.
///
/// Looking up a channel with no registered transport is a configuration
/// error, never a transient one.
#[derive(Clone, Default)]
pub struct Channels {
    transports: HashMap<String, BoxTransport>,
}

impl Channels {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_channel<S>(mut self, channel: impl Into<String>, transport: Transport<S>) -> Self
    where
        S: Service<Outgoing, Response = ()> + Clone + Send + Sync + 'static,
        S::Error: Into<tower::BoxError>,
        S::Future: Send + 'static,
    {
        self.transports.insert(channel.into(), transport.boxed());
        self
    }

    pub fn get(&self, channel: &str) -> Result<BoxTransport, RoutingError> {
        self.transports
            .get(channel)
            .cloned()
            .ok_or_else(|| RoutingError::new(RoutingErrorKind::NoPublisher(channel.to_owned())))
    }
}

impl std::fmt::Debug for Channels {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channels")
            .field("channels", &self.transports.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Error returned by transport operations.
///
/// Each error captures:
/// - The underlying error kind
/// - A tracing span backtrace for improved diagnostics
#[derive(Debug)]
pub struct TransportError {
    context: SpanTrace,
    kind: TransportErrorKind,
}

/// Transport errors kind.
#[derive(Debug)]
pub enum TransportErrorKind {
    /// Errors originating from the sender backend.
    Sender(tower::BoxError),
    /// Errors originating from the receiving backend.
    Receiver(tower::BoxError),
}

impl TransportError {
    /// Create a sender-related transport error.
    pub fn sender(err: tower::BoxError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: TransportErrorKind::Sender(err),
        }
    }

    /// Create a receiver-related transport error.
    pub fn receiver(err: tower::BoxError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: TransportErrorKind::Receiver(err),
        }
    }

    pub fn kind(&self) -> &TransportErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            TransportErrorKind::Sender(err) => writeln!(f, "Sender error: {err}"),
            TransportErrorKind::Receiver(err) => writeln!(f, "Receiver error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            TransportErrorKind::Sender(err) => Some(err.as_ref()),
            TransportErrorKind::Receiver(err) => Some(err.as_ref()),
        }
    }
}

/// Tower service adapter for a [`Sender`] backend.
#[derive(Clone)]
pub struct SenderService<D> {
    sender: D,
}

impl<D> SenderService<D> {
    /// Create a new sender service from a backend.
    pub fn new(sender: D) -> Self {
        Self { sender }
    }
}

/// `tower::Service` implementation delegating to a [`Sender`].
impl<D> Service<Outgoing> for SenderService<D>
where
    D: Sender + Clone + Send + 'static,
{
    type Response = ();
    type Error = tower::BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Outgoing) -> Self::Future {
        let mut sender = self.sender.clone();
        Box::pin(async move {
            sender.send(req).await.map_err(Into::into)?;
            Ok(())
        })
    }
}

/// Trait implemented by concrete sender backends.
///
/// A sender hands one frame to an external system (e.g. Kafka, RabbitMQ, or
/// an in-memory broker). Returning `Ok` means the broker accepted it.
#[async_trait::async_trait]
pub trait Sender {
    /// Backend-specific error type.
    type Error: Into<tower::BoxError>;

    async fn send(&mut self, outgoing: Outgoing) -> Result<(), Self::Error>;
}

/// A frame received from a broker, pending settlement.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub frame: Frame,
    /// Channel (queue) the frame was received from.
    pub channel: String,
    /// Broker-assigned settlement tag.
    pub tag: u64,
}

/// Trait implemented by concrete consuming backends.
#[async_trait::async_trait]
pub trait Receiver: Send + Sync {
    /// Backend-specific error type.
    type Error: Into<tower::BoxError> + Send;

    /// Subscribe to deliveries. The stream ends when `cancel` fires.
    async fn deliveries(
        &self,
        cancel: CancellationToken,
    ) -> Result<BoxStream<'static, Result<Delivery, Self::Error>>, Self::Error>;

    /// Settle a delivery as processed.
    async fn ack(&self, delivery: &Delivery) -> Result<(), Self::Error>;

    /// Settle a delivery as failed. With `requeue` the broker redelivers it.
    async fn reject(&self, delivery: &Delivery, requeue: bool) -> Result<(), Self::Error>;
}
