//! Publisher loop relaying outbox rows to broker channels.
//!
//! This module implements the *outbox publisher*, which:
//!
//! - Claims the head row of some partition from the outbox
//! - Translates it into its wire frame and resolves its route
//! - Sends it through the transport registered for the channel
//! - Acknowledges (deletes) the row once the broker accepted it
//! - Exposes lifecycle hooks for observability and customization
//!
//! A row whose hand-off failed stays claimed and is retried only after the
//! redelivery timeout, which keeps its partition blocked in the meantime.

use std::{sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;

use crate::{
    codec::{CodecError, NativeCodec},
    outbox::{AcknowledgeMessages, ClaimMessages, OutboxRow, SequenceId},
    routing::{Route, Router, RoutingError},
    transport::{Channels, Outgoing, TransportError},
    wire::{TranslateError, Translator},
};

/// Default delay between polls of an empty outbox.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Outbox publisher.
///
/// Generic parameters:
/// - `D`: Outbox backend
/// - `HK`: Hook implementation for lifecycle events
pub struct OutboxPublisher<D, HK = DefaultPublisherHook> {
    outbox: D,
    translator: Translator,
    router: Arc<Router>,
    channels: Channels,
    hook: HK,
    poll_interval: Duration,
    codec: NativeCodec,
}

impl<D> OutboxPublisher<D, DefaultPublisherHook> {
    /// Create a new publisher with the default hook implementation.
    pub fn new(outbox: D, translator: Translator, router: Arc<Router>, channels: Channels) -> Self {
        Self {
            outbox,
            translator,
            router,
            channels,
            hook: DefaultPublisherHook,
            poll_interval: DEFAULT_POLL_INTERVAL,
            codec: NativeCodec,
        }
    }
}

impl<D, HK> OutboxPublisher<D, HK>
where
    D: ClaimMessages + AcknowledgeMessages + Send + Sync,
    <D as ClaimMessages>::Error: Into<tower::BoxError>,
    <D as AcknowledgeMessages>::Error: Into<tower::BoxError>,
    HK: PublisherHook,
{
    /// Replace the publisher hook.
    pub fn with_hook<HK2: PublisherHook>(self, hook: HK2) -> OutboxPublisher<D, HK2> {
        OutboxPublisher {
            outbox: self.outbox,
            translator: self.translator,
            router: self.router,
            channels: self.channels,
            hook,
            poll_interval: self.poll_interval,
            codec: self.codec,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Claim and publish one row.
    ///
    /// Returns the id of the published row, or `None` when nothing is
    /// eligible. On error the claimed row is left untouched.
    #[tracing::instrument(skip(self))]
    pub async fn publish_next(&self) -> Result<Option<SequenceId>, PublishError> {
        let row = self
            .outbox
            .claim()
            .await
            .map_err(|e| PublishError::outbox(e.into()))?;
        let Some(row) = row else {
            return Ok(None);
        };
        self.hook.on_claimed(&row);

        let outgoing = self.prepare(&row).inspect_err(|err| {
            self.hook.on_publish_error(row.id, err);
        })?;

        let mut transport = self.channels.get(&outgoing.route.channel).map_err(|err| {
            let err = PublishError::from(err);
            self.hook.on_publish_error(row.id, &err);
            err
        })?;
        let route = outgoing.route.clone();
        transport.send(outgoing).await.map_err(|err| {
            let err = PublishError::from(err);
            self.hook.on_publish_error(row.id, &err);
            err
        })?;
        self.hook.on_published(row.id, &route);

        if let Err(err) = self.outbox.acknowledge(row.id).await {
            let err = PublishError::outbox(err.into());
            self.hook.on_acknowledge_error(row.id, &err);
            return Err(err);
        }
        Ok(Some(row.id))
    }

    fn prepare(&self, row: &OutboxRow) -> Result<Outgoing, PublishError> {
        let envelope = self.codec.decode(&row.frame())?;
        let frame = self.translator.encode(&envelope)?;
        let name = envelope.stamps.message_name().unwrap_or_default();
        let route = self.router.resolve(name)?;
        Ok(Outgoing { route, frame })
    }

    /// Run the publisher loop until `cancel` fires.
    ///
    /// The outbox is drained row by row; once empty, the loop sleeps for the
    /// poll interval. Transient hand-off failures are reported through the
    /// hook and the loop continues. Configuration errors stop it.
    #[tracing::instrument(skip_all)]
    pub async fn run(self, cancel: CancellationToken) -> Result<(), PublishError> {
        self.hook.on_startup();
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.hook.on_shutdown();
                    return Ok(());
                }
                _ = ticker.tick() => {
                    loop {
                        match self.publish_next().await {
                            Ok(Some(_)) if !cancel.is_cancelled() => continue,
                            Ok(_) => break,
                            Err(err) if err.is_configuration_error() => return Err(err),
                            Err(_) => break,
                        }
                    }
                }
            }
        }
    }
}

/// Error returned when publishing a row fails.
#[derive(Debug)]
pub struct PublishError {
    context: tracing_error::SpanTrace,
    kind: PublishErrorKind,
}

/// Classification of publisher errors.
#[derive(Debug)]
pub enum PublishErrorKind {
    /// The outbox backend failed.
    Outbox(tower::BoxError),
    /// The stored row could not be decoded.
    Decode(CodecError),
    /// The envelope could not be translated to its wire form.
    Translate(TranslateError),
    /// No valid route for the message.
    Routing(RoutingError),
    /// The broker did not accept the frame.
    Transport(TransportError),
}

impl PublishError {
    fn new(kind: PublishErrorKind) -> Self {
        Self {
            context: tracing_error::SpanTrace::capture(),
            kind,
        }
    }

    fn outbox(err: tower::BoxError) -> Self {
        Self::new(PublishErrorKind::Outbox(err))
    }

    pub fn kind(&self) -> &PublishErrorKind {
        &self.kind
    }

    /// Whether retrying can never succeed without a configuration change.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self.kind,
            PublishErrorKind::Routing(_) | PublishErrorKind::Translate(_)
        )
    }
}

impl From<CodecError> for PublishError {
    fn from(err: CodecError) -> Self {
        Self::new(PublishErrorKind::Decode(err))
    }
}

impl From<TranslateError> for PublishError {
    fn from(err: TranslateError) -> Self {
        Self::new(PublishErrorKind::Translate(err))
    }
}

impl From<RoutingError> for PublishError {
    fn from(err: RoutingError) -> Self {
        Self::new(PublishErrorKind::Routing(err))
    }
}

impl From<TransportError> for PublishError {
    fn from(err: TransportError) -> Self {
        Self::new(PublishErrorKind::Transport(err))
    }
}

impl std::fmt::Display for PublishError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            PublishErrorKind::Outbox(err) => writeln!(f, "Outbox error: {err}"),
            PublishErrorKind::Decode(err) => writeln!(f, "Decode error: {err}"),
            PublishErrorKind::Translate(err) => writeln!(f, "Translate error: {err}"),
            PublishErrorKind::Routing(err) => writeln!(f, "Routing error: {err}"),
            PublishErrorKind::Transport(err) => writeln!(f, "Transport error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for PublishError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            PublishErrorKind::Outbox(err) => Some(err.as_ref()),
            PublishErrorKind::Decode(err) => Some(err),
            PublishErrorKind::Translate(err) => Some(err),
            PublishErrorKind::Routing(err) => Some(err),
            PublishErrorKind::Transport(err) => Some(err),
        }
    }
}

/// Hook trait for observing publisher lifecycle events.
///
/// Hooks are invoked synchronously and should avoid heavy or blocking work.
pub trait PublisherHook: Send + Sync {
    fn on_startup(&self);
    fn on_shutdown(&self);
    fn on_claimed(&self, row: &OutboxRow);
    fn on_published(&self, id: SequenceId, route: &Route);
    fn on_publish_error(&self, id: SequenceId, error: &PublishError);
    fn on_acknowledge_error(&self, id: SequenceId, error: &PublishError);
}

/// Default publisher hook. Logs lifecycle events using `tracing`.
pub struct DefaultPublisherHook;

impl PublisherHook for DefaultPublisherHook {
    fn on_startup(&self) {
        tracing::info!("Publisher is starting up");
    }

    fn on_shutdown(&self) {
        tracing::info!("Publisher is shutting down");
    }

    fn on_claimed(&self, row: &OutboxRow) {
        tracing::debug!(id = row.id, partition_key = %row.partition_key, "Row claimed");
    }

    fn on_published(&self, id: SequenceId, route: &Route) {
        tracing::info!(
            id,
            channel = %route.channel,
            routing_key = %route.routing_key,
            "Message published"
        );
    }

    fn on_publish_error(&self, id: SequenceId, error: &PublishError) {
        tracing::error!(id, %error, "Failed to publish message");
    }

    fn on_acknowledge_error(&self, id: SequenceId, error: &PublishError) {
        tracing::error!(id, %error, "Failed to acknowledge published row");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bus::Bus,
        envelope::Message,
        outbox::{Outbox, inmemory::InMemoryOutbox},
        registry::MessageRegistry,
        routing::RoutingErrorKind,
        transaction::InMemoryTransaction,
        transport::{InMemoryBroker, Sender, Transport},
        wire::MESSAGE_CLASS_HEADER,
    };
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    struct OrderPlaced {
        order_id: String,
        seq: u32,
    }

    impl Message for OrderPlaced {
        fn partition_key(&self) -> Option<String> {
            Some(self.order_id.clone())
        }
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct PaymentCaptured;
    impl Message for PaymentCaptured {}

    #[derive(Clone)]
    struct Unavailable;

    #[async_trait::async_trait]
    impl Sender for Unavailable {
        type Error = std::io::Error;

        async fn send(&mut self, _outgoing: Outgoing) -> Result<(), Self::Error> {
            Err(std::io::Error::other("broker unavailable"))
        }
    }

    fn registry() -> Arc<MessageRegistry> {
        Arc::new(
            MessageRegistry::builder()
                .register_as::<OrderPlaced>("shop::OrderPlaced", "order.placed")
                .unwrap()
                .register_as::<PaymentCaptured>("billing::PaymentCaptured", "payment.captured")
                .unwrap()
                .build(),
        )
    }

    async fn dispatch<M: Message>(bus: &Bus<InMemoryOutbox>, message: M) {
        let mut tx = InMemoryTransaction::begin();
        bus.dispatch(&message, &mut tx).await.unwrap();
        tx.commit();
    }

    #[tokio::test]
    async fn publishes_partition_in_order_with_wire_headers() {
        let registry = registry();
        let outbox = InMemoryOutbox::default();
        let bus = Bus::new(registry.clone(), Outbox::new(outbox.clone()));
        for seq in 1..=3 {
            dispatch(
                &bus,
                OrderPlaced {
                    order_id: "o-1".into(),
                    seq,
                },
            )
            .await;
        }

        let broker = InMemoryBroker::default();
        let publisher = OutboxPublisher::new(
            outbox.clone(),
            Translator::new(registry),
            Arc::new(Router::default()),
            Channels::new().with_channel("order", Transport::new(broker.clone())),
        );
        while publisher.publish_next().await.unwrap().is_some() {}

        let sent = broker.sent("order");
        let seqs: Vec<u64> = sent
            .iter()
            .map(|o| serde_json::from_slice::<serde_json::Value>(&o.frame.body).unwrap()["seq"]
                .as_u64()
                .unwrap())
            .collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(sent[0].route.routing_key, "order.placed");
        assert_eq!(sent[0].frame.headers.get("type"), Some("order.placed"));
        assert_eq!(
            sent[0].frame.headers.get(MESSAGE_CLASS_HEADER),
            Some("shop::OrderPlaced")
        );
        assert!(outbox.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_publishers_keep_partition_order() {
        let registry = registry();
        let outbox = InMemoryOutbox::default();
        let bus = Bus::new(registry.clone(), Outbox::new(outbox.clone()));
        for seq in 1..=3 {
            for order_id in ["order-1", "order-2"] {
                dispatch(
                    &bus,
                    OrderPlaced {
                        order_id: order_id.into(),
                        seq,
                    },
                )
                .await;
            }
        }

        let broker = InMemoryBroker::default();
        let workers: Vec<_> = (0..3)
            .map(|_| {
                let outbox = outbox.clone();
                let publisher = OutboxPublisher::new(
                    outbox.clone(),
                    Translator::new(registry.clone()),
                    Arc::new(Router::default()),
                    Channels::new().with_channel("order", Transport::new(broker.clone())),
                );
                tokio::spawn(async move {
                    while !outbox.is_empty() {
                        if publisher.publish_next().await.unwrap().is_none() {
                            tokio::task::yield_now().await;
                        }
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.await.unwrap();
        }

        let sent = broker.sent("order");
        assert_eq!(sent.len(), 6);
        for order_id in ["order-1", "order-2"] {
            let seqs: Vec<u64> = sent
                .iter()
                .map(|o| serde_json::from_slice::<serde_json::Value>(&o.frame.body).unwrap())
                .filter(|body| body["order_id"] == order_id)
                .map(|body| body["seq"].as_u64().unwrap())
                .collect();
            assert_eq!(seqs, vec![1, 2, 3], "{order_id} published out of order");
        }
    }

    #[tokio::test]
    async fn missing_channel_is_a_configuration_error_and_keeps_row() {
        let registry = registry();
        let outbox = InMemoryOutbox::default();
        let bus = Bus::new(registry.clone(), Outbox::new(outbox.clone()));
        dispatch(&bus, PaymentCaptured).await;

        let publisher = OutboxPublisher::new(
            outbox.clone(),
            Translator::new(registry),
            Arc::new(Router::default()),
            Channels::new().with_channel("order", Transport::new(InMemoryBroker::default())),
        );
        let err = publisher.publish_next().await.unwrap_err();

        assert!(err.is_configuration_error());
        assert!(matches!(
            err.kind(),
            PublishErrorKind::Routing(e) if matches!(e.kind(), RoutingErrorKind::NoPublisher(c) if c == "payment")
        ));
        assert_eq!(outbox.rows().len(), 1);
    }

    #[tokio::test]
    async fn failed_handoff_leaves_row_claimed() {
        let registry = registry();
        let outbox = InMemoryOutbox::default();
        let bus = Bus::new(registry.clone(), Outbox::new(outbox.clone()));
        dispatch(
            &bus,
            OrderPlaced {
                order_id: "o-1".into(),
                seq: 1,
            },
        )
        .await;

        let publisher = OutboxPublisher::new(
            outbox.clone(),
            Translator::new(registry),
            Arc::new(Router::default()),
            Channels::new().with_channel("order", Transport::new(Unavailable)),
        );
        let err = publisher.publish_next().await.unwrap_err();
        assert!(!err.is_configuration_error());

        let rows = outbox.rows();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].delivered_at.is_some());
        assert!(publisher.publish_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn run_drains_until_cancelled() {
        let registry = registry();
        let outbox = InMemoryOutbox::default();
        let bus = Bus::new(registry.clone(), Outbox::new(outbox.clone()));
        dispatch(
            &bus,
            OrderPlaced {
                order_id: "o-1".into(),
                seq: 1,
            },
        )
        .await;

        let broker = InMemoryBroker::default();
        let publisher = OutboxPublisher::new(
            outbox.clone(),
            Translator::new(registry),
            Arc::new(Router::default()),
            Channels::new().with_channel("order", Transport::new(broker.clone())),
        )
        .with_poll_interval(Duration::from_millis(10));

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(publisher.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(broker.sent("order").len(), 1);
        assert!(outbox.is_empty());
    }
}
