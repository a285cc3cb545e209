//! Inbox consumer loop.
//!
//! The [`Consumer`] takes deliveries from a [`Receiver`], restores their
//! envelopes through the wire [`Translator`] and runs the inbox pipeline and
//! the matching handler inside one deduplication-store transaction:
//!
//! - success commits the transaction and acks the delivery
//! - a duplicate commits nothing new and acks the delivery
//! - a handler or store failure rolls back and rejects with requeue, so the
//!   delivery comes back and its identity is admitted again
//! - a delivery that can never be processed (undecodable frame or body,
//!   unknown semantic name, no handler) is dead-lettered and rejected
//!   without requeue

use std::sync::Arc;

use tokio_stream::StreamExt as _;
use tokio_util::sync::CancellationToken;

use crate::{
    handler::Handlers,
    inbox::DeduplicationStore,
    pipeline::{DeduplicationStage, DispatchError, Outcome, Pipeline, Stage},
    routing::Route,
    stamp::{MessageId, ReceivedStamp},
    transport::{BoxTransport, Delivery, Outgoing, Receiver, TransportError, TransportErrorKind},
    wire::Translator,
};

/// Header carrying the reason a delivery was dead-lettered.
pub const FAILURE_REASON_HEADER: &str = "x-failure-reason";

/// What happened to a single delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// The handler ran and its transaction committed.
    Handled(MessageId),
    /// The identity was already processed; the handler did not run.
    Duplicate(MessageId),
    /// The delivery can never be processed and was set aside.
    DeadLettered,
}

struct FailureChannel {
    channel: String,
    transport: BoxTransport,
}

/// Inbox consumer.
///
/// Generic parameters:
/// - `R`: Receiver backend
/// - `S`: Deduplication store
/// - `HK`: Hook implementation for lifecycle events
pub struct Consumer<R, S, HK = DefaultConsumerHook>
where
    S: DeduplicationStore,
{
    receiver: R,
    store: Arc<S>,
    translator: Translator,
    pipeline: Pipeline<S::Transaction>,
    handlers: Handlers<S::Transaction>,
    failure: Option<FailureChannel>,
    hook: HK,
}

impl<R, S> Consumer<R, S, DefaultConsumerHook>
where
    S: DeduplicationStore + 'static,
    S::Transaction: 'static,
{
    /// Create a consumer whose pipeline starts with deduplication.
    pub fn new(
        receiver: R,
        store: Arc<S>,
        translator: Translator,
        handlers: Handlers<S::Transaction>,
    ) -> Self {
        let pipeline = Pipeline::new().with_stage(DeduplicationStage::new(store.clone()));
        Self {
            receiver,
            store,
            translator,
            pipeline,
            handlers,
            failure: None,
            hook: DefaultConsumerHook,
        }
    }
}

impl<R, S, HK> Consumer<R, S, HK>
where
    R: Receiver,
    S: DeduplicationStore + 'static,
    S::Transaction: 'static,
    HK: ConsumerHook,
{
    /// Replace the consumer hook.
    pub fn with_hook<HK2: ConsumerHook>(self, hook: HK2) -> Consumer<R, S, HK2> {
        Consumer {
            receiver: self.receiver,
            store: self.store,
            translator: self.translator,
            pipeline: self.pipeline,
            handlers: self.handlers,
            failure: self.failure,
            hook,
        }
    }

    /// Append a stage after deduplication.
    pub fn with_stage(mut self, stage: impl Stage<S::Transaction> + 'static) -> Self {
        self.pipeline = self.pipeline.with_stage(stage);
        self
    }

    /// Send unprocessable deliveries to `channel` before rejecting them.
    pub fn with_failure_channel(mut self, channel: impl Into<String>, transport: BoxTransport) -> Self {
        self.failure = Some(FailureChannel {
            channel: channel.into(),
            transport,
        });
        self
    }

    /// Process and settle one delivery.
    ///
    /// Every error is reported through [`ConsumerHook::on_consume_error`]
    /// before it is returned.
    #[tracing::instrument(skip_all, fields(channel = %delivery.channel, tag = delivery.tag))]
    pub async fn consume(&self, delivery: &Delivery) -> Result<ConsumeOutcome, ConsumeError> {
        self.hook.on_delivery(delivery);
        let result = self.process(delivery).await;
        if let Err(err) = &result {
            self.hook.on_consume_error(err);
        }
        result
    }

    async fn process(&self, delivery: &Delivery) -> Result<ConsumeOutcome, ConsumeError> {
        let mut envelope = match self.translator.decode(&delivery.frame) {
            Ok(envelope) => envelope,
            Err(err) => {
                let reason = err.to_string();
                let reason = reason.lines().next().unwrap_or_default();
                return self.dead_letter(delivery, reason).await;
            }
        };
        let Some(id) = envelope.stamps.message_id() else {
            return self.dead_letter(delivery, "missing message id").await;
        };
        let Some(handler) = self.handlers.get(envelope.message.type_name()).cloned() else {
            let reason = format!("no handler for {}", envelope.message.type_name());
            return self.dead_letter(delivery, &reason).await;
        };
        if let Err(err) = handler.accepts(&envelope.message) {
            let reason = format!("undecodable {} payload: {err}", envelope.message.type_name());
            return self.dead_letter(delivery, &reason).await;
        }
        envelope.stamps.push(ReceivedStamp {
            channel: delivery.channel.clone(),
        });

        let mut tx = match self.store.begin().await {
            Ok(tx) => tx,
            Err(err) => return self.requeue(delivery, ConsumeError::store(err.into())).await,
        };

        let result = match self.pipeline.run(envelope, &mut tx).await {
            Ok(Outcome::Stopped(_)) => Ok(ConsumeOutcome::Duplicate(id)),
            Ok(Outcome::Completed(envelope)) => handler
                .handle(&envelope, &mut tx)
                .await
                .map(|()| ConsumeOutcome::Handled(id))
                .map_err(ConsumeError::handler),
            Err(err) => Err(ConsumeError::from(err)),
        };

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(err) => {
                if let Err(rollback) = self.store.rollback(tx).await {
                    let rollback: tower::BoxError = rollback.into();
                    tracing::error!(error = %rollback, "Rollback failed");
                }
                return self.requeue(delivery, err).await;
            }
        };

        if let Err(err) = self.store.commit(tx).await {
            return self.requeue(delivery, ConsumeError::store(err.into())).await;
        }
        self.receiver
            .ack(delivery)
            .await
            .map_err(|e| ConsumeError::receiver(e.into()))?;
        match &outcome {
            ConsumeOutcome::Duplicate(id) => self.hook.on_duplicate(*id),
            _ => self.hook.on_handled(id),
        }
        Ok(outcome)
    }

    /// Hand the delivery back to the broker and return `err`.
    async fn requeue(
        &self,
        delivery: &Delivery,
        err: ConsumeError,
    ) -> Result<ConsumeOutcome, ConsumeError> {
        if let Err(reject) = self.receiver.reject(delivery, true).await {
            tracing::error!(error = %err, "Delivery could not be requeued after failure");
            return Err(ConsumeError::receiver(reject.into()));
        }
        Err(err)
    }

    async fn dead_letter(
        &self,
        delivery: &Delivery,
        reason: &str,
    ) -> Result<ConsumeOutcome, ConsumeError> {
        if let Some(failure) = &self.failure {
            let mut frame = delivery.frame.clone();
            frame.headers.insert(FAILURE_REASON_HEADER, reason);
            let outgoing = Outgoing {
                route: Route {
                    channel: failure.channel.clone(),
                    routing_key: delivery.channel.clone(),
                },
                frame,
            };
            if let Err(err) = failure.transport.clone().send(outgoing).await {
                return self.requeue(delivery, ConsumeError::from(err)).await;
            }
        }

        self.receiver
            .reject(delivery, false)
            .await
            .map_err(|e| ConsumeError::receiver(e.into()))?;
        self.hook.on_dead_lettered(delivery, reason);
        Ok(ConsumeOutcome::DeadLettered)
    }

    /// Run the consumer loop until `cancel` fires or the receiver stream ends.
    ///
    /// Failures of individual deliveries are reported through the hook and
    /// the delivery is requeued. A receiver that fails to stream or settle
    /// deliveries stops the loop.
    #[tracing::instrument(skip_all)]
    pub async fn run(self, cancel: CancellationToken) -> Result<(), ConsumeError> {
        self.hook.on_startup();

        let mut deliveries = self
            .receiver
            .deliveries(cancel.clone())
            .await
            .map_err(|e| ConsumeError::receiver(e.into()))?;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.hook.on_shutdown();
                    return Ok(());
                }
                next = deliveries.next() => match next {
                    Some(Ok(delivery)) => {
                        if let Err(err) = self.consume(&delivery).await {
                            if err.is_receiver_failure() {
                                self.hook.on_shutdown();
                                return Err(err);
                            }
                        }
                    }
                    Some(Err(err)) => {
                        let err = ConsumeError::receiver(err.into());
                        self.hook.on_consume_error(&err);
                        return Err(err);
                    }
                    None => {
                        self.hook.on_shutdown();
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Error returned when a delivery could not be processed.
#[derive(Debug)]
pub struct ConsumeError {
    context: tracing_error::SpanTrace,
    kind: ConsumeErrorKind,
}

/// Classification of consumer errors.
#[derive(Debug)]
pub enum ConsumeErrorKind {
    /// The deduplication store failed.
    Store(tower::BoxError),
    /// A pipeline stage failed.
    Dispatch(DispatchError),
    /// The handler failed; its transaction was rolled back.
    Handler(tower::BoxError),
    /// Receiving or settling failed, or dead-lettering could not be sent.
    Transport(TransportError),
}

impl ConsumeError {
    fn new(kind: ConsumeErrorKind) -> Self {
        Self {
            context: tracing_error::SpanTrace::capture(),
            kind,
        }
    }

    fn store(err: tower::BoxError) -> Self {
        Self::new(ConsumeErrorKind::Store(err))
    }

    fn handler(err: tower::BoxError) -> Self {
        Self::new(ConsumeErrorKind::Handler(err))
    }

    fn receiver(err: tower::BoxError) -> Self {
        Self::new(ConsumeErrorKind::Transport(TransportError::receiver(err)))
    }

    pub fn kind(&self) -> &ConsumeErrorKind {
        &self.kind
    }

    /// Whether the receiver itself failed, leaving the delivery unsettled.
    pub fn is_receiver_failure(&self) -> bool {
        matches!(
            &self.kind,
            ConsumeErrorKind::Transport(err) if matches!(err.kind(), TransportErrorKind::Receiver(_))
        )
    }
}

impl From<DispatchError> for ConsumeError {
    fn from(err: DispatchError) -> Self {
        Self::new(ConsumeErrorKind::Dispatch(err))
    }
}

impl From<TransportError> for ConsumeError {
    fn from(err: TransportError) -> Self {
        Self::new(ConsumeErrorKind::Transport(err))
    }
}

impl std::fmt::Display for ConsumeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            ConsumeErrorKind::Store(err) => writeln!(f, "Deduplication store error: {err}"),
            ConsumeErrorKind::Dispatch(err) => writeln!(f, "Pipeline error: {err}"),
            ConsumeErrorKind::Handler(err) => writeln!(f, "Handler error: {err}"),
            ConsumeErrorKind::Transport(err) => writeln!(f, "Transport error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for ConsumeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            ConsumeErrorKind::Store(err) => Some(err.as_ref()),
            ConsumeErrorKind::Dispatch(err) => Some(err),
            ConsumeErrorKind::Handler(err) => Some(err.as_ref()),
            ConsumeErrorKind::Transport(err) => Some(err),
        }
    }
}

/// Hook trait for observing consumer lifecycle events.
///
/// Hooks are invoked synchronously and should avoid heavy or blocking work.
pub trait ConsumerHook: Send + Sync {
    fn on_startup(&self);
    fn on_shutdown(&self);
    fn on_delivery(&self, delivery: &Delivery);
    fn on_handled(&self, id: MessageId);
    fn on_duplicate(&self, id: MessageId);
    fn on_dead_lettered(&self, delivery: &Delivery, reason: &str);
    fn on_consume_error(&self, error: &ConsumeError);
}

/// Default consumer hook. Logs lifecycle events using `tracing`.
pub struct DefaultConsumerHook;

impl ConsumerHook for DefaultConsumerHook {
    fn on_startup(&self) {
        tracing::info!("Consumer is starting up");
    }

    fn on_shutdown(&self) {
        tracing::info!("Consumer is shutting down");
    }

    fn on_delivery(&self, delivery: &Delivery) {
        tracing::debug!(tag = delivery.tag, "Delivery received");
    }

    fn on_handled(&self, id: MessageId) {
        tracing::info!(%id, "Message handled");
    }

    fn on_duplicate(&self, id: MessageId) {
        tracing::info!(%id, "Duplicate delivery acknowledged");
    }

    fn on_dead_lettered(&self, delivery: &Delivery, reason: &str) {
        tracing::warn!(tag = delivery.tag, reason, "Delivery dead-lettered");
    }

    fn on_consume_error(&self, error: &ConsumeError) {
        tracing::error!(%error, "Failed to consume delivery");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bus::Bus,
        codec::{Frame, Headers, TYPE_HEADER},
        envelope::Message,
        handler::MessageHandler,
        inbox::inmemory::InMemoryDeduplicationStore,
        outbox::{Outbox, inmemory::InMemoryOutbox},
        publisher::OutboxPublisher,
        registry::MessageRegistry,
        routing::Router,
        stamp::Stamps,
        transaction::InMemoryTransaction,
        transport::{Channels, InMemoryBroker, Transport, inmemory::InMemoryReceiver},
    };
    use serde::{Deserialize, Serialize};
    use tokio_stream::StreamExt as _;
    use std::sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    #[derive(Debug, Serialize, Deserialize)]
    struct OrderPlaced {
        order_id: String,
    }

    impl Message for OrderPlaced {
        fn partition_key(&self) -> Option<String> {
            Some(self.order_id.clone())
        }
    }

    #[derive(Default)]
    struct Recorder {
        handled: Mutex<Vec<String>>,
        failures_left: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl MessageHandler<OrderPlaced, InMemoryTransaction> for Arc<Recorder> {
        async fn handle(
            &self,
            message: OrderPlaced,
            stamps: &Stamps,
            _tx: &mut InMemoryTransaction,
        ) -> Result<(), tower::BoxError> {
            assert_eq!(stamps.received_from(), Some("order"));
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err("inventory service unavailable".into());
            }
            self.handled.lock().unwrap().push(message.order_id);
            Ok(())
        }
    }

    fn registry() -> Arc<MessageRegistry> {
        Arc::new(
            MessageRegistry::builder()
                .register_as::<OrderPlaced>("shop::OrderPlaced", "order.placed")
                .unwrap()
                .build(),
        )
    }

    /// Dispatch through the outbox and publish to the in-memory broker.
    async fn publish(registry: &Arc<MessageRegistry>, broker: &InMemoryBroker, order_id: &str) {
        let outbox = InMemoryOutbox::default();
        let bus = Bus::new(registry.clone(), Outbox::new(outbox.clone()));
        let mut tx = InMemoryTransaction::begin();
        bus.dispatch(
            &OrderPlaced {
                order_id: order_id.into(),
            },
            &mut tx,
        )
        .await
        .unwrap();
        tx.commit();

        let publisher = OutboxPublisher::new(
            outbox,
            Translator::new(registry.clone()),
            Arc::new(Router::default()),
            Channels::new().with_channel("order", Transport::new(broker.clone())),
        );
        publisher.publish_next().await.unwrap().unwrap();
    }

    fn consumer(
        registry: &Arc<MessageRegistry>,
        broker: &InMemoryBroker,
        store: &Arc<InMemoryDeduplicationStore>,
        recorder: &Arc<Recorder>,
    ) -> Consumer<InMemoryReceiver, InMemoryDeduplicationStore> {
        let handlers = Handlers::new(registry.clone()).on::<OrderPlaced, _>(recorder.clone());
        Consumer::new(
            broker.receiver("order"),
            store.clone(),
            Translator::new(registry.clone()),
            handlers,
        )
        .with_failure_channel("failed", Transport::new(broker.clone()).boxed())
    }

    async fn next_delivery(broker: &InMemoryBroker) -> Delivery {
        let mut deliveries = broker
            .receiver("order")
            .deliveries(CancellationToken::new())
            .await
            .unwrap();
        deliveries.next().await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn redelivered_message_is_handled_once() {
        let registry = registry();
        let broker = InMemoryBroker::default();
        let store = Arc::new(InMemoryDeduplicationStore::default());
        let recorder = Arc::new(Recorder::default());
        let consumer = consumer(&registry, &broker, &store, &recorder);

        publish(&registry, &broker, "o-1").await;
        let frame = broker.sent("order")[0].frame.clone();
        broker.deliver("order", frame);

        let first = consumer.consume(&next_delivery(&broker).await).await.unwrap();
        let second = consumer.consume(&next_delivery(&broker).await).await.unwrap();

        assert!(matches!(first, ConsumeOutcome::Handled(_)));
        assert!(matches!(second, ConsumeOutcome::Duplicate(_)));
        assert_eq!(*recorder.handled.lock().unwrap(), vec!["o-1".to_owned()]);
        assert_eq!(store.len(), 1);
        assert_eq!(broker.unsettled(), 0);
    }

    #[tokio::test]
    async fn handler_failure_rolls_back_and_requeues() {
        let registry = registry();
        let broker = InMemoryBroker::default();
        let store = Arc::new(InMemoryDeduplicationStore::default());
        let recorder = Arc::new(Recorder {
            failures_left: AtomicUsize::new(1),
            ..Recorder::default()
        });
        let consumer = consumer(&registry, &broker, &store, &recorder);
        publish(&registry, &broker, "o-1").await;

        let err = consumer
            .consume(&next_delivery(&broker).await)
            .await
            .unwrap_err();
        assert!(matches!(err.kind(), ConsumeErrorKind::Handler(_)));
        assert!(store.is_empty());
        assert_eq!(broker.pending("order"), 1);

        let retried = consumer.consume(&next_delivery(&broker).await).await.unwrap();
        assert!(matches!(retried, ConsumeOutcome::Handled(_)));
        assert_eq!(*recorder.handled.lock().unwrap(), vec!["o-1".to_owned()]);
    }

    #[tokio::test]
    async fn unknown_semantic_name_is_dead_lettered() {
        let registry = registry();
        let broker = InMemoryBroker::default();
        let store = Arc::new(InMemoryDeduplicationStore::default());
        let recorder = Arc::new(Recorder::default());
        let consumer = consumer(&registry, &broker, &store, &recorder);

        let mut headers = Headers::new();
        headers.insert(TYPE_HEADER, "order.cancelled");
        broker.deliver("order", Frame::new(headers, b"{}".to_vec()));

        let outcome = consumer.consume(&next_delivery(&broker).await).await.unwrap();
        assert_eq!(outcome, ConsumeOutcome::DeadLettered);

        let failed = broker.sent("failed");
        assert_eq!(failed.len(), 1);
        assert!(
            failed[0]
                .frame
                .headers
                .get(FAILURE_REASON_HEADER)
                .unwrap()
                .contains("order.cancelled")
        );
        assert_eq!(broker.rejected().len(), 1);
        assert!(store.is_empty());
    }

    /// Store whose connection drops at `begin` or at `commit`.
    struct Unreachable {
        inner: InMemoryDeduplicationStore,
        fail_begin: bool,
    }

    #[async_trait::async_trait]
    impl DeduplicationStore for Unreachable {
        type Error = tower::BoxError;
        type Transaction = InMemoryTransaction;

        async fn begin(&self) -> Result<Self::Transaction, Self::Error> {
            if self.fail_begin {
                return Err("connection lost".into());
            }
            Ok(self.inner.begin().await?)
        }

        async fn check_and_mark(
            &self,
            tx: &mut Self::Transaction,
            message_id: MessageId,
            message_name: &str,
        ) -> Result<bool, Self::Error> {
            Ok(self.inner.check_and_mark(tx, message_id, message_name).await?)
        }

        async fn commit(&self, tx: Self::Transaction) -> Result<(), Self::Error> {
            drop(tx);
            Err("connection lost".into())
        }

        async fn rollback(&self, tx: Self::Transaction) -> Result<(), Self::Error> {
            Ok(self.inner.rollback(tx).await?)
        }

        async fn purge_older_than(
            &self,
            cutoff: chrono::DateTime<chrono::Utc>,
        ) -> Result<u64, Self::Error> {
            Ok(self.inner.purge_older_than(cutoff).await?)
        }
    }

    #[derive(Default)]
    struct ErrorCount(AtomicUsize);

    impl ConsumerHook for Arc<ErrorCount> {
        fn on_startup(&self) {}
        fn on_shutdown(&self) {}
        fn on_delivery(&self, _delivery: &Delivery) {}
        fn on_handled(&self, _id: MessageId) {}
        fn on_duplicate(&self, _id: MessageId) {}
        fn on_dead_lettered(&self, _delivery: &Delivery, _reason: &str) {}
        fn on_consume_error(&self, _error: &ConsumeError) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn consume_with_unreachable_store(fail_begin: bool) {
        let registry = registry();
        let broker = InMemoryBroker::default();
        let recorder = Arc::new(Recorder::default());
        let errors = Arc::new(ErrorCount::default());
        let store = Arc::new(Unreachable {
            inner: InMemoryDeduplicationStore::default(),
            fail_begin,
        });
        let handlers = Handlers::new(registry.clone()).on::<OrderPlaced, _>(recorder.clone());
        let consumer = Consumer::new(
            broker.receiver("order"),
            store.clone(),
            Translator::new(registry.clone()),
            handlers,
        )
        .with_hook(errors.clone());
        publish(&registry, &broker, "o-1").await;

        let err = consumer
            .consume(&next_delivery(&broker).await)
            .await
            .unwrap_err();

        assert!(matches!(err.kind(), ConsumeErrorKind::Store(_)));
        assert!(!err.is_receiver_failure());
        assert_eq!(errors.0.load(Ordering::SeqCst), 1);
        assert_eq!(broker.unsettled(), 0);
        assert_eq!(broker.pending("order"), 1);
        assert!(store.inner.is_empty());
    }

    #[tokio::test]
    async fn store_failure_at_begin_requeues_and_reports() {
        consume_with_unreachable_store(true).await;
    }

    #[tokio::test]
    async fn store_failure_at_commit_requeues_and_reports() {
        consume_with_unreachable_store(false).await;
    }

    #[tokio::test]
    async fn undecodable_body_is_dead_lettered() {
        let registry = registry();
        let upstream = InMemoryBroker::default();
        publish(&registry, &upstream, "o-1").await;
        let mut frame = upstream.sent("order")[0].frame.clone();
        frame.body = br#"{"wrong":1}"#.to_vec();

        let broker = InMemoryBroker::default();
        let store = Arc::new(InMemoryDeduplicationStore::default());
        let recorder = Arc::new(Recorder::default());
        let consumer = consumer(&registry, &broker, &store, &recorder);
        broker.deliver("order", frame);

        let outcome = consumer.consume(&next_delivery(&broker).await).await.unwrap();
        assert_eq!(outcome, ConsumeOutcome::DeadLettered);

        let failed = broker.sent("failed");
        assert_eq!(failed.len(), 1);
        assert!(
            failed[0]
                .frame
                .headers
                .get(FAILURE_REASON_HEADER)
                .unwrap()
                .starts_with("undecodable")
        );
        assert_eq!(broker.rejected().len(), 1);
        assert_eq!(broker.pending("order"), 0);
        assert!(recorder.handled.lock().unwrap().is_empty());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn run_consumes_until_cancelled() {
        let registry = registry();
        let broker = InMemoryBroker::default();
        let store = Arc::new(InMemoryDeduplicationStore::default());
        let recorder = Arc::new(Recorder::default());
        let consumer = consumer(&registry, &broker, &store, &recorder);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(consumer.run(cancel.clone()));
        publish(&registry, &broker, "o-1").await;
        publish(&registry, &broker, "o-2").await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(
            *recorder.handled.lock().unwrap(),
            vec!["o-1".to_owned(), "o-2".to_owned()]
        );
    }
}
