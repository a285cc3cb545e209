//! Ordered chain of stages applied to envelopes.
//!
//! Each [`Stage`] receives the envelope and returns a [`Flow`]: either
//! continue with a (possibly modified) envelope, or stop the chain and return
//! the envelope as the final result. Stages are generic over a context `C`,
//! which is the transaction on the inbox side and `()` at submission time.
//!
//! Built-in stages:
//!
//! - [`MessageIdStage`]: attaches a fresh [`MessageIdStamp`] when absent
//! - [`MessageNameStage`]: attaches the registered semantic name when absent
//! - [`DeduplicationStage`]: admits the envelope through a
//!   [`DeduplicationStore`], stopping duplicates

use std::sync::Arc;

use async_trait::async_trait;
use tracing_error::SpanTrace;

use crate::{
    Envelope,
    envelope::Payload,
    inbox::DeduplicationStore,
    registry::MessageRegistry,
    stamp::{MessageId, MessageIdStamp, MessageNameStamp},
};

/// Outcome of a single stage.
#[derive(Debug, Clone, PartialEq)]
pub enum Flow {
    /// Hand the envelope to the next stage.
    Continue(Envelope<Payload>),
    /// End the chain here with this envelope.
    Stop(Envelope<Payload>),
}

/// Outcome of a whole pipeline run.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Every stage let the envelope through.
    Completed(Envelope<Payload>),
    /// A stage stopped the chain.
    Stopped(Envelope<Payload>),
}

#[async_trait]
pub trait Stage<C: Send>: Send + Sync {
    async fn process(
        &self,
        envelope: Envelope<Payload>,
        context: &mut C,
    ) -> Result<Flow, DispatchError>;
}

/// An ordered list of stages.
pub struct Pipeline<C> {
    stages: Vec<Arc<dyn Stage<C>>>,
}

impl<C> Clone for Pipeline<C> {
    fn clone(&self) -> Self {
        Self {
            stages: self.stages.clone(),
        }
    }
}

impl<C> Default for Pipeline<C> {
    fn default() -> Self {
        Self { stages: Vec::new() }
    }
}

impl<C: Send> Pipeline<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stage(mut self, stage: impl Stage<C> + 'static) -> Self {
        self.stages.push(Arc::new(stage));
        self
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub async fn run(
        &self,
        mut envelope: Envelope<Payload>,
        context: &mut C,
    ) -> Result<Outcome, DispatchError> {
        for stage in &self.stages {
            match stage.process(envelope, context).await? {
                Flow::Continue(next) => envelope = next,
                Flow::Stop(last) => return Ok(Outcome::Stopped(last)),
            }
        }
        Ok(Outcome::Completed(envelope))
    }
}

/// Attaches a new message id unless the envelope already has one.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageIdStage;

#[async_trait]
impl<C: Send> Stage<C> for MessageIdStage {
    async fn process(
        &self,
        mut envelope: Envelope<Payload>,
        _context: &mut C,
    ) -> Result<Flow, DispatchError> {
        if envelope.stamps.message_id().is_none() {
            envelope.stamps.push(MessageIdStamp {
                id: MessageId::new(),
            });
        }
        Ok(Flow::Continue(envelope))
    }
}

/// Attaches the semantic name registered for the payload's identity.
///
/// Envelopes that already carry a name keep it. An unnamed envelope whose
/// identity is not registered is refused.
#[derive(Debug, Clone)]
pub struct MessageNameStage {
    registry: Arc<MessageRegistry>,
}

impl MessageNameStage {
    pub fn new(registry: Arc<MessageRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl<C: Send> Stage<C> for MessageNameStage {
    async fn process(
        &self,
        mut envelope: Envelope<Payload>,
        _context: &mut C,
    ) -> Result<Flow, DispatchError> {
        if envelope.stamps.message_name().is_none() {
            let identity = envelope.message.type_name();
            let name = self
                .registry
                .name_of(identity)
                .ok_or_else(|| DispatchError::unregistered(identity))?;
            envelope.stamps.push(MessageNameStamp {
                name: name.to_owned(),
            });
        }
        Ok(Flow::Continue(envelope))
    }
}

/// Admits envelopes through a [`DeduplicationStore`] inside the handler's
/// transaction. Already admitted identities stop the chain.
pub struct DeduplicationStage<S> {
    store: Arc<S>,
}

impl<S> DeduplicationStage<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<S> Stage<S::Transaction> for DeduplicationStage<S>
where
    S: DeduplicationStore + 'static,
{
    #[tracing::instrument(skip_all)]
    async fn process(
        &self,
        envelope: Envelope<Payload>,
        tx: &mut S::Transaction,
    ) -> Result<Flow, DispatchError> {
        let id = envelope
            .stamps
            .message_id()
            .ok_or_else(|| DispatchError::missing_stamp("MessageIdStamp"))?;
        let name = envelope
            .stamps
            .message_name()
            .unwrap_or_else(|| envelope.message.type_name());

        let duplicate = self
            .store
            .check_and_mark(tx, id, name)
            .await
            .map_err(|e| DispatchError::store(e.into()))?;

        if duplicate {
            tracing::info!(%id, "Duplicate message skipped");
            Ok(Flow::Stop(envelope))
        } else {
            Ok(Flow::Continue(envelope))
        }
    }
}

/// Error raised by a pipeline stage.
#[derive(Debug)]
pub struct DispatchError {
    context: SpanTrace,
    kind: DispatchErrorKind,
}

#[derive(Debug)]
pub enum DispatchErrorKind {
    /// A stamp the stage depends on is absent.
    MissingStamp(&'static str),
    /// No semantic name is registered for the payload's identity.
    Unregistered(String),
    /// The deduplication store failed.
    Store(tower::BoxError),
    /// The payload could not be (de)serialized.
    Serde(serde_json::Error),
    /// The outbox rejected the envelope.
    Outbox(crate::outbox::OutboxError),
    /// A custom stage failed.
    Stage(tower::BoxError),
}

impl DispatchError {
    pub(crate) fn missing_stamp(stamp: &'static str) -> Self {
        Self::new(DispatchErrorKind::MissingStamp(stamp))
    }

    pub(crate) fn unregistered(identity: &str) -> Self {
        Self::new(DispatchErrorKind::Unregistered(identity.to_owned()))
    }

    pub(crate) fn store(err: tower::BoxError) -> Self {
        Self::new(DispatchErrorKind::Store(err))
    }

    /// Create an error for a custom stage.
    pub fn stage(err: impl Into<tower::BoxError>) -> Self {
        Self::new(DispatchErrorKind::Stage(err.into()))
    }

    fn new(kind: DispatchErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }

    pub fn kind(&self) -> &DispatchErrorKind {
        &self.kind
    }
}

impl From<serde_json::Error> for DispatchError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(DispatchErrorKind::Serde(err))
    }
}

impl From<crate::outbox::OutboxError> for DispatchError {
    fn from(err: crate::outbox::OutboxError) -> Self {
        Self::new(DispatchErrorKind::Outbox(err))
    }
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            DispatchErrorKind::MissingStamp(stamp) => writeln!(f, "Missing stamp: {stamp}"),
            DispatchErrorKind::Unregistered(identity) => {
                writeln!(f, "No semantic name registered for {identity}")
            }
            DispatchErrorKind::Store(err) => writeln!(f, "Deduplication store error: {err}"),
            DispatchErrorKind::Serde(err) => writeln!(f, "Serde error: {err}"),
            DispatchErrorKind::Outbox(err) => writeln!(f, "Outbox error: {err}"),
            DispatchErrorKind::Stage(err) => writeln!(f, "Stage error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for DispatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            DispatchErrorKind::MissingStamp(_) | DispatchErrorKind::Unregistered(_) => None,
            DispatchErrorKind::Store(err) => Some(err.as_ref()),
            DispatchErrorKind::Serde(err) => Some(err),
            DispatchErrorKind::Outbox(err) => Some(err),
            DispatchErrorKind::Stage(err) => Some(err.as_ref()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        envelope::Message, inbox::inmemory::InMemoryDeduplicationStore,
        transaction::InMemoryTransaction,
    };
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    struct OrderPlaced;
    impl Message for OrderPlaced {}

    fn registry() -> Arc<MessageRegistry> {
        Arc::new(
            MessageRegistry::builder()
                .register_as::<OrderPlaced>("shop::OrderPlaced", "order.placed")
                .unwrap()
                .build(),
        )
    }

    fn payload() -> Envelope<Payload> {
        Envelope::new(Payload::new("shop::OrderPlaced", serde_json::json!(null)))
    }

    struct Halt;

    #[async_trait]
    impl Stage<()> for Halt {
        async fn process(
            &self,
            envelope: Envelope<Payload>,
            _context: &mut (),
        ) -> Result<Flow, DispatchError> {
            Ok(Flow::Stop(envelope))
        }
    }

    #[tokio::test]
    async fn stamping_stages_attach_identity_and_name() {
        let pipeline = Pipeline::<()>::new()
            .with_stage(MessageIdStage)
            .with_stage(MessageNameStage::new(registry()));

        let Outcome::Completed(envelope) = pipeline.run(payload(), &mut ()).await.unwrap() else {
            panic!("pipeline stopped");
        };
        assert!(envelope.stamps.message_id().is_some());
        assert_eq!(envelope.stamps.message_name(), Some("order.placed"));
    }

    #[tokio::test]
    async fn existing_stamps_are_never_replaced() {
        let id = MessageId::new();
        let envelope = payload()
            .with_stamp(MessageIdStamp { id })
            .with_stamp(MessageNameStamp {
                name: "legacy.order".into(),
            });
        let pipeline = Pipeline::<()>::new()
            .with_stage(MessageIdStage)
            .with_stage(MessageNameStage::new(registry()));

        let Outcome::Completed(envelope) = pipeline.run(envelope, &mut ()).await.unwrap() else {
            panic!("pipeline stopped");
        };
        assert_eq!(envelope.stamps.message_id(), Some(id));
        assert_eq!(envelope.stamps.message_name(), Some("legacy.order"));
        assert_eq!(envelope.stamps.len(), 2);
    }

    #[tokio::test]
    async fn unnamed_unregistered_identity_is_refused() {
        let pipeline = Pipeline::<()>::new().with_stage(MessageNameStage::new(registry()));
        let envelope = Envelope::new(Payload::new("shop::OrderShipped", serde_json::json!(null)));

        let err = pipeline.run(envelope, &mut ()).await.unwrap_err();
        assert!(matches!(
            err.kind(),
            DispatchErrorKind::Unregistered(identity) if identity == "shop::OrderShipped"
        ));
    }

    #[tokio::test]
    async fn stop_short_circuits_later_stages() {
        let pipeline = Pipeline::<()>::new()
            .with_stage(Halt)
            .with_stage(MessageIdStage);

        let Outcome::Stopped(envelope) = pipeline.run(payload(), &mut ()).await.unwrap() else {
            panic!("pipeline completed");
        };
        assert!(envelope.stamps.message_id().is_none());
    }

    #[tokio::test]
    async fn deduplication_stage_stops_second_delivery() {
        let store = Arc::new(InMemoryDeduplicationStore::default());
        let pipeline =
            Pipeline::<InMemoryTransaction>::new().with_stage(DeduplicationStage::new(store.clone()));
        let envelope = payload().with_stamp(MessageIdStamp {
            id: MessageId::new(),
        });

        let mut tx = store.begin().await.unwrap();
        let first = pipeline.run(envelope.clone(), &mut tx).await.unwrap();
        store.commit(tx).await.unwrap();
        assert!(matches!(first, Outcome::Completed(_)));

        let mut tx = store.begin().await.unwrap();
        let second = pipeline.run(envelope, &mut tx).await.unwrap();
        store.commit(tx).await.unwrap();
        assert!(matches!(second, Outcome::Stopped(_)));
    }

    #[tokio::test]
    async fn deduplication_stage_requires_message_id() {
        let store = Arc::new(InMemoryDeduplicationStore::default());
        let pipeline =
            Pipeline::<InMemoryTransaction>::new().with_stage(DeduplicationStage::new(store.clone()));

        let mut tx = store.begin().await.unwrap();
        let err = pipeline.run(payload(), &mut tx).await.unwrap_err();
        assert!(matches!(err.kind(), DispatchErrorKind::MissingStamp("MessageIdStamp")));
    }
}
