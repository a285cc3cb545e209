//! Submission side of the outbox.
//!
//! The [`Bus`] turns a typed message into an [`Envelope`] of [`Payload`],
//! runs it through the submission [`Pipeline`] and appends the result to the
//! [`Outbox`] inside the caller's transaction.

use std::sync::Arc;

use crate::{
    Envelope,
    envelope::{Message, Payload},
    outbox::{AppendMessages, Outbox},
    pipeline::{DispatchError, MessageIdStage, MessageNameStage, Outcome, Pipeline, Stage},
    registry::MessageRegistry,
    stamp::{PartitionKeyStamp, Stamps},
};

/// Dispatches messages into the outbox.
///
/// The default pipeline attaches a message id and the registered semantic
/// name. Additional stages run after those two.
pub struct Bus<D> {
    registry: Arc<MessageRegistry>,
    pipeline: Pipeline<()>,
    outbox: Outbox<D>,
}

impl<D> Bus<D> {
    pub fn new(registry: Arc<MessageRegistry>, outbox: Outbox<D>) -> Self {
        let pipeline = Pipeline::new()
            .with_stage(MessageIdStage)
            .with_stage(MessageNameStage::new(registry.clone()));
        Self {
            registry,
            pipeline,
            outbox,
        }
    }

    pub fn with_stage(mut self, stage: impl Stage<()> + 'static) -> Self {
        self.pipeline = self.pipeline.with_stage(stage);
        self
    }

    pub fn outbox(&self) -> &Outbox<D> {
        &self.outbox
    }

    pub fn registry(&self) -> &Arc<MessageRegistry> {
        &self.registry
    }
}

impl<D> Bus<D>
where
    D: AppendMessages + Sync,
    D::Error: Into<tower::BoxError>,
{
    /// Dispatch `message` with no caller-provided stamps.
    pub async fn dispatch<M: Message>(
        &self,
        message: &M,
        tx: &mut D::Transaction<'_>,
    ) -> Result<Envelope<Payload>, DispatchError> {
        self.dispatch_with(message, Stamps::new(), tx).await
    }

    /// Dispatch `message` with extra stamps.
    ///
    /// Returns the envelope as stored. When a stage stops the pipeline, the
    /// envelope is returned without being appended.
    #[tracing::instrument(skip_all, fields(message_type = std::any::type_name::<M>()))]
    pub async fn dispatch_with<M: Message>(
        &self,
        message: &M,
        mut stamps: Stamps,
        tx: &mut D::Transaction<'_>,
    ) -> Result<Envelope<Payload>, DispatchError> {
        if stamps.partition_key().is_empty() {
            if let Some(key) = message.partition_key() {
                stamps.push(PartitionKeyStamp { key });
            }
        }

        let payload = Payload::encode(self.registry.identity_of::<M>(), message)?;
        let envelope = Envelope::from((stamps, payload));

        match self.pipeline.run(envelope, &mut ()).await? {
            Outcome::Completed(envelope) => {
                self.outbox.append([envelope.clone()], tx).await?;
                Ok(envelope)
            }
            Outcome::Stopped(envelope) => {
                tracing::debug!("Dispatch stopped by pipeline");
                Ok(envelope)
            }
        }
    }
}
