//! Outbox abstractions and backend drivers.
//!
//! This module implements the *outbox pattern*: messages are appended to a
//! durable store in the same transaction as the business write that produced
//! them, and are later claimed and published by a separate worker.
//!
//! The outbox is responsible for **durability and per-partition ordering**,
//! while delivery concerns are delegated to the
//! [`OutboxPublisher`](crate::publisher::OutboxPublisher) and transport layers.
//!
//! ## Claiming
//!
//! Only the oldest unacknowledged row of a partition is ever eligible for
//! claim. A claimed row stays claimed until it is acknowledged (deleted) or
//! its claim outlives the redelivery timeout, at which point any worker may
//! claim it again. Rows with an empty partition key are independent of each
//! other.
//!
//! ## Components
//!
//! - [`Outbox`]: High-level façade encoding envelopes into rows
//! - [`AppendMessages`]: Trait for appending rows inside a caller transaction
//! - [`ClaimMessages`]: Trait for the head-of-line claim
//! - [`AcknowledgeMessages`]: Trait for deleting published rows
//! - [`Setup`]: Trait for idempotent first-use schema creation
//!
//! Concrete implementations are provided by backend modules such as
//! [`inmemory`] and [`sqlx`] (feature-gated).

pub mod inmemory;

#[cfg(feature = "sqlx")]
pub mod sqlx;

use chrono::{DateTime, Utc};
use tracing::instrument;
use tracing_error::SpanTrace;

use crate::{
    Envelope,
    codec::{CodecError, Frame, Headers, NativeCodec},
    envelope::Payload,
};

/// Store-assigned, monotonically increasing row id.
pub type SequenceId = i64;

/// Default redelivery timeout: one hour.
pub const DEFAULT_REDELIVER_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(3600);

/// Default logical queue name.
pub const DEFAULT_QUEUE_NAME: &str = "default";

/// Claims made before the returned instant have expired.
pub(crate) fn redeliver_limit(
    now: DateTime<Utc>,
    redeliver_timeout: std::time::Duration,
) -> DateTime<Utc> {
    chrono::Duration::from_std(redeliver_timeout)
        .ok()
        .and_then(|timeout| now.checked_sub_signed(timeout))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// A row about to be appended.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingMessage {
    pub body: Vec<u8>,
    pub headers: Headers,
    pub partition_key: String,
    pub available_at: DateTime<Utc>,
}

/// A row as stored in the outbox.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxRow {
    pub id: SequenceId,
    pub body: Vec<u8>,
    pub headers: Headers,
    pub partition_key: String,
    pub created_at: DateTime<Utc>,
    pub available_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
}

impl OutboxRow {
    pub fn frame(&self) -> Frame {
        Frame::new(self.headers.clone(), self.body.clone())
    }
}

/// Error returned by outbox operations.
///
/// Wraps the underlying backend error and captures a tracing span backtrace
/// for improved diagnostics.
#[derive(Debug)]
pub struct OutboxError {
    context: SpanTrace,
    kind: OutboxErrorKind,
}

#[derive(Debug)]
pub enum OutboxErrorKind {
    /// The storage backend failed.
    Backend(tower::BoxError),
    /// The envelope could not be encoded.
    Codec(CodecError),
}

impl OutboxError {
    /// Create a backend-related outbox error.
    fn backend(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: OutboxErrorKind::Backend(err),
        }
    }

    pub fn kind(&self) -> &OutboxErrorKind {
        &self.kind
    }
}

impl From<CodecError> for OutboxError {
    fn from(err: CodecError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: OutboxErrorKind::Codec(err),
        }
    }
}

impl std::fmt::Display for OutboxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            OutboxErrorKind::Backend(err) => writeln!(f, "Backend error: {err}"),
            OutboxErrorKind::Codec(err) => writeln!(f, "Codec error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for OutboxError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            OutboxErrorKind::Backend(err) => Some(err.as_ref()),
            OutboxErrorKind::Codec(err) => Some(err),
        }
    }
}

/// High-level façade over an outbox backend.
///
/// `Outbox` provides a stable, ergonomic API for appending envelopes while
/// delegating persistence to the underlying backend.
#[derive(Debug, Clone)]
pub struct Outbox<D> {
    driver: D,
    codec: NativeCodec,
}

impl<D> Outbox<D> {
    /// Create a new outbox backed by the given backend implementation.
    pub fn new(driver: D) -> Self {
        Self {
            driver,
            codec: NativeCodec,
        }
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Append envelopes to the outbox.
    ///
    /// Envelopes are stored but **not** sent. Delivery is handled
    /// asynchronously by a publisher. The rows commit or roll back together
    /// with `tx`, which is typically the transaction carrying the business
    /// write that produced the messages.
    ///
    /// Returns the sequence ids assigned by the store, in input order.
    #[instrument(skip_all)]
    pub async fn append(
        &self,
        envelopes: impl IntoIterator<Item = Envelope<Payload>>,
        tx: &mut D::Transaction<'_>,
    ) -> Result<Vec<SequenceId>, OutboxError>
    where
        D: AppendMessages,
        D::Error: Into<tower::BoxError>,
    {
        let mut ids = Vec::new();
        for envelope in envelopes {
            let frame = self.codec.encode(&envelope)?;
            let mut available_at = Utc::now();
            if let Some(delay) = envelope.stamps.delay() {
                available_at += chrono::Duration::from_std(delay)
                    .map_err(|e| OutboxError::backend(e.into()))?;
            }
            let message = PendingMessage {
                body: frame.body,
                headers: frame.headers,
                partition_key: envelope.stamps.partition_key().to_owned(),
                available_at,
            };

            let id = self
                .driver
                .append(message, tx)
                .await
                .map_err(|e| OutboxError::backend(e.into()))?;
            tracing::debug!(id, "Message appended to outbox");
            ids.push(id);
        }
        Ok(ids)
    }
}

/// Trait for appending rows to the outbox.
///
/// Implementations must write through the caller's transaction so the row
/// commits atomically with the business write.
#[async_trait::async_trait]
pub trait AppendMessages {
    /// Backend-specific error type.
    type Error;
    /// Transaction type used for atomic insertion.
    type Transaction<'a>;

    /// Append one row and return its sequence id.
    async fn append(
        &self,
        message: PendingMessage,
        tx: &mut Self::Transaction<'_>,
    ) -> Result<SequenceId, Self::Error>;
}

/// Trait for the head-of-line claim.
#[async_trait::async_trait]
pub trait ClaimMessages {
    /// Backend-specific error type.
    type Error;

    /// Claim the oldest eligible row of some partition, if any.
    ///
    /// Eligible rows are partition heads whose `available_at` has passed and
    /// which are either unclaimed or whose claim exceeded the redelivery
    /// timeout. The claim marks `delivered_at` and is committed before
    /// returning.
    async fn claim(&self) -> Result<Option<OutboxRow>, Self::Error>;
}

/// Trait for removing rows once they have been handed off.
#[async_trait::async_trait]
pub trait AcknowledgeMessages {
    /// Backend-specific error type.
    type Error;

    /// Delete a published row.
    async fn acknowledge(&self, id: SequenceId) -> Result<(), Self::Error>;

    /// Delete a row that will not be published. Routing it elsewhere is the
    /// caller's concern.
    async fn reject(&self, id: SequenceId) -> Result<(), Self::Error> {
        self.acknowledge(id).await
    }
}

/// Trait for first-use schema creation. Must be idempotent.
#[async_trait::async_trait]
pub trait Setup {
    type Error;

    async fn setup(&self) -> Result<(), Self::Error>;
}
