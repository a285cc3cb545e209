//! Inbox-side deduplication.
//!
//! A [`DeduplicationStore`] admits exactly one caller per message identity.
//! Admission is a single atomic insert performed inside the transaction that
//! also runs the handler: if the handler fails and the transaction rolls back,
//! the admission record rolls back with it and the message can be processed
//! again.
//!
//! Concrete implementations are provided by [`inmemory`] and [`sqlx`]
//! (feature-gated).

pub mod inmemory;

#[cfg(feature = "sqlx")]
pub mod sqlx;

use chrono::{DateTime, Utc};

use crate::stamp::MessageId;

/// A record of an admitted message identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeduplicationRecord {
    pub message_id: MessageId,
    pub message_name: String,
    pub processed_at: DateTime<Utc>,
}

/// Append-once idempotency ledger keyed by message identity.
#[async_trait::async_trait]
pub trait DeduplicationStore: Send + Sync {
    /// Backend-specific error type.
    type Error: Into<tower::BoxError> + Send;
    /// Transaction wrapping admission and handler execution.
    type Transaction: Send;

    /// Open the transaction that admission and handling share.
    async fn begin(&self) -> Result<Self::Transaction, Self::Error>;

    /// Try to admit `message_id`.
    ///
    /// Returns `false` when this call inserted the record: the caller owns
    /// the identity and must process the message in `tx`. Returns `true` when
    /// the identity was already admitted; the caller must not process it.
    async fn check_and_mark(
        &self,
        tx: &mut Self::Transaction,
        message_id: MessageId,
        message_name: &str,
    ) -> Result<bool, Self::Error>;

    async fn commit(&self, tx: Self::Transaction) -> Result<(), Self::Error>;

    async fn rollback(&self, tx: Self::Transaction) -> Result<(), Self::Error>;

    /// Delete records processed before `cutoff`. Returns the number removed.
    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, Self::Error>;
}
