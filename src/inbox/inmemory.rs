use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{
    collections::HashMap,
    convert::Infallible,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use crate::{
    inbox::{DeduplicationRecord, DeduplicationStore},
    stamp::MessageId,
    transaction::InMemoryTransaction,
};

/// An in-memory deduplication store for testing or local usage.
///
/// The record is inserted immediately under the mutex, which makes
/// concurrent admissions of one identity race to a single winner. Rolling
/// back the transaction removes the record again.
#[derive(Clone, Default)]
pub struct InMemoryDeduplicationStore {
    records: Arc<Mutex<HashMap<MessageId, DeduplicationRecord>>>,
}

impl InMemoryDeduplicationStore {
    pub fn contains(&self, message_id: MessageId) -> bool {
        lock(&self.records).contains_key(&message_id)
    }

    pub fn len(&self) -> usize {
        lock(&self.records).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn lock(
    records: &Mutex<HashMap<MessageId, DeduplicationRecord>>,
) -> MutexGuard<'_, HashMap<MessageId, DeduplicationRecord>> {
    records.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl DeduplicationStore for InMemoryDeduplicationStore {
    type Error = Infallible;
    type Transaction = InMemoryTransaction;

    async fn begin(&self) -> Result<Self::Transaction, Self::Error> {
        Ok(InMemoryTransaction::begin())
    }

    #[tracing::instrument(skip(self, tx))]
    async fn check_and_mark(
        &self,
        tx: &mut Self::Transaction,
        message_id: MessageId,
        message_name: &str,
    ) -> Result<bool, Self::Error> {
        {
            let mut records = lock(&self.records);
            if records.contains_key(&message_id) {
                return Ok(true);
            }
            records.insert(
                message_id,
                DeduplicationRecord {
                    message_id,
                    message_name: message_name.to_owned(),
                    processed_at: Utc::now(),
                },
            );
        }

        let records = Arc::clone(&self.records);
        tx.on_rollback(move || {
            lock(&records).remove(&message_id);
        });
        Ok(false)
    }

    async fn commit(&self, tx: Self::Transaction) -> Result<(), Self::Error> {
        tx.commit();
        Ok(())
    }

    async fn rollback(&self, tx: Self::Transaction) -> Result<(), Self::Error> {
        tx.rollback();
        Ok(())
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, Self::Error> {
        let mut records = lock(&self.records);
        let before = records.len();
        records.retain(|_, record| record.processed_at >= cutoff);
        Ok((before - records.len()) as u64)
    }
}
