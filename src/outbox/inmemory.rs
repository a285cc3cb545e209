use async_trait::async_trait;
use chrono::Utc;
use std::{
    collections::{BTreeMap, HashSet},
    convert::Infallible,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use crate::{
    outbox::{
        AcknowledgeMessages, AppendMessages, ClaimMessages, DEFAULT_REDELIVER_TIMEOUT, OutboxRow,
        PendingMessage, SequenceId, Setup, redeliver_limit,
    },
    transaction::InMemoryTransaction,
};

/// An in-memory outbox for testing or local usage.
///
/// Rows are staged in the caller's [`InMemoryTransaction`] and become visible
/// when it commits. Claims follow the same head-of-line rule as the SQL
/// backend: the mutex plays the role of the row lock.
#[derive(Clone)]
pub struct InMemoryOutbox {
    state: Arc<Mutex<State>>,
    redeliver_timeout: Duration,
}

#[derive(Default)]
struct State {
    next_id: SequenceId,
    rows: BTreeMap<SequenceId, OutboxRow>,
}

impl Default for InMemoryOutbox {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                next_id: 1,
                rows: BTreeMap::new(),
            })),
            redeliver_timeout: DEFAULT_REDELIVER_TIMEOUT,
        }
    }
}

impl InMemoryOutbox {
    /// Set how long a claim may stay unacknowledged before the row can be
    /// claimed again.
    pub fn with_redeliver_timeout(mut self, timeout: Duration) -> Self {
        self.redeliver_timeout = timeout;
        self
    }

    /// Snapshot of the committed rows, in sequence order.
    pub fn rows(&self) -> Vec<OutboxRow> {
        lock(&self.state).rows.values().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.state).rows.is_empty()
    }
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl AppendMessages for InMemoryOutbox {
    type Error = Infallible;
    type Transaction<'a> = InMemoryTransaction;

    async fn append(
        &self,
        message: PendingMessage,
        tx: &mut Self::Transaction<'_>,
    ) -> Result<SequenceId, Self::Error> {
        let id = {
            let mut state = lock(&self.state);
            let id = state.next_id;
            state.next_id += 1;
            id
        };

        let row = OutboxRow {
            id,
            body: message.body,
            headers: message.headers,
            partition_key: message.partition_key,
            created_at: Utc::now(),
            available_at: message.available_at,
            delivered_at: None,
        };
        let state = Arc::clone(&self.state);
        tx.on_commit(move || {
            lock(&state).rows.insert(id, row);
        });
        Ok(id)
    }
}

#[async_trait]
impl ClaimMessages for InMemoryOutbox {
    type Error = Infallible;

    #[tracing::instrument(skip_all)]
    async fn claim(&self) -> Result<Option<OutboxRow>, Self::Error> {
        let now = Utc::now();
        let redeliver_limit = redeliver_limit(now, self.redeliver_timeout);

        let mut state = lock(&self.state);
        let mut seen_partitions = HashSet::new();
        let mut claimable = None;
        for row in state.rows.values() {
            if !row.partition_key.is_empty() && !seen_partitions.insert(row.partition_key.clone())
            {
                continue;
            }
            let unclaimed = row.delivered_at.is_none_or(|at| at < redeliver_limit);
            if unclaimed && row.available_at <= now {
                claimable = Some(row.id);
                break;
            }
        }

        Ok(claimable.and_then(|id| {
            let row = state.rows.get_mut(&id)?;
            row.delivered_at = Some(now);
            Some(row.clone())
        }))
    }
}

#[async_trait]
impl AcknowledgeMessages for InMemoryOutbox {
    type Error = Infallible;

    async fn acknowledge(&self, id: SequenceId) -> Result<(), Self::Error> {
        lock(&self.state).rows.remove(&id);
        Ok(())
    }
}

#[async_trait]
impl Setup for InMemoryOutbox {
    type Error = Infallible;

    async fn setup(&self) -> Result<(), Self::Error> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Headers;

    fn pending(body: &str, partition_key: &str) -> PendingMessage {
        PendingMessage {
            body: body.as_bytes().to_vec(),
            headers: Headers::new(),
            partition_key: partition_key.to_owned(),
            available_at: Utc::now(),
        }
    }

    async fn append_committed(outbox: &InMemoryOutbox, rows: &[(&str, &str)]) -> Vec<SequenceId> {
        let mut tx = InMemoryTransaction::begin();
        let mut ids = Vec::new();
        for (body, key) in rows {
            ids.push(outbox.append(pending(body, key), &mut tx).await.unwrap());
        }
        tx.commit();
        ids
    }

    #[tokio::test]
    async fn rows_are_invisible_until_commit() {
        let outbox = InMemoryOutbox::default();
        let mut tx = InMemoryTransaction::begin();
        outbox.append(pending("m1", ""), &mut tx).await.unwrap();

        assert!(outbox.claim().await.unwrap().is_none());
        tx.rollback();
        assert!(outbox.is_empty());
    }

    #[tokio::test]
    async fn partition_head_blocks_successors_until_acknowledged() {
        let outbox = InMemoryOutbox::default();
        let ids = append_committed(
            &outbox,
            &[("m1", "order-1"), ("m2", "order-1"), ("m3", "order-1")],
        )
        .await;

        let first = outbox.claim().await.unwrap().unwrap();
        assert_eq!(first.id, ids[0]);
        assert!(outbox.claim().await.unwrap().is_none());

        outbox.acknowledge(first.id).await.unwrap();
        let second = outbox.claim().await.unwrap().unwrap();
        assert_eq!(second.id, ids[1]);

        outbox.acknowledge(second.id).await.unwrap();
        assert_eq!(outbox.claim().await.unwrap().unwrap().id, ids[2]);
    }

    #[tokio::test]
    async fn distinct_partitions_are_claimed_independently() {
        let outbox = InMemoryOutbox::default();
        let ids = append_committed(&outbox, &[("a1", "a"), ("a2", "a"), ("b1", "b")]).await;

        let first = outbox.claim().await.unwrap().unwrap();
        let second = outbox.claim().await.unwrap().unwrap();
        assert_eq!((first.id, second.id), (ids[0], ids[2]));
        assert!(outbox.claim().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn empty_partition_rows_are_independent() {
        let outbox = InMemoryOutbox::default();
        append_committed(&outbox, &[("m1", ""), ("m2", "")]).await;

        assert!(outbox.claim().await.unwrap().is_some());
        assert!(outbox.claim().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn expired_claim_returns_same_head() {
        let outbox = InMemoryOutbox::default().with_redeliver_timeout(Duration::from_millis(20));
        let ids = append_committed(&outbox, &[("m1", "order-1"), ("m2", "order-1")]).await;

        assert_eq!(outbox.claim().await.unwrap().unwrap().id, ids[0]);
        assert!(outbox.claim().await.unwrap().is_none());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(outbox.claim().await.unwrap().unwrap().id, ids[0]);
    }

    #[tokio::test]
    async fn delayed_head_holds_back_partition() {
        let outbox = InMemoryOutbox::default();
        let mut tx = InMemoryTransaction::begin();
        let mut delayed = pending("m1", "order-1");
        delayed.available_at = Utc::now() + chrono::Duration::seconds(60);
        outbox.append(delayed, &mut tx).await.unwrap();
        outbox.append(pending("m2", "order-1"), &mut tx).await.unwrap();
        tx.commit();

        assert!(outbox.claim().await.unwrap().is_none());
    }
}
