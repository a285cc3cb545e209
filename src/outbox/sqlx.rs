use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Database, Pool, Row};
use std::{marker::PhantomData, time::Duration};

use crate::codec::Headers;
use crate::outbox::{
    AcknowledgeMessages, AppendMessages, ClaimMessages, DEFAULT_QUEUE_NAME,
    DEFAULT_REDELIVER_TIMEOUT, OutboxRow, PendingMessage, SequenceId, Setup, redeliver_limit,
};

/// Type alias for the Postgres outbox driver.
pub type PgSqlxOutbox = SqlxOutbox<sqlx::Postgres>;

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS outbox (
    id BIGSERIAL PRIMARY KEY,
    body BYTEA NOT NULL,
    headers JSONB NOT NULL,
    queue_name VARCHAR(190) NOT NULL,
    partition_key VARCHAR(255) NOT NULL DEFAULT '',
    created_at TIMESTAMPTZ NOT NULL,
    available_at TIMESTAMPTZ NOT NULL,
    delivered_at TIMESTAMPTZ
)";

const CREATE_INDEX: &str = "CREATE INDEX IF NOT EXISTS outbox_head_of_line_idx
    ON outbox (queue_name, partition_key, available_at, delivered_at, id)";

/// Selects the oldest claimable partition head and locks it. Rows locked by a
/// concurrent claim are skipped, never waited on.
const SELECT_HEAD: &str = "SELECT m.id, m.body, m.headers, m.partition_key,
        m.created_at, m.available_at, m.delivered_at
    FROM outbox m
    WHERE m.queue_name = $1
      AND m.available_at <= $2
      AND (m.delivered_at IS NULL OR m.delivered_at < $3)
      AND (m.partition_key = '' OR m.id = (
          SELECT MIN(h.id) FROM outbox h
          WHERE h.queue_name = m.queue_name AND h.partition_key = m.partition_key
      ))
    ORDER BY m.id
    LIMIT 1
    FOR UPDATE SKIP LOCKED";

/// Arbitrary key serializing concurrent schema creation.
const SETUP_LOCK_KEY: i64 = 0x6f75_7462_6f78;

/// SQLx-based outbox driver.
pub struct SqlxOutbox<DB>
where
    DB: Database,
{
    pool: Pool<DB>,
    queue_name: String,
    redeliver_timeout: Duration,
    _db_marker: PhantomData<DB>,
}

impl<DB> Clone for SqlxOutbox<DB>
where
    DB: Database,
{
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            queue_name: self.queue_name.clone(),
            redeliver_timeout: self.redeliver_timeout,
            _db_marker: PhantomData,
        }
    }
}

impl<DB> SqlxOutbox<DB>
where
    DB: Database,
{
    /// Creates a new outbox without touching the schema.
    pub fn new_uninitialized(pool: Pool<DB>) -> Self {
        Self {
            pool,
            queue_name: DEFAULT_QUEUE_NAME.to_owned(),
            redeliver_timeout: DEFAULT_REDELIVER_TIMEOUT,
            _db_marker: PhantomData,
        }
    }

    /// Sets the logical queue this driver appends to and claims from.
    pub fn with_queue_name(mut self, queue_name: impl Into<String>) -> Self {
        self.queue_name = queue_name.into();
        self
    }

    /// Sets how long a claim may stay unacknowledged before the row becomes
    /// claimable again. Must exceed the longest plausible publish.
    pub fn with_redeliver_timeout(mut self, timeout: Duration) -> Self {
        self.redeliver_timeout = timeout;
        self
    }
}

impl SqlxOutbox<sqlx::Postgres> {
    /// Creates a new Postgres outbox and ensures the table exists.
    #[tracing::instrument(skip_all)]
    pub async fn try_new(pool: sqlx::Pool<sqlx::Postgres>) -> Result<Self, Error> {
        let outbox = Self::new_uninitialized(pool);
        create_table(&outbox.pool).await?;
        Ok(outbox)
    }
}

#[async_trait]
impl AppendMessages for SqlxOutbox<sqlx::Postgres> {
    type Error = tower::BoxError;
    type Transaction<'a> = sqlx::PgTransaction<'a>;

    #[tracing::instrument(skip_all, fields(queue = %self.queue_name))]
    async fn append(
        &self,
        message: PendingMessage,
        tx: &mut Self::Transaction<'_>,
    ) -> Result<SequenceId, Self::Error> {
        let headers = serde_json::to_value(&message.headers).map_err(Error::from)?;

        let id: i64 = sqlx::query_scalar(
            "INSERT INTO outbox (body, headers, queue_name, partition_key, created_at, available_at)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING id",
        )
        .bind(message.body)
        .bind(headers)
        .bind(&self.queue_name)
        .bind(message.partition_key)
        .bind(Utc::now())
        .bind(message.available_at)
        .fetch_one(&mut **tx)
        .await
        .map_err(Error::from)?;

        Ok(id)
    }
}

#[async_trait]
impl ClaimMessages for SqlxOutbox<sqlx::Postgres> {
    type Error = tower::BoxError;

    #[tracing::instrument(skip_all, fields(queue = %self.queue_name))]
    async fn claim(&self) -> Result<Option<OutboxRow>, Self::Error> {
        Ok(self.claim_head().await?)
    }
}

impl SqlxOutbox<sqlx::Postgres> {
    async fn claim_head(&self) -> Result<Option<OutboxRow>, Error> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(SELECT_HEAD)
            .bind(&self.queue_name)
            .bind(now)
            .bind(redeliver_limit(now, self.redeliver_timeout))
            .fetch_optional(&mut *tx)
            .await?;

        let Some(row) = row else {
            tx.commit().await?;
            return Ok(None);
        };

        let id: i64 = row.try_get("id")?;
        sqlx::query("UPDATE outbox SET delivered_at = $1 WHERE id = $2")
            .bind(now)
            .bind(id)
            .execute(&mut *tx)
            .await?;

        let headers_json: serde_json::Value = row.try_get("headers")?;
        let claimed = OutboxRow {
            id,
            body: row.try_get("body")?,
            headers: serde_json::from_value::<Headers>(headers_json)?,
            partition_key: row.try_get("partition_key")?,
            created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
            available_at: row.try_get::<DateTime<Utc>, _>("available_at")?,
            delivered_at: Some(now),
        };

        tx.commit().await?;
        tracing::debug!(id, partition_key = %claimed.partition_key, "Outbox row claimed");
        Ok(Some(claimed))
    }
}

#[async_trait]
impl AcknowledgeMessages for SqlxOutbox<sqlx::Postgres> {
    type Error = tower::BoxError;

    #[tracing::instrument(skip(self))]
    async fn acknowledge(&self, id: SequenceId) -> Result<(), Self::Error> {
        sqlx::query("DELETE FROM outbox WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(Error::from)?;
        Ok(())
    }
}

#[async_trait]
impl Setup for SqlxOutbox<sqlx::Postgres> {
    type Error = Error;

    async fn setup(&self) -> Result<(), Self::Error> {
        create_table(&self.pool).await
    }
}

/// Ensures the outbox table and its head-of-line index exist.
///
/// Concurrent callers are serialized with a transaction-scoped advisory lock.
async fn create_table(pool: &sqlx::PgPool) -> Result<(), Error> {
    let mut tx = pool.begin().await?;
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(SETUP_LOCK_KEY)
        .execute(&mut *tx)
        .await?;
    sqlx::query(CREATE_TABLE).execute(&mut *tx).await?;
    sqlx::query(CREATE_INDEX).execute(&mut *tx).await?;
    tx.commit().await?;
    Ok(())
}

/// Sqlx outbox errors.
#[derive(Debug)]
pub struct Error {
    context: tracing_error::SpanTrace,
    kind: SqlxDriverErrorKind,
}

/// Kinds of SQLx outbox errors.
#[derive(Debug)]
pub enum SqlxDriverErrorKind {
    Database(sqlx::Error),
    Serde(serde_json::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            SqlxDriverErrorKind::Database(err) => writeln!(f, "Database error: {}", err),
            SqlxDriverErrorKind::Serde(err) => writeln!(f, "Serde error: {}", err),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            SqlxDriverErrorKind::Database(err) => Some(err),
            SqlxDriverErrorKind::Serde(err) => Some(err),
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Self {
            context: tracing_error::SpanTrace::capture(),
            kind: SqlxDriverErrorKind::Database(err),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self {
            context: tracing_error::SpanTrace::capture(),
            kind: SqlxDriverErrorKind::Serde(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::PgPool;

    fn pending(body: &str, partition_key: &str) -> PendingMessage {
        PendingMessage {
            body: body.as_bytes().to_vec(),
            headers: [("type", "test")].into_iter().collect(),
            partition_key: partition_key.to_owned(),
            available_at: Utc::now(),
        }
    }

    async fn append_committed(
        outbox: &PgSqlxOutbox,
        pool: &PgPool,
        rows: &[(&str, &str)],
    ) -> Vec<SequenceId> {
        let mut tx = pool.begin().await.unwrap();
        let mut ids = Vec::new();
        for (body, key) in rows {
            ids.push(outbox.append(pending(body, key), &mut tx).await.unwrap());
        }
        tx.commit().await.unwrap();
        ids
    }

    #[sqlx::test(migrations = false)]
    async fn setup_is_idempotent(pool: PgPool) {
        let outbox = SqlxOutbox::try_new(pool.clone()).await.unwrap();
        outbox.setup().await.unwrap();
        outbox.setup().await.unwrap();
    }

    #[sqlx::test(migrations = false)]
    async fn rolled_back_append_leaves_no_row(pool: PgPool) {
        let outbox = SqlxOutbox::try_new(pool.clone()).await.unwrap();

        let mut tx = pool.begin().await.unwrap();
        outbox.append(pending("m1", ""), &mut tx).await.unwrap();
        tx.rollback().await.unwrap();

        assert!(outbox.claim().await.unwrap().is_none());
    }

    #[sqlx::test(migrations = false)]
    async fn claims_follow_append_order_within_partition(pool: PgPool) {
        let outbox = SqlxOutbox::try_new(pool.clone()).await.unwrap();
        let ids = append_committed(
            &outbox,
            &pool,
            &[("m1", "order-1"), ("m2", "order-1"), ("m3", "order-1")],
        )
        .await;

        for expected in &ids {
            let claimed = outbox.claim().await.unwrap().unwrap();
            assert_eq!(claimed.id, *expected);
            assert!(outbox.claim().await.unwrap().is_none());
            outbox.acknowledge(claimed.id).await.unwrap();
        }
        assert!(outbox.claim().await.unwrap().is_none());
    }

    #[sqlx::test(migrations = false)]
    async fn concurrent_claims_take_distinct_partitions(pool: PgPool) {
        let outbox = SqlxOutbox::try_new(pool.clone()).await.unwrap();
        let ids = append_committed(&outbox, &pool, &[("a1", "a"), ("a2", "a"), ("b1", "b")]).await;

        let (first, second) = tokio::join!(outbox.claim(), outbox.claim());
        let mut claimed = vec![first.unwrap().unwrap().id, second.unwrap().unwrap().id];
        claimed.sort();

        assert_eq!(claimed, vec![ids[0], ids[2]]);
        assert!(outbox.claim().await.unwrap().is_none());
    }

    #[sqlx::test(migrations = false)]
    async fn expired_claim_is_reclaimed_before_successor(pool: PgPool) {
        let outbox = SqlxOutbox::try_new(pool.clone())
            .await
            .unwrap()
            .with_redeliver_timeout(Duration::from_millis(50));
        let ids = append_committed(&outbox, &pool, &[("m1", "order-1"), ("m2", "order-1")]).await;

        assert_eq!(outbox.claim().await.unwrap().unwrap().id, ids[0]);
        assert!(outbox.claim().await.unwrap().is_none());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(outbox.claim().await.unwrap().unwrap().id, ids[0]);
    }

    #[sqlx::test(migrations = false)]
    async fn queues_are_isolated(pool: PgPool) {
        let orders = SqlxOutbox::try_new(pool.clone()).await.unwrap();
        let billing = orders.clone().with_queue_name("billing");
        append_committed(&orders, &pool, &[("m1", "")]).await;

        assert!(billing.claim().await.unwrap().is_none());
        assert!(orders.claim().await.unwrap().is_some());
    }
}
