use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Database, Pool};
use std::marker::PhantomData;

use crate::{inbox::DeduplicationStore, stamp::MessageId};

/// Type alias for the Postgres deduplication store.
pub type PgSqlxDeduplicationStore = SqlxDeduplicationStore<sqlx::Postgres>;

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS inbox_deduplication (
    message_id UUID PRIMARY KEY,
    message_name VARCHAR(255) NOT NULL,
    processed_at TIMESTAMPTZ NOT NULL
)";

const CREATE_INDEX: &str = "CREATE INDEX IF NOT EXISTS inbox_deduplication_processed_at_idx
    ON inbox_deduplication (processed_at)";

const SETUP_LOCK_KEY: i64 = 0x696e_626f_78;

/// SQLx-based deduplication store.
///
/// Admission is `INSERT … ON CONFLICT DO NOTHING`: the primary key is the
/// only arbiter, and a conflicting insert leaves the surrounding transaction
/// usable for the caller.
pub struct SqlxDeduplicationStore<DB>
where
    DB: Database,
{
    pool: Pool<DB>,
    _db_marker: PhantomData<DB>,
}

impl<DB> Clone for SqlxDeduplicationStore<DB>
where
    DB: Database,
{
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            _db_marker: PhantomData,
        }
    }
}

impl<DB> SqlxDeduplicationStore<DB>
where
    DB: Database,
{
    /// Creates a new store without touching the schema.
    pub fn new_uninitialized(pool: Pool<DB>) -> Self {
        Self {
            pool,
            _db_marker: PhantomData,
        }
    }
}

impl SqlxDeduplicationStore<sqlx::Postgres> {
    /// Creates a new Postgres store and ensures the table exists.
    #[tracing::instrument(skip_all)]
    pub async fn try_new(pool: sqlx::PgPool) -> Result<Self, Error> {
        let store = Self::new_uninitialized(pool);
        store.setup().await?;
        Ok(store)
    }

    /// Ensures the deduplication table and its retention index exist.
    pub async fn setup(&self) -> Result<(), Error> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(SETUP_LOCK_KEY)
            .execute(&mut *tx)
            .await?;
        sqlx::query(CREATE_TABLE).execute(&mut *tx).await?;
        sqlx::query(CREATE_INDEX).execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl DeduplicationStore for SqlxDeduplicationStore<sqlx::Postgres> {
    type Error = Error;
    type Transaction = sqlx::PgTransaction<'static>;

    async fn begin(&self) -> Result<Self::Transaction, Self::Error> {
        Ok(self.pool.begin().await?)
    }

    #[tracing::instrument(skip(self, tx))]
    async fn check_and_mark(
        &self,
        tx: &mut Self::Transaction,
        message_id: MessageId,
        message_name: &str,
    ) -> Result<bool, Self::Error> {
        let result = sqlx::query(
            "INSERT INTO inbox_deduplication (message_id, message_name, processed_at)
             VALUES ($1, $2, $3)
             ON CONFLICT (message_id) DO NOTHING",
        )
        .bind(*message_id.as_uuid())
        .bind(message_name)
        .bind(Utc::now())
        .execute(&mut **tx)
        .await?;

        Ok(result.rows_affected() == 0)
    }

    async fn commit(&self, tx: Self::Transaction) -> Result<(), Self::Error> {
        Ok(tx.commit().await?)
    }

    async fn rollback(&self, tx: Self::Transaction) -> Result<(), Self::Error> {
        Ok(tx.rollback().await?)
    }

    #[tracing::instrument(skip(self))]
    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, Self::Error> {
        let result = sqlx::query("DELETE FROM inbox_deduplication WHERE processed_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

/// Sqlx deduplication store errors.
#[derive(Debug)]
pub struct Error {
    context: tracing_error::SpanTrace,
    source: sqlx::Error,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Database error: {}", self.source)?;
        self.context.fmt(f)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Self {
            context: tracing_error::SpanTrace::capture(),
            source: err,
        }
    }
}
