use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row, postgres::PgRow};

use crate::{KeyValueStore, Record, Result, StoreError, Version};

/// PostgreSQL-backed store implementation.
///
/// All records live in a single `records` table keyed by
/// `(namespace, key)`. Compare-and-set is a conditional `INSERT`/`UPDATE`
/// whose affected-row count decides success.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Creates a new PostgreSQL store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects to the database at `url`.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPool::connect(url).await?;
        Ok(Self::new(pool))
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    fn row_to_record(row: PgRow) -> Result<Record> {
        Ok(Record {
            namespace: row.try_get("namespace")?,
            key: row.try_get("key")?,
            version: Version::new(row.try_get("version")?),
            value: row.try_get("value")?,
            updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
        })
    }

    async fn current_version(&self, namespace: &str, key: &str) -> Result<Version> {
        let version: Option<i64> =
            sqlx::query_scalar("SELECT version FROM records WHERE namespace = $1 AND key = $2")
                .bind(namespace)
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;

        Ok(version.map(Version::new).unwrap_or(Version::initial()))
    }
}

#[async_trait]
impl KeyValueStore for PostgresStore {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Record>> {
        let row: Option<PgRow> = sqlx::query(
            r#"
            SELECT namespace, key, version, value, updated_at
            FROM records
            WHERE namespace = $1 AND key = $2
            "#,
        )
        .bind(namespace)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_record).transpose()
    }

    async fn compare_and_set(
        &self,
        namespace: &str,
        key: &str,
        expected: Version,
        value: serde_json::Value,
    ) -> Result<Version> {
        let next = expected.next();

        let result = if expected == Version::initial() {
            sqlx::query(
                r#"
                INSERT INTO records (namespace, key, version, value, updated_at)
                VALUES ($1, $2, $3, $4, now())
                ON CONFLICT (namespace, key) DO NOTHING
                "#,
            )
            .bind(namespace)
            .bind(key)
            .bind(next.as_i64())
            .bind(&value)
            .execute(&self.pool)
            .await?
        } else {
            sqlx::query(
                r#"
                UPDATE records
                SET version = $4, value = $5, updated_at = now()
                WHERE namespace = $1 AND key = $2 AND version = $3
                "#,
            )
            .bind(namespace)
            .bind(key)
            .bind(expected.as_i64())
            .bind(next.as_i64())
            .bind(&value)
            .execute(&self.pool)
            .await?
        };

        if result.rows_affected() == 1 {
            return Ok(next);
        }

        let actual = self.current_version(namespace, key).await?;
        tracing::debug!(%namespace, %key, %expected, %actual, "compare-and-set lost");
        metrics::counter!("store_cas_conflicts_total").increment(1);

        Err(StoreError::ConcurrencyConflict {
            namespace: namespace.to_string(),
            key: key.to_string(),
            expected,
            actual,
        })
    }

    async fn scan(&self, namespace: &str) -> Result<Vec<Record>> {
        let rows = sqlx::query(
            r#"
            SELECT namespace, key, version, value, updated_at
            FROM records
            WHERE namespace = $1
            ORDER BY key COLLATE "C" ASC
            "#,
        )
        .bind(namespace)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_record).collect()
    }

    async fn remove(&self, namespace: &str, key: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM records WHERE namespace = $1 AND key = $2")
            .bind(namespace)
            .bind(key)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}
