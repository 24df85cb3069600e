//! Postgres replica.

use std::time::Duration;

use async_trait::async_trait;
use packetbuddy_store::keys::month_key;
use packetbuddy_store::{AggregateCleanup, UsageTotals};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder, Row};
use time::{Date, OffsetDateTime};
use tracing::{debug, info};

use super::remote::{BatchOutcome, RemoteStore, StorageUsage, TableSize};
use super::{Result, SyncBatch};
use crate::config::DatabaseConfig;
use crate::identity::DeviceIdentity;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS devices (
        device_id TEXT PRIMARY KEY,
        os_type TEXT NOT NULL,
        hostname TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )",
    "CREATE TABLE IF NOT EXISTS usage_logs (
        id BIGSERIAL PRIMARY KEY,
        device_id TEXT NOT NULL REFERENCES devices(device_id),
        timestamp TIMESTAMPTZ NOT NULL,
        bytes_sent BIGINT NOT NULL CHECK (bytes_sent >= 0),
        bytes_received BIGINT NOT NULL CHECK (bytes_received >= 0)
    )",
    "CREATE INDEX IF NOT EXISTS idx_usage_logs_device_timestamp
        ON usage_logs(device_id, timestamp)",
    "CREATE TABLE IF NOT EXISTS daily_aggregates (
        device_id TEXT NOT NULL REFERENCES devices(device_id),
        date DATE NOT NULL,
        bytes_sent BIGINT NOT NULL,
        bytes_received BIGINT NOT NULL,
        PRIMARY KEY (device_id, date)
    )",
    "CREATE TABLE IF NOT EXISTS monthly_aggregates (
        device_id TEXT NOT NULL REFERENCES devices(device_id),
        month TEXT NOT NULL,
        bytes_sent BIGINT NOT NULL,
        bytes_received BIGINT NOT NULL,
        PRIMARY KEY (device_id, month)
    )",
    "CREATE TABLE IF NOT EXISTS sync_batches (
        batch_id UUID PRIMARY KEY,
        sample_count INTEGER NOT NULL,
        applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )",
];

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_i64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

/// Replica backed by a Postgres database.
///
/// The pool is bounded by `pool_size` so a shared, rate-limited hosted
/// database never sees more than that many connections from one agent.
#[derive(Debug, Clone)]
pub struct PostgresRemote {
    pool: PgPool,
}

impl PostgresRemote {
    /// Build a pool for `url`. No connection is made until first use.
    pub fn connect_lazy(url: &str, config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.pool_size.max(1))
            .min_connections(0)
            .acquire_timeout(Duration::from_secs(config.connect_timeout))
            .connect_lazy(url)?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn totals(&self, sql: &str, date: Option<Date>) -> Result<UsageTotals> {
        let mut query = sqlx::query(sql);
        if let Some(date) = date {
            query = query.bind(date);
        }
        let row = query.fetch_one(&self.pool).await?;
        Ok(UsageTotals::new(
            from_i64(row.try_get(0)?),
            from_i64(row.try_get(1)?),
        ))
    }
}

#[async_trait]
impl RemoteStore for PostgresRemote {
    async fn init_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!("Remote schema ready");
        Ok(())
    }

    async fn register_device(&self, device: &DeviceIdentity) -> Result<()> {
        sqlx::query(
            "INSERT INTO devices (device_id, os_type, hostname)
             VALUES ($1, $2, $3)
             ON CONFLICT (device_id) DO UPDATE SET
                os_type = EXCLUDED.os_type,
                hostname = EXCLUDED.hostname,
                updated_at = NOW()",
        )
        .bind(&device.device_id)
        .bind(&device.os_type)
        .bind(&device.hostname)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn apply_batch(&self, batch: &SyncBatch) -> Result<BatchOutcome> {
        if batch.is_empty() {
            return Ok(BatchOutcome::Applied);
        }

        let mut tx = self.pool.begin().await?;

        let recorded = sqlx::query(
            "INSERT INTO sync_batches (batch_id, sample_count)
             VALUES ($1, $2)
             ON CONFLICT (batch_id) DO NOTHING",
        )
        .bind(batch.batch_id)
        .bind(i32::try_from(batch.len()).unwrap_or(i32::MAX))
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if recorded == 0 {
            tx.rollback().await?;
            return Ok(BatchOutcome::AlreadyApplied);
        }

        let mut insert: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO usage_logs (device_id, timestamp, bytes_sent, bytes_received) ",
        );
        insert.push_values(&batch.samples, |mut row, sample| {
            row.push_bind(sample.device_id.clone())
                .push_bind(sample.timestamp)
                .push_bind(to_i64(sample.bytes_sent))
                .push_bind(to_i64(sample.bytes_received));
        });
        insert.build().execute(&mut *tx).await?;

        for ((device_id, date), totals) in &batch.daily {
            sqlx::query(
                "INSERT INTO daily_aggregates (device_id, date, bytes_sent, bytes_received)
                 VALUES ($1, $2, $3, $4)
                 ON CONFLICT (device_id, date) DO UPDATE SET
                    bytes_sent = daily_aggregates.bytes_sent + EXCLUDED.bytes_sent,
                    bytes_received = daily_aggregates.bytes_received + EXCLUDED.bytes_received",
            )
            .bind(device_id)
            .bind(*date)
            .bind(to_i64(totals.bytes_sent))
            .bind(to_i64(totals.bytes_received))
            .execute(&mut *tx)
            .await?;
        }

        for ((device_id, month), totals) in &batch.monthly {
            sqlx::query(
                "INSERT INTO monthly_aggregates (device_id, month, bytes_sent, bytes_received)
                 VALUES ($1, $2, $3, $4)
                 ON CONFLICT (device_id, month) DO UPDATE SET
                    bytes_sent = monthly_aggregates.bytes_sent + EXCLUDED.bytes_sent,
                    bytes_received = monthly_aggregates.bytes_received + EXCLUDED.bytes_received",
            )
            .bind(device_id)
            .bind(month)
            .bind(to_i64(totals.bytes_sent))
            .bind(to_i64(totals.bytes_received))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(BatchOutcome::Applied)
    }

    async fn global_today_usage(&self, date: Date) -> Result<UsageTotals> {
        self.totals(
            "SELECT COALESCE(SUM(bytes_sent), 0)::BIGINT,
                    COALESCE(SUM(bytes_received), 0)::BIGINT
             FROM daily_aggregates WHERE date = $1",
            Some(date),
        )
        .await
    }

    async fn global_lifetime_usage(&self) -> Result<UsageTotals> {
        self.totals(
            "SELECT COALESCE(SUM(bytes_sent), 0)::BIGINT,
                    COALESCE(SUM(bytes_received), 0)::BIGINT
             FROM monthly_aggregates",
            None,
        )
        .await
    }

    async fn device_count(&self) -> Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) FROM devices")
            .fetch_one(&self.pool)
            .await?;
        Ok(from_i64(row.try_get(0)?))
    }

    async fn storage_usage(&self) -> Result<StorageUsage> {
        let rows = sqlx::query(
            "SELECT relname::TEXT, pg_total_relation_size(relid)
             FROM pg_catalog.pg_statio_user_tables
             ORDER BY 2 DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        let tables = rows
            .iter()
            .map(|row| {
                Ok(TableSize {
                    name: row.try_get(0)?,
                    bytes: from_i64(row.try_get(1)?),
                })
            })
            .collect::<std::result::Result<Vec<_>, sqlx::Error>>()?;

        let total: i64 = sqlx::query("SELECT pg_database_size(current_database())")
            .fetch_one(&self.pool)
            .await?
            .try_get(0)?;

        Ok(StorageUsage {
            tables,
            total_bytes: from_i64(total),
        })
    }

    async fn delete_logs_before(&self, cutoff: OffsetDateTime) -> Result<u64> {
        let deleted = sqlx::query("DELETE FROM usage_logs WHERE timestamp < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?
            .rows_affected();

        sqlx::query("DELETE FROM sync_batches WHERE applied_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        if deleted > 0 {
            info!("Deleted {} remote sample(s) older than {}", deleted, cutoff);
        }
        Ok(deleted)
    }

    async fn delete_aggregates_before(
        &self,
        daily_before: Date,
        monthly_before: Date,
    ) -> Result<AggregateCleanup> {
        let daily_deleted = sqlx::query("DELETE FROM daily_aggregates WHERE date < $1")
            .bind(daily_before)
            .execute(&self.pool)
            .await?
            .rows_affected();
        let monthly_deleted = sqlx::query("DELETE FROM monthly_aggregates WHERE month < $1")
            .bind(month_key(monthly_before))
            .execute(&self.pool)
            .await?
            .rows_affected();

        Ok(AggregateCleanup {
            daily_deleted: usize::try_from(daily_deleted).unwrap_or(usize::MAX),
            monthly_deleted: usize::try_from(monthly_deleted).unwrap_or(usize::MAX),
        })
    }

    async fn vacuum(&self) -> Result<()> {
        sqlx::query("VACUUM ANALYZE").execute(&self.pool).await?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
