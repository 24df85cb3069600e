//! The remote replica interface.

use async_trait::async_trait;
use packetbuddy_store::{AggregateCleanup, UsageTotals};
use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};

use super::{Result, SyncBatch};
use crate::identity::DeviceIdentity;

/// What happened to a batch pushed to the replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchOutcome {
    /// Samples and aggregate deltas were written.
    Applied,
    /// The batch ID was already recorded; nothing was written.
    AlreadyApplied,
}

/// Size of one remote table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSize {
    /// Table name.
    pub name: String,
    /// Size including indexes, in bytes.
    pub bytes: u64,
}

/// Remote storage consumption.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageUsage {
    /// Per-table sizes, largest first.
    pub tables: Vec<TableSize>,
    /// Whole-database size in bytes.
    pub total_bytes: u64,
}

impl StorageUsage {
    /// `total_bytes` as a percentage of `quota_mb`.
    pub fn percent_of(&self, quota_mb: u64) -> f64 {
        if quota_mb == 0 {
            return 0.0;
        }
        self.total_bytes as f64 / (quota_mb as f64 * 1024.0 * 1024.0) * 100.0
    }
}

/// A replica that accepts sample batches.
///
/// `apply_batch` must be atomic: either the raw samples, every aggregate
/// delta and the batch ID are all recorded, or none of them are. A batch
/// whose ID is already recorded must be acknowledged without re-applying
/// the additive aggregate merge.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Create tables if they do not exist.
    async fn init_schema(&self) -> Result<()>;

    /// Insert or refresh this device's row.
    async fn register_device(&self, device: &DeviceIdentity) -> Result<()>;

    /// Apply a batch in one transaction.
    async fn apply_batch(&self, batch: &SyncBatch) -> Result<BatchOutcome>;

    /// Sum of every device's usage on `date`.
    async fn global_today_usage(&self, date: Date) -> Result<UsageTotals>;

    /// Sum of every device's usage across all months.
    async fn global_lifetime_usage(&self) -> Result<UsageTotals>;

    /// Number of registered devices.
    async fn device_count(&self) -> Result<u64>;

    /// Current storage consumption.
    async fn storage_usage(&self) -> Result<StorageUsage>;

    /// Delete raw samples older than `cutoff`.
    async fn delete_logs_before(&self, cutoff: OffsetDateTime) -> Result<u64>;

    /// Delete daily rows before `daily_before` and monthly rows whose month
    /// precedes the month of `monthly_before`.
    async fn delete_aggregates_before(
        &self,
        daily_before: Date,
        monthly_before: Date,
    ) -> Result<AggregateCleanup>;

    /// Reclaim space after deletions.
    async fn vacuum(&self) -> Result<()>;

    /// Release connections.
    async fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent_of_quota() {
        let usage = StorageUsage {
            tables: Vec::new(),
            total_bytes: 45 * 1024 * 1024,
        };
        assert!((usage.percent_of(450) - 10.0).abs() < 1e-9);
        assert_eq!(usage.percent_of(0), 0.0);
    }
}
