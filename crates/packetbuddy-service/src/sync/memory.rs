//! In-process replica for testing.
//!
//! Mirrors the Postgres replica's semantics, including the batch ledger,
//! and adds failure injection:
//!
//! - **fail before apply**: the next `n` calls fail without writing anything
//! - **fail after apply**: the next `n` calls commit and then report an
//!   error, as if the connection dropped before the acknowledgement arrived
//! - **unavailable**: every call fails until reset

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use packetbuddy_store::keys::month_key;
use packetbuddy_store::{AggregateCleanup, UsageTotals};
use time::{Date, OffsetDateTime};
use uuid::Uuid;

use super::remote::{BatchOutcome, RemoteStore, StorageUsage, TableSize};
use super::{Result, SyncBatch, SyncError};
use crate::identity::DeviceIdentity;

/// Rough per-row size used when no explicit size is set.
const ROW_BYTES: u64 = 64;

/// A batch recorded by [`MemoryRemote`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedBatch {
    /// Batch ID.
    pub batch_id: Uuid,
    /// Samples written.
    pub sample_count: usize,
    /// Daily upserts performed.
    pub daily_upserts: usize,
    /// Monthly upserts performed.
    pub monthly_upserts: usize,
}

#[derive(Debug, Clone)]
struct RemoteLog {
    timestamp: OffsetDateTime,
}

#[derive(Debug, Default)]
struct Replica {
    schema_ready: bool,
    devices: BTreeMap<String, DeviceIdentity>,
    logs: Vec<RemoteLog>,
    daily: BTreeMap<(String, Date), UsageTotals>,
    monthly: BTreeMap<(String, String), UsageTotals>,
    ledger: BTreeMap<Uuid, OffsetDateTime>,
    applied: Vec<AppliedBatch>,
    storage_bytes: Option<u64>,
}

#[derive(Debug, Default)]
struct Inner {
    replica: Mutex<Replica>,
    fail_before: AtomicU32,
    fail_after: AtomicU32,
    unavailable: AtomicBool,
    apply_calls: AtomicU32,
    vacuum_calls: AtomicU32,
    closed: AtomicBool,
    total_calls: AtomicU64,
}

/// An in-memory [`RemoteStore`].
///
/// Clones share state, so a test can keep a handle after giving one to the
/// engine.
#[derive(Debug, Clone, Default)]
pub struct MemoryRemote {
    inner: Arc<Inner>,
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
        .is_ok()
}

impl MemoryRemote {
    /// Create an empty replica.
    pub fn new() -> Self {
        Self::default()
    }

    fn replica(&self) -> MutexGuard<'_, Replica> {
        self.inner
            .replica
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_available(&self) -> Result<()> {
        self.inner.total_calls.fetch_add(1, Ordering::Relaxed);
        if self.inner.unavailable.load(Ordering::Relaxed) {
            return Err(SyncError::Unavailable("mock replica offline".to_string()));
        }
        Ok(())
    }

    // --- Test control methods ---

    /// Fail the next `count` batch pushes before anything is written.
    pub fn fail_next(&self, count: u32) {
        self.inner.fail_before.store(count, Ordering::Relaxed);
    }

    /// Commit the next `count` batch pushes, then report failure.
    pub fn fail_next_after_apply(&self, count: u32) {
        self.inner.fail_after.store(count, Ordering::Relaxed);
    }

    /// Fail every call until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::Relaxed);
    }

    /// Report a fixed database size instead of the row-count estimate.
    pub fn set_storage_bytes(&self, bytes: Option<u64>) {
        self.replica().storage_bytes = bytes;
    }

    // --- Inspection ---

    /// Batch push attempts, including failed ones.
    pub fn apply_calls(&self) -> u32 {
        self.inner.apply_calls.load(Ordering::Relaxed)
    }

    /// Batches actually written, in order.
    pub fn applied(&self) -> Vec<AppliedBatch> {
        self.replica().applied.clone()
    }

    /// Raw samples held.
    pub fn log_count(&self) -> usize {
        self.replica().logs.len()
    }

    /// Batch IDs held in the ledger.
    pub fn ledger_len(&self) -> usize {
        self.replica().ledger.len()
    }

    /// Daily aggregate for `(device_id, date)`.
    pub fn daily(&self, device_id: &str, date: Date) -> Option<UsageTotals> {
        self.replica()
            .daily
            .get(&(device_id.to_string(), date))
            .copied()
    }

    /// Monthly aggregate for `(device_id, "YYYY-MM")`.
    pub fn monthly(&self, device_id: &str, month: &str) -> Option<UsageTotals> {
        self.replica()
            .monthly
            .get(&(device_id.to_string(), month.to_string()))
            .copied()
    }

    /// Registered devices.
    pub fn devices(&self) -> Vec<DeviceIdentity> {
        self.replica().devices.values().cloned().collect()
    }

    /// Whether `init_schema` has run.
    pub fn schema_ready(&self) -> bool {
        self.replica().schema_ready
    }

    /// Vacuum calls so far.
    pub fn vacuum_calls(&self) -> u32 {
        self.inner.vacuum_calls.load(Ordering::Relaxed)
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Relaxed)
    }

    /// Seed an aggregate row directly, bypassing the ledger.
    pub fn seed_daily(&self, device_id: &str, date: Date, totals: UsageTotals) {
        let mut replica = self.replica();
        replica
            .daily
            .insert((device_id.to_string(), date), totals);
        replica
            .monthly
            .entry((device_id.to_string(), month_key(date)))
            .or_default()
            .add(totals.bytes_sent, totals.bytes_received);
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn init_schema(&self) -> Result<()> {
        self.check_available()?;
        self.replica().schema_ready = true;
        Ok(())
    }

    async fn register_device(&self, device: &DeviceIdentity) -> Result<()> {
        self.check_available()?;
        self.replica()
            .devices
            .insert(device.device_id.clone(), device.clone());
        Ok(())
    }

    async fn apply_batch(&self, batch: &SyncBatch) -> Result<BatchOutcome> {
        self.inner.apply_calls.fetch_add(1, Ordering::Relaxed);
        self.check_available()?;

        if take_one(&self.inner.fail_before) {
            return Err(SyncError::Unavailable("injected failure".to_string()));
        }

        let outcome = {
            let mut replica = self.replica();
            if replica.ledger.contains_key(&batch.batch_id) {
                BatchOutcome::AlreadyApplied
            } else {
                replica
                    .ledger
                    .insert(batch.batch_id, OffsetDateTime::now_utc());
                replica.logs.extend(batch.samples.iter().map(|s| RemoteLog {
                    timestamp: s.timestamp,
                }));
                for (key, totals) in &batch.daily {
                    replica
                        .daily
                        .entry(key.clone())
                        .or_default()
                        .add(totals.bytes_sent, totals.bytes_received);
                }
                for (key, totals) in &batch.monthly {
                    replica
                        .monthly
                        .entry(key.clone())
                        .or_default()
                        .add(totals.bytes_sent, totals.bytes_received);
                }
                replica.applied.push(AppliedBatch {
                    batch_id: batch.batch_id,
                    sample_count: batch.len(),
                    daily_upserts: batch.daily.len(),
                    monthly_upserts: batch.monthly.len(),
                });
                BatchOutcome::Applied
            }
        };

        if take_one(&self.inner.fail_after) {
            return Err(SyncError::Unavailable(
                "injected failure after commit".to_string(),
            ));
        }
        Ok(outcome)
    }

    async fn global_today_usage(&self, date: Date) -> Result<UsageTotals> {
        self.check_available()?;
        Ok(self
            .replica()
            .daily
            .iter()
            .filter(|((_, d), _)| *d == date)
            .fold(UsageTotals::default(), |mut acc, (_, t)| {
                acc.add(t.bytes_sent, t.bytes_received);
                acc
            }))
    }

    async fn global_lifetime_usage(&self) -> Result<UsageTotals> {
        self.check_available()?;
        Ok(self
            .replica()
            .monthly
            .values()
            .fold(UsageTotals::default(), |mut acc, t| {
                acc.add(t.bytes_sent, t.bytes_received);
                acc
            }))
    }

    async fn device_count(&self) -> Result<u64> {
        self.check_available()?;
        Ok(self.replica().devices.len() as u64)
    }

    async fn storage_usage(&self) -> Result<StorageUsage> {
        self.check_available()?;
        let replica = self.replica();

        let tables = vec![
            TableSize {
                name: "usage_logs".to_string(),
                bytes: replica.logs.len() as u64 * ROW_BYTES,
            },
            TableSize {
                name: "daily_aggregates".to_string(),
                bytes: replica.daily.len() as u64 * ROW_BYTES,
            },
            TableSize {
                name: "monthly_aggregates".to_string(),
                bytes: replica.monthly.len() as u64 * ROW_BYTES,
            },
        ];
        let estimate = tables.iter().map(|t| t.bytes).sum();

        Ok(StorageUsage {
            total_bytes: replica.storage_bytes.unwrap_or(estimate),
            tables,
        })
    }

    async fn delete_logs_before(&self, cutoff: OffsetDateTime) -> Result<u64> {
        self.check_available()?;
        let mut replica = self.replica();
        let before = replica.logs.len();
        replica.logs.retain(|log| log.timestamp >= cutoff);
        replica.ledger.retain(|_, applied_at| *applied_at >= cutoff);
        Ok((before - replica.logs.len()) as u64)
    }

    async fn delete_aggregates_before(
        &self,
        daily_before: Date,
        monthly_before: Date,
    ) -> Result<AggregateCleanup> {
        self.check_available()?;
        let mut replica = self.replica();
        let month_cutoff = month_key(monthly_before);

        let daily_count = replica.daily.len();
        replica.daily.retain(|(_, date), _| *date >= daily_before);
        let monthly_count = replica.monthly.len();
        replica.monthly.retain(|(_, month), _| *month >= month_cutoff);

        Ok(AggregateCleanup {
            daily_deleted: daily_count - replica.daily.len(),
            monthly_deleted: monthly_count - replica.monthly.len(),
        })
    }

    async fn vacuum(&self) -> Result<()> {
        self.check_available()?;
        self.inner.vacuum_calls.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn close(&self) {
        self.inner.closed.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use packetbuddy_store::UsageSample;
    use time::UtcOffset;
    use time::macros::{date, datetime};

    use super::*;

    fn batch() -> SyncBatch {
        let samples = vec![UsageSample {
            id: 1,
            device_id: "d".to_string(),
            timestamp: datetime!(2025-06-01 12:00 UTC),
            bytes_sent: 10,
            bytes_received: 20,
            synced: false,
        }];
        SyncBatch::build(Uuid::new_v4(), samples, UtcOffset::UTC)
    }

    #[tokio::test]
    async fn test_ledger_prevents_double_apply() {
        let remote = MemoryRemote::new();
        let batch = batch();

        assert_eq!(
            remote.apply_batch(&batch).await.unwrap(),
            BatchOutcome::Applied
        );
        assert_eq!(
            remote.apply_batch(&batch).await.unwrap(),
            BatchOutcome::AlreadyApplied
        );
        assert_eq!(
            remote.daily("d", date!(2025 - 06 - 01)),
            Some(UsageTotals::new(10, 20))
        );
        assert_eq!(remote.applied().len(), 1);
        assert_eq!(remote.apply_calls(), 2);
    }

    #[tokio::test]
    async fn test_delete_logs_prunes_ledger() {
        let remote = MemoryRemote::new();
        let batch = batch();
        remote.apply_batch(&batch).await.unwrap();
        assert_eq!(remote.ledger_len(), 1);

        // Entries applied after the cutoff stay.
        let deleted = remote
            .delete_logs_before(datetime!(2025-06-02 00:00 UTC))
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(remote.ledger_len(), 1);

        let later = OffsetDateTime::now_utc() + time::Duration::days(1);
        remote.delete_logs_before(later).await.unwrap();
        assert_eq!(remote.ledger_len(), 0);
        assert_eq!(
            remote.apply_batch(&batch).await.unwrap(),
            BatchOutcome::Applied
        );
    }

    #[tokio::test]
    async fn test_fail_after_apply_still_commits() {
        let remote = MemoryRemote::new();
        remote.fail_next_after_apply(1);

        assert!(remote.apply_batch(&batch()).await.is_err());
        assert_eq!(remote.log_count(), 1);
    }

    #[tokio::test]
    async fn test_unavailable() {
        let remote = MemoryRemote::new();
        remote.set_unavailable(true);
        assert!(remote.device_count().await.is_err());
        remote.set_unavailable(false);
        assert_eq!(remote.device_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_delete_aggregates_before() {
        let remote = MemoryRemote::new();
        remote.seed_daily("d", date!(2025 - 01 - 31), UsageTotals::new(1, 1));
        remote.seed_daily("d", date!(2025 - 02 - 01), UsageTotals::new(1, 1));
        remote.seed_daily("d", date!(2025 - 03 - 15), UsageTotals::new(1, 1));

        let result = remote
            .delete_aggregates_before(date!(2025 - 02 - 01), date!(2025 - 03 - 01))
            .await
            .unwrap();
        assert_eq!(result.daily_deleted, 1);
        assert_eq!(result.monthly_deleted, 2);
        assert!(remote.monthly("d", "2025-03").is_some());
    }
}
