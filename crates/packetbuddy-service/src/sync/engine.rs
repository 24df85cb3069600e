//! The replication engine.
//!
//! Each pass reads the oldest unsynced samples, groups them into a
//! [`SyncBatch`], pushes the batch to the replica in one transaction and
//! only then marks the local rows synced.
//!
//! Before a batch is pushed its ID and highest row ID are journalled in the
//! local state table. If the process dies after the replica committed but
//! before the rows were marked, the next pass rebuilds the same batch under
//! the same ID; the replica's batch ledger recognises it and the engine just
//! marks the rows. Aggregate deltas are therefore applied at most once.

use std::sync::Arc;
use std::time::Duration;

use packetbuddy_core::{RetryConfig, with_retry};
use packetbuddy_store::keys::months_back;
use packetbuddy_store::{AggregateCleanup, Store, UsageTotals};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::{Mutex, OnceCell};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::remote::{BatchOutcome, RemoteStore, StorageUsage};
use super::{Result, SyncBatch, SyncError};
use crate::config::Config;
use crate::identity::DeviceIdentity;
use crate::state::{FailureTracker, SharedStore};

/// State key holding the ID of a batch pushed but not yet acknowledged.
pub const STATE_PENDING_BATCH: &str = "sync_pending_batch";
/// State key holding the highest local row ID in that batch.
pub const STATE_PENDING_MAX_ID: &str = "sync_pending_max_id";

const AGGRESSIVE_LOG_DAYS: u32 = 3;
const AGGRESSIVE_DAILY_MONTHS: u32 = 1;
const AGGRESSIVE_MONTHLY_MONTHS: u32 = 2;

/// Replication settings.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// Samples per batch.
    pub batch_size: u32,
    /// Retry policy for one batch push.
    pub retry: RetryConfig,
    /// Retry policy for schema creation and device registration.
    pub connect_retry: RetryConfig,
    /// Remote raw-sample retention in days.
    pub log_retention_days: u32,
    /// Remote aggregate retention in months.
    pub aggregate_retention_months: u32,
    /// Remote storage quota.
    pub max_storage_mb: u64,
    /// Usage percentage that triggers aggressive cleanup.
    pub warning_threshold_percent: u8,
    /// Check storage pressure after every successful push.
    pub cleanup_on_sync: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl SyncSettings {
    /// Settings from the `[sync]` and `[storage.remote]` sections.
    pub fn from_config(config: &Config) -> Self {
        let remote = &config.storage.remote;
        Self {
            batch_size: config.sync.batch_size.max(1),
            retry: config.sync.retry_config(),
            connect_retry: RetryConfig::for_connect(),
            log_retention_days: remote.log_retention_days,
            aggregate_retention_months: remote.aggregate_retention_months,
            max_storage_mb: remote.max_storage_mb,
            warning_threshold_percent: remote.warning_threshold_percent,
            cleanup_on_sync: remote.cleanup_on_sync,
        }
    }
}

/// Result of one sync pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    /// Batch pushed, if there was anything to push.
    pub batch_id: Option<Uuid>,
    /// Samples in the batch.
    pub samples: usize,
    /// Distinct `(device, day)` buckets.
    pub daily_keys: usize,
    /// Distinct `(device, month)` buckets.
    pub monthly_keys: usize,
    /// What the replica did with the batch.
    pub outcome: Option<BatchOutcome>,
    /// Whether the batch was rebuilt from the pending-batch journal.
    pub resumed: bool,
    /// Local rows flipped to synced.
    pub marked: usize,
}

impl SyncReport {
    /// Whether the pass found nothing to push.
    pub fn is_empty(&self) -> bool {
        self.samples == 0
    }
}

/// Rows removed from the replica by one cleanup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteCleanup {
    /// Raw samples deleted.
    pub logs_deleted: u64,
    /// Aggregate rows deleted.
    pub aggregates: AggregateCleanup,
    /// Whether the vacuum succeeded.
    pub vacuumed: bool,
}

/// Outcome of a storage-pressure check.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PressureCheck {
    /// Usage before any cleanup, in percent of the quota.
    pub percent_before: f64,
    /// Aggressive cleanup results, if the threshold was reached.
    pub cleanup: Option<RemoteCleanup>,
    /// Usage after cleanup, if it ran and could be measured.
    pub percent_after: Option<f64>,
}

impl PressureCheck {
    /// Whether aggressive cleanup ran.
    pub fn triggered(&self) -> bool {
        self.cleanup.is_some()
    }
}

/// Replicates local samples and manages the replica's storage.
pub struct ReplicationEngine {
    store: SharedStore,
    remote: Arc<dyn RemoteStore>,
    identity: DeviceIdentity,
    settings: SyncSettings,
    ready: OnceCell<()>,
    pass: Mutex<()>,
}

impl std::fmt::Debug for ReplicationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationEngine")
            .field("device_id", &self.identity.device_id)
            .field("settings", &self.settings)
            .field("ready", &self.ready.initialized())
            .finish()
    }
}

impl ReplicationEngine {
    /// Create an engine. Nothing is sent until the first pass.
    pub fn new(
        store: SharedStore,
        remote: Arc<dyn RemoteStore>,
        identity: DeviceIdentity,
        settings: SyncSettings,
    ) -> Self {
        Self {
            store,
            remote,
            identity,
            settings,
            ready: OnceCell::new(),
            pass: Mutex::new(()),
        }
    }

    /// The settings in use.
    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    /// Create the remote schema and register this device, once.
    ///
    /// Failures are returned and retried on the next call.
    pub async fn ensure_ready(&self) -> Result<()> {
        self.ready
            .get_or_try_init(|| async {
                with_retry(&self.settings.connect_retry, "remote_init", || async {
                    self.remote.init_schema().await?;
                    self.remote.register_device(&self.identity).await
                })
                .await?;
                info!(
                    "Remote replica ready for device {}",
                    self.identity.device_id
                );
                Ok::<(), SyncError>(())
            })
            .await?;
        Ok(())
    }

    /// Push the oldest batch of unsynced samples.
    ///
    /// Local rows are marked synced only after the replica acknowledges the
    /// batch. When every attempt fails the error is returned and the rows
    /// stay unsynced for the next pass.
    pub async fn sync(&self) -> Result<SyncReport> {
        let _pass = self.pass.lock().await;
        self.ensure_ready().await?;

        let (batch, resumed) = self.next_batch().await?;
        if batch.is_empty() {
            debug!("Nothing to sync");
            return Ok(SyncReport::default());
        }

        debug!(
            "Pushing batch {} ({} sample(s), {} day(s), {} month(s))",
            batch.batch_id,
            batch.len(),
            batch.daily.len(),
            batch.monthly.len()
        );

        let outcome = with_retry(&self.settings.retry, "sync_batch", || {
            self.remote.apply_batch(&batch)
        })
        .await?;

        let marked = {
            let mut store = self.store.lock().await;
            let marked = store.mark_synced(&batch.ids())?;
            clear_journal(&store)?;
            marked
        };

        match outcome {
            BatchOutcome::Applied => info!("Synced {} sample(s)", batch.len()),
            BatchOutcome::AlreadyApplied => info!(
                "Batch {} was already on the replica, marked {} sample(s) synced",
                batch.batch_id, marked
            ),
        }

        if self.settings.cleanup_on_sync {
            if let Err(e) = self.check_storage_pressure().await {
                warn!("Remote storage check after sync failed: {}", e);
            }
        }

        Ok(SyncReport {
            batch_id: Some(batch.batch_id),
            samples: batch.len(),
            daily_keys: batch.daily.len(),
            monthly_keys: batch.monthly.len(),
            outcome: Some(outcome),
            resumed,
            marked,
        })
    }

    /// Push batches until the backlog is empty. Returns samples pushed.
    ///
    /// A resumed batch can be short while newer rows wait behind it, so
    /// only a short fresh batch ends the loop.
    pub async fn sync_all(&self) -> Result<usize> {
        let mut total = 0;
        loop {
            let report = self.sync().await?;
            total += report.samples;
            if !report.resumed && report.samples < self.settings.batch_size as usize {
                return Ok(total);
            }
        }
    }

    /// The journalled batch if one is outstanding, else a fresh one.
    async fn next_batch(&self) -> Result<(SyncBatch, bool)> {
        let store = self.store.lock().await;
        let offset = store.utc_offset();

        if let Some((batch_id, max_id)) = read_journal(&store)? {
            let samples = store.unsynced_samples_through(max_id, self.settings.batch_size)?;
            if !samples.is_empty() {
                debug!("Resuming unacknowledged batch {}", batch_id);
                return Ok((SyncBatch::build(batch_id, samples, offset), true));
            }
            clear_journal(&store)?;
        }

        let samples = store.unsynced_samples(self.settings.batch_size)?;
        let batch = SyncBatch::build(Uuid::new_v4(), samples, offset);
        if let Some(max_id) = batch.max_id() {
            store.set_state_text(STATE_PENDING_BATCH, &batch.batch_id.to_string())?;
            store.set_state_int(STATE_PENDING_MAX_ID, max_id)?;
        }
        Ok((batch, false))
    }

    /// Every device's usage today, or zero if the replica is unreachable.
    pub async fn global_today_usage(&self) -> UsageTotals {
        let today = self.store.lock().await.today();
        self.remote
            .global_today_usage(today)
            .await
            .unwrap_or_else(|e| {
                warn!("Global today usage unavailable: {}", e);
                UsageTotals::default()
            })
    }

    /// Every device's lifetime usage, or zero if the replica is unreachable.
    pub async fn global_lifetime_usage(&self) -> UsageTotals {
        self.remote
            .global_lifetime_usage()
            .await
            .unwrap_or_else(|e| {
                warn!("Global lifetime usage unavailable: {}", e);
                UsageTotals::default()
            })
    }

    /// Registered devices, at least one (this one).
    pub async fn device_count(&self) -> u64 {
        self.remote
            .device_count()
            .await
            .unwrap_or_else(|e| {
                warn!("Device count unavailable: {}", e);
                1
            })
            .max(1)
    }

    /// Replica storage consumption.
    pub async fn storage_usage(&self) -> Result<StorageUsage> {
        self.remote.storage_usage().await
    }

    /// Replica size as a percentage of the quota.
    pub async fn storage_usage_percent(&self) -> Result<f64> {
        Ok(self
            .storage_usage()
            .await?
            .percent_of(self.settings.max_storage_mb))
    }

    /// Delete replica samples older than `days` days.
    pub async fn cleanup_old_logs(&self, days: u32) -> Result<u64> {
        let cutoff = OffsetDateTime::now_utc() - time::Duration::days(i64::from(days));
        self.remote.delete_logs_before(cutoff).await
    }

    /// Delete replica aggregates older than `months` whole months.
    pub async fn cleanup_old_aggregates(&self, months: u32) -> Result<AggregateCleanup> {
        let cutoff = months_back(self.store.lock().await.today(), months)?;
        self.remote.delete_aggregates_before(cutoff, cutoff).await
    }

    /// Apply the configured replica retention.
    pub async fn cleanup(&self) -> Result<RemoteCleanup> {
        let logs_deleted = self
            .cleanup_old_logs(self.settings.log_retention_days)
            .await?;
        let aggregates = self
            .cleanup_old_aggregates(self.settings.aggregate_retention_months)
            .await?;
        let vacuumed = self.vacuum_logged().await;

        Ok(RemoteCleanup {
            logs_deleted,
            aggregates,
            vacuumed,
        })
    }

    /// Shrink the replica to a minimal retention window.
    ///
    /// Keeps three days of samples, one month of daily aggregates and two
    /// months of monthly aggregates, then vacuums.
    pub async fn aggressive_cleanup(&self) -> Result<RemoteCleanup> {
        let today = self.store.lock().await.today();
        let daily_before = months_back(today, AGGRESSIVE_DAILY_MONTHS)?;
        let monthly_before = months_back(today, AGGRESSIVE_MONTHLY_MONTHS)?;

        let logs_deleted = self.cleanup_old_logs(AGGRESSIVE_LOG_DAYS).await?;
        let aggregates = self
            .remote
            .delete_aggregates_before(daily_before, monthly_before)
            .await?;
        let vacuumed = self.vacuum_logged().await;

        info!(
            "Aggressive remote cleanup removed {} sample(s), {} daily and {} monthly row(s)",
            logs_deleted, aggregates.daily_deleted, aggregates.monthly_deleted
        );

        Ok(RemoteCleanup {
            logs_deleted,
            aggregates,
            vacuumed,
        })
    }

    /// Run aggressive cleanup if usage is at or above the warning threshold.
    pub async fn check_storage_pressure(&self) -> Result<PressureCheck> {
        let percent_before = self.storage_usage_percent().await?;
        let threshold = f64::from(self.settings.warning_threshold_percent);

        if percent_before < threshold {
            debug!("Remote storage at {:.1}%", percent_before);
            return Ok(PressureCheck {
                percent_before,
                cleanup: None,
                percent_after: None,
            });
        }

        warn!(
            "Remote storage at {:.1}% (threshold {}%), running aggressive cleanup",
            percent_before, self.settings.warning_threshold_percent
        );
        let cleanup = self.aggressive_cleanup().await?;
        let percent_after = match self.storage_usage_percent().await {
            Ok(percent) => {
                info!("Remote storage now at {:.1}%", percent);
                Some(percent)
            }
            Err(e) => {
                warn!("Could not re-measure remote storage: {}", e);
                None
            }
        };

        Ok(PressureCheck {
            percent_before,
            cleanup: Some(cleanup),
            percent_after,
        })
    }

    /// Vacuum the replica.
    pub async fn vacuum(&self) -> Result<()> {
        self.remote.vacuum().await
    }

    async fn vacuum_logged(&self) -> bool {
        match self.remote.vacuum().await {
            Ok(()) => true,
            Err(e) => {
                warn!("Remote vacuum failed: {}", e);
                false
            }
        }
    }

    /// Release the pool without a final sync.
    pub async fn close(&self) {
        self.remote.close().await;
    }

    /// Final sync bounded by `timeout`, then release the pool.
    ///
    /// Samples that could not be pushed stay unsynced for the next start.
    pub async fn shutdown(&self, timeout: Duration) -> Result<usize> {
        let result = match tokio::time::timeout(timeout, self.sync_all()).await {
            Ok(Ok(pushed)) => {
                info!("Final sync pushed {} sample(s)", pushed);
                Ok(pushed)
            }
            Ok(Err(e)) => {
                warn!("Final sync failed, samples kept for next start: {}", e);
                Err(e)
            }
            Err(_) => {
                warn!("Final sync did not finish within {:?}", timeout);
                Err(SyncError::Timeout(timeout))
            }
        };

        self.remote.close().await;
        result
    }
}

fn read_journal(store: &Store) -> Result<Option<(Uuid, i64)>> {
    let Some(text) = store.state_text(STATE_PENDING_BATCH)? else {
        return Ok(None);
    };

    match (Uuid::parse_str(&text), store.state_int(STATE_PENDING_MAX_ID)?) {
        (Ok(batch_id), Some(max_id)) => Ok(Some((batch_id, max_id))),
        _ => {
            warn!("Discarding unreadable pending-batch journal");
            clear_journal(store)?;
            Ok(None)
        }
    }
}

fn clear_journal(store: &Store) -> Result<()> {
    store.clear_state(STATE_PENDING_BATCH)?;
    store.clear_state(STATE_PENDING_MAX_ID)?;
    Ok(())
}

/// Run [`ReplicationEngine::sync_all`] every `interval` until cancelled.
///
/// The first pass runs one interval after start.
pub async fn run_sync_loop(
    engine: Arc<ReplicationEngine>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let failures = FailureTracker::new("Sync");
    info!("Sync loop started (every {:?})", interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep(interval) => {}
        }

        match engine.sync_all().await {
            Ok(pushed) => {
                if failures.consecutive() > 0 {
                    info!("Sync recovered");
                }
                failures.success();
                if pushed > 0 {
                    debug!("Sync pass pushed {} sample(s)", pushed);
                }
            }
            Err(e) => failures.failure(&e),
        }
    }

    info!("Sync loop stopped");
}
