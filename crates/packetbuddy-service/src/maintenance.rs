//! Periodic retention for the local store and the replica.
//!
//! Every step is independent: a failure is logged, recorded as absent in
//! the [`CleanupReport`], and the next step still runs.

use std::sync::Arc;
use std::time::Duration;

use packetbuddy_store::AggregateCleanup;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::StorageConfig;
use crate::state::{FailureTracker, SharedStore};
use crate::sync::{RemoteCleanup, ReplicationEngine};

/// Delay before the first run after start.
pub const INITIAL_DELAY: Duration = Duration::from_secs(60);

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Local retention settings.
#[derive(Debug, Clone)]
pub struct MaintenanceSettings {
    /// Keep synced samples this many days.
    pub log_retention_days: u32,
    /// Keep aggregates this many months.
    pub aggregate_retention_months: u32,
    /// Compact the database after deleting.
    pub vacuum_after_cleanup: bool,
    /// Warn when the database grows past this size.
    pub max_storage_mb: u64,
    /// Time between runs.
    pub interval: Duration,
}

impl From<&StorageConfig> for MaintenanceSettings {
    fn from(config: &StorageConfig) -> Self {
        Self {
            log_retention_days: config.log_retention_days,
            aggregate_retention_months: config.aggregate_retention_months,
            vacuum_after_cleanup: config.vacuum_after_cleanup,
            max_storage_mb: config.max_storage_mb,
            interval: config.cleanup_interval(),
        }
    }
}

impl Default for MaintenanceSettings {
    fn default() -> Self {
        Self::from(&StorageConfig::default())
    }
}

/// What one maintenance run did. `None` means the step failed or was skipped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CleanupReport {
    /// Days whose aggregate disagrees with its samples.
    pub aggregate_mismatches: Option<usize>,
    /// Synced local samples removed.
    pub synced_samples_deleted: Option<usize>,
    /// Local aggregate rows removed.
    pub aggregates_deleted: Option<AggregateCleanup>,
    /// Whether the local database was compacted.
    pub compacted: bool,
    /// Remote quota usage before cleanup, in percent.
    pub remote_percent_before: Option<f64>,
    /// Aggressive cleanup result, when the quota threshold was reached.
    pub aggressive: Option<RemoteCleanup>,
    /// Remote samples removed by regular retention.
    pub remote_logs_deleted: Option<u64>,
    /// Remote aggregate rows removed by regular retention.
    pub remote_aggregates_deleted: Option<AggregateCleanup>,
    /// Whether the remote vacuum succeeded.
    pub remote_vacuumed: bool,
    /// Remote quota usage after cleanup, in percent.
    pub remote_percent_after: Option<f64>,
    /// Set when the local database is over its size limit.
    pub storage_warning: Option<String>,
}

impl CleanupReport {
    /// Whether any step failed.
    pub fn has_failures(&self, remote: bool) -> bool {
        let local = self.synced_samples_deleted.is_none() || self.aggregates_deleted.is_none();
        let remote = remote
            && (self.remote_percent_before.is_none()
                || self.remote_logs_deleted.is_none()
                || self.remote_aggregates_deleted.is_none());
        local || remote
    }
}

/// Run every cleanup step once.
pub async fn run_maintenance(
    store: &SharedStore,
    engine: Option<&ReplicationEngine>,
    settings: &MaintenanceSettings,
) -> CleanupReport {
    let mut report = CleanupReport::default();

    {
        let store = store.lock().await;

        report.aggregate_mismatches = match store
            .verify_recent_aggregates(settings.log_retention_days)
        {
            Ok(mismatches) => {
                for mismatch in &mismatches {
                    debug!(
                        "Aggregate for {} is {:?}, samples sum to {:?}",
                        mismatch.date, mismatch.aggregate, mismatch.from_samples
                    );
                }
                if !mismatches.is_empty() {
                    warn!(
                        "{} day(s) have aggregates that disagree with their samples",
                        mismatches.len()
                    );
                }
                Some(mismatches.len())
            }
            Err(e) => {
                warn!("Aggregate consistency check failed: {}", e);
                None
            }
        };

        report.synced_samples_deleted = store
            .cleanup_synced_samples(settings.log_retention_days)
            .inspect_err(|e| warn!("Local sample cleanup failed: {}", e))
            .ok();

        report.aggregates_deleted = store
            .cleanup_old_aggregates(settings.aggregate_retention_months)
            .inspect_err(|e| warn!("Local aggregate cleanup failed: {}", e))
            .ok();

        if settings.vacuum_after_cleanup {
            report.compacted = store.compact();
        }
    }

    if let Some(engine) = engine {
        run_remote_steps(engine, &mut report).await;
    }

    match store.lock().await.size_bytes() {
        Ok(size) if size > settings.max_storage_mb.saturating_mul(BYTES_PER_MB) => {
            let message = format!(
                "Database size ({} MB) exceeds limit ({} MB)",
                size / BYTES_PER_MB,
                settings.max_storage_mb
            );
            warn!("{}", message);
            report.storage_warning = Some(message);
        }
        Ok(_) => {}
        Err(e) => warn!("Could not measure local database: {}", e),
    }

    info!(
        "Maintenance finished: {} local sample(s), {} remote sample(s) removed",
        report.synced_samples_deleted.unwrap_or(0),
        report.remote_logs_deleted.unwrap_or(0)
    );
    report
}

async fn run_remote_steps(engine: &ReplicationEngine, report: &mut CleanupReport) {
    let settings = engine.settings();

    match engine.storage_usage_percent().await {
        Ok(percent) => {
            info!("Remote storage at {:.1}% before cleanup", percent);
            report.remote_percent_before = Some(percent);
            if percent >= f64::from(settings.warning_threshold_percent) {
                warn!("Remote storage over threshold, running aggressive cleanup");
                report.aggressive = engine
                    .aggressive_cleanup()
                    .await
                    .inspect_err(|e| warn!("Aggressive remote cleanup failed: {}", e))
                    .ok();
            }
        }
        Err(e) => warn!("Could not measure remote storage: {}", e),
    }

    report.remote_logs_deleted = engine
        .cleanup_old_logs(settings.log_retention_days)
        .await
        .inspect_err(|e| warn!("Remote sample cleanup failed: {}", e))
        .ok();

    report.remote_aggregates_deleted = engine
        .cleanup_old_aggregates(settings.aggregate_retention_months)
        .await
        .inspect_err(|e| warn!("Remote aggregate cleanup failed: {}", e))
        .ok();

    report.remote_vacuumed = engine
        .vacuum()
        .await
        .inspect_err(|e| warn!("Remote vacuum failed: {}", e))
        .is_ok();

    report.remote_percent_after = engine
        .storage_usage_percent()
        .await
        .inspect_err(|e| warn!("Could not re-measure remote storage: {}", e))
        .ok();
}

/// Run maintenance after [`INITIAL_DELAY`], then every `settings.interval`.
pub async fn run_maintenance_loop(
    store: SharedStore,
    engine: Option<Arc<ReplicationEngine>>,
    settings: MaintenanceSettings,
    cancel: CancellationToken,
) {
    let failures = FailureTracker::new("Maintenance");
    let mut delay = INITIAL_DELAY;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep(delay) => {}
        }
        delay = settings.interval;

        let report = run_maintenance(&store, engine.as_deref(), &settings).await;
        if report.has_failures(engine.is_some()) {
            failures.failure(&"one or more cleanup steps failed");
        } else {
            failures.success();
        }
    }

    info!("Maintenance loop stopped");
}

#[cfg(test)]
mod tests {
    use packetbuddy_core::RetryConfig;
    use packetbuddy_store::{Store, UsageTotals};
    use time::OffsetDateTime;

    use super::*;
    use crate::identity::DeviceIdentity;
    use crate::state::share;
    use crate::sync::{MemoryRemote, SyncSettings};

    fn store_with_old_samples() -> SharedStore {
        let mut store = Store::open_in_memory().unwrap();
        store.register_device("dev", "linux", "host").unwrap();
        let old = OffsetDateTime::now_utc() - time::Duration::days(90);
        let a = store.insert_sample(1, 1, old, 0).unwrap();
        store.insert_sample(2, 2, old, 0).unwrap();
        store.mark_synced(&[a]).unwrap();
        share(store)
    }

    fn engine(store: &SharedStore, remote: &MemoryRemote) -> ReplicationEngine {
        ReplicationEngine::new(
            Arc::clone(store),
            Arc::new(remote.clone()),
            DeviceIdentity {
                device_id: "dev".to_string(),
                os_type: "linux".to_string(),
                hostname: "host".to_string(),
            },
            SyncSettings {
                connect_retry: RetryConfig::none(),
                retry: RetryConfig::none(),
                ..SyncSettings::default()
            },
        )
    }

    #[tokio::test]
    async fn test_local_only_maintenance() {
        let store = store_with_old_samples();
        let report = run_maintenance(&store, None, &MaintenanceSettings::default()).await;

        assert_eq!(report.aggregate_mismatches, Some(0));
        assert_eq!(report.synced_samples_deleted, Some(1));
        assert!(report.aggregates_deleted.is_some());
        assert!(report.compacted);
        assert!(report.remote_percent_before.is_none());
        assert!(report.storage_warning.is_none());
        assert!(!report.has_failures(false));

        // The unsynced sample survives.
        assert_eq!(store.lock().await.count_unsynced().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_reports_aggregate_drift() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("usage.db");
        let mut store = Store::open(&path).unwrap();
        store.register_device("dev", "linux", "host").unwrap();
        let now = OffsetDateTime::now_utc();
        store.insert_sample(100, 200, now, 0).unwrap();
        store
            .insert_sample(5, 5, now - time::Duration::days(90), 0)
            .unwrap();
        let store = share(store);

        rusqlite::Connection::open(&path)
            .unwrap()
            .execute("UPDATE daily_aggregates SET bytes_sent = bytes_sent + 7", [])
            .unwrap();

        let report = run_maintenance(&store, None, &MaintenanceSettings::default()).await;

        // The 90-day-old day is outside the sample retention window.
        assert_eq!(report.aggregate_mismatches, Some(1));
        assert!(!report.has_failures(false));
    }

    #[tokio::test]
    async fn test_remote_failures_do_not_stop_local_steps() {
        let store = store_with_old_samples();
        let remote = MemoryRemote::new();
        remote.set_unavailable(true);
        let engine = engine(&store, &remote);

        let report = run_maintenance(&store, Some(&engine), &MaintenanceSettings::default()).await;

        assert_eq!(report.synced_samples_deleted, Some(1));
        assert!(report.remote_percent_before.is_none());
        assert!(report.remote_logs_deleted.is_none());
        assert!(!report.remote_vacuumed);
        assert!(report.has_failures(true));
    }

    #[tokio::test]
    async fn test_remote_pressure_runs_aggressive_then_regular() {
        let store = store_with_old_samples();
        let remote = MemoryRemote::new();
        remote.set_storage_bytes(Some(440 * 1024 * 1024));
        let old = OffsetDateTime::now_utc().date() - time::Duration::days(200);
        remote.seed_daily("dev", old, UsageTotals::new(5, 5));
        let engine = engine(&store, &remote);

        let report = run_maintenance(&store, Some(&engine), &MaintenanceSettings::default()).await;

        let aggressive = report.aggressive.unwrap();
        assert_eq!(aggressive.aggregates.daily_deleted, 1);
        assert_eq!(report.remote_logs_deleted, Some(0));
        assert!(report.remote_vacuumed);
        assert_eq!(remote.vacuum_calls(), 2);
        assert!(report.remote_percent_after.is_some());
    }

    #[tokio::test]
    async fn test_size_warning() {
        let store = store_with_old_samples();
        let settings = MaintenanceSettings {
            max_storage_mb: 0,
            vacuum_after_cleanup: false,
            ..MaintenanceSettings::default()
        };

        let report = run_maintenance(&store, None, &settings).await;
        assert!(!report.compacted);
        assert!(report.storage_warning.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_waits_initial_delay() {
        let store = store_with_old_samples();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_maintenance_loop(
            Arc::clone(&store),
            None,
            MaintenanceSettings::default(),
            cancel.clone(),
        ));

        sleep(Duration::from_secs(30)).await;
        assert_eq!(store.lock().await.all_samples().unwrap().len(), 2);

        sleep(Duration::from_secs(31)).await;
        assert_eq!(store.lock().await.all_samples().unwrap().len(), 1);

        cancel.cancel();
        handle.await.unwrap();
    }
}
