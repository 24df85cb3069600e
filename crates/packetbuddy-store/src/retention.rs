//! Retention, compaction, statistics and the aggregate consistency check.

use rusqlite::params;
use time::{Date, Duration, OffsetDateTime};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::keys::{self, date_key, month_key};
use crate::models::{AggregateCleanup, AggregateMismatch, StoreStats, UsageTotals};
use crate::store::{Store, from_sql_int};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

impl Store {
    /// Delete synced samples older than `days` days.
    ///
    /// Unsynced samples are never deleted, whatever their age.
    pub fn cleanup_synced_samples(&self, days: u32) -> Result<usize> {
        let cutoff = OffsetDateTime::now_utc() - Duration::days(i64::from(days));
        self.cleanup_synced_samples_before(cutoff)
    }

    /// Delete synced samples with a timestamp before `cutoff`.
    pub fn cleanup_synced_samples_before(&self, cutoff: OffsetDateTime) -> Result<usize> {
        let deleted = self.conn.execute(
            "DELETE FROM usage_samples WHERE synced = 1 AND timestamp < ?",
            [cutoff.unix_timestamp()],
        )?;

        if deleted > 0 {
            info!("Deleted {} synced sample(s) older than {}", deleted, cutoff);
        }
        Ok(deleted)
    }

    /// Delete aggregates older than `months` whole months.
    ///
    /// The cutoff is the first day of the month `months` months before the
    /// current one; `months = 0` keeps only the current month.
    pub fn cleanup_old_aggregates(&self, months: u32) -> Result<AggregateCleanup> {
        let cutoff = keys::months_back(self.today(), months)?;
        self.cleanup_aggregates_before(cutoff)
    }

    /// Delete daily rows before `cutoff` and monthly rows before its month.
    pub fn cleanup_aggregates_before(&self, cutoff: Date) -> Result<AggregateCleanup> {
        let daily_deleted = self.conn.execute(
            "DELETE FROM daily_aggregates WHERE date < ?",
            [date_key(cutoff)],
        )?;
        let monthly_deleted = self.conn.execute(
            "DELETE FROM monthly_aggregates WHERE month < ?",
            [month_key(cutoff)],
        )?;

        if daily_deleted + monthly_deleted > 0 {
            info!(
                "Deleted {} daily and {} monthly aggregate row(s) before {}",
                daily_deleted, monthly_deleted, cutoff
            );
        }

        Ok(AggregateCleanup {
            daily_deleted,
            monthly_deleted,
        })
    }

    /// Reclaim space freed by deletions.
    ///
    /// Best-effort: failures are logged and reported as `false`.
    pub fn compact(&self) -> bool {
        let before = self.size_bytes().unwrap_or(0);

        if let Err(e) = self.conn.execute_batch("VACUUM;") {
            warn!("Database compaction failed: {}", e);
            return false;
        }

        if self.path.is_some() {
            if let Err(e) = self
                .conn
                .query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))
            {
                debug!("WAL checkpoint after compaction failed: {}", e);
            }
        }

        let after = self.size_bytes().unwrap_or(0);
        info!(
            "Database compacted: {:.2} MB -> {:.2} MB",
            before as f64 / BYTES_PER_MB,
            after as f64 / BYTES_PER_MB
        );
        true
    }

    /// Size of the main database file in bytes.
    pub fn size_bytes(&self) -> Result<u64> {
        let page_count: i64 = self
            .conn
            .query_row("PRAGMA page_count", [], |row| row.get(0))?;
        let page_size: i64 = self
            .conn
            .query_row("PRAGMA page_size", [], |row| row.get(0))?;
        Ok(from_sql_int(page_count.saturating_mul(page_size)))
    }

    /// Row counts, sample span and size relative to `max_storage_mb`.
    pub fn stats(&self, max_storage_mb: u64) -> Result<StoreStats> {
        let count = |sql: &str| -> Result<u64> {
            let n: i64 = self.conn.query_row(sql, [], |row| row.get(0))?;
            Ok(from_sql_int(n))
        };

        let (oldest, newest): (Option<i64>, Option<i64>) = self.conn.query_row(
            "SELECT MIN(timestamp), MAX(timestamp) FROM usage_samples",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let size_bytes = self.size_bytes()?;
        let usage_percent = if max_storage_mb == 0 {
            0.0
        } else {
            size_bytes as f64 / (max_storage_mb as f64 * BYTES_PER_MB) * 100.0
        };

        Ok(StoreStats {
            device_count: count("SELECT COUNT(*) FROM devices")?,
            sample_count: count("SELECT COUNT(*) FROM usage_samples")?,
            unsynced_count: count("SELECT COUNT(*) FROM usage_samples WHERE synced = 0")?,
            daily_count: count("SELECT COUNT(*) FROM daily_aggregates")?,
            monthly_count: count("SELECT COUNT(*) FROM monthly_aggregates")?,
            oldest_sample: oldest.and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok()),
            newest_sample: newest.and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok()),
            size_bytes,
            usage_percent,
        })
    }

    /// Recompute a day's totals from raw samples and compare with its aggregate.
    ///
    /// Only meaningful for days whose samples have not been removed by
    /// retention. Returns `None` when the two agree.
    pub fn verify_aggregates(&self, date: Date) -> Result<Option<AggregateMismatch>> {
        let device_id = self.device_id()?;
        let offset_seconds = i64::from(self.utc_offset().whole_seconds());

        let from_samples = self.conn.query_row(
            "SELECT COALESCE(SUM(bytes_sent), 0), COALESCE(SUM(bytes_received), 0)
             FROM usage_samples
             WHERE device_id = ?1 AND date(timestamp + ?2, 'unixepoch') = ?3",
            params![device_id, offset_seconds, date_key(date)],
            |row| {
                Ok(UsageTotals::new(
                    from_sql_int(row.get(0)?),
                    from_sql_int(row.get(1)?),
                ))
            },
        )?;

        let day = self.usage_for_date(date)?;
        let aggregate = UsageTotals::new(day.bytes_sent, day.bytes_received);

        if from_samples == aggregate {
            Ok(None)
        } else {
            Ok(Some(AggregateMismatch {
                date,
                from_samples,
                aggregate,
            }))
        }
    }

    /// Check every day that still has raw samples.
    pub fn verify_all_aggregates(&self) -> Result<Vec<AggregateMismatch>> {
        self.verify_days_after(None)
    }

    /// Check the days sample retention has not reached yet.
    ///
    /// Days at or before the cutoff used by
    /// [`Store::cleanup_synced_samples`] may have lost synced samples and
    /// are skipped.
    pub fn verify_recent_aggregates(&self, retention_days: u32) -> Result<Vec<AggregateMismatch>> {
        let cutoff = OffsetDateTime::now_utc() - Duration::days(i64::from(retention_days));
        self.verify_days_after(Some(self.bucket_date(cutoff)))
    }

    fn verify_days_after(&self, after: Option<Date>) -> Result<Vec<AggregateMismatch>> {
        let device_id = self.device_id()?;
        let offset_seconds = i64::from(self.utc_offset().whole_seconds());

        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT date(timestamp + ?2, 'unixepoch')
             FROM usage_samples WHERE device_id = ?1",
        )?;
        let days = stmt
            .query_map(params![device_id, offset_seconds], |row| {
                row.get::<_, String>(0)
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut mismatches = Vec::new();
        for day in days {
            let day = keys::parse_date(&day)?;
            if after.is_some_and(|after| day <= after) {
                continue;
            }
            if let Some(mismatch) = self.verify_aggregates(day)? {
                mismatches.push(mismatch);
            }
        }
        Ok(mismatches)
    }
}

#[cfg(test)]
mod tests {
    use time::macros::{date, datetime};

    use super::*;

    fn test_store() -> Store {
        let mut store = Store::open_in_memory().unwrap();
        store.register_device("dev-1", "linux", "host").unwrap();
        store
    }

    #[test]
    fn test_cleanup_never_deletes_unsynced() {
        let mut store = test_store();
        let old = datetime!(2020-01-01 0:00 UTC);
        let synced = store.insert_sample(1, 1, old, 0).unwrap();
        store.insert_sample(2, 2, old, 0).unwrap();
        store.mark_synced(&[synced]).unwrap();

        assert_eq!(store.cleanup_synced_samples(0).unwrap(), 1);

        let remaining = store.all_samples().unwrap();
        assert_eq!(remaining.len(), 1);
        assert!(!remaining[0].synced);
    }

    #[test]
    fn test_cleanup_keeps_recent_synced() {
        let mut store = test_store();
        let id = store
            .insert_sample(1, 1, OffsetDateTime::now_utc(), 0)
            .unwrap();
        store.mark_synced(&[id]).unwrap();

        assert_eq!(store.cleanup_synced_samples(30).unwrap(), 0);
        assert_eq!(store.all_samples().unwrap().len(), 1);
    }

    #[test]
    fn test_cleanup_aggregates_before() {
        let mut store = test_store();
        store.insert_sample(1, 1, datetime!(2025-01-15 12:00 UTC), 0).unwrap();
        store.insert_sample(1, 1, datetime!(2025-02-28 12:00 UTC), 0).unwrap();
        store.insert_sample(1, 1, datetime!(2025-03-01 12:00 UTC), 0).unwrap();

        let result = store.cleanup_aggregates_before(date!(2025 - 03 - 01)).unwrap();
        assert_eq!(
            result,
            AggregateCleanup {
                daily_deleted: 2,
                monthly_deleted: 2
            }
        );
        assert_eq!(store.all_daily_aggregates().unwrap().len(), 1);
        assert_eq!(store.monthly_aggregates().unwrap()[0].month, "2025-03");
    }

    #[test]
    fn test_compact_in_memory() {
        let store = test_store();
        assert!(store.compact());
    }

    #[test]
    fn test_stats() {
        let mut store = test_store();
        let t0 = datetime!(2025-06-01 12:00 UTC);
        let id = store.insert_sample(1, 1, t0, 0).unwrap();
        store
            .insert_sample(1, 1, t0 + Duration::hours(1), 0)
            .unwrap();
        store.mark_synced(&[id]).unwrap();

        let stats = store.stats(400).unwrap();
        assert_eq!(stats.device_count, 1);
        assert_eq!(stats.sample_count, 2);
        assert_eq!(stats.unsynced_count, 1);
        assert_eq!(stats.daily_count, 1);
        assert_eq!(stats.monthly_count, 1);
        assert_eq!(stats.oldest_sample, Some(t0));
        assert_eq!(stats.newest_sample, Some(t0 + Duration::hours(1)));
        assert!(stats.size_bytes > 0);
        assert!(stats.usage_percent > 0.0 && stats.usage_percent < 100.0);
    }

    #[test]
    fn test_verify_aggregates_detects_drift() {
        let mut store = test_store();
        let day = date!(2025 - 06 - 01);
        store.insert_sample(10, 20, datetime!(2025-06-01 08:00 UTC), 0).unwrap();
        store.insert_sample(30, 40, datetime!(2025-06-01 23:59 UTC), 0).unwrap();

        assert_eq!(store.verify_aggregates(day).unwrap(), None);
        assert!(store.verify_all_aggregates().unwrap().is_empty());

        store
            .conn
            .execute(
                "UPDATE daily_aggregates SET bytes_sent = bytes_sent + 1",
                [],
            )
            .unwrap();

        let mismatch = store.verify_aggregates(day).unwrap().unwrap();
        assert_eq!(mismatch.from_samples, UsageTotals::new(40, 60));
        assert_eq!(mismatch.aggregate, UsageTotals::new(41, 60));
    }

    #[test]
    fn test_verify_recent_aggregates_skips_retention_window() {
        let mut store = test_store();
        let now = OffsetDateTime::now_utc();
        store.insert_sample(10, 10, now - Duration::days(90), 0).unwrap();
        store.insert_sample(20, 20, now, 0).unwrap();

        store
            .conn
            .execute("UPDATE daily_aggregates SET bytes_received = 0", [])
            .unwrap();

        assert_eq!(store.verify_all_aggregates().unwrap().len(), 2);
        let recent = store.verify_recent_aggregates(30).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].date, store.today());
        assert_eq!(recent[0].from_samples, UsageTotals::new(20, 20));
    }
}
