//! Main store implementation.

use std::path::{Path, PathBuf};

use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, Transaction, params};
use time::{Date, OffsetDateTime, UtcOffset};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::keys::{self, date_key, month_key};
use crate::models::{
    DailyAggregate, DayUsage, MonthlyAggregate, MonthlySummary, NewSample, StateValue,
    StoredDevice, TrackingStats, UsageSample, UsageTotals,
};
use crate::queries::SampleQuery;
use crate::schema;

/// Largest number of IDs bound into a single `IN (...)` clause.
const MARK_SYNCED_CHUNK: usize = 500;

/// SQLite-based store for usage samples and their aggregates.
///
/// A store is bound to one device via [`Store::register_device`]; sample
/// writes and per-device reads fail with [`Error::DeviceNotRegistered`]
/// until then.
#[derive(Debug)]
pub struct Store {
    pub(crate) conn: Connection,
    pub(crate) path: Option<PathBuf>,
    device_id: Option<String>,
    offset: UtcOffset,
}

impl Store {
    /// Open or create a database at the given path.
    ///
    /// Runs `PRAGMA quick_check` before touching the schema; a damaged file
    /// yields [`Error::Corrupt`].
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| Error::CreateDirectory {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
            }
        }

        info!("Opening database at {}", path.display());
        let conn = Connection::open(path).map_err(Error::classify)?;

        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )
        .map_err(Error::classify)?;

        check_integrity(&conn)?;
        schema::initialize(&conn)?;

        Ok(Self {
            conn,
            path: Some(path.to_path_buf()),
            device_id: None,
            offset: UtcOffset::UTC,
        })
    }

    /// Open the default database location.
    pub fn open_default() -> Result<Self> {
        Self::open(crate::default_db_path())
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        schema::initialize(&conn)?;
        Ok(Self {
            conn,
            path: None,
            device_id: None,
            offset: UtcOffset::UTC,
        })
    }

    /// Bucket samples into days and months using `offset` instead of UTC.
    #[must_use]
    pub fn with_utc_offset(mut self, offset: UtcOffset) -> Self {
        self.offset = offset;
        self
    }

    /// The offset used for day and month bucketing.
    pub fn utc_offset(&self) -> UtcOffset {
        self.offset
    }

    /// Path of the database file, `None` for in-memory stores.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// The calendar day `timestamp` falls on in the bucketing offset.
    pub fn bucket_date(&self, timestamp: OffsetDateTime) -> Date {
        timestamp.to_offset(self.offset).date()
    }

    /// Today in the bucketing offset.
    pub fn today(&self) -> Date {
        self.bucket_date(OffsetDateTime::now_utc())
    }

    /// The registered device ID.
    pub fn device_id(&self) -> Result<&str> {
        self.device_id.as_deref().ok_or(Error::DeviceNotRegistered)
    }
}

fn check_integrity(conn: &Connection) -> Result<()> {
    let verdict: String = conn
        .query_row("PRAGMA quick_check", [], |row| row.get(0))
        .map_err(Error::classify)?;
    if verdict != "ok" {
        return Err(Error::Corrupt(verdict));
    }
    Ok(())
}

pub(crate) fn to_sql_int(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

pub(crate) fn from_sql_int(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn timestamp_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<OffsetDateTime> {
    let ts: i64 = row.get(idx)?;
    OffsetDateTime::from_unix_timestamp(ts)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Integer, Box::new(e)))
}

fn date_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Date> {
    let key: String = row.get(idx)?;
    Date::parse(&key, keys::DATE_FORMAT)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn row_to_device(row: &Row<'_>) -> rusqlite::Result<StoredDevice> {
    Ok(StoredDevice {
        device_id: row.get(0)?,
        os_type: row.get(1)?,
        hostname: row.get(2)?,
        created_at: timestamp_at(row, 3)?,
        updated_at: timestamp_at(row, 4)?,
    })
}

fn row_to_sample(row: &Row<'_>) -> rusqlite::Result<UsageSample> {
    Ok(UsageSample {
        id: row.get(0)?,
        device_id: row.get(1)?,
        timestamp: timestamp_at(row, 2)?,
        bytes_sent: from_sql_int(row.get(3)?),
        bytes_received: from_sql_int(row.get(4)?),
        synced: row.get(5)?,
    })
}

fn row_to_daily(row: &Row<'_>) -> rusqlite::Result<DailyAggregate> {
    Ok(DailyAggregate {
        date: date_at(row, 0)?,
        bytes_sent: from_sql_int(row.get(1)?),
        bytes_received: from_sql_int(row.get(2)?),
        peak_speed: from_sql_int(row.get(3)?),
    })
}

// Device operations
impl Store {
    /// Register (or refresh) this install's device and bind the store to it.
    ///
    /// `os_type` and `hostname` are refreshed on every call; `created_at`
    /// is preserved.
    pub fn register_device(
        &mut self,
        device_id: &str,
        os_type: &str,
        hostname: &str,
    ) -> Result<StoredDevice> {
        let now = OffsetDateTime::now_utc().unix_timestamp();

        self.conn.execute(
            "INSERT INTO devices (device_id, os_type, hostname, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(device_id) DO UPDATE SET
                os_type = excluded.os_type,
                hostname = excluded.hostname,
                updated_at = excluded.updated_at",
            params![device_id, os_type, hostname, now],
        )?;

        self.device_id = Some(device_id.to_string());
        debug!("Registered device {} ({}, {})", device_id, os_type, hostname);

        self.get_device(device_id)?
            .ok_or(Error::DeviceNotRegistered)
    }

    /// Get a device by ID.
    pub fn get_device(&self, device_id: &str) -> Result<Option<StoredDevice>> {
        let device = self
            .conn
            .query_row(
                "SELECT device_id, os_type, hostname, created_at, updated_at
                 FROM devices WHERE device_id = ?",
                [device_id],
                row_to_device,
            )
            .optional()?;

        Ok(device)
    }

    /// List all devices, most recently registered first.
    pub fn list_devices(&self) -> Result<Vec<StoredDevice>> {
        let mut stmt = self.conn.prepare(
            "SELECT device_id, os_type, hostname, created_at, updated_at
             FROM devices ORDER BY updated_at DESC",
        )?;

        let devices = stmt
            .query_map([], row_to_device)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(devices)
    }
}

// Sample writes
impl Store {
    /// Append a sample and fold it into its daily and monthly aggregates.
    ///
    /// The three writes share one transaction: either the raw row and both
    /// aggregates change, or none do. `speed` is the combined bytes/second
    /// of the tick and only ever raises the day's `peak_speed`.
    pub fn insert_sample(
        &mut self,
        bytes_sent: u64,
        bytes_received: u64,
        timestamp: OffsetDateTime,
        speed: u64,
    ) -> Result<i64> {
        self.insert_samples(&[NewSample {
            bytes_sent,
            bytes_received,
            timestamp,
            speed,
        }])
        .map(|ids| ids.first().copied().unwrap_or_default())
    }

    /// Append several samples in one transaction.
    ///
    /// Returns the assigned IDs in input order.
    pub fn insert_samples(&mut self, samples: &[NewSample]) -> Result<Vec<i64>> {
        if samples.is_empty() {
            return Ok(Vec::new());
        }

        let device_id = self.device_id()?.to_string();
        let offset = self.offset;
        let tx = self.conn.transaction()?;

        let mut ids = Vec::with_capacity(samples.len());
        for sample in samples {
            ids.push(insert_in(&tx, &device_id, offset, sample)?);
        }

        tx.commit()?;
        debug!("Inserted {} sample(s)", ids.len());
        Ok(ids)
    }
}

fn insert_in(
    tx: &Transaction<'_>,
    device_id: &str,
    offset: UtcOffset,
    sample: &NewSample,
) -> Result<i64> {
    let date = sample.timestamp.to_offset(offset).date();
    let sent = to_sql_int(sample.bytes_sent);
    let received = to_sql_int(sample.bytes_received);

    tx.execute(
        "INSERT INTO usage_samples (device_id, timestamp, bytes_sent, bytes_received)
         VALUES (?1, ?2, ?3, ?4)",
        params![device_id, sample.timestamp.unix_timestamp(), sent, received],
    )?;
    let id = tx.last_insert_rowid();

    tx.execute(
        "INSERT INTO daily_aggregates (device_id, date, bytes_sent, bytes_received, peak_speed)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(device_id, date) DO UPDATE SET
            bytes_sent = bytes_sent + excluded.bytes_sent,
            bytes_received = bytes_received + excluded.bytes_received,
            peak_speed = MAX(peak_speed, excluded.peak_speed)",
        params![
            device_id,
            date_key(date),
            sent,
            received,
            to_sql_int(sample.speed)
        ],
    )?;

    tx.execute(
        "INSERT INTO monthly_aggregates (device_id, month, bytes_sent, bytes_received)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(device_id, month) DO UPDATE SET
            bytes_sent = bytes_sent + excluded.bytes_sent,
            bytes_received = bytes_received + excluded.bytes_received",
        params![device_id, month_key(date), sent, received],
    )?;

    Ok(id)
}

// Aggregate reads
impl Store {
    /// Usage for today in the bucketing offset. Zeros if nothing recorded.
    pub fn today_usage(&self) -> Result<DayUsage> {
        self.usage_for_date(self.today())
    }

    /// Usage for one day. Zeros if nothing recorded.
    pub fn usage_for_date(&self, date: Date) -> Result<DayUsage> {
        let usage = self
            .conn
            .query_row(
                "SELECT bytes_sent, bytes_received, peak_speed
                 FROM daily_aggregates WHERE device_id = ?1 AND date = ?2",
                params![self.device_id()?, date_key(date)],
                |row| {
                    Ok(DayUsage {
                        bytes_sent: from_sql_int(row.get(0)?),
                        bytes_received: from_sql_int(row.get(1)?),
                        peak_speed: from_sql_int(row.get(2)?),
                    })
                },
            )
            .optional()?;

        Ok(usage.unwrap_or_default())
    }

    /// Daily breakdown for a `YYYY-MM` month, oldest day first.
    pub fn month_usage(&self, month: &str) -> Result<Vec<DailyAggregate>> {
        keys::parse_month(month)?;

        let mut stmt = self.conn.prepare(
            "SELECT date, bytes_sent, bytes_received, peak_speed
             FROM daily_aggregates
             WHERE device_id = ?1 AND substr(date, 1, 7) = ?2
             ORDER BY date ASC",
        )?;

        let rows = stmt
            .query_map(params![self.device_id()?, month], row_to_daily)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(rows)
    }

    /// Daily breakdown for an inclusive date range, oldest day first.
    pub fn range_usage(&self, from: Date, to: Date) -> Result<Vec<DailyAggregate>> {
        if from > to {
            return Err(Error::InvalidDate(format!(
                "range start {} is after end {}",
                from, to
            )));
        }

        let mut stmt = self.conn.prepare(
            "SELECT date, bytes_sent, bytes_received, peak_speed
             FROM daily_aggregates
             WHERE device_id = ?1 AND date BETWEEN ?2 AND ?3
             ORDER BY date ASC",
        )?;

        let rows = stmt
            .query_map(
                params![self.device_id()?, date_key(from), date_key(to)],
                row_to_daily,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(rows)
    }

    /// Sum over every daily aggregate row of this device.
    pub fn lifetime_usage(&self) -> Result<UsageTotals> {
        let totals = self.conn.query_row(
            "SELECT COALESCE(SUM(bytes_sent), 0), COALESCE(SUM(bytes_received), 0)
             FROM daily_aggregates WHERE device_id = ?",
            [self.device_id()?],
            |row| {
                Ok(UsageTotals::new(
                    from_sql_int(row.get(0)?),
                    from_sql_int(row.get(1)?),
                ))
            },
        )?;

        Ok(totals)
    }

    /// Highest daily peak speed ever recorded.
    pub fn peak_speed(&self) -> Result<u64> {
        let peak: Option<i64> = self.conn.query_row(
            "SELECT MAX(peak_speed) FROM daily_aggregates WHERE device_id = ?",
            [self.device_id()?],
            |row| row.get(0),
        )?;

        Ok(peak.map(from_sql_int).unwrap_or(0))
    }

    /// Every daily aggregate row, oldest first.
    pub fn all_daily_aggregates(&self) -> Result<Vec<DailyAggregate>> {
        let mut stmt = self.conn.prepare(
            "SELECT date, bytes_sent, bytes_received, peak_speed
             FROM daily_aggregates WHERE device_id = ? ORDER BY date ASC",
        )?;

        let rows = stmt
            .query_map([self.device_id()?], row_to_daily)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(rows)
    }

    /// Every monthly aggregate row, oldest first.
    pub fn monthly_aggregates(&self) -> Result<Vec<MonthlyAggregate>> {
        let mut stmt = self.conn.prepare(
            "SELECT month, bytes_sent, bytes_received
             FROM monthly_aggregates WHERE device_id = ? ORDER BY month ASC",
        )?;

        let rows = stmt
            .query_map([self.device_id()?], |row| {
                Ok(MonthlyAggregate {
                    month: row.get(0)?,
                    bytes_sent: from_sql_int(row.get(1)?),
                    bytes_received: from_sql_int(row.get(2)?),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(rows)
    }

    /// Months rolled up from daily rows, with peak and days tracked.
    pub fn monthly_summaries(&self) -> Result<Vec<MonthlySummary>> {
        let mut stmt = self.conn.prepare(
            "SELECT substr(date, 1, 7) AS month,
                    SUM(bytes_sent), SUM(bytes_received), MAX(peak_speed), COUNT(*)
             FROM daily_aggregates
             WHERE device_id = ?
             GROUP BY month
             ORDER BY month ASC",
        )?;

        let rows = stmt
            .query_map([self.device_id()?], |row| {
                Ok(MonthlySummary {
                    month: row.get(0)?,
                    bytes_sent: from_sql_int(row.get(1)?),
                    bytes_received: from_sql_int(row.get(2)?),
                    peak_speed: from_sql_int(row.get(3)?),
                    days_tracked: row.get(4)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(rows)
    }

    /// First/last tracked day and the number of days tracked.
    pub fn tracking_stats(&self) -> Result<TrackingStats> {
        let (first, last, days): (Option<String>, Option<String>, u32) = self.conn.query_row(
            "SELECT MIN(date), MAX(date), COUNT(DISTINCT date)
             FROM daily_aggregates WHERE device_id = ?",
            [self.device_id()?],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        Ok(TrackingStats {
            first_date: first.as_deref().map(keys::parse_date).transpose()?,
            last_date: last.as_deref().map(keys::parse_date).transpose()?,
            days_tracked: days,
        })
    }
}

// Sample reads and the sync partition
impl Store {
    /// Query samples of the registered device.
    pub fn query_samples(&self, query: &SampleQuery) -> Result<Vec<UsageSample>> {
        let device_id = self.device_id()?;
        let sql = query.build_sql(device_id);
        let (_, params) = query.build_where(device_id);

        debug!("Executing query: {}", sql);

        let params_ref: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();

        let mut stmt = self.conn.prepare(&sql)?;
        let samples = stmt
            .query_map(params_ref.as_slice(), row_to_sample)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(samples)
    }

    /// Every sample, oldest first.
    pub fn all_samples(&self) -> Result<Vec<UsageSample>> {
        self.query_samples(&SampleQuery::new().oldest_first())
    }

    /// Up to `limit` unsynced samples, oldest first.
    pub fn unsynced_samples(&self, limit: u32) -> Result<Vec<UsageSample>> {
        self.query_samples(&SampleQuery::new().unsynced().oldest_first().limit(limit))
    }

    /// Up to `limit` unsynced samples with `id <= max_id`, oldest first.
    ///
    /// Used to rebuild a batch that was sent but not acknowledged.
    pub fn unsynced_samples_through(&self, max_id: i64, limit: u32) -> Result<Vec<UsageSample>> {
        self.query_samples(
            &SampleQuery::new()
                .unsynced()
                .through_id(max_id)
                .oldest_first()
                .limit(limit),
        )
    }

    /// Flag samples as replicated.
    ///
    /// Empty input is a no-op and repeated IDs are harmless. Returns the
    /// number of rows that flipped from unsynced to synced.
    pub fn mark_synced(&mut self, ids: &[i64]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }

        let tx = self.conn.transaction()?;
        let mut updated = 0;

        for chunk in ids.chunks(MARK_SYNCED_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(",");
            let sql = format!(
                "UPDATE usage_samples SET synced = 1 WHERE synced = 0 AND id IN ({})",
                placeholders
            );
            updated += tx.execute(&sql, rusqlite::params_from_iter(chunk.iter()))?;
        }

        tx.commit()?;
        debug!("Marked {} of {} sample(s) synced", updated, ids.len());
        Ok(updated)
    }

    /// Number of samples waiting for replication.
    pub fn count_unsynced(&self) -> Result<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM usage_samples WHERE synced = 0",
            [],
            |row| row.get(0),
        )?;
        Ok(from_sql_int(count))
    }
}

// Agent state
impl Store {
    /// Read a state entry.
    pub fn get_state(&self, key: &str) -> Result<Option<StateValue>> {
        let value = self
            .conn
            .query_row(
                "SELECT value_text, value_int FROM agent_state WHERE key = ?",
                [key],
                |row| {
                    Ok(StateValue {
                        text: row.get(0)?,
                        int: row.get(1)?,
                    })
                },
            )
            .optional()?;

        Ok(value)
    }

    /// Read the integer payload of a state entry.
    pub fn state_int(&self, key: &str) -> Result<Option<i64>> {
        Ok(self.get_state(key)?.and_then(|v| v.int))
    }

    /// Read the text payload of a state entry.
    pub fn state_text(&self, key: &str) -> Result<Option<String>> {
        Ok(self.get_state(key)?.and_then(|v| v.text))
    }

    /// Overwrite a state entry with an integer.
    pub fn set_state_int(&self, key: &str, value: i64) -> Result<()> {
        self.put_state(key, None, Some(value))
    }

    /// Overwrite a state entry with text.
    pub fn set_state_text(&self, key: &str, value: &str) -> Result<()> {
        self.put_state(key, Some(value), None)
    }

    /// Remove a state entry. Missing keys are ignored.
    pub fn clear_state(&self, key: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM agent_state WHERE key = ?", [key])?;
        Ok(())
    }

    fn put_state(&self, key: &str, text: Option<&str>, int: Option<i64>) -> Result<()> {
        self.conn.execute(
            "INSERT INTO agent_state (key, value_text, value_int, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(key) DO UPDATE SET
                value_text = excluded.value_text,
                value_int = excluded.value_int,
                updated_at = excluded.updated_at",
            params![key, text, int, OffsetDateTime::now_utc().unix_timestamp()],
        )?;
        Ok(())
    }
}
