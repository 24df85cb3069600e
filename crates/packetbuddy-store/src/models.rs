//! Data models for stored data.

use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};

/// A device registered with the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredDevice {
    /// Stable identifier generated once per install.
    pub device_id: String,
    /// Operating system family (`linux`, `macos`, `windows`, ...).
    pub os_type: String,
    /// Host name at the last registration.
    pub hostname: String,
    /// First registration.
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    /// Last registration.
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// A raw usage sample.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSample {
    /// Store-assigned, monotonically increasing row ID.
    pub id: i64,
    /// Device that recorded the sample.
    pub device_id: String,
    /// When the tick ended.
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    /// Bytes sent during the tick.
    pub bytes_sent: u64,
    /// Bytes received during the tick.
    pub bytes_received: u64,
    /// Whether the sample has been replicated.
    pub synced: bool,
}

/// A sample waiting to be written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewSample {
    /// Bytes sent during the tick.
    pub bytes_sent: u64,
    /// Bytes received during the tick.
    pub bytes_received: u64,
    /// When the tick ended.
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    /// Combined speed in bytes/second, folded into the daily peak.
    pub speed: u64,
}

/// Sent/received byte totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageTotals {
    /// Bytes sent.
    pub bytes_sent: u64,
    /// Bytes received.
    pub bytes_received: u64,
}

impl UsageTotals {
    /// Create totals.
    pub const fn new(bytes_sent: u64, bytes_received: u64) -> Self {
        Self {
            bytes_sent,
            bytes_received,
        }
    }

    /// Sent plus received.
    pub fn total(&self) -> u64 {
        self.bytes_sent.saturating_add(self.bytes_received)
    }

    /// Add another set of totals.
    pub fn add(&mut self, bytes_sent: u64, bytes_received: u64) {
        self.bytes_sent = self.bytes_sent.saturating_add(bytes_sent);
        self.bytes_received = self.bytes_received.saturating_add(bytes_received);
    }
}

/// Usage for one day, including the peak speed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayUsage {
    /// Bytes sent.
    pub bytes_sent: u64,
    /// Bytes received.
    pub bytes_received: u64,
    /// Highest combined speed observed, in bytes/second.
    pub peak_speed: u64,
}

/// A daily aggregate row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyAggregate {
    /// Calendar day in the store's bucketing offset.
    pub date: Date,
    /// Bytes sent.
    pub bytes_sent: u64,
    /// Bytes received.
    pub bytes_received: u64,
    /// Highest combined speed observed, in bytes/second.
    pub peak_speed: u64,
}

/// A monthly aggregate row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonthlyAggregate {
    /// Month key, `YYYY-MM`.
    pub month: String,
    /// Bytes sent.
    pub bytes_sent: u64,
    /// Bytes received.
    pub bytes_received: u64,
}

/// A month rolled up from the daily aggregates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonthlySummary {
    /// Month key, `YYYY-MM`.
    pub month: String,
    /// Bytes sent.
    pub bytes_sent: u64,
    /// Bytes received.
    pub bytes_received: u64,
    /// Highest daily peak in the month.
    pub peak_speed: u64,
    /// Days with any recorded usage.
    pub days_tracked: u32,
}

/// Overall tracking span.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackingStats {
    /// First day with recorded usage.
    pub first_date: Option<Date>,
    /// Most recent day with recorded usage.
    pub last_date: Option<Date>,
    /// Number of distinct days with recorded usage.
    pub days_tracked: u32,
}

/// A value in the agent state table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateValue {
    /// Text payload, if any.
    pub text: Option<String>,
    /// Integer payload, if any.
    pub int: Option<i64>,
}

/// Rows removed by aggregate retention.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateCleanup {
    /// Daily rows deleted.
    pub daily_deleted: usize,
    /// Monthly rows deleted.
    pub monthly_deleted: usize,
}

/// Store statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreStats {
    /// Registered devices.
    pub device_count: u64,
    /// Raw samples.
    pub sample_count: u64,
    /// Raw samples not yet replicated.
    pub unsynced_count: u64,
    /// Daily aggregate rows.
    pub daily_count: u64,
    /// Monthly aggregate rows.
    pub monthly_count: u64,
    /// Oldest sample timestamp.
    #[serde(with = "time::serde::rfc3339::option")]
    pub oldest_sample: Option<OffsetDateTime>,
    /// Newest sample timestamp.
    #[serde(with = "time::serde::rfc3339::option")]
    pub newest_sample: Option<OffsetDateTime>,
    /// Database size on disk in bytes.
    pub size_bytes: u64,
    /// `size_bytes` as a percentage of the configured quota.
    pub usage_percent: f64,
}

/// A daily aggregate that disagrees with the samples it was built from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateMismatch {
    /// The day checked.
    pub date: Date,
    /// Totals recomputed from raw samples.
    pub from_samples: UsageTotals,
    /// Totals held in the aggregate row.
    pub aggregate: UsageTotals,
}
