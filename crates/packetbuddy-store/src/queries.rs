//! Query builder for raw usage samples.
//!
//! [`SampleQuery`] backs the export-oriented bulk reads and the sync
//! partition. It follows the builder pattern; every filter is optional.
//!
//! # Example
//!
//! ```
//! use packetbuddy_store::{SampleQuery, Store};
//! use time::{Duration, OffsetDateTime};
//!
//! let mut store = Store::open_in_memory()?;
//! store.register_device("dev-1", "linux", "host")?;
//!
//! let hour_ago = OffsetDateTime::now_utc() - Duration::hours(1);
//! let query = SampleQuery::new()
//!     .since(hour_ago)
//!     .unsynced()
//!     .oldest_first()
//!     .limit(100);
//!
//! let samples = store.query_samples(&query)?;
//! assert!(samples.is_empty());
//! # Ok::<(), packetbuddy_store::Error>(())
//! ```

use time::OffsetDateTime;

/// Fluent query builder for usage samples.
///
/// By default, queries return samples of the registered device ordered by
/// ID descending (newest first).
#[derive(Debug, Default, Clone)]
pub struct SampleQuery {
    /// Only samples at or after this time.
    pub since: Option<OffsetDateTime>,
    /// Only samples at or before this time.
    pub until: Option<OffsetDateTime>,
    /// Filter on the synced flag.
    pub synced: Option<bool>,
    /// Only samples with an ID at or below this one.
    pub max_id: Option<i64>,
    /// Maximum number of results.
    pub limit: Option<u32>,
    /// Offset for pagination.
    pub offset: Option<u32>,
    /// Order by ID descending.
    pub newest_first: bool,
}

impl SampleQuery {
    /// Create a new query: every sample, newest first.
    pub fn new() -> Self {
        Self {
            newest_first: true,
            ..Default::default()
        }
    }

    /// Only samples recorded at or after `time`.
    pub fn since(mut self, time: OffsetDateTime) -> Self {
        self.since = Some(time);
        self
    }

    /// Only samples recorded at or before `time`.
    pub fn until(mut self, time: OffsetDateTime) -> Self {
        self.until = Some(time);
        self
    }

    /// Only samples not yet replicated.
    pub fn unsynced(mut self) -> Self {
        self.synced = Some(false);
        self
    }

    /// Only samples already replicated.
    pub fn synced(mut self) -> Self {
        self.synced = Some(true);
        self
    }

    /// Only samples with `id <= max_id`.
    pub fn through_id(mut self, max_id: i64) -> Self {
        self.max_id = Some(max_id);
        self
    }

    /// Limit the number of results.
    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Skip the first `offset` results.
    pub fn offset(mut self, offset: u32) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Order chronologically (ascending ID).
    pub fn oldest_first(mut self) -> Self {
        self.newest_first = false;
        self
    }

    /// Build the SQL WHERE clause and parameters.
    ///
    /// The device filter is always the first parameter.
    pub(crate) fn build_where(&self, device_id: &str) -> (String, Vec<Box<dyn rusqlite::ToSql>>) {
        let mut conditions = vec!["device_id = ?"];
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(device_id.to_string())];

        if let Some(since) = self.since {
            conditions.push("timestamp >= ?");
            params.push(Box::new(since.unix_timestamp()));
        }

        if let Some(until) = self.until {
            conditions.push("timestamp <= ?");
            params.push(Box::new(until.unix_timestamp()));
        }

        if let Some(synced) = self.synced {
            conditions.push("synced = ?");
            params.push(Box::new(synced));
        }

        if let Some(max_id) = self.max_id {
            conditions.push("id <= ?");
            params.push(Box::new(max_id));
        }

        (format!("WHERE {}", conditions.join(" AND ")), params)
    }

    /// Build the full SQL query.
    pub(crate) fn build_sql(&self, device_id: &str) -> String {
        let (where_clause, _) = self.build_where(device_id);
        let order = if self.newest_first { "DESC" } else { "ASC" };

        let mut sql = format!(
            "SELECT id, device_id, timestamp, bytes_sent, bytes_received, synced \
             FROM usage_samples {} ORDER BY id {}",
            where_clause, order
        );

        // SQLite only accepts OFFSET after a LIMIT.
        match (self.limit, self.offset) {
            (Some(limit), Some(offset)) => {
                sql.push_str(&format!(" LIMIT {} OFFSET {}", limit, offset))
            }
            (Some(limit), None) => sql.push_str(&format!(" LIMIT {}", limit)),
            (None, Some(offset)) => sql.push_str(&format!(" LIMIT -1 OFFSET {}", offset)),
            (None, None) => {}
        }

        sql
    }
}
