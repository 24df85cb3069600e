//! Local durable storage for PacketBuddy usage samples.
//!
//! This crate is the single writer of record for everything the agent
//! persists: the raw sample log, daily and monthly aggregates derived from
//! it, the device row, and a small key/value table for cross-restart state.
//!
//! # Features
//!
//! - Atomic sample insert: raw row, daily and monthly aggregates in one transaction
//! - Today/month/range/lifetime reads served from aggregates
//! - Synced/unsynced partition for replication, oldest first
//! - Retention for synced samples and old aggregates, plus compaction
//! - Integrity check at open; a damaged file refuses to open
//!
//! # Example
//!
//! ```no_run
//! use packetbuddy_store::Store;
//! use time::OffsetDateTime;
//!
//! let mut store = Store::open_default()?;
//! store.register_device("3f6c0d5e-device", "linux", "workstation")?;
//!
//! store.insert_sample(1_024, 8_192, OffsetDateTime::now_utc(), 9_216)?;
//!
//! let today = store.today_usage()?;
//! println!("{} up, {} down", today.bytes_sent, today.bytes_received);
//! # Ok::<(), packetbuddy_store::Error>(())
//! ```

mod error;
pub mod keys;
mod models;
mod queries;
mod retention;
mod schema;
mod store;

pub use error::{Error, Result};
pub use models::{
    AggregateCleanup, AggregateMismatch, DailyAggregate, DayUsage, MonthlyAggregate,
    MonthlySummary, NewSample, StateValue, StoreStats, StoredDevice, TrackingStats, UsageSample,
    UsageTotals,
};
pub use queries::SampleQuery;
pub use schema::SCHEMA_VERSION;
pub use store::Store;

/// Default database path following platform conventions.
///
/// - Linux: `~/.local/share/packetbuddy/packetbuddy.db`
/// - macOS: `~/Library/Application Support/packetbuddy/packetbuddy.db`
/// - Windows: `C:\Users\<user>\AppData\Local\packetbuddy\packetbuddy.db`
pub fn default_db_path() -> std::path::PathBuf {
    default_data_dir().join("packetbuddy.db")
}

/// Directory holding the database and the device ID file.
pub fn default_data_dir() -> std::path::PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join("packetbuddy")
}
