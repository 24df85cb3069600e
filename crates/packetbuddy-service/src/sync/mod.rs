//! Replication of local samples to a shared remote database.
//!
//! The local store is the system of record; the remote side is a
//! quota-limited replica holding every device's samples and aggregates so
//! cross-device totals can be read from one place.
//!
//! - [`RemoteStore`]: the operations a replica supports
//! - [`PostgresRemote`]: the production replica over `sqlx`
//! - [`MemoryRemote`]: an in-process replica with failure injection
//! - [`ReplicationEngine`]: batching, retries, idempotent re-application,
//!   fail-soft global reads and storage-pressure handling

mod batch;
mod engine;
mod memory;
mod postgres;
mod remote;

pub use batch::SyncBatch;
pub use engine::{
    PressureCheck, RemoteCleanup, ReplicationEngine, STATE_PENDING_BATCH, STATE_PENDING_MAX_ID,
    SyncReport, SyncSettings, run_sync_loop,
};
pub use memory::{AppliedBatch, MemoryRemote};
pub use postgres::PostgresRemote;
pub use remote::{BatchOutcome, RemoteStore, StorageUsage, TableSize};

use thiserror::Error;

/// Replication errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SyncError {
    /// The remote database rejected or dropped a request.
    #[error("Remote database error: {0}")]
    Remote(#[from] sqlx::Error),

    /// The local store failed.
    #[error("Local store error: {0}")]
    Store(#[from] packetbuddy_store::Error),

    /// The remote store cannot be reached or is not configured.
    #[error("Remote store unavailable: {0}")]
    Unavailable(String),

    /// Every attempt at pushing a batch failed.
    #[error("Sync failed after {attempts} attempt(s): {last}")]
    RetriesExhausted {
        /// Attempts made.
        attempts: u32,
        /// Error from the final attempt.
        #[source]
        last: Box<SyncError>,
    },

    /// The operation did not finish in time.
    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Result type alias for replication.
pub type Result<T> = std::result::Result<T, SyncError>;

impl From<packetbuddy_core::RetryError<SyncError>> for SyncError {
    fn from(err: packetbuddy_core::RetryError<SyncError>) -> Self {
        SyncError::RetriesExhausted {
            attempts: err.attempts,
            last: Box::new(err.last),
        }
    }
}
