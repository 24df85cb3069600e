//! State shared between the agent's background tasks.
//!
//! The store is the only resource every task touches; it sits behind a
//! `tokio::sync::Mutex` so each SQLite transaction runs to completion before
//! the next task gets the connection. The rest of this module is small
//! bookkeeping the loops use to report what they are doing.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use packetbuddy_store::Store;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::{error, warn};

/// The local store, shared by the monitor, replication and maintenance.
pub type SharedStore = Arc<Mutex<Store>>;

/// Wrap a store for sharing between tasks.
pub fn share(store: Store) -> SharedStore {
    Arc::new(Mutex::new(store))
}

/// Failures logged at `warn` before a loop goes quiet.
pub const LOUD_FAILURES: u32 = 3;

/// Consecutive-failure counter for a periodic task.
///
/// The first few failures are logged as warnings; the next one is logged
/// once as an error and later ones are silent until the task succeeds again.
#[derive(Debug)]
pub struct FailureTracker {
    task: &'static str,
    consecutive: AtomicU32,
    total: AtomicU64,
}

impl FailureTracker {
    /// Tracker for the named task.
    pub const fn new(task: &'static str) -> Self {
        Self {
            task,
            consecutive: AtomicU32::new(0),
            total: AtomicU64::new(0),
        }
    }

    /// Record a success, resetting the consecutive count.
    pub fn success(&self) {
        self.consecutive.store(0, Ordering::Relaxed);
    }

    /// Record and log a failure.
    pub fn failure(&self, err: &dyn std::fmt::Display) {
        let n = self.consecutive.fetch_add(1, Ordering::Relaxed) + 1;
        self.total.fetch_add(1, Ordering::Relaxed);

        if n <= LOUD_FAILURES {
            warn!("{} failed: {} (attempt {})", self.task, err, n);
        } else if n == LOUD_FAILURES + 1 {
            error!(
                "{} failed {} times in a row, will continue trying silently: {}",
                self.task, n, err
            );
        }
    }

    /// Failures since the last success.
    pub fn consecutive(&self) -> u32 {
        self.consecutive.load(Ordering::Relaxed)
    }

    /// Failures since the tracker was created.
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}

/// Running flag and start time for a background task.
#[derive(Debug, Default)]
pub struct TaskStatus {
    running: AtomicBool,
    started_at: AtomicU64,
}

impl TaskStatus {
    /// A task that has not started.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the task is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Mark the task as started or stopped.
    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
        if running {
            let now = OffsetDateTime::now_utc().unix_timestamp().max(0) as u64;
            self.started_at.store(now, Ordering::SeqCst);
        }
    }

    /// When the task last started.
    pub fn started_at(&self) -> Option<OffsetDateTime> {
        let ts = self.started_at.load(Ordering::SeqCst);
        if ts == 0 {
            None
        } else {
            OffsetDateTime::from_unix_timestamp(ts as i64).ok()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_tracker_counts() {
        let tracker = FailureTracker::new("test task");
        for _ in 0..5 {
            tracker.failure(&"boom");
        }
        assert_eq!(tracker.consecutive(), 5);
        assert_eq!(tracker.total(), 5);

        tracker.success();
        assert_eq!(tracker.consecutive(), 0);
        assert_eq!(tracker.total(), 5);
    }

    #[test]
    fn test_task_status() {
        let status = TaskStatus::new();
        assert!(!status.is_running());
        assert!(status.started_at().is_none());

        status.set_running(true);
        assert!(status.is_running());
        assert!(status.started_at().is_some());

        status.set_running(false);
        assert!(!status.is_running());
        assert!(status.started_at().is_some());
    }

    #[tokio::test]
    async fn test_shared_store() {
        let mut store = Store::open_in_memory().unwrap();
        store.register_device("dev-1", "linux", "host").unwrap();
        let shared = share(store);

        let other = Arc::clone(&shared);
        tokio::spawn(async move {
            other.lock().await.set_state_int("k", 7).unwrap();
        })
        .await
        .unwrap();

        assert_eq!(shared.lock().await.state_int("k").unwrap(), Some(7));
    }
}
