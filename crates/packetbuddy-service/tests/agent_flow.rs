//! End-to-end tests: monitor → on-disk store → replication, across restarts.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use packetbuddy_core::{CounterSnapshot, MockCounters, MockPower, PowerState, RetryConfig};
use packetbuddy_service::monitor::{STATE_BOOT_TIME, STATE_LAST_RECEIVED, STATE_LAST_SENT};
use packetbuddy_service::state::share;
use packetbuddy_service::sync::{BatchOutcome, MemoryRemote, STATE_PENDING_BATCH};
use packetbuddy_service::{
    DeviceIdentity, Monitor, MonitorSettings, MonitorState, ReplicationEngine, SharedStore,
    SyncSettings,
};
use packetbuddy_store::{Store, UsageTotals};
use tokio_util::sync::CancellationToken;

const DEVICE: &str = "flow-device";

fn open(path: &Path) -> SharedStore {
    let mut store = Store::open(path).unwrap();
    store.register_device(DEVICE, "linux", "host").unwrap();
    share(store)
}

fn engine(store: &SharedStore, remote: &MemoryRemote) -> ReplicationEngine {
    ReplicationEngine::new(
        Arc::clone(store),
        Arc::new(remote.clone()),
        DeviceIdentity {
            device_id: DEVICE.to_string(),
            os_type: "linux".to_string(),
            hostname: "host".to_string(),
        },
        SyncSettings {
            retry: RetryConfig::fixed(3, Duration::ZERO),
            connect_retry: RetryConfig::none(),
            ..SyncSettings::default()
        },
    )
}

async fn run_monitor(store: &SharedStore, counters: &MockCounters, readings: &[(u64, u64)]) {
    let monitor = Monitor::new(
        Arc::clone(store),
        counters.clone(),
        MockPower::new(PowerState::Ac),
        MonitorSettings::default(),
    );
    let handle = monitor.start(CancellationToken::new());

    let mut states = monitor.subscribe();
    states
        .wait_for(|state| *state == MonitorState::Running)
        .await
        .unwrap();

    counters.push_readings(
        readings
            .iter()
            .map(|&(sent, received)| CounterSnapshot::new(sent, received)),
    );
    tokio::time::sleep(Duration::from_secs(readings.len() as u64 + 2)).await;

    monitor.stop().await;
    handle.await.unwrap();
    assert_eq!(monitor.state(), MonitorState::Stopped);
    assert_eq!(monitor.pending_len(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_first_run_catches_up_then_samples() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir.path().join("usage.db"));
    let counters = MockCounters::new(CounterSnapshot::new(50_000, 90_000));

    run_monitor(&store, &counters, &[(51_000, 91_000), (53_000, 92_000)]).await;

    let store = store.lock().await;
    let today = store.today_usage().unwrap();
    assert_eq!((today.bytes_sent, today.bytes_received), (53_000, 92_000));
    // One synthetic catch-up sample plus two ticks.
    assert_eq!(store.all_samples().unwrap().len(), 3);
    assert_eq!(store.state_int(STATE_BOOT_TIME).unwrap(), Some(1_700_000_000));
    assert_eq!(store.state_int(STATE_LAST_SENT).unwrap(), Some(53_000));
    assert_eq!(store.state_int(STATE_LAST_RECEIVED).unwrap(), Some(92_000));
}

#[tokio::test(start_paused = true)]
async fn test_restart_on_same_boot_records_gap_only() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("usage.db");

    {
        let store = open(&path);
        let counters = MockCounters::new(CounterSnapshot::new(50_000, 90_000));
        run_monitor(&store, &counters, &[]).await;
    }

    // Same boot, counters moved while the agent was down.
    let store = open(&path);
    let counters = MockCounters::new(CounterSnapshot::new(60_000, 95_000));
    run_monitor(&store, &counters, &[]).await;

    let store = store.lock().await;
    let today = store.today_usage().unwrap();
    assert_eq!((today.bytes_sent, today.bytes_received), (60_000, 95_000));
    assert_eq!(store.all_samples().unwrap().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_restart_after_reboot_counts_from_zero() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("usage.db");

    {
        let store = open(&path);
        let counters = MockCounters::new(CounterSnapshot::new(500_000, 900_000));
        run_monitor(&store, &counters, &[]).await;
    }

    let store = open(&path);
    let counters = MockCounters::new(CounterSnapshot::new(2_000, 3_000));
    counters.set_boot_time(1_800_000_000);
    run_monitor(&store, &counters, &[]).await;

    let store = store.lock().await;
    let today = store.today_usage().unwrap();
    assert_eq!((today.bytes_sent, today.bytes_received), (502_000, 903_000));
}

#[tokio::test(start_paused = true)]
async fn test_crash_between_flushes_loses_no_usage() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("usage.db");
    let counters = MockCounters::new(CounterSnapshot::new(0, 0));

    {
        let store = open(&path);
        let monitor = Monitor::new(
            Arc::clone(&store),
            counters.clone(),
            MockPower::new(PowerState::Ac),
            MonitorSettings::default(),
        );
        let handle = monitor.start(CancellationToken::new());
        monitor
            .subscribe()
            .wait_for(|state| *state == MonitorState::Running)
            .await
            .unwrap();

        counters.push_readings((1..=45).map(|i| CounterSnapshot::new(i * 1_000, i * 2_000)));
        tokio::time::sleep(Duration::from_secs(45)).await;

        // One flush has happened; the process dies before the next.
        assert!(!store.lock().await.all_samples().unwrap().is_empty());
        assert!(monitor.pending_len() > 0);
        handle.abort();
        let _ = handle.await;
    }

    // Same boot: catch-up covers everything that was only buffered.
    let store = open(&path);
    run_monitor(&store, &counters, &[]).await;

    let today = store.lock().await.today_usage().unwrap();
    assert_eq!((today.bytes_sent, today.bytes_received), (45_000, 90_000));
}

#[tokio::test]
async fn test_lost_ack_survives_process_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("usage.db");
    let remote = MemoryRemote::new();

    {
        let store = open(&path);
        {
            let mut s = store.lock().await;
            let now = time::OffsetDateTime::now_utc();
            s.insert_sample(1_000, 2_000, now, 0).unwrap();
            s.insert_sample(500, 500, now, 0).unwrap();
        }

        remote.fail_next_after_apply(3);
        assert!(engine(&store, &remote).sync().await.is_err());

        let s = store.lock().await;
        assert!(s.state_text(STATE_PENDING_BATCH).unwrap().is_some());
        assert_eq!(s.count_unsynced().unwrap(), 2);
    }

    // New process, new engine, same database file.
    let store = open(&path);
    let report = engine(&store, &remote).sync().await.unwrap();

    assert!(report.resumed);
    assert_eq!(report.outcome, Some(BatchOutcome::AlreadyApplied));
    assert_eq!(remote.applied().len(), 1);
    assert_eq!(remote.log_count(), 2);

    let today = time::OffsetDateTime::now_utc().date();
    assert_eq!(remote.daily(DEVICE, today), Some(UsageTotals::new(1_500, 2_500)));
    assert_eq!(store.lock().await.count_unsynced().unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_monitor_and_sync_together() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir.path().join("usage.db"));
    let remote = MemoryRemote::new();
    let counters = MockCounters::new(CounterSnapshot::new(0, 0));

    run_monitor(&store, &counters, &[(100, 200), (300, 600)]).await;

    let engine = engine(&store, &remote);
    assert_eq!(engine.sync_all().await.unwrap(), 2);
    assert_eq!(engine.global_today_usage().await, UsageTotals::new(300, 600));
    assert_eq!(engine.device_count().await, 1);
}
