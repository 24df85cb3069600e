//! Integration tests for packetbuddy-core
//!
//! The host tests read real interface counters and should be run with:
//! `cargo test --package packetbuddy-core -- --ignored --nocapture`

use std::time::Duration;

use packetbuddy_core::{
    CounterSnapshot, CounterSource, DeltaTracker, MockCounters, Observation, SystemCounters,
};

#[test]
#[ignore = "reads host network counters"]
fn test_system_counters_are_monotonic() {
    let mut counters = SystemCounters::new();
    let primary = counters.detect_primary_interface();
    println!("Primary interface: {:?}", primary);

    let first = counters
        .read_totals(primary.as_deref())
        .expect("first read");
    std::thread::sleep(Duration::from_millis(500));
    let second = counters
        .read_totals(primary.as_deref())
        .expect("second read");

    println!("Totals: {:?} -> {:?}", first, second);
    assert!(second.sent >= first.sent);
    assert!(second.received >= first.received);
    assert!(counters.boot_time() > 0);
}

#[test]
fn test_tracker_over_scripted_reboot() {
    let counters = MockCounters::new(CounterSnapshot::new(1_000, 10_000));
    counters.push_readings([
        CounterSnapshot::new(1_500, 12_000),
        // Reboot: counters restart near zero.
        CounterSnapshot::new(40, 90),
        CounterSnapshot::new(140, 290),
    ]);

    let mut source = counters.clone();
    let baseline = source.read_totals(None).expect("baseline");
    let mut tracker = DeltaTracker::new(CounterSnapshot::new(1_000, 10_000), 1_000_000);
    assert_eq!(
        tracker.observe(baseline),
        Observation::Delta {
            sent: 500,
            received: 2_000
        }
    );

    let reboot = source.read_totals(None).expect("after reboot");
    assert_eq!(tracker.observe(reboot), Observation::Reset);

    let after = source.read_totals(None).expect("after reboot");
    assert_eq!(
        tracker.observe(after),
        Observation::Delta {
            sent: 100,
            received: 200
        }
    );
}

#[test]
fn test_primary_interface_disappearing() {
    let counters = MockCounters::new(CounterSnapshot::new(10, 10));
    counters.set_primary(Some("wlan0"));

    let mut source = counters.clone();
    let primary = source.detect_primary_interface();
    assert!(source.read_totals(primary.as_deref()).is_ok());

    // Wi-Fi drops, Ethernet takes over.
    counters.set_primary(Some("eth0"));
    assert!(source.read_totals(primary.as_deref()).is_err());

    let primary = source.detect_primary_interface();
    assert_eq!(primary.as_deref(), Some("eth0"));
    assert!(source.read_totals(primary.as_deref()).is_ok());
}
