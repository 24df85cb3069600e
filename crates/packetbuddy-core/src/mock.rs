//! Scripted counter and power sources for testing.
//!
//! [`MockCounters`] implements [`CounterSource`] and [`MockPower`] implements
//! [`PowerSource`], so the monitor can be driven deterministically without
//! touching the host's network stack.
//!
//! Both are cheap to clone; clones share state, so a test can hand one copy
//! to the monitor and keep another to script readings.
//!
//! # Features
//!
//! - **Scripted readings**: queue a sequence of totals, consumed one per read
//! - **Failure injection**: fail the next `n` reads, or every read
//! - **Primary interface control**: change what detection reports mid-run

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::counters::{CounterSnapshot, CounterSource, InterfaceCounters};
use crate::error::{Error, Result};
use crate::power::{PowerSource, PowerState};

/// Name of the interface the mock reports.
pub const MOCK_INTERFACE: &str = "mock0";

#[derive(Debug, Default)]
struct CounterScript {
    totals: CounterSnapshot,
    queued: VecDeque<CounterSnapshot>,
    primary: Option<String>,
}

#[derive(Debug, Default)]
struct MockCountersInner {
    script: Mutex<CounterScript>,
    boot_time: AtomicU64,
    read_count: AtomicU32,
    detect_count: AtomicU32,
    remaining_failures: AtomicU32,
    should_fail: AtomicBool,
}

/// A scripted [`CounterSource`].
///
/// # Example
///
/// ```
/// use packetbuddy_core::{CounterSnapshot, CounterSource, MockCounters};
///
/// let counters = MockCounters::new(CounterSnapshot::new(100, 200));
/// counters.push_readings([CounterSnapshot::new(150, 260)]);
///
/// let mut source = counters.clone();
/// assert_eq!(source.read_totals(None).unwrap(), CounterSnapshot::new(150, 260));
/// // Once the queue is drained the last value sticks.
/// assert_eq!(source.read_totals(None).unwrap(), CounterSnapshot::new(150, 260));
/// assert_eq!(counters.read_count(), 2);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MockCounters {
    inner: Arc<MockCountersInner>,
}

impl MockCounters {
    /// Create a mock reporting `initial` until told otherwise.
    pub fn new(initial: CounterSnapshot) -> Self {
        let mock = Self::default();
        mock.script().totals = initial;
        mock.inner.boot_time.store(1_700_000_000, Ordering::Relaxed);
        mock
    }

    fn script(&self) -> MutexGuard<'_, CounterScript> {
        self.inner
            .script
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // --- Test control methods ---

    /// Replace the current totals.
    pub fn set_totals(&self, totals: CounterSnapshot) {
        self.script().totals = totals;
    }

    /// Queue readings returned by successive reads.
    pub fn push_readings(&self, readings: impl IntoIterator<Item = CounterSnapshot>) {
        self.script().queued.extend(readings);
    }

    /// Totals the next read returns if nothing is queued.
    pub fn totals(&self) -> CounterSnapshot {
        self.script().totals
    }

    /// Set the reported boot time (seconds since the Unix epoch).
    pub fn set_boot_time(&self, boot_time: u64) {
        self.inner.boot_time.store(boot_time, Ordering::Relaxed);
    }

    /// Set what primary interface detection reports.
    pub fn set_primary(&self, primary: Option<&str>) {
        self.script().primary = primary.map(str::to_string);
    }

    /// Fail the next `count` reads, then succeed.
    pub fn fail_next(&self, count: u32) {
        self.inner.remaining_failures.store(count, Ordering::Relaxed);
    }

    /// Fail every read until reset.
    pub fn set_should_fail(&self, fail: bool) {
        self.inner.should_fail.store(fail, Ordering::Relaxed);
    }

    /// Number of successful reads so far.
    pub fn read_count(&self) -> u32 {
        self.inner.read_count.load(Ordering::Relaxed)
    }

    /// Number of primary interface detections so far.
    pub fn detect_count(&self) -> u32 {
        self.inner.detect_count.load(Ordering::Relaxed)
    }

    fn check_should_fail(&self) -> Result<()> {
        let injected = self
            .inner
            .remaining_failures
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok();

        if injected || self.inner.should_fail.load(Ordering::Relaxed) {
            return Err(Error::CounterRead("mock failure".to_string()));
        }
        Ok(())
    }
}

impl CounterSource for MockCounters {
    fn detect_primary_interface(&mut self) -> Option<String> {
        self.inner.detect_count.fetch_add(1, Ordering::Relaxed);
        self.script().primary.clone()
    }

    fn list_interface_counters(&mut self) -> Result<Vec<InterfaceCounters>> {
        self.check_should_fail()?;

        let mut script = self.script();
        if let Some(next) = script.queued.pop_front() {
            script.totals = next;
        }
        let name = script
            .primary
            .clone()
            .unwrap_or_else(|| MOCK_INTERFACE.to_string());
        let totals = script.totals;
        drop(script);

        self.inner.read_count.fetch_add(1, Ordering::Relaxed);
        Ok(vec![InterfaceCounters::new(
            name,
            totals.sent,
            totals.received,
        )])
    }

    fn boot_time(&self) -> u64 {
        self.inner.boot_time.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
struct MockPowerInner {
    state: Mutex<PowerState>,
    query_count: AtomicU32,
    should_fail: AtomicBool,
}

/// A scripted [`PowerSource`].
#[derive(Debug, Clone)]
pub struct MockPower {
    inner: Arc<MockPowerInner>,
}

impl MockPower {
    /// Create a mock reporting `state`.
    pub fn new(state: PowerState) -> Self {
        Self {
            inner: Arc::new(MockPowerInner {
                state: Mutex::new(state),
                query_count: AtomicU32::new(0),
                should_fail: AtomicBool::new(false),
            }),
        }
    }

    /// Change the reported state.
    pub fn set_state(&self, state: PowerState) {
        *self
            .inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = state;
    }

    /// Fail every query until reset.
    pub fn set_should_fail(&self, fail: bool) {
        self.inner.should_fail.store(fail, Ordering::Relaxed);
    }

    /// Number of queries so far, including failed ones.
    pub fn query_count(&self) -> u32 {
        self.inner.query_count.load(Ordering::Relaxed)
    }
}

impl Default for MockPower {
    fn default() -> Self {
        Self::new(PowerState::Ac)
    }
}

impl PowerSource for MockPower {
    fn power_state(&mut self) -> Result<PowerState> {
        self.inner.query_count.fetch_add(1, Ordering::Relaxed);
        if self.inner.should_fail.load(Ordering::Relaxed) {
            return Err(Error::Power("mock failure".to_string()));
        }
        Ok(*self
            .inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_counters_queue_then_sticky() {
        let counters = MockCounters::new(CounterSnapshot::new(1, 1));
        counters.push_readings([CounterSnapshot::new(2, 2), CounterSnapshot::new(3, 3)]);

        let mut source = counters.clone();
        assert_eq!(source.read_totals(None).unwrap(), CounterSnapshot::new(2, 2));
        assert_eq!(source.read_totals(None).unwrap(), CounterSnapshot::new(3, 3));
        assert_eq!(source.read_totals(None).unwrap(), CounterSnapshot::new(3, 3));
        assert_eq!(counters.read_count(), 3);
    }

    #[test]
    fn test_mock_counters_fail_next() {
        let counters = MockCounters::new(CounterSnapshot::new(5, 5));
        counters.fail_next(2);

        let mut source = counters.clone();
        assert!(source.read_totals(None).is_err());
        assert!(source.read_totals(None).is_err());
        assert!(source.read_totals(None).is_ok());
        assert_eq!(counters.read_count(), 1);
    }

    #[test]
    fn test_mock_counters_primary_selection() {
        let counters = MockCounters::new(CounterSnapshot::new(10, 20));
        let mut source = counters.clone();

        // mock0 is not a virtual interface, so the summed path sees it.
        assert_eq!(source.read_totals(None).unwrap(), CounterSnapshot::new(10, 20));

        counters.set_primary(Some("en0"));
        assert_eq!(source.detect_primary_interface().as_deref(), Some("en0"));
        assert!(source.read_totals(Some("en0")).is_ok());
        assert!(source.read_totals(Some("eth9")).is_err());
    }

    #[test]
    fn test_mock_power() {
        let power = MockPower::new(PowerState::Ac);
        let mut source = power.clone();
        assert_eq!(source.power_state().unwrap(), PowerState::Ac);

        power.set_state(PowerState::Battery);
        assert_eq!(source.power_state().unwrap(), PowerState::Battery);

        power.set_should_fail(true);
        assert!(source.power_state().is_err());
        assert_eq!(power.query_count(), 3);
    }
}
