//! Counter delta policy.
//!
//! [`DeltaTracker`] turns a stream of cumulative counter readings into
//! per-tick deltas, discarding ticks where the counters went backwards
//! (reboot, sleep/resume, driver reload, 32-bit wrap) or jumped by more than
//! the anomaly threshold. Either way the baseline is resynchronised to the
//! new reading so the following tick is measured from a sane point.

use std::time::Duration;

use crate::counters::CounterSnapshot;

/// Default anomaly threshold: 1 GB in a single tick.
pub const DEFAULT_MAX_DELTA_BYTES: u64 = 1_000_000_000;

/// The outcome of one observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// Usable deltas since the previous reading. May be zero.
    Delta {
        /// Bytes sent since the previous reading.
        sent: u64,
        /// Bytes received since the previous reading.
        received: u64,
    },
    /// At least one counter decreased.
    Reset,
    /// At least one delta exceeded the anomaly threshold.
    Anomaly,
}

impl Observation {
    /// Whether this observation carries bytes worth recording.
    pub fn has_traffic(&self) -> bool {
        matches!(self, Observation::Delta { sent, received } if *sent > 0 || *received > 0)
    }

    /// Instantaneous `(sent, received)` speed in bytes/second.
    ///
    /// Discarded ticks report zero speed.
    pub fn speed(&self, poll_interval: Duration) -> (f64, f64) {
        let secs = poll_interval.as_secs_f64();
        match self {
            Observation::Delta { sent, received } if secs > 0.0 => {
                (*sent as f64 / secs, *received as f64 / secs)
            }
            _ => (0.0, 0.0),
        }
    }
}

/// Tracks the last counter reading and classifies new ones.
#[derive(Debug, Clone)]
pub struct DeltaTracker {
    last: CounterSnapshot,
    max_delta: u64,
}

impl DeltaTracker {
    /// Create a tracker with an initial baseline.
    pub fn new(baseline: CounterSnapshot, max_delta: u64) -> Self {
        Self {
            last: baseline,
            max_delta,
        }
    }

    /// The most recent reading.
    pub fn last(&self) -> CounterSnapshot {
        self.last
    }

    /// Replace the baseline without classifying anything.
    pub fn resync(&mut self, current: CounterSnapshot) {
        self.last = current;
    }

    /// Classify `current` against the baseline and advance the baseline.
    pub fn observe(&mut self, current: CounterSnapshot) -> Observation {
        let previous = std::mem::replace(&mut self.last, current);

        if current.sent < previous.sent || current.received < previous.received {
            return Observation::Reset;
        }

        let sent = current.sent - previous.sent;
        let received = current.received - previous.received;

        if sent > self.max_delta || received > self.max_delta {
            return Observation::Anomaly;
        }

        Observation::Delta { sent, received }
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Emitted plus discarded bytes always equal the counter growth
        /// since the last reset, and a decrease never emits anything.
        #[test]
        fn emitted_deltas_account_for_growth(
            steps in proptest::collection::vec((0u64..2_000, 0u64..2_000, any::<bool>()), 1..64)
        ) {
            let max_delta = 1_500;
            let mut tracker = DeltaTracker::new(CounterSnapshot::default(), max_delta);
            let mut origin = CounterSnapshot::default();
            let mut current = CounterSnapshot::default();
            let mut emitted = (0u64, 0u64);
            let mut discarded = (0u64, 0u64);

            for (sent, received, reboot) in steps {
                let next = if reboot {
                    CounterSnapshot::new(sent / 4, received / 4)
                } else {
                    CounterSnapshot::new(current.sent + sent, current.received + received)
                };
                let decreased = next.sent < current.sent || next.received < current.received;

                match tracker.observe(next) {
                    Observation::Delta { sent, received } => {
                        prop_assert!(!decreased);
                        prop_assert!(sent <= max_delta && received <= max_delta);
                        emitted.0 += sent;
                        emitted.1 += received;
                    }
                    Observation::Anomaly => {
                        prop_assert!(!decreased);
                        discarded.0 += next.sent - current.sent;
                        discarded.1 += next.received - current.received;
                    }
                    Observation::Reset => {
                        prop_assert!(decreased);
                        origin = next;
                        emitted = (0, 0);
                        discarded = (0, 0);
                    }
                }

                current = next;
                prop_assert_eq!(tracker.last(), next);
                prop_assert_eq!(emitted.0 + discarded.0, current.sent - origin.sent);
                prop_assert_eq!(emitted.1 + discarded.1, current.received - origin.received);
            }
        }
    }
}
