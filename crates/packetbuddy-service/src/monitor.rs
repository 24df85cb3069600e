//! Network usage monitor.
//!
//! The monitor owns three loops:
//!
//! - **sample**: reads the byte counters every poll interval, classifies the
//!   delta and buffers usable ticks in memory
//! - **flush**: writes the buffer to the store every batch interval and
//!   persists the absolute counters for the next start's catch-up; the
//!   persisted counters never run ahead of the written samples
//! - **power**: checks the power source and stretches both intervals while
//!   on battery
//!
//! The sample loop never waits on storage; only the flush loop and the
//! startup catch-up take the store lock.
//!
//! Lifecycle: `Initializing → CatchingUp → Running → Draining → Stopped`.
//! On cancellation the loops exit at their next wake and the buffer is
//! drained into the store before the state becomes `Stopped`.

use std::sync::{Arc, Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use packetbuddy_core::{
    Cadence, CounterSnapshot, CounterSource, DeltaTracker, Observation, PowerSource, PowerState,
};
use packetbuddy_store::NewSample;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::MonitoringConfig;
use crate::state::{FailureTracker, SharedStore};

/// State key: boot time of the session the counters below belong to.
pub const STATE_BOOT_TIME: &str = "boot_time";
/// State key: last absolute bytes-sent counter.
pub const STATE_LAST_SENT: &str = "last_abs_sent";
/// State key: last absolute bytes-received counter.
pub const STATE_LAST_RECEIVED: &str = "last_abs_received";

/// Catch-up gaps at or below this many bytes in both directions are ignored.
pub const CATCH_UP_THRESHOLD: u64 = 1024;

/// Where the monitor is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MonitorState {
    /// Detecting the interface and taking the first reading.
    Initializing,
    /// Reconciling usage from while the agent was not running.
    CatchingUp,
    /// Loops are active.
    Running,
    /// Writing buffered samples after a stop request.
    Draining,
    /// Terminal.
    Stopped,
}

/// Monitor tuning, usually derived from [`MonitoringConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorSettings {
    /// Base sample interval.
    pub poll_interval: Duration,
    /// Base flush interval.
    pub batch_interval: Duration,
    /// Power check interval.
    pub power_check_interval: Duration,
    /// Anomaly threshold in bytes per tick.
    pub max_delta_bytes: u64,
    /// Track this interface instead of detecting one.
    pub interface: Option<String>,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self::from(&MonitoringConfig::default())
    }
}

impl From<&MonitoringConfig> for MonitorSettings {
    fn from(config: &MonitoringConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            batch_interval: config.batch_write_interval(),
            power_check_interval: config.battery_check_interval(),
            max_delta_bytes: config.max_delta_bytes,
            interface: config.interface().map(str::to_string),
        }
    }
}

/// Persisted counters from a previous run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PriorCounters {
    /// Boot time recorded with the counters.
    pub boot_time: Option<u64>,
    /// Absolute counters, if both directions were recorded.
    pub counters: Option<CounterSnapshot>,
}

/// The host's counters right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostCounters {
    /// Current boot time.
    pub boot_time: u64,
    /// Current absolute counters.
    pub counters: CounterSnapshot,
}

/// Usage that happened while the agent was not running.
///
/// - Same boot with prior counters: the difference, never negative.
/// - Same boot, no prior counters, nothing recorded today: everything since boot.
/// - Different boot: everything since boot.
/// - Otherwise nothing.
pub fn catch_up_gap(
    prior: PriorCounters,
    current: HostCounters,
    has_usage_today: bool,
) -> CounterSnapshot {
    if prior.boot_time != Some(current.boot_time) {
        return current.counters;
    }

    match prior.counters {
        Some(prev) => CounterSnapshot::new(
            current.counters.sent.saturating_sub(prev.sent),
            current.counters.received.saturating_sub(prev.received),
        ),
        None if !has_usage_today => current.counters,
        None => CounterSnapshot::default(),
    }
}

/// Record the catch-up gap (if significant) and persist the current counters.
///
/// Returns the gap that was written as a synthetic sample, if any.
pub async fn run_catch_up(
    store: &SharedStore,
    current: HostCounters,
) -> packetbuddy_store::Result<Option<CounterSnapshot>> {
    let mut store = store.lock().await;

    let prior = PriorCounters {
        boot_time: store.state_int(STATE_BOOT_TIME)?.map(from_state_int),
        counters: match (
            store.state_int(STATE_LAST_SENT)?,
            store.state_int(STATE_LAST_RECEIVED)?,
        ) {
            (Some(sent), Some(received)) => Some(CounterSnapshot::new(
                from_state_int(sent),
                from_state_int(received),
            )),
            _ => None,
        },
    };
    let today = store.today_usage()?;
    let has_usage_today = today.bytes_sent.saturating_add(today.bytes_received) > 0;

    let gap = catch_up_gap(prior, current, has_usage_today);
    let recorded = if gap.sent > CATCH_UP_THRESHOLD || gap.received > CATCH_UP_THRESHOLD {
        info!(
            "Catching up on missed usage: {} bytes sent, {} bytes received",
            gap.sent, gap.received
        );
        store.insert_sample(gap.sent, gap.received, OffsetDateTime::now_utc(), 0)?;
        Some(gap)
    } else {
        debug!("No significant usage to catch up on");
        None
    };

    store.set_state_int(STATE_BOOT_TIME, to_state_int(current.boot_time))?;
    store.set_state_int(STATE_LAST_SENT, to_state_int(current.counters.sent))?;
    store.set_state_int(STATE_LAST_RECEIVED, to_state_int(current.counters.received))?;

    Ok(recorded)
}

fn to_state_int(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_state_int(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

struct Sampler {
    counters: Box<dyn CounterSource>,
    primary: Option<String>,
    tracker: Option<DeltaTracker>,
}

/// Buffered samples and the absolute counters they bring the store up to.
#[derive(Default)]
struct Pending {
    samples: Vec<NewSample>,
    absolute: Option<CounterSnapshot>,
}

struct Cadences {
    poll: Duration,
    batch: Duration,
    power: PowerState,
}

struct Inner {
    store: SharedStore,
    settings: MonitorSettings,
    cadence: Cadence,
    sampler: Mutex<Sampler>,
    power: Mutex<Box<dyn PowerSource>>,
    cadences: Mutex<Cadences>,
    pending: Mutex<Pending>,
    speed: Mutex<(f64, f64)>,
    state: watch::Sender<MonitorState>,
    started: AtomicBool,
    cancel: Mutex<Option<CancellationToken>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Samples network counters into the store.
///
/// Cheap to clone; clones share the same loops and buffer.
#[derive(Clone)]
pub struct Monitor {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Monitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Monitor")
            .field("state", &self.state())
            .field("pending", &self.pending_len())
            .finish_non_exhaustive()
    }
}

impl Monitor {
    /// Create a monitor. Nothing runs until [`Monitor::start`].
    pub fn new<C, P>(store: SharedStore, counters: C, power: P, settings: MonitorSettings) -> Self
    where
        C: CounterSource + 'static,
        P: PowerSource + 'static,
    {
        let cadence = Cadence::new(settings.poll_interval, settings.batch_interval);
        let (state, _) = watch::channel(MonitorState::Initializing);

        Self {
            inner: Arc::new(Inner {
                store,
                cadence,
                sampler: Mutex::new(Sampler {
                    counters: Box::new(counters),
                    primary: None,
                    tracker: None,
                }),
                power: Mutex::new(Box::new(power)),
                cadences: Mutex::new(Cadences {
                    poll: settings.poll_interval,
                    batch: settings.batch_interval,
                    power: PowerState::Unknown,
                }),
                settings,
                pending: Mutex::new(Pending::default()),
                speed: Mutex::new((0.0, 0.0)),
                state,
                started: AtomicBool::new(false),
                cancel: Mutex::new(None),
            }),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> MonitorState {
        *self.inner.state.borrow()
    }

    /// Subscribe to lifecycle changes.
    pub fn subscribe(&self) -> watch::Receiver<MonitorState> {
        self.inner.state.subscribe()
    }

    /// Most recent `(sent, received)` speed in bytes/second.
    pub fn current_speed(&self) -> (f64, f64) {
        *lock(&self.inner.speed)
    }

    /// Samples buffered but not yet written.
    pub fn pending_len(&self) -> usize {
        lock(&self.inner.pending).samples.len()
    }

    /// Effective `(poll, batch)` intervals.
    pub fn intervals(&self) -> (Duration, Duration) {
        let cadences = lock(&self.inner.cadences);
        (cadences.poll, cadences.batch)
    }

    /// Interface being tracked, or `None` when summing all interfaces.
    pub fn primary_interface(&self) -> Option<String> {
        lock(&self.inner.sampler).primary.clone()
    }

    /// Initialize, catch up, and spawn the loops.
    ///
    /// The returned task finishes after the loops have exited and the
    /// buffer has been drained. Cancelling `cancel` (or calling
    /// [`Monitor::stop`]) ends it.
    pub fn start(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let token = cancel.child_token();
        *lock(&self.inner.cancel) = Some(token.clone());
        self.inner.started.store(true, Ordering::SeqCst);

        let monitor = self.clone();
        tokio::spawn(async move { monitor.run(token).await })
    }

    /// Stop the loops and wait until buffered samples are written.
    pub async fn stop(&self) {
        if !self.inner.started.load(Ordering::SeqCst) {
            self.drain().await;
            return;
        }

        let token = lock(&self.inner.cancel).clone();
        if let Some(token) = token {
            token.cancel();
        }

        let mut rx = self.subscribe();
        let _ = rx.wait_for(|state| *state == MonitorState::Stopped).await;
    }

    async fn run(&self, cancel: CancellationToken) {
        self.set_state(MonitorState::Initializing);
        let baseline = self.initialize();

        if let Some(counters) = baseline {
            self.set_state(MonitorState::CatchingUp);
            let boot_time = lock(&self.inner.sampler).counters.boot_time();
            let current = HostCounters {
                boot_time,
                counters,
            };
            if let Err(e) = run_catch_up(&self.inner.store, current).await {
                warn!("Catch-up failed: {}", e);
            }
        } else {
            warn!("No initial counter reading, skipping catch-up");
        }

        if let Err(e) = self.check_power() {
            warn!("Initial power check failed: {}", e);
        }

        self.set_state(MonitorState::Running);
        info!("Monitor running");

        tokio::join!(
            self.sample_loop(cancel.clone()),
            self.flush_loop(cancel.clone()),
            self.power_loop(cancel.clone()),
        );

        self.drain().await;
    }

    /// Detect the interface and take the baseline reading.
    fn initialize(&self) -> Option<CounterSnapshot> {
        let mut guard = lock(&self.inner.sampler);
        let sampler = &mut *guard;

        let primary = match &self.inner.settings.interface {
            Some(name) => Some(name.clone()),
            None => sampler.counters.detect_primary_interface(),
        };
        match &primary {
            Some(name) => info!("Monitoring primary interface: {}", name),
            None => info!("No primary interface detected, summing all physical interfaces"),
        }
        sampler.primary = primary;

        let reading = match sampler.counters.read_totals(sampler.primary.as_deref()) {
            Ok(reading) => Ok(reading),
            Err(e) if sampler.primary.is_some() => {
                warn!("Primary interface unreadable ({}), summing all interfaces", e);
                sampler.primary = None;
                sampler.counters.read_totals(None)
            }
            Err(e) => Err(e),
        };

        match reading {
            Ok(counters) => {
                sampler.tracker = Some(DeltaTracker::new(
                    counters,
                    self.inner.settings.max_delta_bytes,
                ));
                lock(&self.inner.pending).absolute = Some(counters);
                Some(counters)
            }
            Err(e) => {
                warn!("Initial counter read failed: {}", e);
                None
            }
        }
    }

    /// One sample tick. Returns the buffered sample, if any.
    fn sample_once(&self) -> packetbuddy_core::Result<Option<NewSample>> {
        let poll_interval = lock(&self.inner.cadences).poll;
        let mut guard = lock(&self.inner.sampler);
        let sampler = &mut *guard;

        let current = match sampler.counters.read_totals(sampler.primary.as_deref()) {
            Ok(current) => current,
            Err(e) if sampler.primary.is_some() => {
                let previous = sampler.primary.take();
                let redetected = match &self.inner.settings.interface {
                    Some(name) => Some(name.clone()),
                    None => sampler.counters.detect_primary_interface(),
                };
                warn!(
                    "Read of {:?} failed ({}), switching to {:?}",
                    previous, e, redetected
                );
                sampler.primary = redetected;
                let current = sampler.counters.read_totals(sampler.primary.as_deref())?;
                self.resync(sampler, current);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let observation = match sampler.tracker.as_mut() {
            Some(tracker) => tracker.observe(current),
            None => {
                self.resync(sampler, current);
                return Ok(None);
            }
        };
        drop(guard);

        let sample = match observation {
            Observation::Reset => {
                debug!("Counter reset detected, discarding tick");
                None
            }
            Observation::Anomaly => {
                warn!("Anomalous counter jump detected, discarding tick");
                None
            }
            Observation::Delta { sent, received } => {
                let (sent_bps, received_bps) = observation.speed(poll_interval);
                *lock(&self.inner.speed) = (sent_bps, received_bps);

                observation.has_traffic().then(|| NewSample {
                    bytes_sent: sent,
                    bytes_received: received,
                    timestamp: OffsetDateTime::now_utc(),
                    speed: (sent_bps + received_bps) as u64,
                })
            }
        };

        // The counters and the sample accounting for them move together.
        let mut pending = lock(&self.inner.pending);
        pending.absolute = Some(current);
        if let Some(sample) = sample {
            pending.samples.push(sample);
        }
        Ok(sample)
    }

    fn resync(&self, sampler: &mut Sampler, current: CounterSnapshot) {
        match sampler.tracker.as_mut() {
            Some(tracker) => tracker.resync(current),
            None => {
                sampler.tracker = Some(DeltaTracker::new(
                    current,
                    self.inner.settings.max_delta_bytes,
                ))
            }
        }
        lock(&self.inner.pending).absolute = Some(current);
    }

    /// Write buffered samples and the absolute counters.
    ///
    /// The counters written are the ones captured with the last buffered
    /// tick, so they never include usage the store does not have yet. On
    /// failure the samples go back to the front of the buffer and the
    /// counters are left alone.
    pub async fn flush(&self) -> packetbuddy_store::Result<usize> {
        let (batch, absolute) = {
            let mut pending = lock(&self.inner.pending);
            (std::mem::take(&mut pending.samples), pending.absolute)
        };

        let mut store = self.inner.store.lock().await;

        if !batch.is_empty()
            && let Err(e) = store.insert_samples(&batch)
        {
            let mut pending = lock(&self.inner.pending);
            let newer = std::mem::replace(&mut pending.samples, batch);
            pending.samples.extend(newer);
            return Err(e);
        }

        if let Some(counters) = absolute {
            store.set_state_int(STATE_LAST_SENT, to_state_int(counters.sent))?;
            store.set_state_int(STATE_LAST_RECEIVED, to_state_int(counters.received))?;
        }

        if !batch.is_empty() {
            debug!("Flushed {} sample(s)", batch.len());
        }
        Ok(batch.len())
    }

    /// Check the power source and adjust the cadence on a transition.
    fn check_power(&self) -> packetbuddy_core::Result<Option<PowerState>> {
        let state = lock(&self.inner.power).power_state()?;
        if state == PowerState::Unknown {
            return Ok(None);
        }

        let mut cadences = lock(&self.inner.cadences);
        if cadences.power == state {
            return Ok(None);
        }

        let (poll, batch) = self.inner.cadence.for_state(state);
        if cadences.power != PowerState::Unknown || state.is_battery() {
            info!(
                "Power source changed to {:?}: poll every {:?}, flush every {:?}",
                state, poll, batch
            );
        }
        cadences.power = state;
        cadences.poll = poll;
        cadences.batch = batch;
        Ok(Some(state))
    }

    async fn sample_loop(&self, cancel: CancellationToken) {
        let failures = FailureTracker::new("Counter read");

        loop {
            let poll = lock(&self.inner.cadences).poll;
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(poll) => {}
            }

            match self.sample_once() {
                Ok(_) => failures.success(),
                Err(e) => failures.failure(&e),
            }
        }
        debug!("Sample loop stopped");
    }

    async fn flush_loop(&self, cancel: CancellationToken) {
        let failures = FailureTracker::new("Batch write");

        loop {
            let batch = lock(&self.inner.cadences).batch;
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(batch) => {}
            }

            match self.flush().await {
                Ok(_) => failures.success(),
                Err(e) => failures.failure(&e),
            }
        }
        debug!("Flush loop stopped");
    }

    async fn power_loop(&self, cancel: CancellationToken) {
        let failures = FailureTracker::new("Power check");
        let interval = self.inner.settings.power_check_interval;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            match self.check_power() {
                Ok(_) => failures.success(),
                Err(e) => failures.failure(&e),
            }
        }
        debug!("Power loop stopped");
    }

    async fn drain(&self) {
        self.set_state(MonitorState::Draining);
        let pending = self.pending_len();

        match self.flush().await {
            Ok(written) => {
                if written > 0 {
                    info!("Drained {} buffered sample(s)", written);
                }
            }
            Err(e) => warn!("Final flush of {} sample(s) failed: {}", pending, e),
        }

        self.set_state(MonitorState::Stopped);
        info!("Monitor stopped");
    }

    fn set_state(&self, state: MonitorState) {
        self.inner.state.send_replace(state);
    }
}
