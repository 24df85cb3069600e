//! Host-side sampling primitives for the PacketBuddy usage agent.
//!
//! This crate knows how to ask the operating system how many bytes have
//! crossed the network since boot, whether the machine is on battery, and
//! how to turn successive counter readings into trustworthy per-tick deltas.
//! It has no storage or network dependencies; the agent in
//! `packetbuddy-service` wires these pieces into its loops.
//!
//! # Features
//!
//! - **Counter sources**: per-interface byte counters via `sysinfo`
//! - **Primary interface detection**: default-route lookup per OS
//! - **Delta policy**: counter resets and anomalous jumps are discarded
//! - **Power awareness**: battery detection and a slower cadence on battery
//! - **Retry helpers**: bounded async retries for flaky remote calls
//! - **Mocks**: scripted counter and power sources for tests
//!
//! # Quick Start
//!
//! ```no_run
//! use packetbuddy_core::{CounterSource, DeltaTracker, Observation, SystemCounters};
//!
//! let mut counters = SystemCounters::new();
//! let primary = counters.detect_primary_interface();
//! let baseline = counters.read_totals(primary.as_deref())?;
//! let mut tracker = DeltaTracker::new(baseline, packetbuddy_core::DEFAULT_MAX_DELTA_BYTES);
//!
//! std::thread::sleep(std::time::Duration::from_secs(1));
//! if let Observation::Delta { sent, received } =
//!     tracker.observe(counters.read_totals(primary.as_deref())?)
//! {
//!     println!("{} bytes up, {} bytes down", sent, received);
//! }
//! # Ok::<(), packetbuddy_core::Error>(())
//! ```

pub mod counters;
pub mod delta;
pub mod error;
pub mod interface;
pub mod mock;
pub mod power;
pub mod retry;

pub use counters::{
    CounterSnapshot, CounterSource, InterfaceCounters, SystemCounters, is_virtual_interface,
    select_totals,
};
pub use delta::{DEFAULT_MAX_DELTA_BYTES, DeltaTracker, Observation};
pub use error::{Error, Result};
pub use interface::detect_primary_interface;
pub use mock::{MockCounters, MockPower};
pub use power::{Cadence, PowerSource, PowerState, SystemPower};
pub use retry::{RetryConfig, RetryError, with_retry, with_retry_if};
