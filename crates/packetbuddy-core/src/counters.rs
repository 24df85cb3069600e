//! Cumulative network byte counters.
//!
//! The [`CounterSource`] trait abstracts over the operating system's
//! per-interface counters so the monitor can be driven by
//! [`SystemCounters`] in production and by [`MockCounters`](crate::MockCounters)
//! in tests.
//!
//! Counters are *cumulative since boot*. The monitor only ever looks at the
//! difference between two consecutive reads, so the absolute values matter
//! only for the startup catch-up.

use serde::{Deserialize, Serialize};
use sysinfo::{Networks, System};
use tracing::debug;

use crate::error::{Error, Result};
use crate::interface;

/// Interface name prefixes that never carry internet traffic.
///
/// Loopback, tunnels, Apple wireless direct link, hypervisor bridges and
/// container veth pairs would otherwise double-count or inflate usage.
pub const IGNORED_INTERFACE_PREFIXES: &[&str] = &[
    "lo", "utun", "awdl", "llw", "anpi", "gif", "stf", "bridge", "ap", "vboxnet", "vmnet",
    "docker", "veth",
];

/// Sent/received byte totals at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    /// Bytes transmitted.
    pub sent: u64,
    /// Bytes received.
    pub received: u64,
}

impl CounterSnapshot {
    /// Create a snapshot.
    pub const fn new(sent: u64, received: u64) -> Self {
        Self { sent, received }
    }

    /// Whether both counters are zero.
    pub fn is_zero(&self) -> bool {
        self.sent == 0 && self.received == 0
    }
}

/// Counters for a single network interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceCounters {
    /// Interface name as reported by the OS (e.g. `eth0`, `en0`, `Wi-Fi`).
    pub name: String,
    /// Bytes transmitted since boot.
    pub sent: u64,
    /// Bytes received since boot.
    pub received: u64,
}

impl InterfaceCounters {
    /// Create interface counters.
    pub fn new(name: impl Into<String>, sent: u64, received: u64) -> Self {
        Self {
            name: name.into(),
            sent,
            received,
        }
    }
}

/// A source of cumulative per-interface byte counters.
///
/// One implementation exists per OS family ([`SystemCounters`]) plus a
/// scripted mock for tests.
pub trait CounterSource: Send {
    /// Best-effort lookup of the interface carrying the default route.
    fn detect_primary_interface(&mut self) -> Option<String>;

    /// Current counters for every interface the OS reports.
    fn list_interface_counters(&mut self) -> Result<Vec<InterfaceCounters>>;

    /// System boot time as seconds since the Unix epoch.
    fn boot_time(&self) -> u64;

    /// Read the totals the monitor should track.
    ///
    /// See [`select_totals`] for how `primary` is applied.
    fn read_totals(&mut self, primary: Option<&str>) -> Result<CounterSnapshot> {
        let interfaces = self.list_interface_counters()?;
        select_totals(&interfaces, primary)
    }
}

/// Whether an interface name belongs to the virtual/loopback set.
pub fn is_virtual_interface(name: &str) -> bool {
    let lower = name.to_lowercase();
    IGNORED_INTERFACE_PREFIXES
        .iter()
        .any(|prefix| lower.starts_with(prefix))
}

/// Reduce per-interface counters to the totals the monitor tracks.
///
/// With a known primary interface, only that interface counts; if it is no
/// longer reported the read fails so the caller can re-detect. Without a
/// primary interface, every non-virtual interface with non-zero counters is
/// summed.
pub fn select_totals(
    interfaces: &[InterfaceCounters],
    primary: Option<&str>,
) -> Result<CounterSnapshot> {
    if let Some(primary) = primary {
        return interfaces
            .iter()
            .find(|iface| iface.name == primary)
            .map(|iface| CounterSnapshot::new(iface.sent, iface.received))
            .ok_or_else(|| {
                Error::CounterRead(format!("primary interface {} is not present", primary))
            });
    }

    let mut totals = CounterSnapshot::default();
    let mut counted = 0usize;

    for iface in interfaces {
        if is_virtual_interface(&iface.name) {
            continue;
        }
        if iface.sent == 0 && iface.received == 0 {
            continue;
        }
        totals.sent = totals.sent.saturating_add(iface.sent);
        totals.received = totals.received.saturating_add(iface.received);
        counted += 1;
    }

    if counted == 0 {
        return Err(Error::NoInterfaces);
    }

    Ok(totals)
}

/// Counter source backed by the operating system via `sysinfo`.
pub struct SystemCounters {
    networks: Networks,
}

impl std::fmt::Debug for SystemCounters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemCounters").finish_non_exhaustive()
    }
}

impl SystemCounters {
    /// Create a counter source with a freshly enumerated interface list.
    pub fn new() -> Self {
        Self {
            networks: Networks::new_with_refreshed_list(),
        }
    }
}

impl Default for SystemCounters {
    fn default() -> Self {
        Self::new()
    }
}

impl CounterSource for SystemCounters {
    fn detect_primary_interface(&mut self) -> Option<String> {
        let detected = interface::detect_primary_interface();
        debug!("Primary interface detection: {:?}", detected);
        detected
    }

    fn list_interface_counters(&mut self) -> Result<Vec<InterfaceCounters>> {
        // Re-enumerate so interfaces that appear after startup (USB
        // tethering, VPN-less reconnects) are picked up.
        self.networks.refresh_list();

        let mut interfaces = Vec::new();
        for (name, data) in &self.networks {
            interfaces.push(InterfaceCounters::new(
                name.clone(),
                data.total_transmitted(),
                data.total_received(),
            ));
        }

        if interfaces.is_empty() {
            return Err(Error::CounterRead(
                "operating system reported no network interfaces".to_string(),
            ));
        }

        Ok(interfaces)
    }

    fn boot_time(&self) -> u64 {
        System::boot_time()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_interfaces() -> Vec<InterfaceCounters> {
        vec![
            InterfaceCounters::new("lo", 9_000, 9_000),
            InterfaceCounters::new("eth0", 1_000, 5_000),
            InterfaceCounters::new("wlan0", 200, 300),
            InterfaceCounters::new("docker0", 7_000, 7_000),
            InterfaceCounters::new("veth12ab", 1, 1),
            InterfaceCounters::new("enp3s0", 0, 0),
        ]
    }

    #[test]
    fn test_virtual_interface_prefixes() {
        assert!(is_virtual_interface("lo"));
        assert!(is_virtual_interface("lo0"));
        assert!(is_virtual_interface("utun3"));
        assert!(is_virtual_interface("Docker0"));
        assert!(is_virtual_interface("vmnet8"));
        assert!(!is_virtual_interface("eth0"));
        assert!(!is_virtual_interface("en0"));
        assert!(!is_virtual_interface("Wi-Fi"));
    }

    #[test]
    fn test_select_totals_sums_physical_interfaces() {
        let totals = select_totals(&sample_interfaces(), None).unwrap();
        assert_eq!(totals, CounterSnapshot::new(1_200, 5_300));
    }

    #[test]
    fn test_select_totals_uses_primary_only() {
        let totals = select_totals(&sample_interfaces(), Some("wlan0")).unwrap();
        assert_eq!(totals, CounterSnapshot::new(200, 300));
    }

    #[test]
    fn test_select_totals_missing_primary_fails() {
        let result = select_totals(&sample_interfaces(), Some("eth9"));
        assert!(matches!(result, Err(Error::CounterRead(_))));
    }

    #[test]
    fn test_select_totals_only_virtual_interfaces() {
        let interfaces = vec![
            InterfaceCounters::new("lo", 10, 10),
            InterfaceCounters::new("bridge0", 10, 10),
        ];
        assert!(matches!(
            select_totals(&interfaces, None),
            Err(Error::NoInterfaces)
        ));
    }

    #[test]
    fn test_snapshot_is_zero() {
        assert!(CounterSnapshot::default().is_zero());
        assert!(!CounterSnapshot::new(0, 1).is_zero());
    }
}
