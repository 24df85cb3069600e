//! Power source detection and power-aware cadence.
//!
//! On battery the agent wakes less often and writes less often. The
//! [`Cadence`] type holds the configured base intervals and derives the
//! effective ones for a given [`PowerState`].
//!
//! | Platform | Source |
//! |----------|--------|
//! | Linux | `/sys/class/power_supply/*/{type,online,status,scope}` |
//! | macOS | `pmset -g batt` |
//! | Windows | `Win32_Battery.BatteryStatus` via PowerShell |
//!
//! A host without a battery reports [`PowerState::Unknown`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Poll interval multiplier while on battery.
pub const BATTERY_POLL_MULTIPLIER: u32 = 2;
/// Batch write interval multiplier while on battery.
pub const BATTERY_BATCH_MULTIPLIER: u32 = 6;

/// Where the host currently draws power from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerState {
    /// Mains power.
    Ac,
    /// Running on battery.
    Battery,
    /// No battery present or state not reported.
    Unknown,
}

impl PowerState {
    /// Whether the host is running on battery.
    pub fn is_battery(self) -> bool {
        matches!(self, PowerState::Battery)
    }
}

/// A source of the host's power state.
pub trait PowerSource: Send {
    /// Query the current power state.
    fn power_state(&mut self) -> Result<PowerState>;
}

/// Base intervals and their power-adjusted values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cadence {
    /// Configured sample interval.
    pub base_poll: Duration,
    /// Configured flush interval.
    pub base_batch: Duration,
}

impl Cadence {
    /// Create a cadence from the configured base intervals.
    pub fn new(base_poll: Duration, base_batch: Duration) -> Self {
        Self {
            base_poll,
            base_batch,
        }
    }

    /// Effective `(poll, batch)` intervals on battery.
    pub fn on_battery(&self) -> (Duration, Duration) {
        (
            self.base_poll * BATTERY_POLL_MULTIPLIER,
            self.base_batch * BATTERY_BATCH_MULTIPLIER,
        )
    }

    /// Effective `(poll, batch)` intervals on mains power.
    pub fn on_ac(&self) -> (Duration, Duration) {
        (self.base_poll, self.base_batch)
    }

    /// Effective `(poll, batch)` intervals for `state`.
    ///
    /// [`PowerState::Unknown`] is treated as mains power.
    pub fn for_state(&self, state: PowerState) -> (Duration, Duration) {
        if state.is_battery() {
            self.on_battery()
        } else {
            self.on_ac()
        }
    }
}

/// Power source reading the platform's power supply information.
///
/// On Linux this walks `/sys/class/power_supply`; macOS and Windows ask the
/// OS tools listed in the module docs. Unsupported platforms report
/// [`PowerState::Unknown`], which leaves the cadence untouched.
#[derive(Debug, Clone)]
pub struct SystemPower {
    root: PathBuf,
}

impl SystemPower {
    /// Default sysfs location of power supply devices.
    pub const DEFAULT_ROOT: &'static str = "/sys/class/power_supply";

    /// Power source using the default sysfs root.
    pub fn new() -> Self {
        Self::with_root(Self::DEFAULT_ROOT)
    }

    /// Power source reading from a custom sysfs-style directory.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The directory being read.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Default for SystemPower {
    fn default() -> Self {
        Self::new()
    }
}

impl PowerSource for SystemPower {
    fn power_state(&mut self) -> Result<PowerState> {
        if cfg!(any(target_os = "linux", test)) {
            read_sysfs_power_state(&self.root)
        } else {
            platform_power_state()
        }
    }
}

#[cfg(target_os = "macos")]
fn platform_power_state() -> Result<PowerState> {
    let output = std::process::Command::new("pmset")
        .args(["-g", "batt"])
        .output()?;
    if !output.status.success() {
        return Err(crate::Error::Power(format!("pmset exited with {}", output.status)));
    }
    Ok(parse_pmset_batt(&String::from_utf8_lossy(&output.stdout)))
}

#[cfg(target_os = "windows")]
fn platform_power_state() -> Result<PowerState> {
    let output = std::process::Command::new("powershell")
        .args([
            "-NoProfile",
            "-Command",
            "Get-CimInstance -ClassName Win32_Battery | \
             Select-Object -ExpandProperty BatteryStatus",
        ])
        .output()?;
    if !output.status.success() {
        return Err(crate::Error::Power(format!(
            "Win32_Battery query exited with {}",
            output.status
        )));
    }
    Ok(parse_win32_battery_status(&String::from_utf8_lossy(
        &output.stdout,
    )))
}

#[cfg(not(any(target_os = "macos", target_os = "windows")))]
fn platform_power_state() -> Result<PowerState> {
    Ok(PowerState::Unknown)
}

/// Parse `pmset -g batt` output.
///
/// The first line names the source (`Now drawing from 'Battery Power'`);
/// an `InternalBattery` line is present only on machines with a battery.
pub fn parse_pmset_batt(output: &str) -> PowerState {
    let has_battery = output.contains("InternalBattery");
    let source = output.lines().find_map(|line| {
        let rest = line.split_once("drawing from '")?.1;
        rest.split_once('\'').map(|(source, _)| source)
    });

    match source {
        Some("Battery Power") | Some("UPS Power") => PowerState::Battery,
        Some("AC Power") if has_battery => PowerState::Ac,
        _ => PowerState::Unknown,
    }
}

/// Parse `Win32_Battery.BatteryStatus` values, one per line.
///
/// `1` (discharging), `4` (low) and `5` (critical) mean the host runs on
/// battery; `10` (undefined) is skipped; any other code means mains power.
/// No output means no battery.
pub fn parse_win32_battery_status(output: &str) -> PowerState {
    output
        .lines()
        .filter_map(|line| line.trim().parse::<u16>().ok())
        .find_map(|status| match status {
            1 | 4 | 5 => Some(PowerState::Battery),
            10 => None,
            _ => Some(PowerState::Ac),
        })
        .unwrap_or(PowerState::Unknown)
}

fn read_attr(dir: &Path, name: &str) -> Option<String> {
    std::fs::read_to_string(dir.join(name))
        .ok()
        .map(|s| s.trim().to_string())
}

/// Derive the power state from a sysfs `power_supply` directory.
///
/// A host without any battery reports [`PowerState::Unknown`].
pub fn read_sysfs_power_state(root: &Path) -> Result<PowerState> {
    if !root.exists() {
        return Ok(PowerState::Unknown);
    }

    let mut mains_seen = false;
    let mut mains_online = false;
    let mut battery_seen = false;
    let mut discharging = false;

    for entry in std::fs::read_dir(root)? {
        let dir = entry?.path();
        match read_attr(&dir, "type").as_deref() {
            Some("Mains") | Some("USB") => {
                mains_seen = true;
                if read_attr(&dir, "online").as_deref() == Some("1") {
                    mains_online = true;
                }
            }
            Some("Battery") => {
                // Peripheral batteries (mice, headsets) report scope=Device.
                if read_attr(&dir, "scope").as_deref() == Some("Device") {
                    continue;
                }
                battery_seen = true;
                if read_attr(&dir, "status").as_deref() == Some("Discharging") {
                    discharging = true;
                }
            }
            _ => {}
        }
    }

    let state = if !battery_seen {
        PowerState::Unknown
    } else if mains_online {
        PowerState::Ac
    } else if discharging || mains_seen {
        PowerState::Battery
    } else {
        PowerState::Ac
    };

    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supply(root: &Path, name: &str, attrs: &[(&str, &str)]) {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        for (key, value) in attrs {
            std::fs::write(dir.join(key), format!("{}\n", value)).unwrap();
        }
    }

    #[test]
    fn test_cadence_on_battery() {
        let cadence = Cadence::new(Duration::from_secs(1), Duration::from_secs(30));
        assert_eq!(
            cadence.on_battery(),
            (Duration::from_secs(2), Duration::from_secs(180))
        );
        assert_eq!(
            cadence.on_ac(),
            (Duration::from_secs(1), Duration::from_secs(30))
        );
        assert_eq!(cadence.for_state(PowerState::Unknown), cadence.on_ac());
        assert_eq!(cadence.for_state(PowerState::Battery), cadence.on_battery());
    }

    #[test]
    fn test_parse_pmset_batt() {
        let on_battery = "Now drawing from 'Battery Power'\n \
                          -InternalBattery-0 (id=4653155)\t85%; discharging; 4:12 remaining present: true\n";
        assert_eq!(parse_pmset_batt(on_battery), PowerState::Battery);

        let charging = "Now drawing from 'AC Power'\n \
                        -InternalBattery-0 (id=4653155)\t97%; charging; 0:15 remaining present: true\n";
        assert_eq!(parse_pmset_batt(charging), PowerState::Ac);

        // Desktop Macs report AC power but no battery.
        assert_eq!(
            parse_pmset_batt("Now drawing from 'AC Power'\n"),
            PowerState::Unknown
        );
        assert_eq!(parse_pmset_batt(""), PowerState::Unknown);
    }

    #[test]
    fn test_parse_win32_battery_status() {
        assert_eq!(parse_win32_battery_status("1\r\n"), PowerState::Battery);
        assert_eq!(parse_win32_battery_status("4\r\n"), PowerState::Battery);
        assert_eq!(parse_win32_battery_status("2\r\n"), PowerState::Ac);
        assert_eq!(parse_win32_battery_status("6\r\n"), PowerState::Ac);
        assert_eq!(parse_win32_battery_status("10\r\n2\r\n"), PowerState::Ac);
        assert_eq!(parse_win32_battery_status(""), PowerState::Unknown);
        assert_eq!(parse_win32_battery_status("\r\n"), PowerState::Unknown);
    }

    #[test]
    fn test_sysfs_missing_root_is_unknown() {
        let state = read_sysfs_power_state(Path::new("/nonexistent/power_supply")).unwrap();
        assert_eq!(state, PowerState::Unknown);
    }

    #[test]
    fn test_sysfs_desktop_without_battery() {
        let dir = tempfile::tempdir().unwrap();
        supply(dir.path(), "AC", &[("type", "Mains"), ("online", "1")]);
        assert_eq!(
            read_sysfs_power_state(dir.path()).unwrap(),
            PowerState::Unknown
        );
    }

    #[test]
    fn test_sysfs_laptop_on_ac() {
        let dir = tempfile::tempdir().unwrap();
        supply(dir.path(), "AC", &[("type", "Mains"), ("online", "1")]);
        supply(dir.path(), "BAT0", &[("type", "Battery"), ("status", "Charging")]);
        let mut power = SystemPower::with_root(dir.path());
        assert_eq!(power.power_state().unwrap(), PowerState::Ac);
    }

    #[test]
    fn test_sysfs_laptop_on_battery() {
        let dir = tempfile::tempdir().unwrap();
        supply(dir.path(), "AC", &[("type", "Mains"), ("online", "0")]);
        supply(dir.path(), "BAT0", &[("type", "Battery"), ("status", "Discharging")]);
        let mut power = SystemPower::with_root(dir.path());
        assert_eq!(power.power_state().unwrap(), PowerState::Battery);
    }

    #[test]
    fn test_sysfs_ignores_peripheral_batteries() {
        let dir = tempfile::tempdir().unwrap();
        supply(
            dir.path(),
            "hidpp_battery_0",
            &[("type", "Battery"), ("scope", "Device"), ("status", "Discharging")],
        );
        assert_eq!(
            read_sysfs_power_state(dir.path()).unwrap(),
            PowerState::Unknown
        );
    }
}
