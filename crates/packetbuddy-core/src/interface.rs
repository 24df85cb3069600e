//! Primary network interface detection.
//!
//! The primary interface is the one carrying the default route. Detection is
//! best-effort: any failure returns `None` and the monitor falls back to
//! summing every physical interface.
//!
//! | Platform | Source |
//! |----------|--------|
//! | Linux | `/proc/net/route` (destination `00000000`, lowest metric) |
//! | macOS | `route -n get default` |
//! | Windows | `Get-NetRoute -DestinationPrefix 0.0.0.0/0` via PowerShell |
//!
//! Output parsing lives in pure functions so it can be tested on any host.

/// Detect the interface carrying the default route on this host.
pub fn detect_primary_interface() -> Option<String> {
    #[cfg(target_os = "linux")]
    {
        let table = std::fs::read_to_string("/proc/net/route").ok()?;
        parse_proc_net_route(&table)
    }
    #[cfg(target_os = "macos")]
    {
        let output = std::process::Command::new("route")
            .args(["-n", "get", "default"])
            .output()
            .ok()?;
        parse_macos_route(&String::from_utf8_lossy(&output.stdout))
    }
    #[cfg(target_os = "windows")]
    {
        let output = std::process::Command::new("powershell")
            .args([
                "-NoProfile",
                "-Command",
                "Get-NetRoute -DestinationPrefix 0.0.0.0/0 | Sort-Object RouteMetric | \
                 Select-Object -First 1 -ExpandProperty InterfaceAlias",
            ])
            .output()
            .ok()?;
        if !output.status.success() {
            return None;
        }
        parse_windows_route(&String::from_utf8_lossy(&output.stdout))
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    {
        None
    }
}

/// Parse `/proc/net/route`, returning the default-route interface with the lowest metric.
pub fn parse_proc_net_route(table: &str) -> Option<String> {
    table
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            // Iface Destination Gateway Flags RefCnt Use Metric Mask ...
            if fields.len() < 8 || fields[1] != "00000000" || fields[7] != "00000000" {
                return None;
            }
            let metric = fields[6].parse::<u32>().unwrap_or(u32::MAX);
            Some((metric, fields[0]))
        })
        .min_by_key(|(metric, _)| *metric)
        .map(|(_, name)| name.to_string())
}

/// Parse `route -n get default` output (`interface: en0`).
pub fn parse_macos_route(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        if key.trim() == "interface" {
            let value = value.trim();
            (!value.is_empty()).then(|| value.to_string())
        } else {
            None
        }
    })
}

/// Parse the PowerShell `InterfaceAlias` output (first non-empty line).
pub fn parse_windows_route(output: &str) -> Option<String> {
    output
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
}
