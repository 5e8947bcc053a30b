//! CPU load probe for load shedding.
//!
//! Load is the 1-minute load average divided by the number of available
//! CPUs, as a percentage. Platforms without `/proc/loadavg` report no load
//! and are never shed.

use std::path::Path;

const LOADAVG: &str = "/proc/loadavg";

/// Current load percentage, or `None` when it cannot be determined.
pub fn load_percent() -> Option<f64> {
    load_percent_from(Path::new(LOADAVG))
}

fn load_percent_from(path: &Path) -> Option<f64> {
    let content = std::fs::read_to_string(path).ok()?;
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    parse_loadavg(&content, cpus)
}

/// Parses the first field of `/proc/loadavg` relative to `cpus`.
pub fn parse_loadavg(content: &str, cpus: usize) -> Option<f64> {
    let one_minute: f64 = content.split_whitespace().next()?.parse().ok()?;
    if !one_minute.is_finite() || one_minute < 0.0 {
        return None;
    }
    Some(one_minute / cpus.max(1) as f64 * 100.0)
}
