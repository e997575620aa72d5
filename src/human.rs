//! Human-readable renderings used in the telemetry report.

use std::fmt::Write;
use std::time::Duration;

const UNITS: [&str; 6] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB"];

/// Formats a byte count with binary units, e.g. `1536` as `1.5 KiB`.
pub fn bytes(n: u64) -> String {
    let mut size = n as f64;
    let mut exp = 0;
    while size >= 1024.0 && exp < UNITS.len() - 1 {
        size /= 1024.0;
        exp += 1;
    }
    if exp == 0 {
        format!("{size:.0} {}", UNITS[exp])
    } else {
        format!("{size:.1} {}", UNITS[exp])
    }
}

/// Formats an elapsed time as `1h2m3.5s`, `12.5ms`, `850µs` or `42ns`.
///
/// Sub-second values use the largest unit that keeps the integer part
/// non-zero, longer values are split into hours, minutes and seconds.
/// Trailing fractional zeros are dropped.
pub fn duration(d: Duration) -> String {
    let nanos = d.as_nanos();
    if nanos == 0 {
        return "0s".to_string();
    }
    if nanos < 1_000 {
        return format!("{nanos}ns");
    }
    if nanos < 1_000_000 {
        return fraction(nanos, 1_000, 3, "µs");
    }
    if nanos < 1_000_000_000 {
        return fraction(nanos, 1_000_000, 6, "ms");
    }

    let total_secs = d.as_secs();
    let (hours, minutes) = (total_secs / 3600, total_secs / 60 % 60);
    let sub_minute = u128::from(total_secs % 60) * 1_000_000_000 + u128::from(d.subsec_nanos());
    let seconds = fraction(sub_minute, 1_000_000_000, 9, "s");

    let mut out = String::new();
    if hours > 0 {
        let _ = write!(out, "{hours}h");
    }
    if hours > 0 || minutes > 0 {
        let _ = write!(out, "{minutes}m");
    }
    out.push_str(&seconds);
    out
}

fn fraction(value: u128, scale: u128, digits: usize, unit: &str) -> String {
    let whole = value / scale;
    let frac = value % scale;
    if frac == 0 {
        return format!("{whole}{unit}");
    }
    let frac = format!("{frac:0digits$}");
    format!("{whole}.{}{unit}", frac.trim_end_matches('0'))
}
