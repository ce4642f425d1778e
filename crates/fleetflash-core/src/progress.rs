//! Speed, ETA and size helpers shared by the build, verify and flash paths

use std::time::Duration;

/// Calculate estimated time remaining in seconds
pub fn calculate_eta(bytes_done: u64, total_bytes: u64, speed_bps: u64) -> Option<u64> {
    if speed_bps == 0 || bytes_done >= total_bytes {
        return None;
    }

    let remaining = total_bytes.saturating_sub(bytes_done);
    Some(remaining / speed_bps)
}

/// Derive `(speed, eta)` from a percentage of a known total and elapsed time
///
/// `speed = bytes_done / elapsed`, `eta = remaining / speed`.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
pub fn calculate_speed_eta(total_bytes: u64, percent: f64, elapsed: Duration) -> (u64, Option<u64>) {
    let fraction = (percent / 100.0).clamp(0.0, 1.0);
    let bytes_done = (total_bytes as f64 * fraction) as u64;

    let secs = elapsed.as_secs_f64();
    let speed_bps = if secs > 0.0 {
        (bytes_done as f64 / secs) as u64
    } else {
        0
    };

    (speed_bps, calculate_eta(bytes_done, total_bytes, speed_bps))
}

/// Format a transfer rate in decimal units (e.g. "12.3 MB/s")
#[allow(clippy::cast_precision_loss)]
pub fn format_speed(bytes_per_second: u64) -> String {
    let k = bytes_per_second as f64 / 1000.0;
    let m = k / 1000.0;

    if m > 1.0 {
        format!("{m:.1} MB/s")
    } else if k > 1.0 {
        format!("{k:.1} KB/s")
    } else {
        format!("{bytes_per_second} B/s")
    }
}

/// Format a remaining-time estimate the way users read it
///
/// - under 10 seconds: "a few secs"
/// - under a minute: "N secs"
/// - under 59 minutes: "N min"
/// - otherwise: "H hour M min" / "H hours M min"
pub fn format_eta(seconds: u64) -> String {
    let mins = seconds / 60;
    let hours = mins / 60;

    if mins < 1 {
        if seconds < 10 {
            "a few secs".to_string()
        } else {
            format!("{seconds} secs")
        }
    } else if mins < 59 {
        format!("{mins} min")
    } else if hours > 1 {
        format!("{hours} hours {} min", mins % 60)
    } else {
        format!("{hours} hour {} min", mins % 60)
    }
}

/// Format a byte count in decimal units with three decimals
#[allow(clippy::cast_precision_loss)]
pub fn format_size(bytes: u64) -> String {
    let k = bytes as f64 / 1000.0;
    let m = k / 1000.0;

    if m > 1.0 {
        format!("{m:.3} MB")
    } else if k > 1.0 {
        format!("{k:.3} KB")
    } else {
        format!("{bytes} bytes")
    }
}

/// Format an elapsed duration compactly (e.g. "2m 30s")
pub fn format_duration(seconds: u64) -> String {
    if seconds >= 3600 {
        let hours = seconds / 3600;
        let mins = (seconds % 3600) / 60;
        format!("{hours}h {mins}m")
    } else if seconds >= 60 {
        let mins = seconds / 60;
        let secs = seconds % 60;
        format!("{mins}m {secs}s")
    } else {
        format!("{seconds}s")
    }
}

// ============================================================================
// UNIT TESTS
// ============================================================================
