//! Windows FILETIME conversions.
//!
//! Archive timestamps are 64-bit counts of 100-nanosecond intervals since
//! 1601-01-01 UTC.

use chrono::{DateTime, TimeZone, Utc};
use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds between 1601-01-01 and 1970-01-01.
const EPOCH_GAP_SECS: i64 = 11_644_473_600;
const TICKS_PER_SEC: i64 = 10_000_000;

pub fn filetime_to_datetime(filetime: u64) -> DateTime<Utc> {
    let ticks = filetime as i64;
    let secs = ticks / TICKS_PER_SEC - EPOCH_GAP_SECS;
    let nanos = (ticks % TICKS_PER_SEC) as u32 * 100;
    Utc.timestamp_opt(secs, nanos)
        .single()
        .unwrap_or_else(|| Utc.timestamp_opt(0, 0).unwrap())
}

pub fn datetime_to_filetime(time: DateTime<Utc>) -> u64 {
    let secs = time.timestamp() + EPOCH_GAP_SECS;
    if secs < 0 {
        return 0;
    }
    let ticks = secs * TICKS_PER_SEC + i64::from(time.timestamp_subsec_nanos() / 100);
    ticks as u64
}

pub fn system_time_to_filetime(time: SystemTime) -> u64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(after) => {
            (after.as_secs() + EPOCH_GAP_SECS as u64) * TICKS_PER_SEC as u64
                + u64::from(after.subsec_nanos() / 100)
        }
        // Pre-1970 mtimes are vanishingly rare; clamp toward the epoch gap.
        Err(before) => {
            let back = before.duration();
            let ticks = EPOCH_GAP_SECS as u64 * TICKS_PER_SEC as u64;
            ticks.saturating_sub(
                back.as_secs() * TICKS_PER_SEC as u64 + u64::from(back.subsec_nanos() / 100),
            )
        }
    }
}

pub fn filetime_to_system_time(filetime: u64) -> SystemTime {
    let unix_ticks = filetime as i64 - EPOCH_GAP_SECS * TICKS_PER_SEC;
    if unix_ticks >= 0 {
        UNIX_EPOCH + std::time::Duration::from_nanos(unix_ticks as u64 * 100)
    } else {
        UNIX_EPOCH - std::time::Duration::from_nanos(unix_ticks.unsigned_abs() * 100)
    }
}
