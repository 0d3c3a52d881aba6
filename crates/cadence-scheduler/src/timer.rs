//! Wakeup and stall arithmetic — pure helpers composed by the engine loop.

use chrono::{DateTime, Duration, Utc};

use cadence_core::config::{MAX_SLEEP_SECS, STALL_THRESHOLD_SECS};

/// How long to sleep before the next wakeup.
///
/// Capped at [`MAX_SLEEP_SECS`] regardless of how far away the nearest
/// `next_run_at` is: the cap bounds both the latency between an API edit and
/// the engine noticing it, and how long a stuck job can go undetected.
/// Floored at one second so an already-due slot cannot spin the loop hot.
pub fn sleep_duration(
    next_wakeup: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> std::time::Duration {
    let cap = std::time::Duration::from_secs(MAX_SLEEP_SECS);
    let until = match next_wakeup {
        None => return cap,
        Some(at) => at - now,
    };
    if until <= Duration::seconds(1) {
        return std::time::Duration::from_secs(1);
    }
    until.to_std().map_or(cap, |d| d.min(cap))
}

/// The cutoff before which an in-flight marker counts as crashed.
pub fn stall_cutoff(now: DateTime<Utc>) -> DateTime<Utc> {
    now - Duration::seconds(STALL_THRESHOLD_SECS)
}
