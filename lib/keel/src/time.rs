use std::time::{Duration, Instant, SystemTime};

/// Returns the current unix timestamp (seconds elapsed since 1970-01-01)
#[inline]
pub fn timestamp_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("Closed timelike curve, reality compromised")
        .as_secs()
}

/// Milliseconds elapsed since the supplied epoch instant. Wire timestamps are
/// always expressed relative to the endpoint epoch so that simulated clocks
/// stay deterministic.
#[inline]
pub fn millis_since(epoch: Instant, now: Instant) -> u64 {
    duration_millis(now.duration_since(epoch))
}

/// Converts a duration to whole milliseconds.
#[inline]
pub fn duration_millis(duration: Duration) -> u64 {
    duration.as_secs() * 1000 + u64::from(duration.subsec_millis())
}
