use std::time::Duration;

/// Capture timestamp in whole milliseconds. Capture timestamps are offsets from the unix epoch,
/// so this comfortably fits a signed value and differences of two of these never overflow.
#[inline]
pub(crate) fn dur_ms(d: Duration) -> i64 {
    d.as_millis() as i64
}

/// Capture timestamp in whole microseconds.
#[inline]
pub(crate) fn dur_us(d: Duration) -> i64 {
    d.as_micros() as i64
}

/// Signed difference `a - b` in seconds. Needed because [`Duration`] itself cannot go negative
/// and sender/receiver clocks are not ordered.
#[inline]
pub(crate) fn secs_between(a: Duration, b: Duration) -> f64 {
    a.as_secs_f64() - b.as_secs_f64()
}
