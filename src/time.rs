//! Coarse Monotonic Time
//!
//! A process-wide monotonic anchor. Several subsystems need to store a
//! point in time inside an atomic (bucket wash stamps, the timer worker's
//! next-expiration word); representing those as durations since a shared
//! anchor makes them a plain `u64`.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

fn anchor() -> Instant {
    static ANCHOR: OnceLock<Instant> = OnceLock::new();
    *ANCHOR.get_or_init(Instant::now)
}

/// Time elapsed since the process-wide anchor.
pub(crate) fn since_start() -> Duration {
    anchor().elapsed()
}

/// Convert an offset produced by [`since_start`] back into an `Instant`.
pub(crate) fn offset_to_instant(offset: Duration) -> Instant {
    anchor() + offset
}

/// Nanoseconds since the anchor, for storage in atomics.
pub(crate) fn since_start_nanos() -> u64 {
    since_start().as_nanos() as u64
}

/// Convert an `Instant` into nanoseconds since the anchor. Instants before
/// the anchor clamp to zero.
pub(crate) fn instant_to_nanos(at: Instant) -> u64 {
    at.saturating_duration_since(anchor()).as_nanos() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic() {
        let a = since_start();
        let b = since_start();
        assert!(b >= a);
    }

    #[test]
    fn test_offset_round_trip() {
        let offset = since_start();
        let instant = offset_to_instant(offset);
        assert!(instant <= Instant::now());
    }
}
