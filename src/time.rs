//! Monotonic tick source.
//!
//! Every timed operation in the crate (lifetimes, tracking-tree sweeps,
//! pool back-off) is driven off a single monotonic clock so that tests can
//! hand in synthetic `now` values instead of racing the wall clock.

use std::time::Instant;

/// Sentinel meaning "never expires" for any `expires_tick` field.
pub const NEVER: u64 = u64::MAX;

/// Nanoseconds elapsed since an arbitrary process-local epoch.
///
/// The epoch is the first call to [`now_ns`] (lazily latched), so ticks are
/// only meaningful relative to each other within one process.
pub fn now_ns() -> u64 {
    static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    let start = START.get_or_init(Instant::now);
    start.elapsed().as_nanos() as u64
}

/// Milliseconds elapsed since the same process-local epoch as [`now_ns`].
pub fn now_ms() -> u64 {
    now_ns() / 1_000_000
}

/// Converts milliseconds to nanoseconds, saturating on overflow.
pub fn ms_to_ns(ms: u64) -> u64 {
    ms.saturating_mul(1_000_000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_non_decreasing() {
        let a = now_ns();
        let b = now_ns();
        assert!(b >= a);
    }

    #[test]
    fn ms_derived_from_ns() {
        let ns = now_ns();
        let ms = now_ms();
        assert!(ms <= ns / 1_000_000 + 1);
    }

    #[test]
    fn never_sentinel_is_max() {
        assert_eq!(NEVER, u64::MAX);
    }
}
