//! 64-bit atomic counter helpers with the orderings the rest of the crate
//! relies on: relaxed for statistics, acquire/release for anything gating
//! visibility of data published through a pointer.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::CachePadded;

/// A padded 64-bit counter. `CachePadded` avoids false sharing when several
/// of these sit next to each other (e.g. per-tier `usage_bytes`).
#[derive(Debug, Default)]
pub struct Counter64(CachePadded<AtomicU64>);

impl Counter64 {
    pub fn new(value: u64) -> Self {
        Self(CachePadded::new(AtomicU64::new(value)))
    }

    pub fn load(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    pub fn store(&self, value: u64) {
        self.0.store(value, Ordering::Release)
    }

    pub fn inc(&self) -> u64 {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn add(&self, delta: u64) -> u64 {
        self.0.fetch_add(delta, Ordering::AcqRel) + delta
    }

    /// Subtracts `delta`, saturating at zero rather than wrapping.
    pub fn sub_saturating(&self, delta: u64) -> u64 {
        loop {
            let cur = self.0.load(Ordering::Acquire);
            let next = cur.saturating_sub(delta);
            if self
                .0
                .compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return next;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inc_and_add() {
        let c = Counter64::new(0);
        assert_eq!(c.inc(), 1);
        assert_eq!(c.add(5), 6);
        assert_eq!(c.load(), 6);
    }

    #[test]
    fn sub_saturates_at_zero() {
        let c = Counter64::new(3);
        assert_eq!(c.sub_saturating(10), 0);
        assert_eq!(c.load(), 0);
    }
}
