//! Smart scheduler (EWMA-based priority adjustment to avoid head-of-line
//! starvation) and async scheduler (thin wrapper over the thread pool that
//! falls back to inline, in-epoch execution when no pool is configured).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::ebr::EbrDomain;
use crate::pool::ThreadPool;

const EWMA_ALPHA: f64 = 0.2;
/// Bonus divisor: an EWMA cost of `BONUS_SCALE` nanoseconds adds +1 to the
/// effective priority. Chosen so a task costing ~1ms gets a small but
/// real boost rather than dwarfing the caller's own priority scale.
const BONUS_SCALE: f64 = 1_000_000.0;

#[derive(Default)]
struct TaskStats {
    ewma_cost_ns: f64,
    samples: usize,
}

/// Tracks per-task-kind execution cost and hands back a priority nudged in
/// favor of historically expensive tasks, so a stream of cheap submissions
/// can't starve a slow one indefinitely.
#[derive(Default)]
pub struct SmartScheduler {
    stats: Mutex<HashMap<u64, TaskStats>>,
}

impl SmartScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// `scheduler_record_execution`: folds `cost_ns` into the task's EWMA.
    pub fn record_execution(&self, hash_id: u64, cost_ns: u64) {
        let mut stats = self.stats.lock().expect("scheduler lock poisoned");
        let entry = stats.entry(hash_id).or_default();
        entry.ewma_cost_ns = if entry.samples == 0 {
            cost_ns as f64
        } else {
            EWMA_ALPHA * cost_ns as f64 + (1.0 - EWMA_ALPHA) * entry.ewma_cost_ns
        };
        entry.samples += 1;
    }

    /// `get_adjusted_priority`: `base` plus a bonus proportional to the
    /// task's recorded EWMA cost.
    pub fn get_adjusted_priority(&self, hash_id: u64, base: i64) -> i64 {
        let stats = self.stats.lock().expect("scheduler lock poisoned");
        let bonus = stats
            .get(&hash_id)
            .map(|s| (s.ewma_cost_ns / BONUS_SCALE) as i64)
            .unwrap_or(0);
        base + bonus
    }
}

/// `async_init/async_shutdown/async_schedule/async_yield`: schedules work
/// onto a backing pool when one is configured, otherwise runs it inline
/// inside a throwaway epoch pin — so collaborators can write the same
/// scheduling call whether or not a pool has been stood up.
pub struct AsyncScheduler {
    pool: Option<Arc<ThreadPool>>,
    domain: Arc<EbrDomain>,
}

impl AsyncScheduler {
    /// `async_init`.
    pub fn init(pool: Option<Arc<ThreadPool>>) -> Self {
        Self {
            pool,
            domain: EbrDomain::new(),
        }
    }

    /// `async_schedule`: runs `f` on the backing pool if present, else
    /// inline (but still epoch-protected).
    pub fn schedule<T: Send + 'static>(&self, priority: i64, f: impl FnOnce() -> T + Send + 'static) -> T {
        if let Some(pool) = &self.pool {
            return pool.submit_task(priority, f).get(None);
        }
        self.yield_inline(f)
    }

    /// `async_yield`: executes `f` inline, inside the scheduler's own
    /// epoch pin, and exits before returning.
    pub fn yield_inline<T>(&self, f: impl FnOnce() -> T) -> T {
        let handle = self.domain.register_thread();
        let guard = handle.enter();
        let result = f();
        drop(guard);
        result
    }

    /// `async_shutdown`.
    pub fn shutdown(&self) {
        if let Some(pool) = &self.pool {
            pool.destroy();
        }
    }
}

impl std::fmt::Debug for AsyncScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncScheduler")
            .field("has_pool", &self.pool.is_some())
            .finish()
    }
}
