//! One-shot promise/future pair backed by a mutex + condition variable.
//!
//! The blocking wait in [`Future::get`] must leave the epoch before sleeping
//! and re-enter it on wakeup (§4.4's interaction rule) — otherwise a
//! quiescent waiting thread could stall the global epoch indefinitely. This
//! is why `get` takes an optional [`EbrHandle`] rather than just blocking.

use std::sync::{Arc, Condvar, Mutex};

use crate::ebr::EbrHandle;

struct SharedState<T> {
    ready: bool,
    value: Option<T>,
}

struct Shared<T> {
    state: Mutex<SharedState<T>>,
    condvar: Condvar,
}

pub struct Promise<T> {
    shared: Arc<Shared<T>>,
}

pub struct Future<T> {
    shared: Arc<Shared<T>>,
}

/// `promise_create`: builds a linked promise/future pair.
pub fn promise_create<T>() -> (Promise<T>, Future<T>) {
    let shared = Arc::new(Shared {
        state: Mutex::new(SharedState {
            ready: false,
            value: None,
        }),
        condvar: Condvar::new(),
    });
    (
        Promise {
            shared: Arc::clone(&shared),
        },
        Future { shared },
    )
}

impl<T> Promise<T> {
    /// Stores the result exactly once and broadcasts to every waiter.
    /// Setting an already-ready promise is a programmer error and panics
    /// rather than silently overwriting — a promise, per spec, resolves
    /// once.
    pub fn set_value(&self, value: T) {
        let mut state = self.shared.state.lock().expect("future lock poisoned");
        assert!(!state.ready, "promise already resolved");
        state.value = Some(value);
        state.ready = true;
        drop(state);
        self.shared.condvar.notify_all();
    }

    /// `get_future`: hands back another handle to the same shared state.
    pub fn get_future(&self) -> Future<T> {
        Future {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Future<T> {
    /// `ttak_future_get`: blocks until the promise resolves. If `epoch` is
    /// given, exits it before sleeping and re-enters on wakeup so a reclaim
    /// cycle concurrent with an arbitrary number of waiters still completes.
    pub fn get(&self, epoch: Option<&EbrHandle>) -> T {
        if let Some(h) = epoch {
            h.exit_raw();
        }

        let mut state = self.shared.state.lock().expect("future lock poisoned");
        while !state.ready {
            state = self.shared.condvar.wait(state).expect("future lock poisoned");
        }
        let value = state.value.take().expect("ready implies a value");
        drop(state);

        if let Some(h) = epoch {
            h.enter_raw();
        }
        value
    }

    pub fn is_ready(&self) -> bool {
        self.shared.state.lock().expect("future lock poisoned").ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ebr::EbrDomain;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn get_returns_value_set_once() {
        let (promise, future) = promise_create::<i32>();
        promise.set_value(42);
        assert_eq!(future.get(None), 42);
    }

    #[test]
    fn get_blocks_until_set_from_another_thread() {
        let (promise, future) = promise_create::<&'static str>();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            promise.set_value("done");
        });
        assert_eq!(future.get(None), "done");
        handle.join().unwrap();
    }

    #[test]
    fn get_exits_and_reenters_epoch_around_wait() {
        let domain = EbrDomain::new();
        let handle = domain.register_thread();
        let _g = handle.enter();

        let (promise, future) = promise_create::<i32>();
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            promise.set_value(7);
        });

        assert_eq!(future.get(Some(&handle)), 7);
        t.join().unwrap();
        // The guard entered above is still logically active; get() must
        // have restored `active` on exit so this reclaim can proceed.
        assert!(domain.reclaim());
    }
}
