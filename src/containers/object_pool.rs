//! Bounded FIFO of pre-sized, reusable objects. Generalizes the detachable
//! arena's small-object cache (see [`crate::arena`]) into a standalone
//! container that isn't tied to allocator chunks.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

struct Inner<T> {
    free: VecDeque<T>,
    capacity: usize,
}

pub struct ObjectPool<T> {
    inner: Mutex<Inner<T>>,
}

impl<T> ObjectPool<T> {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                free: VecDeque::with_capacity(capacity),
                capacity,
            }),
        })
    }

    /// Pops a pooled object, or `None` if the pool is currently empty.
    pub fn acquire(self: &Arc<Self>) -> Option<PoolGuard<T>> {
        let value = self.inner.lock().expect("pool lock poisoned").free.pop_front()?;
        Some(PoolGuard {
            pool: Arc::clone(self),
            value: Some(value),
        })
    }

    /// Like [`Self::acquire`] but manufactures a fresh object via `make`
    /// when the pool is empty, so callers never see `None`.
    pub fn acquire_or_create(self: &Arc<Self>, make: impl FnOnce() -> T) -> PoolGuard<T> {
        let value = self
            .inner
            .lock()
            .expect("pool lock poisoned")
            .free
            .pop_front()
            .unwrap_or_else(make);
        PoolGuard {
            pool: Arc::clone(self),
            value: Some(value),
        }
    }

    fn release(&self, value: T) {
        let mut inner = self.inner.lock().expect("pool lock poisoned");
        if inner.free.len() < inner.capacity {
            inner.free.push_back(value);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("pool lock poisoned").free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// RAII handle: the wrapped value returns to its pool on drop.
pub struct PoolGuard<T> {
    pool: Arc<ObjectPool<T>>,
    value: Option<T>,
}

impl<T> Deref for PoolGuard<T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.value.as_ref().expect("value taken before drop")
    }
}

impl<T> DerefMut for PoolGuard<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.value.as_mut().expect("value taken before drop")
    }
}

impl<T> Drop for PoolGuard<T> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            self.pool.release(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_pool_returns_none() {
        let pool: Arc<ObjectPool<Vec<u8>>> = ObjectPool::new(4);
        assert!(pool.acquire().is_none());
    }

    #[test]
    fn guard_returns_object_on_drop() {
        let pool = ObjectPool::new(2);
        {
            let guard = pool.acquire_or_create(|| 7);
            assert_eq!(*guard, 7);
        }
        assert_eq!(pool.len(), 1);
        let guard = pool.acquire().unwrap();
        assert_eq!(*guard, 7);
    }

    #[test]
    fn over_capacity_objects_are_dropped_not_pooled() {
        let pool = ObjectPool::new(1);
        let a = pool.acquire_or_create(|| 1);
        let b = pool.acquire_or_create(|| 2);
        drop(a);
        drop(b);
        assert_eq!(pool.len(), 1);
    }
}
