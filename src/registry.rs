//! Global pointer registry: maps a live "root" user pointer to its header
//! pointer, so collaborators can look a block up for inspection or a dirty
//! sweep without walking the tracking tree.
//!
//! A thin specialization of [`crate::containers::hash_table::HashTable`]
//! over `usize` keys/values, serialized by a global mutex plus a
//! thread-local "operation in progress" flag so an allocation triggered
//! while the map itself is resizing doesn't recursively re-enter `put`.

use std::cell::Cell;
use std::sync::Mutex;

use crate::containers::hash_table::HashTable;

thread_local! {
    static IN_PROGRESS: Cell<bool> = const { Cell::new(false) };
}

pub struct PointerRegistry {
    table: Mutex<HashTable<usize, usize>>,
}

impl Default for PointerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PointerRegistry {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(HashTable::new()),
        }
    }

    /// Inserts `user_ptr -> header_ptr`. A no-op (rather than a deadlock)
    /// if this thread is already inside a registry mutation.
    pub fn put(&self, user_ptr: usize, header_ptr: usize) {
        if IN_PROGRESS.with(Cell::get) {
            return;
        }
        IN_PROGRESS.with(|f| f.set(true));
        self.table.lock().expect("registry lock poisoned").put(user_ptr, header_ptr);
        IN_PROGRESS.with(|f| f.set(false));
    }

    pub fn get(&self, user_ptr: usize) -> Option<usize> {
        self.table
            .lock()
            .expect("registry lock poisoned")
            .get(&user_ptr)
            .copied()
    }

    pub fn delete(&self, user_ptr: usize) -> Option<usize> {
        if IN_PROGRESS.with(Cell::get) {
            return None;
        }
        IN_PROGRESS.with(|f| f.set(true));
        let result = self
            .table
            .lock()
            .expect("registry lock poisoned")
            .delete(&user_ptr);
        IN_PROGRESS.with(|f| f.set(false));
        result
    }

    /// Snapshot of every `(user_ptr, header_ptr)` pair currently registered.
    pub fn snapshot(&self) -> Vec<(usize, usize)> {
        self.table
            .lock()
            .expect("registry lock poisoned")
            .iter()
            .map(|(&k, &v)| (k, v))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.table.lock().expect("registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_delete() {
        let r = PointerRegistry::new();
        r.put(0x1000, 0x0fe0);
        assert_eq!(r.get(0x1000), Some(0x0fe0));
        assert_eq!(r.delete(0x1000), Some(0x0fe0));
        assert_eq!(r.get(0x1000), None);
    }

    #[test]
    fn snapshot_reflects_all_entries() {
        let r = PointerRegistry::new();
        for i in 0..10 {
            r.put(i, i * 10);
        }
        let mut snap = r.snapshot();
        snap.sort();
        assert_eq!(snap.len(), 10);
        assert_eq!(snap[0], (0, 0));
        assert_eq!(snap[9], (9, 90));
    }
}
