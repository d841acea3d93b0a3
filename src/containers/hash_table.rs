//! Open-addressed hash table with {Empty, Deleted, Occupied} probe states
//! and a SipHash-class mixer. Generalizes the pointer registry's original
//! bespoke probing scheme into a standalone generic container so the
//! registry becomes a thin `HashTable<usize, usize>` specialization rather
//! than its own structure.

use std::hash::{BuildHasher, Hash};
use std::collections::hash_map::RandomState;

#[derive(Clone)]
enum Slot<K, V> {
    Empty,
    Deleted,
    Occupied(K, V),
}

const LOAD_FACTOR_NUM: usize = 7;
const LOAD_FACTOR_DEN: usize = 10;

/// Generic open-addressed map. Not thread-safe on its own — callers needing
/// concurrent access (e.g. [`crate::registry::PointerRegistry`]) wrap it in
/// a mutex.
pub struct HashTable<K, V> {
    slots: Vec<Slot<K, V>>,
    len: usize,
    hasher: RandomState,
}

impl<K: Hash + Eq + Clone, V: Clone> Default for HashTable<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Hash + Eq + Clone, V: Clone> HashTable<K, V> {
    pub fn new() -> Self {
        Self::with_capacity(16)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.next_power_of_two().max(16);
        Self {
            slots: (0..capacity).map(|_| Slot::Empty).collect(),
            len: 0,
            hasher: RandomState::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn hash_index(&self, key: &K, capacity: usize) -> usize {
        (self.hasher.hash_one(key) as usize) & (capacity - 1)
    }

    fn maybe_grow(&mut self) {
        if self.len * LOAD_FACTOR_DEN >= self.slots.len() * LOAD_FACTOR_NUM {
            self.resize(self.slots.len() * 2);
        }
    }

    fn resize(&mut self, new_capacity: usize) {
        let old = std::mem::replace(
            &mut self.slots,
            (0..new_capacity).map(|_| Slot::Empty).collect(),
        );
        self.len = 0;
        for slot in old {
            if let Slot::Occupied(k, v) = slot {
                self.put(k, v);
            }
        }
    }

    pub fn put(&mut self, key: K, value: V) -> Option<V> {
        self.maybe_grow();
        let capacity = self.slots.len();
        let mut idx = self.hash_index(&key, capacity);
        let mut first_deleted: Option<usize> = None;

        for _ in 0..capacity {
            match &self.slots[idx] {
                Slot::Empty => {
                    let target = first_deleted.unwrap_or(idx);
                    self.slots[target] = Slot::Occupied(key, value);
                    self.len += 1;
                    return None;
                }
                Slot::Deleted => {
                    if first_deleted.is_none() {
                        first_deleted = Some(idx);
                    }
                }
                Slot::Occupied(k, _) if *k == key => {
                    let old = std::mem::replace(&mut self.slots[idx], Slot::Occupied(key, value));
                    if let Slot::Occupied(_, old_v) = old {
                        return Some(old_v);
                    }
                    unreachable!()
                }
                Slot::Occupied(_, _) => {}
            }
            idx = (idx + 1) & (capacity - 1);
        }
        // Table full of tombstones/occupied with no empty slot found; grow
        // and retry once.
        self.resize(capacity * 2);
        self.put(key, value)
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        let capacity = self.slots.len();
        let mut idx = self.hash_index(key, capacity);
        for _ in 0..capacity {
            match &self.slots[idx] {
                Slot::Empty => return None,
                Slot::Occupied(k, v) if k == key => return Some(v),
                _ => {}
            }
            idx = (idx + 1) & (capacity - 1);
        }
        None
    }

    pub fn delete(&mut self, key: &K) -> Option<V> {
        let capacity = self.slots.len();
        let mut idx = self.hash_index(key, capacity);
        for _ in 0..capacity {
            match &self.slots[idx] {
                Slot::Empty => return None,
                Slot::Occupied(k, _) if k == key => {
                    let old = std::mem::replace(&mut self.slots[idx], Slot::Deleted);
                    self.len -= 1;
                    if let Slot::Occupied(_, v) = old {
                        return Some(v);
                    }
                    unreachable!()
                }
                _ => {}
            }
            idx = (idx + 1) & (capacity - 1);
        }
        None
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.slots.iter().filter_map(|slot| match slot {
            Slot::Occupied(k, v) => Some((k, v)),
            _ => None,
        })
    }
}

/// Set built on the same open-addressing scheme, storing only keys.
pub struct HashSet<K> {
    table: HashTable<K, ()>,
}

impl<K: Hash + Eq + Clone> Default for HashSet<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Hash + Eq + Clone> HashSet<K> {
    pub fn new() -> Self {
        Self {
            table: HashTable::new(),
        }
    }

    pub fn insert(&mut self, key: K) -> bool {
        self.table.put(key, ()).is_none()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.table.get(key).is_some()
    }

    pub fn remove(&mut self, key: &K) -> bool {
        self.table.delete(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_delete_roundtrip() {
        let mut t = HashTable::new();
        assert_eq!(t.put(1usize, "a"), None);
        assert_eq!(t.get(&1), Some(&"a"));
        assert_eq!(t.put(1, "b"), Some("a"));
        assert_eq!(t.delete(&1), Some("b"));
        assert_eq!(t.get(&1), None);
    }

    #[test]
    fn grows_past_load_factor() {
        let mut t = HashTable::with_capacity(16);
        for i in 0..1000 {
            t.put(i, i * 2);
        }
        assert_eq!(t.len(), 1000);
        for i in 0..1000 {
            assert_eq!(t.get(&i), Some(&(i * 2)));
        }
    }

    #[test]
    fn deleted_slots_dont_break_probing() {
        let mut t = HashTable::with_capacity(16);
        for i in 0..8 {
            t.put(i, i);
        }
        for i in 0..4 {
            t.delete(&i);
        }
        for i in 4..8 {
            assert_eq!(t.get(&i), Some(&i));
        }
    }

    #[test]
    fn set_basic() {
        let mut s = HashSet::new();
        assert!(s.insert(1));
        assert!(!s.insert(1));
        assert!(s.contains(&1));
        assert!(s.remove(&1));
        assert!(!s.contains(&1));
    }
}
