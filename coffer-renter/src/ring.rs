use std::{collections::HashMap, hash::Hash};

/// A bounded map that forgets its oldest insertions.
///
/// Slots are reused in insertion order through a cursor, so the memory cost
/// is fixed and lookups stay O(1). Used to remember recent per-block state
/// long enough to unwind shallow reorgs.
#[derive(Debug)]
pub struct RecentRing<K, V> {
    slots: Vec<Option<K>>,
    values: HashMap<K, V>,
    cursor: usize,
}

impl<K: Clone + Eq + Hash, V> RecentRing<K, V> {
    pub fn new(capacity: usize) -> RecentRing<K, V> {
        let capacity = capacity.max(1);
        RecentRing {
            slots: vec![None; capacity],
            values: HashMap::with_capacity(capacity),
            cursor: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Insert a value, returning the entry evicted to make room, if any.
    /// Re-inserting a present key replaces its value without refreshing its
    /// age.
    pub fn insert(&mut self, key: K, value: V) -> Option<(K, V)> {
        if let Some(existing) = self.values.get_mut(&key) {
            *existing = value;
            return None;
        }
        let evicted = self.slots[self.cursor].take().and_then(|old| {
            let v = self.values.remove(&old)?;
            Some((old, v))
        });
        self.slots[self.cursor] = Some(key.clone());
        self.values.insert(key, value);
        self.cursor = (self.cursor + 1) % self.slots.len();
        evicted
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.values.get(key)
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.values.values()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.values.contains_key(key)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let value = self.values.remove(key)?;
        if let Some(slot) = self.slots.iter_mut().find(|s| s.as_ref() == Some(key)) {
            *slot = None;
        }
        Some(value)
    }
}
