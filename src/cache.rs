//! Bounded insertion-ordered dedupe set
//!
//! Used by the detection pipeline to suppress repeated work for keys it has
//! already seen (transaction hashes, `tx:strategy` keys). Once full, the
//! oldest key is evicted.

use std::collections::{HashSet, VecDeque};
use std::hash::Hash;
use std::sync::Mutex;

struct Inner<K> {
    set: HashSet<K>,
    order: VecDeque<K>,
}

/// Fixed-capacity set, oldest key evicted first
pub struct DedupeCache<K> {
    inner: Mutex<Inner<K>>,
    capacity: usize,
}

impl<K: Eq + Hash + Clone> DedupeCache<K> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(Inner {
                set: HashSet::with_capacity(capacity),
                order: VecDeque::with_capacity(capacity),
            }),
            capacity,
        }
    }

    /// Record `key`. Returns `true` the first time a key is seen, `false`
    /// while it is still remembered.
    ///
    /// Check and insert happen under one lock, so two concurrent callers can
    /// never both get `true` for the same key.
    pub fn insert(&self, key: K) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if inner.set.contains(&key) {
            return false;
        }
        if inner.order.len() >= self.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.set.remove(&oldest);
            }
        }
        inner.set.insert(key.clone());
        inner.order.push_back(key);
        true
    }

    pub fn contains(&self, key: &K) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.set.contains(key)
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_insert_once() {
        let cache = DedupeCache::new(4);
        assert!(cache.insert("a"));
        assert!(!cache.insert("a"));
        assert!(cache.contains(&"a"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_evicts_oldest() {
        let cache = DedupeCache::new(2);
        assert!(cache.insert(1));
        assert!(cache.insert(2));
        assert!(cache.insert(3));
        assert_eq!(cache.len(), 2);
        assert!(!cache.contains(&1));
        assert!(cache.contains(&2));
        // Evicted keys are new again
        assert!(cache.insert(1));
        assert!(!cache.contains(&2));
    }

    #[test]
    fn test_concurrent_single_winner() {
        let cache = Arc::new(DedupeCache::new(16));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                std::thread::spawn(move || cache.insert("tx".to_string()))
            })
            .collect();
        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(wins, 1);
    }
}
