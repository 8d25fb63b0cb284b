//! LRU cache engine
//!
//! [`LruCache`] is a fixed-capacity map with O(1) `get`/`put`. Entries live in a
//! slab and are threaded on an intrusive doubly-linked list ordered by recency
//! (head = most recent, tail = least recent). Every touch stamps the entry with
//! a strictly increasing access counter, so recency never ties.
//!
//! The engine itself is not synchronized. [`SharedCache`] wraps one instance in
//! a single async mutex so the server and proxy can share it across tasks.

use std::collections::HashMap;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::sync::Mutex;

/// A cached value with its recency marker
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<K, V> {
    pub key: K,
    pub value: V,
    /// Access counter value at the last touch
    pub recency: u64,
}

#[derive(Debug)]
struct Slot<K, V> {
    entry: CacheEntry<K, V>,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Fixed-capacity least-recently-used cache
#[derive(Debug)]
pub struct LruCache<K, V> {
    capacity: NonZeroUsize,
    index: HashMap<K, usize>,
    slots: Vec<Option<Slot<K, V>>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    clock: u64,
}

impl<K: Hash + Eq + Clone, V> LruCache<K, V> {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            capacity,
            index: HashMap::with_capacity(capacity.get()),
            slots: Vec::with_capacity(capacity.get()),
            free: Vec::new(),
            head: None,
            tail: None,
            clock: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity.get()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.index.contains_key(key)
    }

    /// Look up `key` and mark it most recently used.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let idx = *self.index.get(key)?;
        self.touch(idx);
        self.slots[idx].as_ref().map(|slot| &slot.entry.value)
    }

    /// Look up `key` without changing its recency.
    pub fn peek(&self, key: &K) -> Option<&CacheEntry<K, V>> {
        let idx = *self.index.get(key)?;
        self.slots[idx].as_ref().map(|slot| &slot.entry)
    }

    /// Insert or replace `key`.
    ///
    /// Returns the evicted least-recently-used entry when inserting a new key
    /// would push the cache past capacity. The new key is the most recent one,
    /// so evicting before linking it in removes the same entry as evicting after.
    pub fn put(&mut self, key: K, value: V) -> Option<(K, V)> {
        if let Some(&idx) = self.index.get(&key) {
            if let Some(slot) = self.slots[idx].as_mut() {
                slot.entry.value = value;
            }
            self.touch(idx);
            return None;
        }

        let evicted = if self.index.len() >= self.capacity.get() {
            self.evict_lru()
        } else {
            None
        };

        let recency = self.tick();
        let slot = Slot {
            entry: CacheEntry {
                key: key.clone(),
                value,
                recency,
            },
            prev: None,
            next: None,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(slot);
                idx
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        };
        self.index.insert(key, idx);
        self.push_front(idx);
        evicted
    }

    /// Remove `key`, returning its value.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let idx = *self.index.get(key)?;
        self.take_slot(idx).map(|(_, value)| value)
    }

    pub fn clear(&mut self) {
        self.index.clear();
        self.slots.clear();
        self.free.clear();
        self.head = None;
        self.tail = None;
    }

    /// Keys from least to most recently used.
    pub fn keys_by_recency(&self) -> Vec<K> {
        let mut keys = Vec::with_capacity(self.len());
        let mut cursor = self.tail;
        while let Some(slot) = cursor.and_then(|idx| self.slots[idx].as_ref()) {
            keys.push(slot.entry.key.clone());
            cursor = slot.prev;
        }
        keys
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn touch(&mut self, idx: usize) {
        let recency = self.tick();
        if let Some(slot) = self.slots[idx].as_mut() {
            slot.entry.recency = recency;
        }
        if self.head != Some(idx) {
            self.unlink(idx);
            self.push_front(idx);
        }
    }

    fn evict_lru(&mut self) -> Option<(K, V)> {
        let idx = self.tail?;
        self.take_slot(idx)
    }

    fn take_slot(&mut self, idx: usize) -> Option<(K, V)> {
        self.unlink(idx);
        let slot = self.slots[idx].take()?;
        self.index.remove(&slot.entry.key);
        self.free.push(idx);
        Some((slot.entry.key, slot.entry.value))
    }

    fn links(&self, idx: usize) -> (Option<usize>, Option<usize>) {
        self.slots[idx]
            .as_ref()
            .map(|slot| (slot.prev, slot.next))
            .unwrap_or((None, None))
    }

    fn set_prev(&mut self, idx: usize, prev: Option<usize>) {
        if let Some(slot) = self.slots[idx].as_mut() {
            slot.prev = prev;
        }
    }

    fn set_next(&mut self, idx: usize, next: Option<usize>) {
        if let Some(slot) = self.slots[idx].as_mut() {
            slot.next = next;
        }
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = self.links(idx);
        match prev {
            Some(prev) => self.set_next(prev, next),
            None => self.head = next,
        }
        match next {
            Some(next) => self.set_prev(next, prev),
            None => self.tail = prev,
        }
        self.set_prev(idx, None);
        self.set_next(idx, None);
    }

    fn push_front(&mut self, idx: usize) {
        let old_head = self.head;
        self.set_prev(idx, None);
        self.set_next(idx, old_head);
        if let Some(head) = old_head {
            self.set_prev(head, Some(idx));
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }
}

/// An [`LruCache`] shared across tasks behind one mutex.
///
/// Every operation, including the combined lookup-then-insert of
/// [`SharedCache::get_or_try_insert_with`], runs under the same lock.
#[derive(Debug)]
pub struct SharedCache<K, V> {
    inner: Arc<Mutex<LruCache<K, V>>>,
}

impl<K, V> Clone for SharedCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K: Hash + Eq + Clone, V: Clone> SharedCache<K, V> {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(LruCache::new(capacity))),
        }
    }

    pub async fn get(&self, key: &K) -> Option<V> {
        self.inner.lock().await.get(key).cloned()
    }

    pub async fn put(&self, key: K, value: V) -> Option<(K, V)> {
        self.inner.lock().await.put(key, value)
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }

    /// Return the cached value for `key`, or compute, store and return it.
    ///
    /// The lock is held across `compute`, so concurrent callers for the same
    /// key run the computation once. The flag is `true` on a cache hit.
    /// A failed computation leaves the cache untouched.
    pub async fn get_or_try_insert_with<E, F>(&self, key: K, compute: F) -> Result<(V, bool), E>
    where
        F: FnOnce() -> Result<V, E>,
    {
        let mut cache = self.inner.lock().await;
        if let Some(value) = cache.get(&key) {
            return Ok((value.clone(), true));
        }
        let value = compute()?;
        cache.put(key, value.clone());
        Ok((value, false))
    }
}
