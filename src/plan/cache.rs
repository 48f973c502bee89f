//! Bounded LRU plan cache with inactive entries.
//!
//! A freshly planned query lands in the cache inactive, carrying the works
//! its winning plan needed. A later planning of the same shape activates the
//! entry only if it did no worse; otherwise the stored works double so a
//! stable shape activates eventually while an erratic one stays out of use.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct CachedEntry<V> {
    pub value: V,
    pub works: u64,
    pub active: bool,
}

#[derive(Debug)]
struct Slot<V> {
    entry: CachedEntry<V>,
    tick: u64,
}

#[derive(Debug)]
struct Inner<K, V> {
    entries: HashMap<K, Slot<V>>,
    /// Access order, oldest first.
    lru: BTreeMap<u64, K>,
    tick: u64,
}

impl<K: Clone + Eq + Hash, V> Inner<K, V> {
    fn touch(&mut self, key: &K) {
        self.tick += 1;
        let tick = self.tick;
        if let Some(slot) = self.entries.get_mut(key) {
            self.lru.remove(&slot.tick);
            slot.tick = tick;
            self.lru.insert(tick, key.clone());
        }
    }

    fn remove(&mut self, key: &K) -> Option<CachedEntry<V>> {
        let slot = self.entries.remove(key)?;
        self.lru.remove(&slot.tick);
        Some(slot.entry)
    }
}

/// What `insert_or_update` did with the entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    InsertedInactive,
    Activated,
    WorksIncreased,
    Updated,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub skipped: u64,
}

#[derive(Debug)]
pub struct PlanCache<K, V> {
    capacity: usize,
    inner: Mutex<Inner<K, V>>,
    hits: AtomicU64,
    misses: AtomicU64,
    skipped: AtomicU64,
}

impl<K: Clone + Eq + Hash, V: Clone> PlanCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                lru: BTreeMap::new(),
                tick: 0,
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
        }
    }

    /// The active entry for `key`. Inactive entries count as misses.
    pub fn lookup(&self, key: &K) -> Option<CachedEntry<V>> {
        let mut inner = self.inner.lock();
        let found = inner
            .entries
            .get(key)
            .filter(|slot| slot.entry.active)
            .map(|slot| slot.entry.clone());
        match found {
            Some(entry) => {
                inner.touch(key);
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// The entry whatever its state, without touching stats or recency.
    pub fn peek(&self, key: &K) -> Option<CachedEntry<V>> {
        self.inner.lock().entries.get(key).map(|s| s.entry.clone())
    }

    pub fn insert_or_update(&self, key: K, value: V, works: u64) -> CacheOutcome {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let outcome = match inner.entries.get_mut(&key) {
            None => {
                if inner.entries.len() >= self.capacity {
                    if let Some((_, oldest)) = inner.lru.pop_first() {
                        inner.entries.remove(&oldest);
                        debug!("Evicted least recently used plan cache entry");
                    }
                }
                inner.entries.insert(
                    key.clone(),
                    Slot {
                        entry: CachedEntry {
                            value,
                            works,
                            active: false,
                        },
                        tick: 0,
                    },
                );
                CacheOutcome::InsertedInactive
            }
            Some(slot) if !slot.entry.active => {
                if works <= slot.entry.works {
                    slot.entry = CachedEntry {
                        value,
                        works,
                        active: true,
                    };
                    CacheOutcome::Activated
                } else {
                    slot.entry.works = slot.entry.works.saturating_mul(2).max(1);
                    CacheOutcome::WorksIncreased
                }
            }
            Some(slot) => {
                slot.entry.value = value;
                slot.entry.works = works;
                CacheOutcome::Updated
            }
        };

        if outcome == CacheOutcome::InsertedInactive {
            // New slot: give it a real position in the access order.
            inner.tick += 1;
            let tick = inner.tick;
            if let Some(slot) = inner.entries.get_mut(&key) {
                slot.tick = tick;
            }
            inner.lru.insert(tick, key);
        } else {
            inner.touch(&key);
        }
        outcome
    }

    /// Turns an active entry back to inactive, keeping its works.
    pub fn deactivate(&self, key: &K) -> bool {
        let mut inner = self.inner.lock();
        match inner.entries.get_mut(key) {
            Some(slot) if slot.entry.active => {
                slot.entry.active = false;
                true
            }
            _ => false,
        }
    }

    pub fn remove(&self, key: &K) -> Option<CachedEntry<V>> {
        self.inner.lock().remove(key)
    }

    /// Removes every entry matching `pred`; returns how many went.
    pub fn invalidate<F>(&self, mut pred: F) -> usize
    where
        F: FnMut(&K, &V) -> bool,
    {
        let mut inner = self.inner.lock();
        let doomed: Vec<K> = inner
            .entries
            .iter()
            .filter(|(k, slot)| pred(*k, &slot.entry.value))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &doomed {
            inner.remove(key);
        }
        doomed.len()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.lru.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn record_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
        }
    }
}
