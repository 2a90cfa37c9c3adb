use std::{
    collections::{HashMap, HashSet, VecDeque},
    hash::Hash,
};

/// A bounded map whose entries expire after a period without access.
///
/// Time is passed in by the caller as milliseconds so that the owner decides
/// which clock to use. Every successful lookup slides the entry's expiry
/// forward by the full TTL.
#[derive(Debug)]
pub(crate) struct TtlCache<K, V> {
    entries: HashMap<K, Entry<V>>,
    ttl_ms: u64,
    capacity: usize,
}

#[derive(Debug)]
struct Entry<V> {
    value: V,
    expires_at: u64,
}

impl<K: Eq + Hash + Clone, V> TtlCache<K, V> {
    pub(crate) fn new(ttl_ms: u64, capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            ttl_ms,
            capacity: capacity.max(1),
        }
    }

    /// Looks up a live entry and refreshes its expiry.
    pub(crate) fn get(&mut self, key: &K, now: u64) -> Option<&V> {
        self.get_mut(key, now).map(|v| &*v)
    }

    pub(crate) fn get_mut(&mut self, key: &K, now: u64) -> Option<&mut V> {
        if self.entries.get(key).is_some_and(|e| e.expires_at <= now) {
            self.entries.remove(key);
            return None;
        }
        let ttl = self.ttl_ms;
        self.entries.get_mut(key).map(|e| {
            e.expires_at = now.saturating_add(ttl);
            &mut e.value
        })
    }

    /// Returns true if a live entry exists. Does not refresh it.
    pub(crate) fn contains_key(&self, key: &K, now: u64) -> bool {
        self.entries.get(key).is_some_and(|e| e.expires_at > now)
    }

    /// Inserts or replaces an entry, evicting the entry closest to expiry if
    /// the cache is full.
    pub(crate) fn insert(&mut self, key: K, value: V, now: u64) -> Option<V> {
        if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
            self.purge(now);
            if self.entries.len() >= self.capacity {
                let victim = self
                    .entries
                    .iter()
                    .min_by_key(|(_, e)| e.expires_at)
                    .map(|(k, _)| k.clone());
                if let Some(victim) = victim {
                    self.entries.remove(&victim);
                }
            }
        }
        self.entries
            .insert(
                key,
                Entry {
                    value,
                    expires_at: now.saturating_add(self.ttl_ms),
                },
            )
            .map(|e| e.value)
    }

    pub(crate) fn remove(&mut self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|e| e.value)
    }

    /// Drops every expired entry.
    pub(crate) fn purge(&mut self, now: u64) {
        self.entries.retain(|_, e| e.expires_at > now);
    }

    /// Iterates over live entries without refreshing them.
    pub(crate) fn iter(&self, now: u64) -> impl Iterator<Item = (&K, &V)> {
        self.entries
            .iter()
            .filter(move |(_, e)| e.expires_at > now)
            .map(|(k, e)| (k, &e.value))
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// A fixed-size window of recently seen values, oldest evicted first.
#[derive(Debug)]
pub(crate) struct RecentSet<T> {
    seen: HashSet<T>,
    order: VecDeque<T>,
    capacity: usize,
}

impl<T: Eq + Hash + Copy> RecentSet<T> {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            seen: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Remembers `value`. Returns false if it was already in the window.
    pub(crate) fn insert(&mut self, value: T) -> bool {
        if !self.seen.insert(value) {
            return false;
        }
        self.order.push_back(value);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }
}
