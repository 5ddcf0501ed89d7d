//! Bounded key/value cache with expire-after-write TTL and batched removal
//! notifications.
//!
//! Reads go straight to a [`DashMap`]. Every mutation also goes through a
//! single order index keyed by insertion sequence, which makes
//! oldest-first capacity eviction and the TTL sweep a walk from the front.
//! Because the TTL is fixed and sequence numbers are handed out under the
//! same lock as the expiry instant, expiry order equals sequence order.

use std::collections::BTreeMap;
use std::ops::ControlFlow;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use burrow_core::EntityKey;
use burrow_lanes::Scheduler;
use dashmap::DashMap;

/// Why entries left the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemovalCause {
    /// `remove` / `remove_if` by a caller.
    Explicit,
    /// The entry outlived its TTL.
    Expired,
    /// The entry was the oldest when capacity was exceeded.
    Capacity,
}

impl RemovalCause {
    /// Whether the cache dropped the entry on its own.
    pub fn was_evicted(self) -> bool {
        !matches!(self, RemovalCause::Explicit)
    }
}

/// Callback receiving every batch of removed entries.
///
/// Invoked outside the cache's locks, on whichever thread caused the
/// removal (the caller of `put`/`remove`, or the sweeper).
pub type RemovalListener<K, V> = Arc<dyn Fn(Vec<(K, V)>, RemovalCause) + Send + Sync>;

/// Point-in-time cache counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Number of entries currently in cache.
    pub entry_count: u64,
    /// Entries removed by callers.
    pub explicit_removals: u64,
    /// Entries removed by the TTL sweep.
    pub expirations: u64,
    /// Entries removed to stay within capacity.
    pub evictions: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct Slot<V> {
    value: V,
    seq: u64,
    /// `None` when the TTL is too large to represent.
    expires_at: Option<Instant>,
}

struct Order<K> {
    by_seq: BTreeMap<u64, K>,
    next_seq: u64,
}

impl<K> Default for Order<K> {
    fn default() -> Self {
        Self {
            by_seq: BTreeMap::new(),
            next_seq: 0,
        }
    }
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    explicit: AtomicU64,
    expired: AtomicU64,
    capacity: AtomicU64,
}

impl Counters {
    fn record(&self, cause: RemovalCause, n: usize) {
        let counter = match cause {
            RemovalCause::Explicit => &self.explicit,
            RemovalCause::Expired => &self.expired,
            RemovalCause::Capacity => &self.capacity,
        };
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
}

struct Inner<K, V> {
    map: DashMap<K, Slot<V>>,
    order: Mutex<Order<K>>,
    capacity: usize,
    ttl: Duration,
    listener: RemovalListener<K, V>,
    counters: Counters,
}

/// Bounded cache handle. Clones share the same storage.
pub struct BoundedCache<K, V> {
    inner: Arc<Inner<K, V>>,
}

impl<K, V> Clone for BoundedCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> BoundedCache<K, V>
where
    K: EntityKey,
    V: Clone + Send + Sync + 'static,
{
    /// Create an empty cache. A `capacity` of zero is treated as one.
    pub fn new(capacity: usize, ttl: Duration, listener: RemovalListener<K, V>) -> Self {
        Self {
            inner: Arc::new(Inner {
                map: DashMap::new(),
                order: Mutex::new(Order::default()),
                capacity: capacity.max(1),
                ttl,
                listener,
                counters: Counters::default(),
            }),
        }
    }

    /// Sweep expired entries every `interval` on `scheduler` for as long as
    /// the cache is alive.
    pub fn spawn_sweeper(&self, scheduler: &Scheduler, interval: Duration) {
        let weak: Weak<Inner<K, V>> = Arc::downgrade(&self.inner);
        scheduler.schedule_repeating(interval, move || match weak.upgrade() {
            Some(inner) => {
                BoundedCache { inner }.sweep_expired();
                ControlFlow::Continue(())
            }
            None => ControlFlow::Break(()),
        });
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn ttl(&self) -> Duration {
        self.inner.ttl
    }

    /// Value for `key`, if resident. Does not refresh the TTL.
    pub fn get(&self, key: &K) -> Option<V> {
        let found = self.inner.map.get(key).map(|slot| slot.value.clone());
        let counter = if found.is_some() {
            &self.inner.counters.hits
        } else {
            &self.inner.counters.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }

    /// Like [`get`](Self::get), without counting a hit or miss.
    pub fn peek(&self, key: &K) -> Option<V> {
        self.inner.map.get(key).map(|slot| slot.value.clone())
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.inner.map.contains_key(key)
    }

    /// Insert or replace `key`, restarting its TTL and making it the newest
    /// entry. Replacing a value is not a removal and is not notified.
    pub fn put(&self, key: K, value: V) {
        let evicted = {
            let mut order = self.lock_order();
            self.insert_locked(&mut order, key, value);
            self.evict_overflow(&mut order)
        };
        self.notify(evicted, RemovalCause::Capacity);
    }

    /// Insert `value` unless `key` is already resident. Returns the value
    /// that ends up cached.
    pub fn put_if_absent(&self, key: K, value: V) -> V {
        self.put_unless(key, value, |_| true)
    }

    /// Insert `value` unless `key` is resident and `keep` accepts the
    /// resident value. Returns the value that ends up cached.
    pub fn put_unless<P>(&self, key: K, value: V, keep: P) -> V
    where
        P: FnOnce(&V) -> bool,
    {
        let evicted = {
            let mut order = self.lock_order();
            if let Some(existing) = self.inner.map.get(&key) {
                if keep(&existing.value) {
                    return existing.value.clone();
                }
            }
            self.insert_locked(&mut order, key, value.clone());
            self.evict_overflow(&mut order)
        };
        self.notify(evicted, RemovalCause::Capacity);
        value
    }

    /// Remove `key`, notifying the listener with [`RemovalCause::Explicit`].
    pub fn remove(&self, key: &K) -> Option<V> {
        self.remove_if(key, |_| true)
    }

    /// Remove `key` only if `predicate` accepts its current value.
    pub fn remove_if<P>(&self, key: &K, predicate: P) -> Option<V>
    where
        P: FnOnce(&V) -> bool,
    {
        let removed = {
            let mut order = self.lock_order();
            let (key, slot) = self
                .inner
                .map
                .remove_if(key, |_, slot| predicate(&slot.value))?;
            order.by_seq.remove(&slot.seq);
            (key, slot.value)
        };
        let value = removed.1.clone();
        self.notify(vec![removed], RemovalCause::Explicit);
        Some(value)
    }

    /// Drop every entry whose TTL has elapsed, delivering them to the
    /// listener as one [`RemovalCause::Expired`] batch. Returns how many
    /// were dropped.
    pub fn sweep_expired(&self) -> usize {
        let expired = {
            let mut order = self.lock_order();
            let now = Instant::now();
            let mut expired = Vec::new();
            while let Some(entry) = order.by_seq.first_entry() {
                let due = match self.inner.map.get(entry.get()) {
                    Some(slot) => slot.expires_at.is_some_and(|at| at <= now),
                    None => true,
                };
                if !due {
                    break;
                }
                let key = entry.remove();
                if let Some((key, slot)) = self.inner.map.remove(&key) {
                    expired.push((key, slot.value));
                }
            }
            expired
        };
        let n = expired.len();
        self.notify(expired, RemovalCause::Expired);
        n
    }

    /// Visit a snapshot of every resident entry.
    pub fn for_each<F>(&self, mut visitor: F)
    where
        F: FnMut(&K, &V),
    {
        let snapshot: Vec<(K, V)> = self
            .inner
            .map
            .iter()
            .map(|r| (r.key().clone(), r.value().value.clone()))
            .collect();
        for (key, value) in &snapshot {
            visitor(key, value);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.map.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        let c = &self.inner.counters;
        CacheStats {
            hits: c.hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            entry_count: self.inner.map.len() as u64,
            explicit_removals: c.explicit.load(Ordering::Relaxed),
            expirations: c.expired.load(Ordering::Relaxed),
            evictions: c.capacity.load(Ordering::Relaxed),
        }
    }

    fn lock_order(&self) -> MutexGuard<'_, Order<K>> {
        self.inner.order.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn insert_locked(&self, order: &mut Order<K>, key: K, value: V) {
        let seq = order.next_seq;
        order.next_seq += 1;
        let slot = Slot {
            value,
            seq,
            expires_at: Instant::now().checked_add(self.inner.ttl),
        };
        if let Some(previous) = self.inner.map.insert(key.clone(), slot) {
            order.by_seq.remove(&previous.seq);
        }
        order.by_seq.insert(seq, key);
    }

    fn evict_overflow(&self, order: &mut Order<K>) -> Vec<(K, V)> {
        let mut evicted = Vec::new();
        while order.by_seq.len() > self.inner.capacity {
            let Some((_, oldest)) = order.by_seq.pop_first() else {
                break;
            };
            if let Some((key, slot)) = self.inner.map.remove(&oldest) {
                evicted.push((key, slot.value));
            }
        }
        evicted
    }

    fn notify(&self, removed: Vec<(K, V)>, cause: RemovalCause) {
        if removed.is_empty() {
            return;
        }
        let n = removed.len();
        self.inner.counters.record(cause, n);
        let listener = &self.inner.listener;
        if catch_unwind(AssertUnwindSafe(|| listener(removed, cause))).is_err() {
            tracing::error!(?cause, count = n, "Removal listener panicked");
        }
    }
}

impl<K: EntityKey, V> std::fmt::Debug for BoundedCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedCache")
            .field("capacity", &self.inner.capacity)
            .field("ttl", &self.inner.ttl)
            .field("len", &self.inner.map.len())
            .finish()
    }
}
