//! DNS answer cache with TTL-based expiration and FIFO eviction.

use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use crate::dns::{DnsRecord, QueryKey};

/// Default capacity in entries.
pub const DEFAULT_CAPACITY: usize = 1000;

/// Default (and maximum) lifetime of an entry.
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

struct CacheEntry {
    answers: Vec<DnsRecord>,
    inserted_at: Instant,
    ttl: Duration,
    /// Insertion sequence number, the key into `Inner::order`.
    seq: u64,
}

impl CacheEntry {
    fn is_valid(&self, now: Instant) -> bool {
        now < self.inserted_at + self.ttl
    }
}

#[derive(Default)]
struct Inner {
    entries: FxHashMap<QueryKey, CacheEntry>,
    /// Insertion order; the first key is the oldest entry.
    order: BTreeMap<u64, QueryKey>,
    next_seq: u64,
}

impl Inner {
    fn remove(&mut self, key: &QueryKey) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.seq);
        Some(entry)
    }
}

/// Bounded TTL cache of validated upstream answers.
///
/// Expired entries are dropped lazily on lookup. When the cache is full
/// the oldest-inserted entry is evicted, regardless of how recently it
/// was read or how much of its TTL remains. Every operation runs under
/// a single lock, so capacity is never exceeded even transiently.
pub struct DnsCache {
    inner: Mutex<Inner>,
    capacity: usize,
    max_ttl: Duration,
}

impl DnsCache {
    pub fn new(capacity: usize, max_ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            capacity,
            max_ttl,
        }
    }

    /// Look up live answers for `key`.
    pub fn lookup(&self, key: &QueryKey) -> Option<Vec<DnsRecord>> {
        self.lookup_at(key, Instant::now())
    }

    /// Look up live answers for `key` as of `now`.
    ///
    /// Returned record TTLs are capped to the entry's remaining lifetime.
    pub fn lookup_at(&self, key: &QueryKey, now: Instant) -> Option<Vec<DnsRecord>> {
        let Ok(mut inner) = self.inner.lock() else {
            return None;
        };

        let entry = inner.entries.get(key)?;
        if !entry.is_valid(now) {
            inner.remove(key);
            return None;
        }

        let remaining = (entry.inserted_at + entry.ttl).saturating_duration_since(now);
        let remaining = u32::try_from(remaining.as_secs()).unwrap_or(u32::MAX).max(1);

        Some(
            entry
                .answers
                .iter()
                .map(|record| DnsRecord {
                    ttl: record.ttl.min(remaining),
                    ..record.clone()
                })
                .collect(),
        )
    }

    /// Store answers for `key`, replacing any existing entry.
    ///
    /// `ttl` is clamped to `[1s, max_ttl]`.
    pub fn store(&self, key: QueryKey, answers: Vec<DnsRecord>, ttl: Duration) {
        self.store_at(key, answers, ttl, Instant::now());
    }

    pub fn store_at(&self, key: QueryKey, answers: Vec<DnsRecord>, ttl: Duration, now: Instant) {
        if self.capacity == 0 {
            return;
        }
        let ttl = ttl.clamp(Duration::from_secs(1), self.max_ttl.max(Duration::from_secs(1)));

        let Ok(mut inner) = self.inner.lock() else {
            return;
        };

        if inner.remove(&key).is_none() && inner.entries.len() >= self.capacity {
            if let Some((_, oldest)) = inner.order.pop_first() {
                inner.entries.remove(&oldest);
            }
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.order.insert(seq, key.clone());
        inner.entries.insert(
            key,
            CacheEntry {
                answers,
                inserted_at: now,
                ttl,
                seq,
            },
        );
    }

    /// Drop every expired entry, returning how many were removed.
    ///
    /// Only bounds memory held by stale entries; lookups already treat
    /// them as misses.
    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(Instant::now())
    }

    pub fn purge_expired_at(&self, now: Instant) -> usize {
        let Ok(mut inner) = self.inner.lock() else {
            return 0;
        };

        let expired: Vec<QueryKey> = inner
            .entries
            .iter()
            .filter(|(_, entry)| !entry.is_valid(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            inner.remove(key);
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|inner| inner.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for DnsCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_TTL)
    }
}
