//! Host lookup caching with TTL expiration
//!
//! Entries are keyed by lowercase hostname and hold either the combined
//! address list of a successful lookup or a negative marker. Reads never
//! reorder the LRU so they can run under a shared lock.

use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use lru::LruCache;
use tokio::time::Instant;

/// Default maximum number of cached hosts
pub const DEFAULT_MAX_ENTRIES: usize = 4096;

/// How long a failed lookup is remembered
pub const NEGATIVE_TTL: Duration = Duration::from_secs(5 * 60);

/// Interval of the periodic expired-entry sweep
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Result remembered for a host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CachedLookup {
    /// Addresses in resolver order
    Found(Vec<IpAddr>),
    /// The host had no records
    NotFound,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    lookup: CachedLookup,
    expires_at: Instant,
}

impl CacheEntry {
    fn new(lookup: CachedLookup, ttl: Duration) -> Self {
        Self {
            lookup,
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Cache statistics
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    /// Number of cache hits
    pub hits: u64,
    /// Number of cache misses
    pub misses: u64,
    /// Number of expired entries removed
    pub expired: u64,
    /// Current number of entries in cache
    pub entries: usize,
}

/// Host lookup cache
pub struct DnsCache {
    cache: LruCache<String, CacheEntry>,
    hits: AtomicU64,
    misses: AtomicU64,
    expired: u64,
}

impl DnsCache {
    /// Create a cache holding at most `max_entries` hosts
    pub fn new(max_entries: usize) -> Self {
        let capacity = NonZeroUsize::new(max_entries)
            .or(NonZeroUsize::new(DEFAULT_MAX_ENTRIES))
            .unwrap_or(NonZeroUsize::MIN);

        Self {
            cache: LruCache::new(capacity),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            expired: 0,
        }
    }

    /// Look up a host
    ///
    /// Expired entries count as misses and are left for [`cleanup_expired`]
    /// or the next insert to replace.
    ///
    /// [`cleanup_expired`]: DnsCache::cleanup_expired
    pub fn get(&self, host: &str) -> Option<CachedLookup> {
        match self.cache.peek(&host.to_lowercase()) {
            Some(entry) if !entry.is_expired() => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.lookup.clone())
            }
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Remember the addresses of a successful lookup for `ttl`
    pub fn insert(&mut self, host: &str, addrs: Vec<IpAddr>, ttl: Duration) {
        self.cache.put(
            host.to_lowercase(),
            CacheEntry::new(CachedLookup::Found(addrs), ttl),
        );
    }

    /// Remember that `host` has no records
    pub fn insert_negative(&mut self, host: &str) {
        self.cache.put(
            host.to_lowercase(),
            CacheEntry::new(CachedLookup::NotFound, NEGATIVE_TTL),
        );
    }

    /// Clear all entries from the cache
    pub fn clear(&mut self) {
        self.cache.clear();
    }

    /// Get current cache statistics
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            expired: self.expired,
            entries: self.cache.len(),
        }
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Remove expired entries, returning how many were dropped
    pub fn cleanup_expired(&mut self) -> usize {
        let expired_keys: Vec<String> = self
            .cache
            .iter()
            .filter(|(_, entry)| entry.is_expired())
            .map(|(key, _)| key.clone())
            .collect();

        let count = expired_keys.len();
        for key in expired_keys {
            self.cache.pop(&key);
        }

        self.expired += count as u64;
        count
    }
}

impl Default for DnsCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES)
    }
}
