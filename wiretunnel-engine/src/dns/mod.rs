//! Name resolution
//!
//! - [`cache`]: TTL-bounded LRU of lookup results, including negative entries
//! - [`exchange`]: building queries and performing one exchange over a dialer
//! - [`resolver`]: the [`Resolver`] trait and its caching and tunnel-native
//!   implementations

pub mod cache;
pub mod exchange;
pub mod resolver;

pub use cache::{
    CacheStats, CachedLookup, DnsCache, CLEANUP_INTERVAL, DEFAULT_MAX_ENTRIES, NEGATIVE_TTL,
};
pub use exchange::DNS_TIMEOUT;
pub use resolver::{CachingResolver, NetworkCapability, Resolver, TunnelResolver, DNS_PORT};
