//! Hostname resolution for the dial pipeline
//!
//! [`CachingResolver`] speaks raw DNS to a single server over any [`Dialer`]
//! (the tunnel, or the host stack when local DNS is requested), querying A and
//! AAAA concurrently according to the address families the tunnel can carry.
//! [`TunnelResolver`] hands names to the tunnel's own resolution path.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::rr::RecordType;
use tokio::sync::RwLock;

use super::cache::{CacheStats, CachedLookup, DnsCache};
use super::exchange::{build_query, exchange, extract_records};
use crate::error::{Error, Result};
use crate::net::{Dialer, Network};
use crate::tunnel::Tunnel;

/// Standard DNS port
pub const DNS_PORT: u16 = 53;

/// Upper bound on the reachability probes run at construction
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Well-known IPv4 endpoint used to probe tunnel connectivity
pub const PROBE_TARGET_V4: SocketAddr =
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)), DNS_PORT);

/// Well-known IPv6 endpoint used to probe tunnel connectivity
pub const PROBE_TARGET_V6: SocketAddr = SocketAddr::new(
    IpAddr::V6(Ipv6Addr::new(0x2606, 0x4700, 0x4700, 0, 0, 0, 0, 0x1111)),
    DNS_PORT,
);

/// Turns a hostname into candidate addresses
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Resolve `host` into addresses in preference order
    ///
    /// A literal IP address resolves to itself.
    async fn lookup_host(&self, host: &str) -> Result<Vec<IpAddr>>;
}

/// Address families reachable through the tunnel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkCapability {
    pub ipv4: bool,
    pub ipv6: bool,
}

impl NetworkCapability {
    /// Probe TCP reachability of well-known endpoints through `dialer`
    ///
    /// Both probes run concurrently under [`PROBE_TIMEOUT`]. Fails with
    /// [`Error::NoNetwork`] when neither family is reachable.
    pub async fn probe<D>(dialer: &D) -> Result<Self>
    where
        D: Dialer + ?Sized,
    {
        let (ipv4, ipv6) = tokio::join!(
            Self::reachable(dialer, PROBE_TARGET_V4),
            Self::reachable(dialer, PROBE_TARGET_V6),
        );

        let capability = Self { ipv4, ipv6 };
        if !capability.any() {
            return Err(Error::NoNetwork);
        }
        Ok(capability)
    }

    async fn reachable<D>(dialer: &D, target: SocketAddr) -> bool
    where
        D: Dialer + ?Sized,
    {
        let addr = target.to_string();
        match tokio::time::timeout(PROBE_TIMEOUT, dialer.dial(Network::Tcp, &addr)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                log::debug!("resolver: probe of {} failed: {}", target, e);
                false
            }
            Err(_) => {
                log::debug!("resolver: probe of {} timed out", target);
                false
            }
        }
    }

    /// Whether any family is reachable
    pub fn any(&self) -> bool {
        self.ipv4 || self.ipv6
    }
}

/// Pick the DNS server: the override if given, else the tunnel's first
pub fn select_server(tunnel_servers: &[IpAddr], server: Option<SocketAddr>) -> Result<SocketAddr> {
    if let Some(server) = server {
        return Ok(server);
    }

    let first = tunnel_servers
        .first()
        .ok_or_else(|| Error::Config("tunnel has no DNS servers configured".into()))?;

    if tunnel_servers.len() > 1 {
        log::warn!(
            "resolver: tunnel advertises {} DNS servers, only {} is used",
            tunnel_servers.len(),
            first
        );
    }

    Ok(SocketAddr::new(*first, DNS_PORT))
}

/// Interleave address lists, starting with the first
pub fn combine_ips(ip6: Vec<IpAddr>, ip4: Vec<IpAddr>) -> Vec<IpAddr> {
    let mut combined = Vec::with_capacity(ip6.len() + ip4.len());
    let mut ip6 = ip6.into_iter();
    let mut ip4 = ip4.into_iter();

    loop {
        match (ip6.next(), ip4.next()) {
            (None, None) => break,
            (a, b) => combined.extend(a.into_iter().chain(b)),
        }
    }

    combined
}

/// DNS resolver with a positive and negative cache
pub struct CachingResolver {
    transport: Arc<dyn Dialer>,
    server: SocketAddr,
    capability: NetworkCapability,
    cache: RwLock<DnsCache>,
}

impl CachingResolver {
    /// Build a resolver for `tunnel`
    ///
    /// Queries are carried over `transport`. Construction checks that the DNS
    /// server can be dialed over the transport and probes which address
    /// families the tunnel carries; both failures are fatal.
    pub async fn new(
        tunnel: Arc<dyn Tunnel>,
        transport: Arc<dyn Dialer>,
        server: Option<SocketAddr>,
        cache_size: usize,
    ) -> Result<Self> {
        let server = select_server(tunnel.dns_servers(), server)?;

        transport
            .dial(Network::Udp, &server.to_string())
            .await
            .map_err(|e| Error::Dns(format!("DNS server {} unreachable: {}", server, e)))?;

        let capability = NetworkCapability::probe(tunnel.as_ref()).await?;

        log::info!(
            "resolver: using DNS server {} (ipv4: {}, ipv6: {})",
            server,
            capability.ipv4,
            capability.ipv6
        );

        Ok(Self::with_capability(transport, server, capability, cache_size))
    }

    /// Build a resolver with already-known capability flags
    pub fn with_capability(
        transport: Arc<dyn Dialer>,
        server: SocketAddr,
        capability: NetworkCapability,
        cache_size: usize,
    ) -> Self {
        Self {
            transport,
            server,
            capability,
            cache: RwLock::new(DnsCache::new(cache_size)),
        }
    }

    /// The DNS server queries are sent to
    pub fn server(&self) -> SocketAddr {
        self.server
    }

    pub fn capability(&self) -> NetworkCapability {
        self.capability
    }

    /// Get cache statistics
    pub async fn cache_stats(&self) -> CacheStats {
        self.cache.read().await.stats()
    }

    /// Drop expired cache entries
    pub async fn cleanup_expired(&self) -> usize {
        self.cache.write().await.cleanup_expired()
    }

    async fn query(&self, host: &str, record_type: RecordType, ttl: &AtomicU32) -> Result<Vec<IpAddr>> {
        let query = build_query(host, record_type)?;
        let response = exchange(self.transport.as_ref(), self.server, &query).await?;
        let records = extract_records(&response, record_type)?;

        // Whichever family completes last decides the cached TTL
        ttl.store(records.ttl, Ordering::Relaxed);
        Ok(records.addrs)
    }

    async fn query_if(
        &self,
        enabled: bool,
        host: &str,
        record_type: RecordType,
        ttl: &AtomicU32,
    ) -> Result<Vec<IpAddr>> {
        if !enabled {
            return Ok(Vec::new());
        }
        self.query(host, record_type, ttl).await
    }

    /// Query both families and merge, returning addresses and TTL
    async fn lookup_ip(&self, host: &str) -> Result<(Vec<IpAddr>, u32)> {
        let ttl = AtomicU32::new(0);

        let (ip6, ip4) = tokio::join!(
            self.query_if(self.capability.ipv6, host, RecordType::AAAA, &ttl),
            self.query_if(self.capability.ipv4, host, RecordType::A, &ttl),
        );

        let mut transport_error = None;
        let mut addrs_of = |result: Result<Vec<IpAddr>>| match result {
            Ok(addrs) => addrs,
            Err(e) => {
                log::debug!("resolver: lookup of {} failed: {}", host, e);
                if !e.is_not_found() && transport_error.is_none() {
                    transport_error = Some(e);
                }
                Vec::new()
            }
        };
        let ip6 = addrs_of(ip6);
        let ip4 = addrs_of(ip4);

        let addrs = combine_ips(ip6, ip4);
        if addrs.is_empty() {
            if let Some(e) = transport_error {
                return Err(e);
            }
        }

        Ok((addrs, ttl.load(Ordering::Relaxed)))
    }

    fn no_such_host(&self, host: &str) -> Error {
        Error::NoSuchHost {
            host: host.to_string(),
            server: self.server.to_string(),
        }
    }
}

#[async_trait]
impl Resolver for CachingResolver {
    async fn lookup_host(&self, host: &str) -> Result<Vec<IpAddr>> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }

        let cached = self.cache.read().await.get(host);
        match cached {
            Some(CachedLookup::Found(addrs)) => return Ok(addrs),
            Some(CachedLookup::NotFound) => return Err(self.no_such_host(host)),
            None => {}
        }

        let (addrs, ttl) = self.lookup_ip(host).await?;

        if addrs.is_empty() {
            self.cache.write().await.insert_negative(host);
            return Err(self.no_such_host(host));
        }

        log::debug!("resolver: {} -> {:?} (ttl {}s)", host, addrs, ttl);
        self.cache
            .write()
            .await
            .insert(host, addrs.clone(), Duration::from_secs(u64::from(ttl)));

        Ok(addrs)
    }
}

/// Resolver backed by the tunnel's native lookup
pub struct TunnelResolver {
    tunnel: Arc<dyn Tunnel>,
}

impl TunnelResolver {
    pub fn new(tunnel: Arc<dyn Tunnel>) -> Self {
        Self { tunnel }
    }
}

#[async_trait]
impl Resolver for TunnelResolver {
    async fn lookup_host(&self, host: &str) -> Result<Vec<IpAddr>> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }
        self.tunnel.lookup_host(host).await
    }
}
