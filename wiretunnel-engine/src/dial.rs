//! Dial pipeline
//!
//! The pipeline turns the tunnel's raw connect capability into the policed
//! dialer both proxy servers use. It is a chain of [`Dialer`] decorators, each
//! owning the next:
//!
//! ```text
//! ResolvingDialer -> FilterDialer -> BypassDialer -> TunnelDialer
//!   (hostname ->       (reject         (direct dial     (tunnel)
//!    candidates)        loopback)       for bypassed)
//! ```
//!
//! Resolution runs first so that the filter and bypass stages always see the
//! literal address each candidate will actually connect to.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::bypass::BypassList;
use crate::dns::Resolver;
use crate::error::{Error, Result};
use crate::net::{join_host_port, literal_ip, split_host_port, BoxConn, Dialer, Network};
use crate::tunnel::Tunnel;

/// Lower bound of the per-candidate dial timeout
pub const MIN_CANDIDATE_TIMEOUT: Duration = Duration::from_secs(2);

/// Total budget spread across resolved candidates
pub const MAX_CANDIDATE_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-candidate timeout: `max(2s, 10s / count)`
pub fn candidate_timeout(count: usize) -> Duration {
    let count = u32::try_from(count.max(1)).unwrap_or(u32::MAX);
    (MAX_CANDIDATE_TIMEOUT / count).max(MIN_CANDIDATE_TIMEOUT)
}

/// Whether the address filter rejects `ip`
pub fn is_forbidden(ip: IpAddr) -> bool {
    let ip = ip.to_canonical();
    ip.is_loopback() || ip.is_unspecified()
}

/// Innermost stage: hands the connection to the tunnel
pub struct TunnelDialer {
    tunnel: Arc<dyn Tunnel>,
}

impl TunnelDialer {
    pub fn new(tunnel: Arc<dyn Tunnel>) -> Self {
        Self { tunnel }
    }
}

#[async_trait]
impl Dialer for TunnelDialer {
    async fn dial(&self, network: Network, addr: &str) -> Result<BoxConn> {
        self.tunnel.dial(network, addr).await
    }
}

/// Sends bypassed destinations over `direct` instead of the inner stage
pub struct BypassDialer<D, B> {
    inner: D,
    direct: B,
    bypass: Arc<BypassList>,
}

impl<D: Dialer, B: Dialer> BypassDialer<D, B> {
    pub fn new(inner: D, direct: B, bypass: Arc<BypassList>) -> Self {
        Self {
            inner,
            direct,
            bypass,
        }
    }
}

#[async_trait]
impl<D: Dialer, B: Dialer> Dialer for BypassDialer<D, B> {
    async fn dial(&self, network: Network, addr: &str) -> Result<BoxConn> {
        if let Some(ip) = literal_ip(addr) {
            if let Some(net) = self.bypass.matching(ip) {
                log::debug!("dial: {} matches bypass {}, dialing directly", addr, net);
                return self.direct.dial(network, addr).await;
            }
        }
        self.inner.dial(network, addr).await
    }
}

/// Rejects loopback and unspecified targets before any I/O
pub struct FilterDialer<D> {
    inner: D,
}

impl<D: Dialer> FilterDialer<D> {
    pub fn new(inner: D) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<D: Dialer> Dialer for FilterDialer<D> {
    async fn dial(&self, network: Network, addr: &str) -> Result<BoxConn> {
        split_host_port(addr)?;
        if literal_ip(addr).is_some_and(is_forbidden) {
            return Err(Error::InvalidAddress(addr.to_string()));
        }
        self.inner.dial(network, addr).await
    }
}

/// Resolves hostnames and tries each candidate address in turn
pub struct ResolvingDialer<D> {
    inner: D,
    resolver: Arc<dyn Resolver>,
}

impl<D: Dialer> ResolvingDialer<D> {
    pub fn new(inner: D, resolver: Arc<dyn Resolver>) -> Self {
        Self { inner, resolver }
    }
}

#[async_trait]
impl<D: Dialer> Dialer for ResolvingDialer<D> {
    async fn dial(&self, network: Network, addr: &str) -> Result<BoxConn> {
        let start = Instant::now();

        let (host, port) = split_host_port(addr)?;
        let candidates = self.resolver.lookup_host(host).await?;

        let timeout = candidate_timeout(candidates.len());
        let mut failures: Vec<Error> = Vec::with_capacity(candidates.len());

        for ip in candidates {
            let target = join_host_port(&ip.to_string(), port);

            match tokio::time::timeout(timeout, self.inner.dial(network, &target)).await {
                Ok(Ok(conn)) => return Ok(conn),
                Ok(Err(e)) if e.is_cancelled() => {
                    return Err(Error::Cancelled(format!(
                        "{} after {:.3} seconds",
                        addr,
                        start.elapsed().as_secs_f64()
                    )));
                }
                Ok(Err(e)) => {
                    log::debug!("dial: candidate {} for {} failed: {}", target, addr, e);
                    failures.push(e);
                }
                Err(_) => {
                    log::debug!("dial: candidate {} for {} timed out", target, addr);
                    failures.push(Error::Timeout(target));
                }
            }
        }

        if !failures.is_empty() && failures.iter().all(Error::is_invalid_address) {
            return Err(failures.swap_remove(0));
        }

        let reasons: Vec<String> = failures.iter().map(|e| e.to_string()).collect();
        Err(Error::DialExhausted {
            address: addr.to_string(),
            elapsed: start.elapsed(),
            reasons: reasons.join("; "),
        })
    }
}

/// Compose the full pipeline over a tunnel
///
/// `direct` carries bypassed traffic. The resolution stage is only installed
/// when a resolver is given; without it hostnames go to the tunnel as-is.
pub fn build_pipeline<B>(
    tunnel: Arc<dyn Tunnel>,
    direct: B,
    bypass: Arc<BypassList>,
    resolver: Option<Arc<dyn Resolver>>,
) -> Arc<dyn Dialer>
where
    B: Dialer + 'static,
{
    let policed = FilterDialer::new(BypassDialer::new(TunnelDialer::new(tunnel), direct, bypass));

    match resolver {
        Some(resolver) => Arc::new(ResolvingDialer::new(policed, resolver)),
        None => Arc::new(policed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use tokio::net::TcpListener;

    use crate::net::SystemDialer;

    /// Records every dial and answers from a script keyed by address
    #[derive(Default)]
    struct ScriptedDialer {
        calls: Mutex<Vec<String>>,
        hang: Vec<String>,
        cancel: Vec<String>,
        ok: Option<String>,
    }

    impl ScriptedDialer {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Dialer for ScriptedDialer {
        async fn dial(&self, network: Network, addr: &str) -> Result<BoxConn> {
            self.calls.lock().unwrap().push(addr.to_string());
            if self.hang.iter().any(|a| a == addr) {
                std::future::pending::<()>().await;
            }
            if self.cancel.iter().any(|a| a == addr) {
                return Err(Error::Cancelled(addr.to_string()));
            }
            if let Some(ok) = &self.ok {
                return SystemDialer.dial(network, ok).await;
            }
            Err(Error::Tunnel(format!("refused {}", addr)))
        }
    }

    struct StaticResolver(HashMap<String, Vec<IpAddr>>);

    #[async_trait]
    impl Resolver for StaticResolver {
        async fn lookup_host(&self, host: &str) -> Result<Vec<IpAddr>> {
            if let Ok(ip) = host.parse() {
                return Ok(vec![ip]);
            }
            self.0.get(host).cloned().ok_or_else(|| Error::NoSuchHost {
                host: host.to_string(),
                server: "static".to_string(),
            })
        }
    }

    fn resolver(entries: &[(&str, &[&str])]) -> Arc<dyn Resolver> {
        let map = entries
            .iter()
            .map(|(host, ips)| {
                (
                    host.to_string(),
                    ips.iter().map(|ip| ip.parse().unwrap()).collect(),
                )
            })
            .collect();
        Arc::new(StaticResolver(map))
    }

    #[test]
    fn test_candidate_timeout() {
        assert_eq!(candidate_timeout(1), Duration::from_secs(10));
        assert_eq!(candidate_timeout(2), Duration::from_secs(5));
        assert_eq!(candidate_timeout(4), Duration::from_millis(2500));
        assert_eq!(candidate_timeout(5), Duration::from_secs(2));
        assert_eq!(candidate_timeout(10), Duration::from_secs(2));
        assert_eq!(candidate_timeout(20), Duration::from_secs(2));
        assert_eq!(candidate_timeout(0), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_filter_rejects_loopback_and_unspecified() {
        for addr in ["127.0.0.1:80", "[::1]:80", "0.0.0.0:80", "[::]:80", "[::ffff:127.0.0.1]:80"] {
            let inner = Arc::new(ScriptedDialer::default());
            let dialer = FilterDialer::new(inner.clone());
            let err = dialer.dial(Network::Tcp, addr).await.err().unwrap();
            assert!(err.is_invalid_address(), "{}: {}", addr, err);
            assert!(inner.calls().is_empty(), "{} reached the network", addr);
        }
    }

    #[tokio::test]
    async fn test_filter_passes_hostnames_and_public_addresses() {
        let inner = Arc::new(ScriptedDialer::default());
        let dialer = FilterDialer::new(inner.clone());
        let _ = dialer.dial(Network::Tcp, "example.com:80").await;
        let _ = dialer.dial(Network::Udp, "192.0.2.1:53").await;
        assert_eq!(inner.calls(), vec!["example.com:80", "192.0.2.1:53"]);
    }

    #[tokio::test]
    async fn test_bypass_dials_directly_when_tunnel_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap();

        let tunnel = Arc::new(ScriptedDialer::default());
        let direct = Arc::new(ScriptedDialer {
            ok: Some(target.to_string()),
            ..Default::default()
        });
        let bypass = Arc::new(BypassList::parse("198.51.100.0/24"));
        let dialer = BypassDialer::new(tunnel.clone(), direct.clone(), bypass);

        let conn = dialer.dial(Network::Tcp, "198.51.100.20:443").await;
        assert!(conn.is_ok());
        assert!(tunnel.calls().is_empty());
        assert_eq!(direct.calls(), vec!["198.51.100.20:443"]);

        let err = dialer.dial(Network::Tcp, "203.0.113.1:443").await;
        assert!(err.is_err());
        assert_eq!(tunnel.calls(), vec!["203.0.113.1:443"]);
    }

    #[tokio::test]
    async fn test_resolving_dialer_tries_candidates_in_order() {
        let inner = Arc::new(ScriptedDialer::default());
        let dialer = ResolvingDialer::new(
            inner.clone(),
            resolver(&[("multi.test", &["2001:db8::1", "192.0.2.1", "2001:db8::2"])]),
        );

        let err = dialer.dial(Network::Tcp, "multi.test:443").await.err().unwrap();
        assert_eq!(
            inner.calls(),
            vec!["[2001:db8::1]:443", "192.0.2.1:443", "[2001:db8::2]:443"]
        );
        match err {
            Error::DialExhausted {
                address, reasons, ..
            } => {
                assert_eq!(address, "multi.test:443");
                assert_eq!(
                    reasons,
                    "tunnel error: refused [2001:db8::1]:443; \
                     tunnel error: refused 192.0.2.1:443; \
                     tunnel error: refused [2001:db8::2]:443"
                );
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_resolving_dialer_returns_first_success() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let inner = Arc::new(ScriptedDialer {
            ok: Some(listener.local_addr().unwrap().to_string()),
            ..Default::default()
        });
        let dialer = ResolvingDialer::new(
            inner.clone(),
            resolver(&[("ok.test", &["192.0.2.1", "192.0.2.2"])]),
        );

        assert!(dialer.dial(Network::Tcp, "ok.test:80").await.is_ok());
        assert_eq!(inner.calls(), vec!["192.0.2.1:80"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_candidate_timeout_advances_to_next() {
        let inner = Arc::new(ScriptedDialer {
            hang: vec!["192.0.2.1:80".into()],
            ..Default::default()
        });
        let dialer = ResolvingDialer::new(
            inner.clone(),
            resolver(&[("slow.test", &["192.0.2.1", "192.0.2.2"])]),
        );

        let err = dialer.dial(Network::Tcp, "slow.test:80").await.err().unwrap();
        assert_eq!(inner.calls(), vec!["192.0.2.1:80", "192.0.2.2:80"]);
        match err {
            Error::DialExhausted {
                elapsed, reasons, ..
            } => {
                assert!(reasons.starts_with("timed out when dialing 192.0.2.1:80; "));
                assert!(elapsed >= Duration::from_secs(5));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_cancellation_stops_candidate_iteration() {
        let inner = Arc::new(ScriptedDialer {
            cancel: vec!["192.0.2.1:80".into()],
            ..Default::default()
        });
        let dialer = ResolvingDialer::new(
            inner.clone(),
            resolver(&[("cancel.test", &["192.0.2.1", "192.0.2.2"])]),
        );

        let err = dialer.dial(Network::Tcp, "cancel.test:80").await.err().unwrap();
        assert!(err.is_cancelled());
        assert_eq!(inner.calls(), vec!["192.0.2.1:80"]);
    }

    #[tokio::test]
    async fn test_resolution_failure_is_returned() {
        let inner = Arc::new(ScriptedDialer::default());
        let dialer = ResolvingDialer::new(inner.clone(), resolver(&[]));

        let err = dialer.dial(Network::Tcp, "missing.test:80").await.err().unwrap();
        assert!(err.is_not_found());
        assert!(inner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_pipeline_rejects_loopback_literal() {
        let tunnel: Arc<dyn Tunnel> = Arc::new(crate::tunnel::HostTunnel::default());
        let direct = Arc::new(ScriptedDialer::default());
        let pipeline = build_pipeline(
            tunnel,
            direct.clone(),
            Arc::new(BypassList::parse("127.0.0.0/8")),
            Some(resolver(&[])),
        );

        let err = pipeline.dial(Network::Tcp, "127.0.0.1:22").await.err().unwrap();
        assert!(err.is_invalid_address(), "{}", err);
        assert!(direct.calls().is_empty());
    }

    #[tokio::test]
    async fn test_pipeline_bypass_after_resolution() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let tunnel: Arc<dyn Tunnel> = Arc::new(crate::tunnel::HostTunnel::default());
        let direct = Arc::new(ScriptedDialer {
            ok: Some(listener.local_addr().unwrap().to_string()),
            ..Default::default()
        });
        let pipeline = build_pipeline(
            tunnel,
            direct.clone(),
            Arc::new(BypassList::parse("192.0.2.0/24")),
            Some(resolver(&[("lan.test", &["192.0.2.80"])])),
        );

        assert!(pipeline.dial(Network::Tcp, "lan.test:8080").await.is_ok());
        assert_eq!(direct.calls(), vec!["192.0.2.80:8080"]);
    }
}
