//! Tunnel transport seam
//!
//! The encrypted tunnel is an external collaborator. The proxy only needs it
//! to open stream and datagram connections to remote endpoints, to report the
//! DNS servers it was configured with, and to resolve names natively.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::net::{BoxConn, Dialer, Network, PacketConn, SystemDialer, UdpConn};

/// The point-to-point tunnel traffic is carried over
///
/// [`Dialer::dial`] opens a connection through the tunnel; the tunnel may
/// resolve hostnames in `addr` itself.
#[async_trait]
pub trait Tunnel: Dialer {
    /// Open a UDP socket through the tunnel, optionally bound to `local`
    async fn dial_udp(
        &self,
        local: Option<SocketAddr>,
        remote: SocketAddr,
    ) -> Result<Arc<dyn PacketConn>>;

    /// DNS servers configured for the tunnel
    fn dns_servers(&self) -> &[IpAddr];

    /// Resolve `host` through the tunnel's own resolution path
    async fn lookup_host(&self, host: &str) -> Result<Vec<IpAddr>>;
}

/// Tunnel that carries traffic over the host network stack
///
/// Used when no encrypted transport is linked into the binary, and as a
/// predictable transport in tests.
#[derive(Debug, Clone, Default)]
pub struct HostTunnel {
    dns: Vec<IpAddr>,
}

impl HostTunnel {
    /// Create a host tunnel advertising the given DNS servers
    pub fn new(dns: Vec<IpAddr>) -> Self {
        Self { dns }
    }
}

#[async_trait]
impl Dialer for HostTunnel {
    async fn dial(&self, network: Network, addr: &str) -> Result<BoxConn> {
        SystemDialer.dial(network, addr).await
    }
}

#[async_trait]
impl Tunnel for HostTunnel {
    async fn dial_udp(
        &self,
        local: Option<SocketAddr>,
        remote: SocketAddr,
    ) -> Result<Arc<dyn PacketConn>> {
        let conn = UdpConn::connect(local, remote).await?;
        Ok(Arc::new(conn))
    }

    fn dns_servers(&self) -> &[IpAddr] {
        &self.dns
    }

    async fn lookup_host(&self, host: &str) -> Result<Vec<IpAddr>> {
        let addrs: Vec<IpAddr> = tokio::net::lookup_host((host, 0))
            .await?
            .map(|addr| addr.ip())
            .collect();

        if addrs.is_empty() {
            return Err(Error::NoSuchHost {
                host: host.to_string(),
                server: "host".to_string(),
            });
        }

        Ok(addrs)
    }
}
