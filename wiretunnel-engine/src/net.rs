//! Transport-agnostic connection primitives
//!
//! Everything that opens a connection in this crate does it through the
//! [`Dialer`] trait: the tunnel, the host network stack and every stage of the
//! dial pipeline. A dialed connection is a [`Conn`], a byte stream for TCP or a
//! datagram-preserving stream for UDP (each write is one datagram, each read
//! returns one datagram). UDP sessions that need concurrent send and receive
//! use [`PacketConn`] instead.

use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpStream, UdpSocket};

use crate::error::{Error, Result};

/// Network kind requested from a dialer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    /// Stream connection (TCP)
    Tcp,
    /// Datagram connection (UDP)
    Udp,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Tcp => write!(f, "tcp"),
            Network::Udp => write!(f, "udp"),
        }
    }
}

/// A connection produced by a [`Dialer`]
pub trait Conn: AsyncRead + AsyncWrite + Send + Unpin {
    /// Local address the connection is bound to
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// Owned, type-erased connection
pub type BoxConn = Box<dyn Conn>;

impl Conn for TcpStream {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpStream::local_addr(self)
    }
}

/// A connected datagram socket that can be shared between a sender and a
/// receiver task
#[async_trait]
pub trait PacketConn: Send + Sync {
    /// Send one datagram to the connected peer
    async fn send(&self, buf: &[u8]) -> io::Result<usize>;

    /// Receive one datagram from the connected peer
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Local address the socket is bound to
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// Connected UDP socket usable both as a [`Conn`] and as a [`PacketConn`]
#[derive(Debug)]
pub struct UdpConn {
    socket: UdpSocket,
}

impl UdpConn {
    /// Bind `local` (or an ephemeral port of the remote's family) and connect
    /// to `remote`
    pub async fn connect(local: Option<SocketAddr>, remote: SocketAddr) -> io::Result<Self> {
        let local = local.unwrap_or_else(|| unspecified_for(remote));
        let socket = UdpSocket::bind(local).await?;
        socket.connect(remote).await?;
        Ok(Self { socket })
    }

    /// Local address the socket is bound to
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Address of the connected peer
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.socket.peer_addr()
    }
}

impl AsyncRead for UdpConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.socket.poll_recv(cx, buf)
    }
}

impl AsyncWrite for UdpConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.socket.poll_send(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl Conn for UdpConn {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

#[async_trait]
impl PacketConn for UdpConn {
    async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        self.socket.send(buf).await
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.socket.recv(buf).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

/// Something that can open connections
///
/// `addr` is a `host:port` string; the host may be a literal IP address or a
/// hostname, depending on what the implementation accepts.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Open a connection of the given kind to `addr`
    async fn dial(&self, network: Network, addr: &str) -> Result<BoxConn>;
}

#[async_trait]
impl<D: Dialer + ?Sized> Dialer for Arc<D> {
    async fn dial(&self, network: Network, addr: &str) -> Result<BoxConn> {
        (**self).dial(network, addr).await
    }
}

/// Dialer that uses the host's own network stack
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemDialer;

#[async_trait]
impl Dialer for SystemDialer {
    async fn dial(&self, network: Network, addr: &str) -> Result<BoxConn> {
        match network {
            Network::Tcp => {
                let stream = TcpStream::connect(addr).await?;
                Ok(Box::new(stream))
            }
            Network::Udp => {
                let remote = tokio::net::lookup_host(addr).await?.next().ok_or_else(|| {
                    Error::Io(io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("no addresses for {}", addr),
                    ))
                })?;
                Ok(Box::new(UdpConn::connect(None, remote).await?))
            }
        }
    }
}

/// Split `host:port`, accepting bracketed IPv6 hosts
pub fn split_host_port(addr: &str) -> Result<(&str, u16)> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| invalid_input(format!("address {}: missing port", addr)))?;

    let host = match host.strip_prefix('[') {
        Some(rest) => rest
            .strip_suffix(']')
            .ok_or_else(|| invalid_input(format!("address {}: missing ']'", addr)))?,
        None if host.contains(':') => {
            return Err(invalid_input(format!(
                "address {}: too many colons",
                addr
            )))
        }
        None => host,
    };

    let port = port
        .parse::<u16>()
        .map_err(|_| invalid_input(format!("address {}: invalid port", addr)))?;

    Ok((host, port))
}

/// Join a host and port, bracketing IPv6 literals
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Parse the host part of `addr` as an IP, if it is one
pub fn literal_ip(addr: &str) -> Option<IpAddr> {
    split_host_port(addr).ok()?.0.parse().ok()
}

/// Unspecified address of the same family as `addr`, port 0
pub fn unspecified_for(addr: SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    }
}

fn invalid_input(msg: String) -> Error {
    Error::Io(io::Error::new(io::ErrorKind::InvalidInput, msg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_split_host_port() {
        assert_eq!(split_host_port("example.com:80").unwrap(), ("example.com", 80));
        assert_eq!(split_host_port("1.2.3.4:53").unwrap(), ("1.2.3.4", 53));
        assert_eq!(split_host_port("[::1]:1080").unwrap(), ("::1", 1080));
        assert!(split_host_port("example.com").is_err());
        assert!(split_host_port("::1:80").is_err());
        assert!(split_host_port("[::1:80").is_err());
        assert!(split_host_port("host:99999").is_err());
    }

    #[test]
    fn test_join_host_port() {
        assert_eq!(join_host_port("example.com", 443), "example.com:443");
        assert_eq!(join_host_port("2001:db8::1", 53), "[2001:db8::1]:53");
    }

    #[test]
    fn test_literal_ip() {
        assert_eq!(literal_ip("10.0.0.1:80"), Some("10.0.0.1".parse().unwrap()));
        assert_eq!(literal_ip("[::]:80"), Some("::".parse().unwrap()));
        assert_eq!(literal_ip("example.com:80"), None);
    }

    #[tokio::test]
    async fn test_udp_conn_preserves_datagrams() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();

        let mut conn = UdpConn::connect(None, server_addr).await.unwrap();
        conn.write_all(b"first").await.unwrap();
        conn.write_all(b"second").await.unwrap();

        let mut buf = [0u8; 64];
        let (n, from) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"first");
        let (n, _) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"second");

        server.send_to(b"reply", from).await.unwrap();
        let n = conn.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"reply");
        assert_eq!(conn.peer_addr().unwrap(), server_addr);
    }
}
