//! SOCKS5 wire format (RFC 1928, RFC 1929)

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::auth::Credentials;
use crate::error::{Error, Result};
use crate::net::join_host_port;

pub const VERSION5: u8 = 0x05;

pub const AUTH_NONE: u8 = 0x00;
pub const AUTH_USERPASS: u8 = 0x02;
pub const AUTH_NO_ACCEPT: u8 = 0xFF;

/// Username/password sub-negotiation version
pub const USERPASS_VERSION: u8 = 0x01;
pub const USERPASS_SUCCESS: u8 = 0x00;
pub const USERPASS_FAILURE: u8 = 0x01;

pub const CMD_CONNECT: u8 = 0x01;
pub const CMD_BIND: u8 = 0x02;
pub const CMD_UDP_ASSOCIATE: u8 = 0x03;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

pub const REP_SUCCESS: u8 = 0x00;
pub const REP_GENERAL_FAILURE: u8 = 0x01;
pub const REP_HOST_UNREACH: u8 = 0x04;
pub const REP_CMD_NOT_SUPPORTED: u8 = 0x07;
pub const REP_ADDR_NOT_SUPPORTED: u8 = 0x08;

/// Destination of a request or datagram
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TargetAddr {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl TargetAddr {
    /// Address type byte
    pub fn atyp(&self) -> u8 {
        match self {
            TargetAddr::Ip(SocketAddr::V4(_)) => ATYP_IPV4,
            TargetAddr::Ip(SocketAddr::V6(_)) => ATYP_IPV6,
            TargetAddr::Domain(..) => ATYP_DOMAIN,
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            TargetAddr::Ip(addr) => addr.port(),
            TargetAddr::Domain(_, port) => *port,
        }
    }

    /// The all-zero address of the family a reply to this target uses
    ///
    /// IPv4 and domain targets get `0.0.0.0:0`, IPv6 targets `[::]:0`.
    pub fn unspecified_reply(&self) -> TargetAddr {
        match self {
            TargetAddr::Ip(SocketAddr::V6(_)) => {
                TargetAddr::Ip(SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0))
            }
            _ => TargetAddr::Ip(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)),
        }
    }

    /// Append ATYP, address and port
    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.push(self.atyp());
        match self {
            TargetAddr::Ip(SocketAddr::V4(addr)) => buf.extend_from_slice(&addr.ip().octets()),
            TargetAddr::Ip(SocketAddr::V6(addr)) => buf.extend_from_slice(&addr.ip().octets()),
            TargetAddr::Domain(host, _) => {
                let len = u8::try_from(host.len())
                    .map_err(|_| Error::Socks5(format!("domain too long: {}", host.len())))?;
                buf.push(len);
                buf.extend_from_slice(host.as_bytes());
            }
        }
        buf.extend_from_slice(&self.port().to_be_bytes());
        Ok(())
    }

    /// Read address and port for the given ATYP from a stream
    pub async fn read_from<R>(reader: &mut R, atyp: u8) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let target = match atyp {
            ATYP_IPV4 => {
                let mut octets = [0u8; 4];
                reader.read_exact(&mut octets).await?;
                let port = reader.read_u16().await?;
                TargetAddr::Ip(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port))
            }
            ATYP_IPV6 => {
                let mut octets = [0u8; 16];
                reader.read_exact(&mut octets).await?;
                let port = reader.read_u16().await?;
                TargetAddr::Ip(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
            }
            ATYP_DOMAIN => {
                let len = reader.read_u8().await? as usize;
                let mut name = vec![0u8; len];
                reader.read_exact(&mut name).await?;
                let port = reader.read_u16().await?;
                let host = String::from_utf8(name)
                    .map_err(|_| Error::Socks5("domain is not valid UTF-8".into()))?;
                TargetAddr::Domain(host, port)
            }
            other => return Err(Error::Socks5(format!("unsupported address type 0x{:02x}", other))),
        };
        Ok(target)
    }

    /// Parse ATYP, address and port from the front of `buf`, returning the
    /// number of bytes consumed
    pub fn parse(buf: &[u8]) -> Result<(Self, usize)> {
        let short = || Error::Socks5("address truncated".into());
        let (&atyp, rest) = buf.split_first().ok_or_else(short)?;

        let (target, used) = match atyp {
            ATYP_IPV4 => {
                let raw = rest.get(..6).ok_or_else(short)?;
                let ip = Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3]);
                let port = u16::from_be_bytes([raw[4], raw[5]]);
                (TargetAddr::Ip(SocketAddr::new(IpAddr::V4(ip), port)), 6)
            }
            ATYP_IPV6 => {
                let raw = rest.get(..18).ok_or_else(short)?;
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&raw[..16]);
                let port = u16::from_be_bytes([raw[16], raw[17]]);
                (TargetAddr::Ip(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port)), 18)
            }
            ATYP_DOMAIN => {
                let len = *rest.first().ok_or_else(short)? as usize;
                let raw = rest.get(1..len + 3).ok_or_else(short)?;
                let host = std::str::from_utf8(&raw[..len])
                    .map_err(|_| Error::Socks5("domain is not valid UTF-8".into()))?;
                let port = u16::from_be_bytes([raw[len], raw[len + 1]]);
                (TargetAddr::Domain(host.to_string(), port), len + 3)
            }
            other => return Err(Error::Socks5(format!("unsupported address type 0x{:02x}", other))),
        };

        Ok((target, used + 1))
    }
}

impl From<SocketAddr> for TargetAddr {
    fn from(addr: SocketAddr) -> Self {
        TargetAddr::Ip(addr)
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ip(addr) => write!(f, "{}", addr),
            TargetAddr::Domain(host, port) => f.write_str(&join_host_port(host, *port)),
        }
    }
}

/// Run method negotiation, and username/password authentication when
/// `credentials` is set
pub async fn negotiate<S>(stream: &mut S, credentials: Option<&Credentials>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let version = stream.read_u8().await?;
    if version != VERSION5 {
        return Err(Error::Socks5(format!("unsupported version {}", version)));
    }

    let count = stream.read_u8().await? as usize;
    let mut methods = vec![0u8; count];
    stream.read_exact(&mut methods).await?;

    let wanted = match credentials {
        Some(_) => AUTH_USERPASS,
        None => AUTH_NONE,
    };
    if !methods.contains(&wanted) {
        stream.write_all(&[VERSION5, AUTH_NO_ACCEPT]).await?;
        return Err(Error::Auth("no acceptable authentication method".into()));
    }
    stream.write_all(&[VERSION5, wanted]).await?;

    let Some(credentials) = credentials else {
        return Ok(());
    };

    let version = stream.read_u8().await?;
    if version != USERPASS_VERSION {
        return Err(Error::Socks5(format!(
            "unsupported auth version {}",
            version
        )));
    }

    let len = stream.read_u8().await? as usize;
    let mut username = vec![0u8; len];
    stream.read_exact(&mut username).await?;

    let len = stream.read_u8().await? as usize;
    let mut password = vec![0u8; len];
    stream.read_exact(&mut password).await?;

    if username != credentials.username.as_bytes() || password != credentials.password.as_bytes() {
        stream.write_all(&[USERPASS_VERSION, USERPASS_FAILURE]).await?;
        return Err(Error::Auth("invalid username or password".into()));
    }

    stream.write_all(&[USERPASS_VERSION, USERPASS_SUCCESS]).await?;
    Ok(())
}

/// A client request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub command: u8,
    pub target: TargetAddr,
}

/// Read the request that follows negotiation
pub async fn read_request<R>(reader: &mut R) -> Result<Request>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    reader.read_exact(&mut header).await?;

    if header[0] != VERSION5 {
        return Err(Error::Socks5(format!("unsupported version {}", header[0])));
    }

    let target = TargetAddr::read_from(reader, header[3]).await?;
    Ok(Request {
        command: header[1],
        target,
    })
}

/// Write a reply with the given code and bound address
pub async fn write_reply<W>(writer: &mut W, rep: u8, bound: &TargetAddr) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = Vec::with_capacity(22);
    buf.extend_from_slice(&[VERSION5, rep, 0x00]);
    bound.encode(&mut buf)?;
    writer.write_all(&buf).await?;
    Ok(())
}

/// A UDP relay datagram (RFC 1928 §7)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub frag: u8,
    pub target: TargetAddr,
    pub data: Vec<u8>,
}

impl Datagram {
    pub fn new(target: TargetAddr, data: Vec<u8>) -> Self {
        Self {
            frag: 0,
            target,
            data,
        }
    }

    /// Parse a datagram received from a client
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < 4 {
            return Err(Error::Socks5("datagram too short".into()));
        }
        if buf[0] != 0 || buf[1] != 0 {
            return Err(Error::Socks5("datagram reserved bytes are not zero".into()));
        }

        let frag = buf[2];
        let (target, used) = TargetAddr::parse(&buf[3..])?;

        Ok(Self {
            frag,
            target,
            data: buf[3 + used..].to_vec(),
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.data.len() + 22);
        buf.extend_from_slice(&[0x00, 0x00, self.frag]);
        self.target.encode(&mut buf)?;
        buf.extend_from_slice(&self.data);
        Ok(buf)
    }
}
