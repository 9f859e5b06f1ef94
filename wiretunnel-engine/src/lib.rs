//! WireTunnel Engine
//!
//! HTTP and SOCKS5 proxy servers that send client traffic through a
//! point-to-point tunnel.
//!
//! # Architecture
//!
//! ```text
//!   HTTP client          SOCKS5 client (TCP)        SOCKS5 client (UDP)
//!        │                      │                           │
//!        ▼                      ▼                           ▼
//!  ┌───────────┐         ┌─────────────┐             ┌─────────────┐
//!  │ HttpProxy │         │ TcpHandler  │             │  UdpRelay   │
//!  └─────┬─────┘         └──────┬──────┘             └──────┬──────┘
//!        └──────────┬───────────┘                           │
//!                   ▼                                       ▼
//!   ┌───────────────────────────────────┐            ┌─────────────┐
//!   │ dial pipeline                     │            │  UdpDialer  │
//!   │ resolve → filter → bypass → tunnel│            └──────┬──────┘
//!   └──────┬────────────────────────────┘                   │
//!          │           ▲                                    │
//!          │    ┌──────┴──────┐                             │
//!          │    │  Resolver   │◄────────────────────────────┤
//!          │    └─────────────┘                             │
//!          ▼                                                ▼
//!     host network (bypass)            Tunnel (stream and datagram dials)
//! ```
//!
//! [`ProxyEngine`] builds all of the above from a [`Config`] and a
//! [`Tunnel`] implementation.

pub mod auth;
pub mod bypass;
pub mod config;
pub mod dial;
pub mod dns;
pub mod engine;
pub mod error;
pub mod http;
pub mod net;
pub mod socks5;
pub mod tunnel;

pub use crate::http::HttpProxy;
pub use auth::Credentials;
pub use bypass::BypassList;
pub use config::{Config, HttpConfig, Overrides, ResolverConfig, ResolverMode, Socks5Config};
pub use dial::build_pipeline;
pub use dns::{CachingResolver, Resolver, TunnelResolver};
pub use engine::{BoundAddrs, ProxyEngine};
pub use error::{Error, Result};
pub use net::{BoxConn, Conn, Dialer, Network, PacketConn, SystemDialer};
pub use socks5::Socks5Server;
pub use tunnel::{HostTunnel, Tunnel};
