//! Error types for the proxy engine

use std::time::Duration;

use thiserror::Error;

/// Result type alias for proxy operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while dialing, resolving or serving proxy clients
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Failed to parse configuration file
    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Target rejected by the address filter (loopback or unspecified)
    #[error("invalid address {0}")]
    InvalidAddress(String),

    /// Every resolved candidate failed to connect
    #[error(
        "failed when dialing {address} after {:.3} seconds. Reasons: {reasons}",
        elapsed.as_secs_f64()
    )]
    DialExhausted {
        address: String,
        elapsed: Duration,
        reasons: String,
    },

    /// The dial was cancelled by its caller
    #[error("canceled when dialing {0}")]
    Cancelled(String),

    /// Timeout error
    #[error("timed out when dialing {0}")]
    Timeout(String),

    /// Neither IPv4 nor IPv6 is reachable through the tunnel
    #[error("no network available")]
    NoNetwork,

    /// Name resolution produced no addresses
    #[error("lookup {host} on {server}: no such host")]
    NoSuchHost { host: String, server: String },

    /// A query returned no usable A records
    #[error("no A record")]
    NoARecord,

    /// A query returned no usable AAAA records
    #[error("no AAAA record")]
    NoAAAARecord,

    /// DNS query/response error
    #[error("DNS error: {0}")]
    Dns(String),

    /// SOCKS5 protocol error
    #[error("SOCKS5 error: {0}")]
    Socks5(String),

    /// SOCKS5 command other than CONNECT or UDP ASSOCIATE
    #[error("command not supported: 0x{0:02x}")]
    UnsupportedCommand(u8),

    /// Authentication error
    #[error("authentication error: {0}")]
    Auth(String),

    /// HTTP proxy error
    #[error("HTTP error: {0}")]
    Http(String),

    /// Tunnel transport error
    #[error("tunnel error: {0}")]
    Tunnel(String),
}

impl Error {
    /// Check if the caller gave up on the operation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled(_))
    }

    /// Check if a local bind failed because the port is taken
    pub fn is_addr_in_use(&self) -> bool {
        matches!(self, Error::Io(e) if e.kind() == std::io::ErrorKind::AddrInUse)
    }

    /// Check if this is a policy rejection by the address filter
    pub fn is_invalid_address(&self) -> bool {
        matches!(self, Error::InvalidAddress(_))
    }

    /// Check if resolution failed because the name has no records
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::NoSuchHost { .. } | Error::NoARecord | Error::NoAAAARecord
        )
    }

    /// Check if this is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::Config(_) | Error::ConfigParse(_))
    }
}
