//! Configuration types for the proxy engine

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::path::Path;

use crate::auth::Credentials;
use crate::bypass::BypassList;
use crate::error::{Error, Result};

/// Listen value that turns a server off
pub const DISABLED_LISTEN: &str = "0";

/// Main configuration structure
///
/// # Example Configuration
///
/// ```toml
/// log_level = "info"
/// bypass = "192.168.0.0/16,10.1.2.3"
///
/// [tunnel]
/// dns = ["10.64.0.1"]
///
/// [http]
/// listen = ":8080"
///
/// [socks5]
/// listen = ":1080"
/// username = "user"
/// password = "secret"
///
/// [resolver]
/// mode = "dns"
/// local = false
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Log level: "error", "warn", "info", "debug", "trace"
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Comma-separated CIDRs and addresses dialed outside the tunnel
    #[serde(default)]
    pub bypass: String,

    #[serde(default)]
    pub tunnel: TunnelConfig,

    #[serde(default)]
    pub http: HttpConfig,

    #[serde(default)]
    pub socks5: Socks5Config,

    #[serde(default)]
    pub resolver: ResolverConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            bypass: String::new(),
            tunnel: TunnelConfig::default(),
            http: HttpConfig::default(),
            socks5: Socks5Config::default(),
            resolver: ResolverConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file, apply overrides, then validate the result
    pub fn load_with_overrides<P: AsRef<Path>>(path: P, overrides: &Overrides) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.apply(overrides);
        config.validate()?;
        Ok(config)
    }

    /// Apply environment or command-line overrides on top of the file
    pub fn apply(&mut self, overrides: &Overrides) {
        if let Some(ref listen) = overrides.http_addr {
            self.http.enabled = true;
            self.http.listen = listen.clone();
        }
        if let Some(ref username) = overrides.http_user {
            self.http.username = username.clone();
        }
        if let Some(ref password) = overrides.http_pass {
            self.http.password = password.clone();
        }
        if let Some(ref listen) = overrides.socks5_addr {
            self.socks5.enabled = true;
            self.socks5.listen = listen.clone();
        }
        if let Some(ref username) = overrides.socks5_user {
            self.socks5.username = username.clone();
        }
        if let Some(ref password) = overrides.socks5_pass {
            self.socks5.password = password.clone();
        }
        if let Some(ref bypass) = overrides.bypass {
            self.bypass = bypass.clone();
        }
        if let Some(local) = overrides.local_dns {
            self.resolver.local = local;
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let http = self.http.listen_addr()?;
        let socks5 = self.socks5.listen_addr()?;

        if http.is_none() && socks5.is_none() {
            return Err(Error::Config(
                "at least one of the HTTP and SOCKS5 servers must be enabled".into(),
            ));
        }

        self.socks5.credentials()?;

        if self.resolver.cache_size == 0 {
            return Err(Error::Config("resolver cache_size must be positive".into()));
        }

        if self.resolver.mode == ResolverMode::Dns
            && self.resolver.server.is_none()
            && self.tunnel.dns.is_empty()
        {
            return Err(Error::Config(
                "DNS resolver needs tunnel.dns or resolver.server".into(),
            ));
        }

        Ok(())
    }

    /// Parsed bypass list
    pub fn bypass_list(&self) -> BypassList {
        BypassList::parse(&self.bypass)
    }

    /// Generate a sample configuration
    pub fn sample() -> String {
        r#"# WireTunnel Configuration

# Log level: "error", "warn", "info", "debug", "trace"
# RUST_LOG takes precedence when set.
log_level = "info"

# Destinations dialed over the host network instead of the tunnel.
# Comma-separated CIDRs and bare addresses.
# bypass = "192.168.0.0/16,10.1.2.3"

[tunnel]
# DNS servers the tunnel advertises. The first one is used by the
# caching resolver unless resolver.server is set.
dns = ["10.64.0.1"]

[http]
enabled = true
# "host:port", ":port" for all interfaces, or "0" to disable
listen = ":8080"
# Basic authentication. A username alone enables it.
username = ""
password = ""

[socks5]
enabled = true
listen = ":1080"
# Username/password authentication. Both must be set.
username = ""
password = ""

[resolver]
# "dns": built-in caching resolver that queries over the tunnel
# "tunnel": hand names to the tunnel unresolved
mode = "dns"

# Send DNS queries over the host network instead of the tunnel
local = false

# Override the DNS server (port defaults to 53 when omitted)
# server = "10.64.0.1:53"

# Maximum number of cached names
cache_size = 4096
"#
        .to_string()
    }
}

/// Tunnel settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// DNS servers advertised by the tunnel
    #[serde(default)]
    pub dns: Vec<IpAddr>,
}

/// HTTP proxy settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub enabled: bool,
    pub listen: String,
    pub username: String,
    pub password: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: ":8080".into(),
            username: String::new(),
            password: String::new(),
        }
    }
}

impl HttpConfig {
    /// Bind address, or `None` when the server is disabled
    pub fn listen_addr(&self) -> Result<Option<SocketAddr>> {
        if !self.enabled {
            return Ok(None);
        }
        parse_listen(&self.listen)
    }

    pub fn credentials(&self) -> Option<Credentials> {
        Credentials::for_http(&self.username, &self.password)
    }
}

/// SOCKS5 proxy settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Socks5Config {
    pub enabled: bool,
    pub listen: String,
    pub username: String,
    pub password: String,
}

impl Default for Socks5Config {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: ":1080".into(),
            username: String::new(),
            password: String::new(),
        }
    }
}

impl Socks5Config {
    /// Bind address, or `None` when the server is disabled
    pub fn listen_addr(&self) -> Result<Option<SocketAddr>> {
        if !self.enabled {
            return Ok(None);
        }
        parse_listen(&self.listen)
    }

    pub fn credentials(&self) -> Result<Option<Credentials>> {
        Credentials::for_socks5(&self.username, &self.password)
    }
}

/// How hostnames are turned into addresses
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolverMode {
    /// Built-in caching resolver
    #[default]
    Dns,
    /// The tunnel's native resolution
    Tunnel,
}

/// Resolver settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    pub mode: ResolverMode,

    /// Carry DNS queries over the host network
    pub local: bool,

    /// Explicit DNS server, port 53 when omitted
    #[serde(deserialize_with = "deserialize_server", serialize_with = "serialize_server")]
    pub server: Option<SocketAddr>,

    pub cache_size: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            mode: ResolverMode::Dns,
            local: false,
            server: None,
            cache_size: crate::dns::DEFAULT_MAX_ENTRIES,
        }
    }
}

/// Overrides collected from the environment or the command line
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub http_addr: Option<String>,
    pub http_user: Option<String>,
    pub http_pass: Option<String>,
    pub socks5_addr: Option<String>,
    pub socks5_user: Option<String>,
    pub socks5_pass: Option<String>,
    pub bypass: Option<String>,
    pub local_dns: Option<bool>,
}

/// Parse a listen address
///
/// `"0"` disables the server and `":port"` binds every IPv4 interface.
/// Hostnames are resolved and the first address is used.
pub fn parse_listen(listen: &str) -> Result<Option<SocketAddr>> {
    let listen = listen.trim();
    if listen == DISABLED_LISTEN {
        return Ok(None);
    }

    let normalized = match listen.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{}", port),
        None => listen.to_string(),
    };

    if let Ok(addr) = normalized.parse::<SocketAddr>() {
        return Ok(Some(addr));
    }

    match normalized.to_socket_addrs() {
        Ok(mut addrs) => addrs
            .next()
            .map(Some)
            .ok_or_else(|| Error::Config(format!("listen address '{}' resolved to nothing", listen))),
        Err(e) => Err(Error::Config(format!("invalid listen address '{}': {}", listen, e))),
    }
}

/// Parse a DNS server given as `ip` or `ip:port`
pub fn parse_server(server: &str) -> Result<SocketAddr> {
    if let Ok(addr) = server.parse::<SocketAddr>() {
        return Ok(addr);
    }
    server
        .trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, crate::dns::DNS_PORT))
        .map_err(|_| Error::Config(format!("invalid DNS server '{}'", server)))
}

fn deserialize_server<'de, D>(deserializer: D) -> std::result::Result<Option<SocketAddr>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value: Option<String> = Option::deserialize(deserializer)?;
    match value {
        Some(s) if !s.trim().is_empty() => parse_server(s.trim())
            .map(Some)
            .map_err(serde::de::Error::custom),
        _ => Ok(None),
    }
}

fn serialize_server<S>(server: &Option<SocketAddr>, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    match server {
        Some(addr) => serializer.serialize_some(&addr.to_string()),
        None => serializer.serialize_none(),
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
