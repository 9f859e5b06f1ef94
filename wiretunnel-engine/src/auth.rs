//! Client credentials for the proxy servers

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::error::{Error, Result};

/// Username and password clients must present
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Credentials for the HTTP proxy: required whenever a username is set
    pub fn for_http(username: &str, password: &str) -> Option<Self> {
        if username.is_empty() {
            return None;
        }
        Some(Self::new(username, password))
    }

    /// Credentials for the SOCKS5 server
    ///
    /// A username without a password is a configuration error.
    pub fn for_socks5(username: &str, password: &str) -> Result<Option<Self>> {
        match (username.is_empty(), password.is_empty()) {
            (true, _) => Ok(None),
            (false, true) => Err(Error::Config(
                "SOCKS5 username is set but password is empty".into(),
            )),
            (false, false) => Ok(Some(Self::new(username, password))),
        }
    }

    /// Check a `Proxy-Authorization` header value against these credentials
    ///
    /// Only the `Basic` scheme is accepted; the decoded payload is split at the
    /// first `:`.
    pub fn matches_basic(&self, header: &str) -> bool {
        let Some(encoded) = header.strip_prefix("Basic ") else {
            return false;
        };
        let Ok(decoded) = STANDARD.decode(encoded.trim()) else {
            return false;
        };
        let Ok(decoded) = String::from_utf8(decoded) else {
            return false;
        };

        match decoded.split_once(':') {
            Some((user, pass)) => user == self.username && pass == self.password,
            None => false,
        }
    }

    /// `Basic` header value for these credentials
    pub fn basic_header(&self) -> String {
        let raw = format!("{}:{}", self.username, self.password);
        format!("Basic {}", STANDARD.encode(raw))
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}
