//! Networks excluded from tunnel routing

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use ipnet::IpNet;

/// Ordered, immutable list of destination networks that bypass the tunnel
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BypassList {
    networks: Vec<IpNet>,
}

impl BypassList {
    /// Build a list from already-parsed networks
    pub fn new(networks: Vec<IpNet>) -> Self {
        Self {
            networks: networks.into_iter().map(|net| net.trunc()).collect(),
        }
    }

    /// Parse a comma-separated list of CIDRs and bare IP addresses
    ///
    /// Bare addresses become /32 or /128 networks. Tokens that are neither are
    /// skipped with a warning.
    pub fn parse(list: &str) -> Self {
        let mut networks = Vec::new();

        for token in list.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            if let Ok(net) = IpNet::from_str(token) {
                networks.push(net.trunc());
                continue;
            }

            match IpAddr::from_str(token) {
                Ok(ip) => networks.push(IpNet::from(ip)),
                Err(_) => log::warn!("bypass: ignoring invalid entry '{}'", token),
            }
        }

        Self { networks }
    }

    /// First network containing `ip`, if any
    pub fn matching(&self, ip: IpAddr) -> Option<&IpNet> {
        let ip = ip.to_canonical();
        self.networks.iter().find(|net| net.contains(&ip))
    }

    /// Whether `ip` should be dialed directly
    pub fn contains(&self, ip: IpAddr) -> bool {
        self.matching(ip).is_some()
    }

    /// The configured networks, in order
    pub fn networks(&self) -> &[IpNet] {
        &self.networks
    }

    pub fn len(&self) -> usize {
        self.networks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }
}

impl fmt::Display for BypassList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let list: Vec<String> = self.networks.iter().map(|n| n.to_string()).collect();
        write!(f, "{}", list.join(","))
    }
}

impl FromStr for BypassList {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_cidr_and_bare_addresses() {
        let list = BypassList::parse("192.168.0.0/16, 10.1.2.3,2001:db8::/32,fe80::1");
        assert_eq!(
            list.to_string(),
            "192.168.0.0/16,10.1.2.3/32,2001:db8::/32,fe80::1/128"
        );
    }

    #[test]
    fn test_parse_normalizes_host_bits() {
        let list = BypassList::parse("192.168.1.77/24");
        assert_eq!(list.networks()[0].to_string(), "192.168.1.0/24");
    }

    #[test]
    fn test_parse_skips_garbage() {
        let list = BypassList::parse("nope,,300.1.1.1, 172.16.0.0/12 ,example.com");
        assert_eq!(list.len(), 1);
        assert!(list.contains(ip("172.20.1.1")));
    }

    #[test]
    fn test_empty_list_matches_nothing() {
        let list = BypassList::parse("");
        assert!(list.is_empty());
        assert!(!list.contains(ip("0.0.0.0")));
        assert!(!list.contains(ip("8.8.8.8")));
    }

    #[test]
    fn test_first_match_wins() {
        let list = BypassList::parse("10.0.0.0/8,10.1.0.0/16");
        assert_eq!(
            list.matching(ip("10.1.2.3")).unwrap().to_string(),
            "10.0.0.0/8"
        );
    }

    #[test]
    fn test_mapped_ipv4_matches_ipv4_network() {
        let list = BypassList::parse("192.0.2.0/24");
        assert!(list.contains(ip("::ffff:192.0.2.10")));
        assert!(!list.contains(ip("2001:db8::1")));
    }
}
