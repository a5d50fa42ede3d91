//! NO_PROXY bypass rules
//!
//! Entries are comma separated and may be:
//! - an IP address (`10.0.0.5`, `::1`)
//! - a CIDR network (`10.0.0.0/8`)
//! - a domain zone (`*.corp.example` or `.corp.example`), matching the
//!   domain itself and everything below it
//! - an exact host name (`localhost`)

use super::{Dial, DialError, Dialer, DirectDialer, Network};
use async_trait::async_trait;
use ipnet::IpNet;
use std::fmt;
use std::net::IpAddr;
use tokio::net::TcpStream;
use tracing::debug;

/// Environment variables listing hosts that skip the proxy, in order
pub const NO_PROXY_ENV_VARS: [&str; 2] = ["NO_PROXY", "no_proxy"];

static DIRECT: Dialer = Dialer::Direct(DirectDialer);

/// Parsed NO_PROXY list
#[derive(Debug, Clone, Default)]
pub struct BypassList {
    raw: String,
    networks: Vec<IpNet>,
    ips: Vec<IpAddr>,
    /// Stored with a leading dot
    zones: Vec<String>,
    hosts: Vec<String>,
}

impl BypassList {
    pub fn parse(list: &str) -> Self {
        let mut bypass = Self {
            raw: list.trim().to_string(),
            ..Default::default()
        };

        for entry in list.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            if entry.contains('/') {
                match entry.parse::<IpNet>() {
                    Ok(net) => bypass.networks.push(net),
                    Err(e) => debug!("Skipping NO_PROXY entry {}: {}", entry, e),
                }
                continue;
            }
            if let Ok(ip) = entry.trim_matches(|c| c == '[' || c == ']').parse::<IpAddr>() {
                bypass.ips.push(ip);
                continue;
            }

            let entry = entry.trim_end_matches('.').to_ascii_lowercase();
            if let Some(zone) = entry.strip_prefix("*.") {
                bypass.zones.push(format!(".{}", zone));
            } else if entry.starts_with('.') {
                bypass.zones.push(entry);
            } else {
                bypass.hosts.push(entry);
            }
        }

        bypass
    }

    pub fn is_empty(&self) -> bool {
        self.networks.is_empty() && self.ips.is_empty() && self.zones.is_empty() && self.hosts.is_empty()
    }

    /// True if `host` (no port) should be dialed directly
    pub fn matches(&self, host: &str) -> bool {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return self.ips.contains(&ip) || self.networks.iter().any(|net| net.contains(&ip));
        }

        let host = host.trim_end_matches('.').to_ascii_lowercase();
        self.zones
            .iter()
            .any(|zone| host.ends_with(zone.as_str()) || host == zone[1..])
            || self.hosts.iter().any(|h| *h == host)
    }
}

impl fmt::Display for BypassList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Host part of `host:port`, without IPv6 brackets
fn host_of(addr: &str) -> &str {
    let host = match addr.rsplit_once(':') {
        Some((host, port)) if !port.contains(']') => host,
        _ => addr,
    };
    host.trim_start_matches('[').trim_end_matches(']')
}

/// Proxy dialer that skips the proxy for hosts on a bypass list
#[derive(Debug, Clone)]
pub struct PerHostDialer {
    proxy: Box<Dialer>,
    bypass: BypassList,
}

impl PerHostDialer {
    pub fn new(proxy: Dialer, bypass: BypassList) -> Self {
        Self {
            proxy: Box::new(proxy),
            bypass,
        }
    }

    pub fn proxy(&self) -> &Dialer {
        &self.proxy
    }

    pub fn bypass(&self) -> &BypassList {
        &self.bypass
    }

    /// Dialer used for `addr`
    pub fn route(&self, addr: &str) -> &Dialer {
        if self.bypass.matches(host_of(addr)) {
            &DIRECT
        } else {
            &self.proxy
        }
    }
}

#[async_trait]
impl Dial for PerHostDialer {
    async fn dial(&self, network: Network, addr: &str) -> Result<TcpStream, DialError> {
        let dialer = self.route(addr);
        if matches!(dialer, Dialer::Direct(_)) {
            debug!("{} is listed in NO_PROXY, dialing directly", addr);
        }
        dialer.dial(network, addr).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::{ConnectOptions, HttpConnectDialer};

    #[test]
    fn test_host_of() {
        assert_eq!(host_of("example.com:80"), "example.com");
        assert_eq!(host_of("10.0.0.5:22"), "10.0.0.5");
        assert_eq!(host_of("[::1]:8080"), "::1");
        assert_eq!(host_of("localhost"), "localhost");
    }

    #[test]
    fn test_exact_hosts_and_ips() {
        let bypass = BypassList::parse("10.0.0.5, localhost,,::1, [fe80::1]");
        assert!(!bypass.is_empty());

        assert!(bypass.matches("10.0.0.5"));
        assert!(bypass.matches("localhost"));
        assert!(bypass.matches("LOCALHOST."));
        assert!(bypass.matches("::1"));
        assert!(bypass.matches("fe80::1"));

        assert!(!bypass.matches("10.0.0.6"));
        assert!(!bypass.matches("notlocalhost"));
        assert!(!bypass.matches("sub.localhost"));
    }

    #[test]
    fn test_cidr_networks() {
        let bypass = BypassList::parse("192.168.0.0/16,fd00::/8,300.0.0.0/8");

        assert!(bypass.matches("192.168.44.2"));
        assert!(bypass.matches("fd12::7"));
        assert!(!bypass.matches("192.169.0.1"));
        assert!(!bypass.matches("fe80::1"));
    }

    #[test]
    fn test_domain_zones() {
        let bypass = BypassList::parse("*.corp.example,.internal");

        assert!(bypass.matches("git.corp.example"));
        assert!(bypass.matches("a.b.corp.example"));
        assert!(bypass.matches("corp.example"));
        assert!(bypass.matches("db.internal"));
        assert!(bypass.matches("internal"));

        assert!(!bypass.matches("evilcorp.example"));
        assert!(!bypass.matches("corp.example.com"));
    }

    #[test]
    fn test_empty_list_matches_nothing() {
        let bypass = BypassList::parse(" , ");
        assert!(bypass.is_empty());
        assert!(!bypass.matches("localhost"));
    }

    #[test]
    fn test_route_picks_direct_for_listed_hosts() {
        let proxy = Dialer::HttpConnect(HttpConnectDialer::new(
            "10.9.9.9:3128",
            Dialer::direct(),
            ConnectOptions::default(),
        ));
        let dialer = PerHostDialer::new(proxy, BypassList::parse("10.0.0.5"));

        assert!(matches!(dialer.route("10.0.0.5:22"), Dialer::Direct(_)));
        assert!(matches!(dialer.route("10.0.0.6:22"), Dialer::HttpConnect(_)));
    }
}
