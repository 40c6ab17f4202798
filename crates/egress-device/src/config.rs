//! Tunnel Configuration
//!
//! Interface and peer settings for a WireGuard tunnel, the parsers that
//! turn server metadata into them, and the device manager's own settings.

use crate::keys::{PrivateKey, PublicKey};
use crate::selection::DeviceTimezone;
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// Host part of an endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EndpointHost {
    Ip(IpAddr),
    Name(String),
}

impl fmt::Display for EndpointHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointHost::Ip(IpAddr::V6(v6)) => write!(f, "[{}]", v6),
            EndpointHost::Ip(IpAddr::V4(v4)) => write!(f, "{}", v4),
            EndpointHost::Name(name) => write!(f, "{}", name),
        }
    }
}

/// Network endpoint (host + UDP port)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: EndpointHost,
    pub port: u16,
}

impl Endpoint {
    /// Create from an IP address
    pub fn ip(addr: IpAddr, port: u16) -> Self {
        Self {
            host: EndpointHost::Ip(addr),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = ParseError;

    /// Parse `host:port`, `a.b.c.d:port` or `[v6]:port`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseError::InvalidEndpoint(s.to_string());

        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let (v6, port) = rest.split_once("]:").ok_or_else(invalid)?;
            let addr: Ipv6Addr = v6.parse().map_err(|_| invalid())?;
            (EndpointHost::Ip(IpAddr::V6(addr)), port)
        } else {
            let (host, port) = s.rsplit_once(':').ok_or_else(invalid)?;
            if host.contains(':') {
                // Bare IPv6 without brackets is ambiguous
                return Err(invalid());
            }
            let host = match host.parse::<Ipv4Addr>() {
                Ok(v4) => EndpointHost::Ip(IpAddr::V4(v4)),
                Err(_) if is_valid_hostname(host) => EndpointHost::Name(host.to_string()),
                Err(_) => return Err(invalid()),
            };
            (host, port)
        };

        let port: u16 = port.parse().map_err(|_| invalid())?;
        Ok(Self { host, port })
    }
}

fn is_valid_hostname(host: &str) -> bool {
    !host.is_empty()
        && host.len() <= 253
        && host.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
}

/// Parse an address range (`10.0.0.2/32`); a bare address is a host route
pub fn parse_address_range(s: &str) -> Result<IpNetwork, ParseError> {
    let s = s.trim();
    if s.contains('/') {
        s.parse::<IpNetwork>()
            .map_err(|_| ParseError::InvalidAddressRange(s.to_string()))
    } else {
        s.parse::<IpAddr>()
            .map(IpNetwork::from)
            .map_err(|_| ParseError::InvalidAddressRange(s.to_string()))
    }
}

/// Routes matching all IPv4 and IPv6 traffic
pub fn full_tunnel_ranges() -> Vec<IpNetwork> {
    [IpAddr::V4(Ipv4Addr::UNSPECIFIED), IpAddr::V6(Ipv6Addr::UNSPECIFIED)]
        .into_iter()
        .filter_map(|addr| IpNetwork::new(addr, 0).ok())
        .collect()
}

/// WireGuard peer configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfiguration {
    /// Peer's public key
    pub public_key: PublicKey,
    /// Peer's endpoint
    pub endpoint: Endpoint,
    /// What traffic to route through this peer
    pub allowed_ips: Vec<IpNetwork>,
    /// Persistent keepalive interval (seconds)
    pub persistent_keepalive: Option<u16>,
}

impl PeerConfiguration {
    /// Full-tunnel peer: all traffic goes through `endpoint`
    pub fn new(public_key: PublicKey, endpoint: Endpoint) -> Self {
        Self {
            public_key,
            endpoint,
            allowed_ips: full_tunnel_ranges(),
            persistent_keepalive: None,
        }
    }
}

/// Local side of the tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceConfiguration {
    pub private_key: PrivateKey,
    pub listen_port: u16,
    pub dns: Vec<IpAddr>,
    pub addresses: Vec<IpNetwork>,
}

/// Everything a tunnel provider needs to bring the interface up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelConfiguration {
    pub name: String,
    pub interface: InterfaceConfiguration,
    pub peers: Vec<PeerConfiguration>,
}

impl TunnelConfiguration {
    /// Render in `wg-quick` format
    pub fn to_wg_quick(&self) -> String {
        let mut out = String::new();

        out.push_str("[Interface]\n");
        out.push_str(&format!("PrivateKey = {}\n", self.interface.private_key.to_base64()));
        out.push_str(&format!("ListenPort = {}\n", self.interface.listen_port));
        if !self.interface.addresses.is_empty() {
            out.push_str(&format!("Address = {}\n", join(&self.interface.addresses)));
        }
        if !self.interface.dns.is_empty() {
            out.push_str(&format!("DNS = {}\n", join(&self.interface.dns)));
        }

        for peer in &self.peers {
            out.push_str("\n[Peer]\n");
            out.push_str(&format!("PublicKey = {}\n", peer.public_key));
            out.push_str(&format!("AllowedIPs = {}\n", join(&peer.allowed_ips)));
            out.push_str(&format!("Endpoint = {}\n", peer.endpoint));
            if let Some(keepalive) = peer.persistent_keepalive {
                out.push_str(&format!("PersistentKeepalive = {}\n", keepalive));
            }
        }

        out
    }
}

fn join<T: fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Device manager settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceManagerConfig {
    /// Name given to generated tunnel configurations
    pub tunnel_name: String,
    /// Interface listen port
    pub listen_port: u16,
    /// DNS server pushed into the tunnel
    pub dns: IpAddr,
    /// Peer keepalive in seconds (none by default)
    pub persistent_keepalive: Option<u16>,
    /// Device GMT offset in seconds; the host timezone when unset
    pub timezone_offset: Option<i32>,
    /// Trip a panic when the backend omits the selected server after registration
    pub assert_on_inconsistency: bool,
}

impl Default for DeviceManagerConfig {
    fn default() -> Self {
        Self {
            tunnel_name: "Egress".to_string(),
            listen_port: 51821,
            dns: IpAddr::V4(Ipv4Addr::new(10, 11, 12, 1)),
            persistent_keepalive: None,
            timezone_offset: None,
            assert_on_inconsistency: cfg!(debug_assertions),
        }
    }
}

impl DeviceManagerConfig {
    /// Load from TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn device_timezone(&self) -> DeviceTimezone {
        self.timezone_offset
            .map(DeviceTimezone::Fixed)
            .unwrap_or(DeviceTimezone::System)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen_port == 0 {
            return Err(ConfigError::InvalidPort);
        }
        if let Some(offset) = self.timezone_offset {
            // UTC-12 .. UTC+14
            if !(-12 * 3600..=14 * 3600).contains(&offset) {
                return Err(ConfigError::InvalidTimezoneOffset(offset));
            }
        }
        Ok(())
    }
}

/// Parsing errors for tunnel metadata
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Invalid address range: {0}")]
    InvalidAddressRange(String),
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid listen port")]
    InvalidPort,

    #[error("Timezone offset out of range: {0}")]
    InvalidTimezoneOffset(i32),

    #[error("Parse error: {0}")]
    Parse(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_ipv4() {
        let ep: Endpoint = "162.245.204.100:443".parse().unwrap();
        assert_eq!(ep, Endpoint::ip(IpAddr::V4(Ipv4Addr::new(162, 245, 204, 100)), 443));
        assert_eq!(ep.to_string(), "162.245.204.100:443");
    }

    #[test]
    fn test_endpoint_ipv6() {
        let ep: Endpoint = "[2001:db8::1]:51820".parse().unwrap();
        assert_eq!(ep.port, 51820);
        assert_eq!(ep.to_string(), "[2001:db8::1]:51820");
    }

    #[test]
    fn test_endpoint_hostname() {
        let ep: Endpoint = "egress.usw.1.example.net:443".parse().unwrap();
        assert_eq!(ep.host, EndpointHost::Name("egress.usw.1.example.net".to_string()));
    }

    #[test]
    fn test_invalid_endpoints() {
        for input in ["", "no-port", "host:", "host:99999", "2001:db8::1:443", "bad host:1", "[::1]443"] {
            assert!(input.parse::<Endpoint>().is_err(), "{input} should not parse");
        }
    }

    #[test]
    fn test_address_range() {
        assert_eq!(parse_address_range("10.64.169.158/32").unwrap().prefix(), 32);
        assert_eq!(parse_address_range("10.64.169.158").unwrap().prefix(), 32);
        assert_eq!(parse_address_range("fd00::2").unwrap().prefix(), 128);
        assert!(parse_address_range("10.0.0.1/33").is_err());
        assert!(parse_address_range("nonsense").is_err());
    }

    #[test]
    fn test_full_tunnel_ranges() {
        let rendered: Vec<String> = full_tunnel_ranges().iter().map(ToString::to_string).collect();
        assert_eq!(rendered, vec!["0.0.0.0/0", "::/0"]);
    }

    #[test]
    fn test_wg_quick_rendering() {
        let private_key = PrivateKey::generate();
        let peer_key = PrivateKey::generate().public_key();
        let mut peer = PeerConfiguration::new(peer_key.clone(), "10.0.0.1:443".parse().unwrap());
        peer.persistent_keepalive = Some(25);

        let config = TunnelConfiguration {
            name: "Egress".to_string(),
            interface: InterfaceConfiguration {
                private_key: private_key.clone(),
                listen_port: 51821,
                dns: vec![IpAddr::V4(Ipv4Addr::new(10, 11, 12, 1))],
                addresses: vec![parse_address_range("10.64.0.2/32").unwrap()],
            },
            peers: vec![peer],
        };

        let expected = format!(
            "[Interface]\nPrivateKey = {}\nListenPort = 51821\nAddress = 10.64.0.2/32\nDNS = 10.11.12.1\n\n\
             [Peer]\nPublicKey = {}\nAllowedIPs = 0.0.0.0/0, ::/0\nEndpoint = 10.0.0.1:443\nPersistentKeepalive = 25\n",
            private_key.to_base64(),
            peer_key.to_base64()
        );
        assert_eq!(config.to_wg_quick(), expected);
    }

    #[test]
    fn test_config_default() {
        let config = DeviceManagerConfig::default();

        assert_eq!(config.listen_port, 51821);
        assert_eq!(config.dns.to_string(), "10.11.12.1");
        assert!(config.validate().is_ok());
        assert_eq!(config.device_timezone(), DeviceTimezone::System);
    }

    #[test]
    fn test_config_from_toml() {
        let config = DeviceManagerConfig::from_toml(
            "listen_port = 51900\ndns = \"1.1.1.1\"\ntimezone_offset = -18000\n",
        )
        .unwrap();

        assert_eq!(config.listen_port, 51900);
        assert_eq!(config.dns, IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)));
        assert_ne!(config.dns, DeviceManagerConfig::default().dns);
        assert_eq!(config.tunnel_name, "Egress");
        assert_eq!(config.device_timezone(), DeviceTimezone::Fixed(-18000));
    }

    #[test]
    fn test_config_rejects_bad_values() {
        assert_eq!(
            DeviceManagerConfig::from_toml("listen_port = 0").unwrap_err(),
            ConfigError::InvalidPort
        );
        assert!(matches!(
            DeviceManagerConfig::from_toml("timezone_offset = 90000"),
            Err(ConfigError::InvalidTimezoneOffset(90000))
        ));
        assert!(matches!(
            DeviceManagerConfig::from_toml("listen_port = \"x\""),
            Err(ConfigError::Parse(_))
        ));
    }
}
