//! Egress Server Metadata
//!
//! The server records returned by the backend and cached on disk.
//! Field names follow the backend's JSON so a cached list round-trips
//! byte-compatible with a fetched one.

use crate::keys::PublicKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Location attributes advertised by a server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerAttributes {
    pub city: String,
    pub country: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    /// Seconds east of GMT (negative west of GMT)
    pub timezone_offset: i32,
}

/// Public server info, safe to hand to UI and status reporting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    /// Unique server name (e.g. `egress.usw.1`)
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal_ip: Option<String>,
    /// Server public key (base64)
    pub public_key: String,
    #[serde(default)]
    pub hostnames: Vec<String>,
    #[serde(default)]
    pub ips: Vec<String>,
    #[serde(default = "default_port")]
    pub port: u16,
    pub attributes: ServerAttributes,
}

fn default_port() -> u16 {
    443
}

impl ServerInfo {
    /// Advertised addresses in `host:port` form, IPs first
    pub fn server_addresses(&self) -> Vec<String> {
        self.ips
            .iter()
            .map(|ip| match ip.parse::<IpAddr>() {
                Ok(IpAddr::V6(v6)) => format!("[{}]:{}", v6, self.port),
                _ => format!("{}:{}", ip, self.port),
            })
            .chain(self.hostnames.iter().map(|host| format!("{}:{}", host, self.port)))
            .collect()
    }

    /// Human readable location (e.g. "Los Angeles, US")
    pub fn server_location(&self) -> String {
        match &self.attributes.state {
            Some(state) if !state.is_empty() => format!(
                "{}, {}, {}",
                self.attributes.city, state, self.attributes.country
            ),
            _ => format!("{}, {}", self.attributes.city, self.attributes.country),
        }
    }
}

/// A server record as returned by the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Server {
    /// Public keys registered with this server (base64)
    #[serde(default)]
    pub registered_public_keys: Vec<String>,
    /// Addresses assigned to the device on this server, `None` until registered
    #[serde(default, rename = "allowedIPs", skip_serializing_if = "Option::is_none")]
    pub allowed_ips: Option<Vec<String>>,
    #[serde(rename = "server")]
    pub info: ServerInfo,
    /// When the registration of the current public key lapses
    #[serde(default, rename = "expiresAt", skip_serializing_if = "Option::is_none")]
    pub expiration_date: Option<DateTime<Utc>>,
}

impl Server {
    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn timezone_offset(&self) -> i32 {
        self.info.attributes.timezone_offset
    }

    /// Whether this server already lists `public_key` as registered
    pub fn is_registered(&self, public_key: &PublicKey) -> bool {
        let encoded = public_key.to_base64();
        self.registered_public_keys.iter().any(|k| *k == encoded)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::PrivateKey;

    const SERVER_JSON: &str = r#"{
        "registeredPublicKeys": ["R/BMR6Rr5rzvp7vSIWdAtgAmOLK9m7CqTcDynblM3Us="],
        "allowedIPs": ["10.64.169.158/32"],
        "server": {
            "name": "egress.usw.1",
            "internalIp": "10.64.0.1",
            "publicKey": "R/BMR6Rr5rzvp7vSIWdAtgAmOLK9m7CqTcDynblM3Us=",
            "hostnames": [],
            "ips": ["162.245.204.100"],
            "port": 443,
            "attributes": {
                "city": "Los Angeles",
                "country": "us",
                "state": "ca",
                "timezoneOffset": -28800
            }
        },
        "expiresAt": "2023-04-12T17:09:46Z"
    }"#;

    #[test]
    fn test_decode_backend_record() {
        let server: Server = serde_json::from_str(SERVER_JSON).unwrap();

        assert_eq!(server.name(), "egress.usw.1");
        assert_eq!(server.timezone_offset(), -28800);
        assert_eq!(server.allowed_ips.as_deref(), Some(&["10.64.169.158/32".to_string()][..]));
        assert!(server.expiration_date.is_some());
        assert_eq!(server.info.server_location(), "Los Angeles, ca, us");
    }

    #[test]
    fn test_unregistered_record_has_no_allowed_ips() {
        let server = test_support::server("egress.use.1", -18000);
        let json = serde_json::to_string(&server).unwrap();

        assert!(!json.contains("allowedIPs"));
        assert_eq!(serde_json::from_str::<Server>(&json).unwrap(), server);
    }

    #[test]
    fn test_server_addresses() {
        let mut server = test_support::server("egress.euw.1", 3600);
        server.info.ips.push("2001:db8::1".to_string());

        assert_eq!(
            server.info.server_addresses(),
            vec![
                format!("{}:443", test_support::server_ip("egress.euw.1")),
                "[2001:db8::1]:443".to_string(),
                "egress.euw.1.example.net:443".to_string(),
            ]
        );
    }

    #[test]
    fn test_is_registered() {
        let key = PrivateKey::generate().public_key();
        let mut server = test_support::server("egress.usw.2", -28800);
        assert!(!server.is_registered(&key));

        server.registered_public_keys.push(key.to_base64());
        assert!(server.is_registered(&key));
    }
}
