//! Tunnel configuration builder
//!
//! Turns a registered server and the device private key into a
//! [`TunnelConfiguration`]. The tunnel is always full-route: the peer's
//! allowed IPs are the catch-all ranges whatever the server advertises.

use crate::config::{
    DeviceManagerConfig, Endpoint, InterfaceConfiguration, PeerConfiguration,
    TunnelConfiguration, parse_address_range,
};
use crate::error::NetworkProtectionError;
use crate::keys::{PrivateKey, PublicKey};
use crate::server::Server;
use std::net::IpAddr;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct TunnelConfigurationBuilder {
    name: String,
    listen_port: u16,
    dns: IpAddr,
    persistent_keepalive: Option<u16>,
}

impl TunnelConfigurationBuilder {
    pub fn new(config: &DeviceManagerConfig) -> Self {
        Self {
            name: config.tunnel_name.clone(),
            listen_port: config.listen_port,
            dns: config.dns,
            persistent_keepalive: config.persistent_keepalive,
        }
    }

    pub fn build(
        &self,
        private_key: &PrivateKey,
        server: &Server,
    ) -> Result<TunnelConfiguration, NetworkProtectionError> {
        let allowed_ips = server
            .allowed_ips
            .as_ref()
            .ok_or(NetworkProtectionError::NoServerRegistrationInfo)?;

        let public_key = PublicKey::from_base64(&server.info.public_key)
            .map_err(|_| NetworkProtectionError::CouldNotGetPeerPublicKey)?;

        let endpoint: Endpoint = server
            .info
            .server_addresses()
            .first()
            .and_then(|address| address.parse().ok())
            .ok_or(NetworkProtectionError::CouldNotGetPeerHostName)?;

        let address_range = allowed_ips
            .first()
            .and_then(|range| parse_address_range(range).ok())
            .ok_or(NetworkProtectionError::CouldNotGetInterfaceAddressRange)?;

        debug!(
            "Building tunnel configuration for {} ({}, address {})",
            server.name(),
            endpoint,
            address_range
        );

        let mut peer = PeerConfiguration::new(public_key, endpoint);
        peer.persistent_keepalive = self.persistent_keepalive;

        Ok(TunnelConfiguration {
            name: self.name.clone(),
            interface: InterfaceConfiguration {
                private_key: private_key.clone(),
                listen_port: self.listen_port,
                dns: vec![self.dns],
                addresses: vec![address_range],
            },
            peers: vec![peer],
        })
    }
}

impl Default for TunnelConfigurationBuilder {
    fn default() -> Self {
        Self::new(&DeviceManagerConfig::default())
    }
}
