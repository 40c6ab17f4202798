//! Egress Device - VPN device registration and tunnel configuration
//!
//! Keeps a device registered with a fleet of egress servers and turns
//! that registration into a WireGuard-style tunnel configuration.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        DeviceManager                          │
//! │                                                               │
//! │  ┌───────────────┐   ┌──────────────┐   ┌─────────────────┐  │
//! │  │ NetworkClient │──▶│   Selection  │──▶│  Registration   │  │
//! │  │ (server list) │   │ (tz distance)│   │ (key → server)  │  │
//! │  └───────┬───────┘   └──────────────┘   └────────┬────────┘  │
//! │          │ fallback                              │           │
//! │  ┌───────▼─────────┐                    ┌────────▼────────┐  │
//! │  │ ServerListStore │◀───────────────────│    KeyStore     │  │
//! │  │  (servers.json) │    cache update    │   (key.json)    │  │
//! │  └─────────────────┘                    └────────┬────────┘  │
//! │                                                  ▼           │
//! │                                    ┌──────────────────────┐  │
//! │                                    │ TunnelConfiguration  │  │
//! │                                    │ (interface + peer)   │  │
//! │                                    └──────────────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Features
//!
//! - **Offline fallback**: the last known-good server list is cached on disk
//! - **Timezone selection**: picks the server whose UTC offset is nearest the device's
//! - **Single registration**: a key is only registered with a server once
//! - **Serialized calls**: concurrent requests run one after another
//!
//! Every failure is reported once to an [`ErrorEvents`] sink before it is
//! returned.

mod client;
mod config;
mod error;
mod events;
mod key_store;
mod keys;
mod manager;
mod selection;
mod server;
mod server_list_store;
mod tunnel;

pub use client::{ClientError, MockNetworkClient, NetworkClient};
pub use config::{
    ConfigError, DeviceManagerConfig, Endpoint, EndpointHost, InterfaceConfiguration,
    ParseError, PeerConfiguration, TunnelConfiguration, full_tunnel_ranges,
    parse_address_range,
};
pub use error::NetworkProtectionError;
pub use events::{ErrorEvents, RecordingErrorEvents, TracingErrorEvents};
pub use key_store::{FileKeyStore, KeyStore, MemoryKeyStore, default_validity_interval};
pub use keys::{KeyError, KeyPair, PrivateKey, PublicKey};
pub use manager::{DeviceManagement, DeviceManager};
pub use selection::{DeviceTimezone, SelectionMethod, closest_server, select_server};
pub use server::{Server, ServerAttributes, ServerInfo};
pub use server_list_store::{FileServerListStore, ServerListStore, ServerListStoreError};
pub use tunnel::TunnelConfigurationBuilder;
