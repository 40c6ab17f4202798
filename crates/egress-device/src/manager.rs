//! Device Manager
//!
//! Produces a ready-to-use tunnel configuration for a selection policy:
//! fetches (or falls back to the cached) server list, selects a server,
//! registers the device key with it when needed, and builds the
//! interface and peer settings.
//!
//! # Usage
//!
//! ```rust,ignore
//! let manager = DeviceManager::new(client, key_store, server_list_store, Some(events), config);
//! let (tunnel, server) = manager
//!     .generate_tunnel_configuration(&SelectionMethod::Automatic)
//!     .await?;
//! println!("{}", tunnel.to_wg_quick());
//! ```
//!
//! # Failure policy
//!
//! | step | on failure |
//! |------|------------|
//! | fetch server list | report, use cached list |
//! | read cached list | report, fail |
//! | persist server list | report, continue |
//! | select server | report, fail |
//! | register key | report, fail |
//! | build configuration | report, fail |

use crate::client::NetworkClient;
use crate::config::{DeviceManagerConfig, TunnelConfiguration};
use crate::error::NetworkProtectionError;
use crate::events::ErrorEvents;
use crate::key_store::KeyStore;
use crate::keys::KeyPair;
use crate::selection::{DeviceTimezone, SelectionMethod, select_server};
use crate::server::{Server, ServerInfo};
use crate::server_list_store::{ServerListStore, ServerListStoreError};
use crate::tunnel::TunnelConfigurationBuilder;
use async_trait::async_trait;
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Anything able to hand out tunnel configurations
#[async_trait]
pub trait DeviceManagement: Send + Sync {
    async fn generate_tunnel_configuration(
        &self,
        selection_method: &SelectionMethod,
    ) -> Result<(TunnelConfiguration, ServerInfo), NetworkProtectionError>;
}

/// State only touched while a configuration is being generated
struct ManagerState {
    rng: StdRng,
}

/// Device registration and tunnel configuration.
///
/// Calls to [`DeviceManager::generate_tunnel_configuration`] run one at a
/// time: the server list and key pair are read and updated as a single
/// transaction, so a concurrent caller waits for the running one.
pub struct DeviceManager {
    network_client: Arc<dyn NetworkClient>,
    key_store: Arc<dyn KeyStore>,
    server_list_store: Arc<dyn ServerListStore>,
    error_events: Option<Arc<dyn ErrorEvents>>,
    builder: TunnelConfigurationBuilder,
    timezone: DeviceTimezone,
    assert_on_inconsistency: bool,
    state: Mutex<ManagerState>,
}

impl DeviceManager {
    pub fn new(
        network_client: Arc<dyn NetworkClient>,
        key_store: Arc<dyn KeyStore>,
        server_list_store: Arc<dyn ServerListStore>,
        error_events: Option<Arc<dyn ErrorEvents>>,
        config: DeviceManagerConfig,
    ) -> Self {
        Self {
            network_client,
            key_store,
            server_list_store,
            error_events,
            builder: TunnelConfigurationBuilder::new(&config),
            timezone: config.device_timezone(),
            assert_on_inconsistency: config.assert_on_inconsistency,
            state: Mutex::new(ManagerState {
                rng: StdRng::from_entropy(),
            }),
        }
    }

    /// Use `rng` to break ties between equally close servers
    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.state = Mutex::new(ManagerState { rng });
        self
    }

    pub fn with_timezone(mut self, timezone: DeviceTimezone) -> Self {
        self.timezone = timezone;
        self
    }

    /// Generate a tunnel configuration for a server chosen by `selection_method`.
    ///
    /// Returns the configuration together with the public info of the
    /// server it points at.
    pub async fn generate_tunnel_configuration(
        &self,
        selection_method: &SelectionMethod,
    ) -> Result<(TunnelConfiguration, ServerInfo), NetworkProtectionError> {
        let mut state = self.state.lock().await;

        debug!("Generating tunnel configuration ({})", selection_method);

        let servers = self.server_list().await?;

        let device_offset = self.timezone.seconds_from_gmt();
        let selected = select_server(&servers, selection_method, device_offset, &mut state.rng)
            .cloned()
            .ok_or_else(|| self.report(NetworkProtectionError::CouldNotSelectClosestServer))?;

        info!(
            "Selected server {} ({}) out of {}",
            selected.name(),
            selected.info.server_location(),
            servers.len()
        );

        let key_pair = self.key_store.current_key_pair();

        let (server, key_pair) = if selected.is_registered(&key_pair.public_key) {
            debug!("{:?} already registered with {}", key_pair.public_key, selected.name());
            (selected, key_pair)
        } else {
            self.register(selected, key_pair).await?
        };

        let configuration = self
            .builder
            .build(&key_pair.private_key, &server)
            .map_err(|e| self.report(e))?;

        info!(
            "Generated tunnel configuration for {} (key expires {})",
            server.name(),
            key_pair.expiration_date
        );

        Ok((configuration, server.info))
    }

    /// Fresh server list from the backend, or the cached one if the
    /// backend can't be reached
    async fn server_list(&self) -> Result<Vec<Server>, NetworkProtectionError> {
        match self.network_client.get_servers().await {
            Ok(servers) => {
                if let Err(e) = self.server_list_store.store(&servers) {
                    self.report(store_error(e, "server_list", line!()));
                }
                Ok(servers)
            }
            Err(e) => {
                warn!("Failed to fetch server list, using cached list: {}", e);
                self.report(e.into());

                self.server_list_store
                    .stored_list()
                    .map_err(|e| self.report(store_error(e, "server_list", line!())))
            }
        }
    }

    /// Register `key_pair` with `selected` and bring the key's expiration
    /// in line with the server's
    async fn register(
        &self,
        selected: Server,
        key_pair: KeyPair,
    ) -> Result<(Server, KeyPair), NetworkProtectionError> {
        info!("Registering {:?} with {}", key_pair.public_key, selected.name());

        let registered_servers = self
            .network_client
            .register(&key_pair.public_key, &selected.info)
            .await
            .map_err(|e| self.report(e.into()))?;

        let Some(registered) = registered_servers
            .iter()
            .find(|server| server.name() == selected.name())
            .cloned()
        else {
            error!(
                "Registration response ({} servers) is missing {}",
                registered_servers.len(),
                selected.name()
            );
            let error = self.report(NetworkProtectionError::ServerListInconsistency);
            if self.assert_on_inconsistency && error.asserts() {
                panic!("registered server list is missing {}", selected.name());
            }
            return Err(error);
        };

        let mut key_pair = key_pair;
        if let Some(server_expiration) = registered.expiration_date {
            if key_pair.expiration_date > server_expiration {
                info!(
                    "Shortening key expiration to {} to match {}",
                    server_expiration,
                    registered.name()
                );
                key_pair = self.key_store.update_current_key_pair(server_expiration);
            }
        }

        if let Err(e) = self.server_list_store.update_server_list_cache(&registered_servers) {
            self.report(store_error(e, "register", line!()));
        }

        Ok((registered, key_pair))
    }

    fn report(&self, error: NetworkProtectionError) -> NetworkProtectionError {
        if let Some(events) = &self.error_events {
            events.fire(&error);
        }
        error
    }
}

#[async_trait]
impl DeviceManagement for DeviceManager {
    async fn generate_tunnel_configuration(
        &self,
        selection_method: &SelectionMethod,
    ) -> Result<(TunnelConfiguration, ServerInfo), NetworkProtectionError> {
        DeviceManager::generate_tunnel_configuration(self, selection_method).await
    }
}

/// Map a server list store failure into the taxonomy
fn store_error(error: anyhow::Error, function: &'static str, line: u32) -> NetworkProtectionError {
    match error.downcast_ref::<ServerListStoreError>() {
        Some(store_error) => NetworkProtectionError::from(store_error),
        None => NetworkProtectionError::unhandled(function, line, error),
    }
}
