//! Backend client boundary
//!
//! The device manager only needs two calls from the backend: the list of
//! candidate servers, and registering a public key with one of them.
//! Transport, authentication, timeouts and cancellation all belong to the
//! implementation.

use crate::error::{NetworkProtectionError, detail};
use crate::keys::PublicKey;
use crate::server::{Server, ServerInfo};
use async_trait::async_trait;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[async_trait]
pub trait NetworkClient: Send + Sync {
    /// Fetch every server the device may connect to
    async fn get_servers(&self) -> Result<Vec<Server>, ClientError>;

    /// Register `public_key` with `server`; returns the updated server list
    async fn register(
        &self,
        public_key: &PublicKey,
        server: &ServerInfo,
    ) -> Result<Vec<Server>, ClientError>;
}

/// Backend client errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    #[error("Failed to fetch server list{}", detail(.0))]
    FailedToFetchServerList(Option<String>),

    #[error("Failed to parse server list response: {0}")]
    FailedToParseServerListResponse(String),

    #[error("Failed to encode register key request")]
    FailedToEncodeRegisterKeyRequest,

    #[error("Failed to fetch registered servers{}", detail(.0))]
    FailedToFetchRegisteredServers(Option<String>),

    #[error("Failed to parse registered servers response: {0}")]
    FailedToParseRegisteredServersResponse(String),

    #[error("Invalid auth token")]
    InvalidAuthToken,
}

impl From<ClientError> for NetworkProtectionError {
    fn from(error: ClientError) -> Self {
        match error {
            ClientError::FailedToFetchServerList(e) => NetworkProtectionError::FailedToFetchServerList(e),
            ClientError::FailedToParseServerListResponse(e) => {
                NetworkProtectionError::FailedToParseServerListResponse(e)
            }
            ClientError::FailedToEncodeRegisterKeyRequest => {
                NetworkProtectionError::FailedToEncodeRegisterKeyRequest
            }
            ClientError::FailedToFetchRegisteredServers(e) => {
                NetworkProtectionError::FailedToFetchRegisteredServers(e)
            }
            ClientError::FailedToParseRegisteredServersResponse(e) => {
                NetworkProtectionError::FailedToParseRegisteredServersResponse(e)
            }
            ClientError::InvalidAuthToken => NetworkProtectionError::InvalidAuthToken,
        }
    }
}

/// Scripted [`NetworkClient`] for tests and offline runs.
///
/// Returns canned results and counts calls. With
/// [`MockNetworkClient::stamp_registered_key`] it behaves like the real
/// backend and lists the registering key on the selected server.
pub struct MockNetworkClient {
    get_servers_result: Mutex<Result<Vec<Server>, ClientError>>,
    register_result: Mutex<Result<Vec<Server>, ClientError>>,
    stamp_registered_key: bool,
    delay: Option<Duration>,
    get_servers_calls: AtomicUsize,
    register_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    last_registration: Mutex<Option<(String, String)>>,
}

impl MockNetworkClient {
    pub fn new(
        get_servers_result: Result<Vec<Server>, ClientError>,
        register_result: Result<Vec<Server>, ClientError>,
    ) -> Self {
        Self {
            get_servers_result: Mutex::new(get_servers_result),
            register_result: Mutex::new(register_result),
            stamp_registered_key: false,
            delay: None,
            get_servers_calls: AtomicUsize::new(0),
            register_calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            last_registration: Mutex::new(None),
        }
    }

    /// Add the registering key to the matching server of the register result
    pub fn stamp_registered_key(mut self) -> Self {
        self.stamp_registered_key = true;
        self
    }

    /// Sleep this long inside every call
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn set_get_servers_result(&self, result: Result<Vec<Server>, ClientError>) {
        *lock(&self.get_servers_result) = result;
    }

    pub fn set_register_result(&self, result: Result<Vec<Server>, ClientError>) {
        *lock(&self.register_result) = result;
    }

    pub fn get_servers_calls(&self) -> usize {
        self.get_servers_calls.load(Ordering::SeqCst)
    }

    pub fn register_calls(&self) -> usize {
        self.register_calls.load(Ordering::SeqCst)
    }

    /// Highest number of calls that were running at the same time
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// `(public key, server name)` of the last registration
    pub fn last_registration(&self) -> Option<(String, String)> {
        lock(&self.last_registration).clone()
    }

    async fn enter(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn exit(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[async_trait]
impl NetworkClient for MockNetworkClient {
    async fn get_servers(&self) -> Result<Vec<Server>, ClientError> {
        self.get_servers_calls.fetch_add(1, Ordering::SeqCst);
        self.enter().await;
        let result = lock(&self.get_servers_result).clone();
        self.exit();
        result
    }

    async fn register(
        &self,
        public_key: &PublicKey,
        server: &ServerInfo,
    ) -> Result<Vec<Server>, ClientError> {
        self.register_calls.fetch_add(1, Ordering::SeqCst);
        *lock(&self.last_registration) = Some((public_key.to_base64(), server.name.clone()));
        self.enter().await;

        let mut result = lock(&self.register_result).clone();
        if self.stamp_registered_key {
            if let Ok(servers) = &mut result {
                let encoded = public_key.to_base64();
                for registered in servers.iter_mut().filter(|s| s.name() == server.name) {
                    if !registered.registered_public_keys.contains(&encoded) {
                        registered.registered_public_keys.push(encoded.clone());
                    }
                }
            }
        }

        self.exit();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::PrivateKey;
    use crate::server::test_support::server;

    #[tokio::test]
    async fn test_mock_counts_calls() {
        let client = MockNetworkClient::new(Ok(vec![server("egress.usw.1", 0)]), Ok(Vec::new()));

        assert_eq!(client.get_servers().await.unwrap().len(), 1);
        assert_eq!(client.get_servers_calls(), 1);
        assert_eq!(client.register_calls(), 0);
    }

    #[tokio::test]
    async fn test_mock_stamps_registered_key() {
        let target = server("egress.usw.1", 0);
        let other = server("egress.usw.2", 0);
        let client = MockNetworkClient::new(Ok(Vec::new()), Ok(vec![target.clone(), other]))
            .stamp_registered_key();
        let key = PrivateKey::generate().public_key();

        let servers = client.register(&key, &target.info).await.unwrap();

        assert!(servers[0].is_registered(&key));
        assert!(!servers[1].is_registered(&key));
        assert_eq!(
            client.last_registration(),
            Some((key.to_base64(), "egress.usw.1".to_string()))
        );
    }

    #[test]
    fn test_client_error_mapping() {
        assert_eq!(
            NetworkProtectionError::from(ClientError::FailedToFetchServerList(None)),
            NetworkProtectionError::FailedToFetchServerList(None)
        );
        assert_eq!(
            NetworkProtectionError::from(ClientError::InvalidAuthToken),
            NetworkProtectionError::InvalidAuthToken
        );
    }

    #[test]
    fn test_client_error_detail() {
        assert_eq!(
            ClientError::FailedToFetchRegisteredServers(None).to_string(),
            "Failed to fetch registered servers"
        );
        assert_eq!(
            ClientError::FailedToFetchServerList(Some("HTTP 503".into())).to_string(),
            "Failed to fetch server list: HTTP 503"
        );
    }
}
