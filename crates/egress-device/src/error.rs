//! Error taxonomy
//!
//! Every failure the device manager can observe maps to exactly one
//! [`NetworkProtectionError`]. Collaborator errors convert into it with
//! `From`, so each is reported under a stable event name.

/// Umbrella error for device registration and tunnel configuration
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NetworkProtectionError {
    // Tunnel configuration errors
    #[error("Server has no registration info (missing allowed IPs)")]
    NoServerRegistrationInfo,

    #[error("Could not select a server")]
    CouldNotSelectClosestServer,

    #[error("Could not parse the peer public key")]
    CouldNotGetPeerPublicKey,

    #[error("Could not parse the peer endpoint")]
    CouldNotGetPeerHostName,

    #[error("Could not parse the interface address range")]
    CouldNotGetInterfaceAddressRange,

    // Client errors
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

    #[error("Auth token rejected by backend")]
    InvalidAuthToken,

    // Server list store errors
    #[error("Failed to encode server list: {0}")]
    FailedToEncodeServerList(String),

    #[error("Failed to decode server list: {0}")]
    FailedToDecodeServerList(String),

    #[error("Failed to write server list: {0}")]
    FailedToWriteServerList(String),

    #[error("No server list found")]
    NoServerListFound,

    #[error("Could not create server list directory: {0}")]
    CouldNotCreateServerListDirectory(String),

    #[error("Failed to read server list: {0}")]
    FailedToReadServerList(String),

    #[error("Registered server list does not contain the selected server")]
    ServerListInconsistency,

    // Key store errors
    #[error("Failed to read key pair: {0}")]
    KeyStoreReadError(String),

    #[error("Failed to decode key pair: {0}")]
    KeyStoreDecodeError(String),

    #[error("Failed to write key pair: {0}")]
    KeyStoreWriteError(String),

    #[error("Failed to delete key pair: {0}")]
    KeyStoreDeleteError(String),

    #[error("Unhandled error in {function} (line {line}): {error}")]
    Unhandled {
        function: &'static str,
        line: u32,
        error: String,
    },
}

pub(crate) fn detail(source: &Option<String>) -> String {
    source.as_ref().map(|s| format!(": {}", s)).unwrap_or_default()
}

impl NetworkProtectionError {
    /// Wrap an error of unexpected type, keeping where it surfaced
    pub fn unhandled(function: &'static str, line: u32, error: impl std::fmt::Display) -> Self {
        NetworkProtectionError::Unhandled {
            function,
            line,
            error: format!("{:#}", error),
        }
    }

    /// Stable identifier used when the error is reported
    pub fn event_name(&self) -> &'static str {
        use NetworkProtectionError::*;

        match self {
            NoServerRegistrationInfo => "NetworkProtectionError.noServerRegistrationInfo",
            CouldNotSelectClosestServer => "NetworkProtectionError.couldNotSelectClosestServer",
            CouldNotGetPeerPublicKey => "NetworkProtectionError.couldNotGetPeerPublicKey",
            CouldNotGetPeerHostName => "NetworkProtectionError.couldNotGetPeerHostName",
            CouldNotGetInterfaceAddressRange => {
                "NetworkProtectionError.couldNotGetInterfaceAddressRange"
            }
            FailedToFetchServerList(_) => "NetworkProtectionError.failedToFetchServerList",
            FailedToParseServerListResponse(_) => {
                "NetworkProtectionError.failedToParseServerListResponse"
            }
            FailedToEncodeRegisterKeyRequest => {
                "NetworkProtectionError.failedToEncodeRegisterKeyRequest"
            }
            FailedToFetchRegisteredServers(_) => {
                "NetworkProtectionError.failedToFetchRegisteredServers"
            }
            FailedToParseRegisteredServersResponse(_) => {
                "NetworkProtectionError.failedToParseRegisteredServersResponse"
            }
            InvalidAuthToken => "NetworkProtectionError.invalidAuthToken",
            FailedToEncodeServerList(_) => "NetworkProtectionError.failedToEncodeServerList",
            FailedToDecodeServerList(_) => "NetworkProtectionError.failedToDecodeServerList",
            FailedToWriteServerList(_) => "NetworkProtectionError.failedToWriteServerList",
            NoServerListFound => "NetworkProtectionError.noServerListFound",
            CouldNotCreateServerListDirectory(_) => {
                "NetworkProtectionError.couldNotCreateServerListDirectory"
            }
            FailedToReadServerList(_) => "NetworkProtectionError.failedToReadServerList",
            ServerListInconsistency => "NetworkProtectionError.serverListInconsistency",
            KeyStoreReadError(_) => "NetworkProtectionError.keyStoreReadError",
            KeyStoreDecodeError(_) => "NetworkProtectionError.keyStoreDecodeError",
            KeyStoreWriteError(_) => "NetworkProtectionError.keyStoreWriteError",
            KeyStoreDeleteError(_) => "NetworkProtectionError.keyStoreDeleteError",
            Unhandled { .. } => "NetworkProtectionError.unhandledError",
        }
    }

    /// Whether this error signals a contract violation that should trip
    /// an assertion in debug builds
    pub fn asserts(&self) -> bool {
        matches!(self, NetworkProtectionError::ServerListInconsistency)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names() {
        assert_eq!(
            NetworkProtectionError::CouldNotSelectClosestServer.event_name(),
            "NetworkProtectionError.couldNotSelectClosestServer"
        );
        assert_eq!(
            NetworkProtectionError::unhandled("serverList", 10, "boom").event_name(),
            "NetworkProtectionError.unhandledError"
        );
    }

    #[test]
    fn test_unhandled_keeps_origin() {
        let error = NetworkProtectionError::unhandled("generate_tunnel_configuration", 42, "disk on fire");

        assert_eq!(
            error.to_string(),
            "Unhandled error in generate_tunnel_configuration (line 42): disk on fire"
        );
    }

    #[test]
    fn test_optional_detail() {
        assert_eq!(
            NetworkProtectionError::FailedToFetchServerList(None).to_string(),
            "Failed to fetch server list"
        );
        assert_eq!(
            NetworkProtectionError::FailedToFetchServerList(Some("HTTP 502".into())).to_string(),
            "Failed to fetch server list: HTTP 502"
        );
    }

    #[test]
    fn test_only_inconsistency_asserts() {
        assert!(NetworkProtectionError::ServerListInconsistency.asserts());
        assert!(!NetworkProtectionError::CouldNotGetPeerHostName.asserts());
    }
}
