//! Device Key Store
//!
//! Owns the device's current key pair. A key pair is generated on first
//! use and afterwards only replaced: its expiration is shortened when a
//! server guarantees the registration for less time than the key would
//! otherwise live.
//!
//! Key store calls never fail the caller. Persistence problems are
//! reported through [`ErrorEvents`] and the in-memory key stays usable.

use crate::error::NetworkProtectionError;
use crate::events::ErrorEvents;
use crate::keys::{KeyPair, PrivateKey};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

/// Lifetime of freshly generated keys unless overridden
pub fn default_validity_interval() -> Duration {
    Duration::days(1)
}

pub trait KeyStore: Send + Sync {
    /// The current key pair, generating and storing one if there is none
    fn current_key_pair(&self) -> KeyPair;

    /// Replace the current key pair's expiration and persist it
    fn update_current_key_pair(&self, new_expiration_date: DateTime<Utc>) -> KeyPair;

    /// Forget the current key pair; the next read generates a new one
    fn reset_current_key_pair(&self);

    /// Lifetime used for key pairs generated from now on
    fn set_validity_interval(&self, interval: Duration);
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct KeyState {
    key_pair: Option<KeyPair>,
    validity: Duration,
}

impl KeyState {
    fn new() -> Self {
        Self {
            key_pair: None,
            validity: default_validity_interval(),
        }
    }

    fn generate(&mut self) -> KeyPair {
        let key_pair = KeyPair::generate(Utc::now() + self.validity);
        info!(
            "Generated new key pair {:?} (expires {})",
            key_pair.public_key, key_pair.expiration_date
        );
        self.key_pair = Some(key_pair.clone());
        key_pair
    }
}

/// Process-local key store
pub struct MemoryKeyStore {
    state: Mutex<KeyState>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(KeyState::new()),
        }
    }

    /// Start from an existing key pair
    pub fn with_key_pair(key_pair: KeyPair) -> Self {
        let store = Self::new();
        lock(&store.state).key_pair = Some(key_pair);
        store
    }

    /// Current key pair without generating one
    pub fn stored_key_pair(&self) -> Option<KeyPair> {
        lock(&self.state).key_pair.clone()
    }
}

impl Default for MemoryKeyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyStore for MemoryKeyStore {
    fn current_key_pair(&self) -> KeyPair {
        let mut state = lock(&self.state);
        match state.key_pair.clone() {
            Some(key_pair) => key_pair,
            None => state.generate(),
        }
    }

    fn update_current_key_pair(&self, new_expiration_date: DateTime<Utc>) -> KeyPair {
        let mut state = lock(&self.state);
        let current = match state.key_pair.clone() {
            Some(key_pair) => key_pair,
            None => state.generate(),
        };
        let updated = current.with_expiration(new_expiration_date);
        state.key_pair = Some(updated.clone());
        updated
    }

    fn reset_current_key_pair(&self) {
        lock(&self.state).key_pair = None;
    }

    fn set_validity_interval(&self, interval: Duration) {
        lock(&self.state).validity = interval;
    }
}

/// On-disk representation of the key pair
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredKeyPair {
    private_key: String,
    expiration_date: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
enum KeyStoreError {
    #[error("{0}")]
    Read(#[source] io::Error),

    #[error("{0}")]
    Decode(String),

    #[error("{0}")]
    Write(#[source] io::Error),

    #[error("{0}")]
    Delete(#[source] io::Error),
}

impl From<KeyStoreError> for NetworkProtectionError {
    fn from(error: KeyStoreError) -> Self {
        match error {
            KeyStoreError::Read(e) => NetworkProtectionError::KeyStoreReadError(e.to_string()),
            KeyStoreError::Decode(e) => NetworkProtectionError::KeyStoreDecodeError(e),
            KeyStoreError::Write(e) => NetworkProtectionError::KeyStoreWriteError(e.to_string()),
            KeyStoreError::Delete(e) => NetworkProtectionError::KeyStoreDeleteError(e.to_string()),
        }
    }
}

struct FileState {
    keys: KeyState,
    /// Whether `keys.key_pair` reflects the file
    loaded: bool,
}

/// Key store persisted as a JSON file readable only by the owner
pub struct FileKeyStore {
    path: PathBuf,
    state: Mutex<FileState>,
    error_events: Option<Arc<dyn ErrorEvents>>,
}

impl FileKeyStore {
    pub const FILE_NAME: &'static str = "key.json";

    pub fn new(path: impl Into<PathBuf>, error_events: Option<Arc<dyn ErrorEvents>>) -> Self {
        Self {
            path: path.into(),
            state: Mutex::new(FileState {
                keys: KeyState::new(),
                loaded: false,
            }),
            error_events,
        }
    }

    /// Store as `key.json` inside `dir`
    pub fn in_directory(dir: &Path, error_events: Option<Arc<dyn ErrorEvents>>) -> Self {
        Self::new(dir.join(Self::FILE_NAME), error_events)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the stored private key without generating one
    pub fn stored_private_key(&self) -> Option<PrivateKey> {
        match self.read_file() {
            Ok(stored) => stored.map(|key_pair| key_pair.private_key),
            Err(e) => {
                self.report(e);
                None
            }
        }
    }

    fn report(&self, error: KeyStoreError) {
        let error = NetworkProtectionError::from(error);
        if let Some(events) = &self.error_events {
            events.fire(&error);
        }
    }

    fn read_file(&self) -> Result<Option<KeyPair>, KeyStoreError> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(KeyStoreError::Read(e)),
        };

        let stored: StoredKeyPair =
            serde_json::from_slice(&data).map_err(|e| KeyStoreError::Decode(e.to_string()))?;
        let private_key = PrivateKey::from_base64(&stored.private_key)
            .map_err(|e| KeyStoreError::Decode(e.to_string()))?;

        Ok(Some(KeyPair::from_private(private_key, stored.expiration_date)))
    }

    fn write_file(&self, key_pair: &KeyPair) -> Result<(), KeyStoreError> {
        let stored = StoredKeyPair {
            private_key: key_pair.private_key.to_base64(),
            expiration_date: key_pair.expiration_date,
        };
        let data = serde_json::to_vec(&stored).map_err(|e| KeyStoreError::Write(io::Error::other(e)))?;

        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir).map_err(KeyStoreError::Write)?;
            }
        }

        let temp_path = self.path.with_extension("json.tmp");
        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let written = options
            .open(&temp_path)
            .and_then(|mut file| {
                file.write_all(&data)?;
                file.sync_all()
            })
            .and_then(|()| fs::rename(&temp_path, &self.path));

        written.map_err(|e| {
            let _ = fs::remove_file(&temp_path);
            KeyStoreError::Write(e)
        })
    }

    /// Current key pair from memory or disk, without generating
    fn load(&self, state: &mut FileState) -> Option<KeyPair> {
        if !state.loaded {
            state.loaded = true;
            match self.read_file() {
                Ok(key_pair) => state.keys.key_pair = key_pair,
                Err(e) => self.report(e),
            }
        }
        state.keys.key_pair.clone()
    }

    fn generate_and_store(&self, state: &mut FileState) -> KeyPair {
        let key_pair = state.keys.generate();
        if let Err(e) = self.write_file(&key_pair) {
            self.report(e);
        }
        key_pair
    }
}

impl KeyStore for FileKeyStore {
    fn current_key_pair(&self) -> KeyPair {
        let mut state = lock(&self.state);
        match self.load(&mut state) {
            Some(key_pair) => key_pair,
            None => self.generate_and_store(&mut state),
        }
    }

    fn update_current_key_pair(&self, new_expiration_date: DateTime<Utc>) -> KeyPair {
        let mut state = lock(&self.state);
        let current = match self.load(&mut state) {
            Some(key_pair) => key_pair,
            None => self.generate_and_store(&mut state),
        };

        let updated = current.with_expiration(new_expiration_date);
        debug!(
            "Updating key pair {:?} expiration: {} -> {}",
            updated.public_key, current.expiration_date, new_expiration_date
        );
        state.keys.key_pair = Some(updated.clone());
        if let Err(e) = self.write_file(&updated) {
            self.report(e);
        }
        updated
    }

    fn reset_current_key_pair(&self) {
        let mut state = lock(&self.state);
        state.keys.key_pair = None;
        state.loaded = true;

        match fs::remove_file(&self.path) {
            Ok(()) => info!("Reset key pair at {}", self.path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => self.report(KeyStoreError::Delete(e)),
        }
    }

    fn set_validity_interval(&self, interval: Duration) {
        info!("Setting key validity to {}s", interval.num_seconds());
        lock(&self.state).keys.validity = interval;
    }
}
