//! Server List Cache
//!
//! Persists the last known-good server list so a configuration can still
//! be generated while the backend is unreachable. Writes always replace
//! the whole list and go through a temp file so a crash never leaves a
//! half-written cache behind.

use crate::error::NetworkProtectionError;
use crate::server::Server;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Full-replace persistence of the server list.
///
/// Errors are returned as [`anyhow::Error`] so implementations are free to
/// fail with their own types; the device manager maps
/// [`ServerListStoreError`] to its taxonomy and treats anything else as
/// unhandled.
pub trait ServerListStore: Send + Sync {
    /// Replace the stored list
    fn store(&self, servers: &[Server]) -> anyhow::Result<()>;

    /// Replace the stored list with the one returned by a registration
    fn update_server_list_cache(&self, servers: &[Server]) -> anyhow::Result<()> {
        self.store(servers)
    }

    /// Read the stored list in stored order; empty when nothing was stored yet
    fn stored_list(&self) -> anyhow::Result<Vec<Server>>;
}

/// Server list store errors
#[derive(Debug, Error)]
pub enum ServerListStoreError {
    #[error("Failed to encode server list: {0}")]
    FailedToEncodeServerList(#[source] serde_json::Error),

    #[error("Failed to decode server list: {0}")]
    FailedToDecodeServerList(#[source] serde_json::Error),

    #[error("Failed to write server list: {0}")]
    FailedToWriteServerList(#[source] io::Error),

    #[error("No server list found")]
    NoServerListFound,

    #[error("Could not create server list directory: {0}")]
    CouldNotCreateServerListDirectory(#[source] io::Error),

    #[error("Failed to read server list: {0}")]
    FailedToReadServerList(#[source] io::Error),
}

impl From<&ServerListStoreError> for NetworkProtectionError {
    fn from(error: &ServerListStoreError) -> Self {
        use ServerListStoreError::*;

        match error {
            FailedToEncodeServerList(e) => NetworkProtectionError::FailedToEncodeServerList(e.to_string()),
            FailedToDecodeServerList(e) => NetworkProtectionError::FailedToDecodeServerList(e.to_string()),
            FailedToWriteServerList(e) => NetworkProtectionError::FailedToWriteServerList(e.to_string()),
            NoServerListFound => NetworkProtectionError::NoServerListFound,
            CouldNotCreateServerListDirectory(e) => {
                NetworkProtectionError::CouldNotCreateServerListDirectory(e.to_string())
            }
            FailedToReadServerList(e) => NetworkProtectionError::FailedToReadServerList(e.to_string()),
        }
    }
}

impl From<ServerListStoreError> for NetworkProtectionError {
    fn from(error: ServerListStoreError) -> Self {
        NetworkProtectionError::from(&error)
    }
}

/// JSON file backed server list store
#[derive(Debug, Clone)]
pub struct FileServerListStore {
    path: PathBuf,
}

impl FileServerListStore {
    pub const FILE_NAME: &'static str = "servers.json";

    /// Store at an explicit file path
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store as `servers.json` inside `dir`
    pub fn in_directory(dir: &Path) -> Self {
        Self::new(dir.join(Self::FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write `servers`, replacing whatever was stored
    pub fn write(&self, servers: &[Server]) -> Result<(), ServerListStoreError> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir).map_err(ServerListStoreError::CouldNotCreateServerListDirectory)?;
            }
        }

        let encoded =
            serde_json::to_vec_pretty(servers).map_err(ServerListStoreError::FailedToEncodeServerList)?;

        let temp_path = self.path.with_extension("json.tmp");
        let written = write_file(&temp_path, &encoded).and_then(|()| fs::rename(&temp_path, &self.path));
        if let Err(e) = written {
            let _ = fs::remove_file(&temp_path);
            return Err(ServerListStoreError::FailedToWriteServerList(e));
        }

        info!("Stored {} servers in {}", servers.len(), self.path.display());
        Ok(())
    }

    /// Read the stored list, failing with `NoServerListFound` if nothing was stored
    pub fn read(&self) -> Result<Vec<Server>, ServerListStoreError> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ServerListStoreError::NoServerListFound);
            }
            Err(e) => return Err(ServerListStoreError::FailedToReadServerList(e)),
        };

        serde_json::from_slice(&data).map_err(ServerListStoreError::FailedToDecodeServerList)
    }

    /// Delete the stored list; a missing file is not an error
    pub fn remove_server_list(&self) -> Result<(), ServerListStoreError> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                info!("Removed server list at {}", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ServerListStoreError::FailedToWriteServerList(e)),
        }
    }
}

fn write_file(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    writer.write_all(data)?;
    writer.flush()?;
    writer.get_ref().sync_all()
}

impl ServerListStore for FileServerListStore {
    fn store(&self, servers: &[Server]) -> anyhow::Result<()> {
        Ok(self.write(servers)?)
    }

    fn stored_list(&self) -> anyhow::Result<Vec<Server>> {
        match self.read() {
            Ok(servers) => Ok(servers),
            Err(ServerListStoreError::NoServerListFound) => {
                debug!("No server list stored at {}", self.path.display());
                Ok(Vec::new())
            }
            Err(e) => Err(e.into()),
        }
    }
}
