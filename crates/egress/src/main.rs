//! Egress: VPN device registration and tunnel configuration
//!
//! Main entry point. Initializes the global allocator, sets up logging,
//! and runs one command against the backend and the local state directory.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use egress_backend::{BackendClient, BackendConfig};
use egress_device::{
    DeviceManager, DeviceManagerConfig, ErrorEvents, FileKeyStore, FileServerListStore, KeyStore,
    SelectionMethod, ServerListStore, TracingErrorEvents,
};
use serde::Deserialize;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Egress - VPN tunnel configuration
#[derive(Parser)]
#[command(name = "egress")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// TOML config file
    #[arg(short, long, global = true, env = "EGRESS_CONFIG")]
    config: Option<PathBuf>,

    /// Directory holding the key and the cached server list
    #[arg(long, global = true, env = "EGRESS_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Controller base URL
    #[arg(long, global = true, env = "EGRESS_ENDPOINT")]
    endpoint: Option<String>,

    /// Controller auth token
    #[arg(long, global = true, env = "EGRESS_AUTH_TOKEN", hide_env_values = true)]
    auth_token: Option<String>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate a tunnel configuration in wg-quick format
    Generate {
        /// Use this server if the backend still lists it
        #[arg(long, conflicts_with = "avoid")]
        prefer: Option<String>,

        /// Never pick this server
        #[arg(long)]
        avoid: Option<String>,

        /// Write the configuration here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List the cached servers
    Servers,

    /// Forget the device key and the cached server list
    Reset,
}

/// Contents of the `--config` file
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    data_dir: Option<PathBuf>,
    device: DeviceManagerConfig,
    backend: BackendConfig,
}

impl FileConfig {
    fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        config.device.validate().context("Invalid device settings")?;
        Ok(config)
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("egress")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so stdout carries only the configuration
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if cli.verbose { "debug" } else { "info" }));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let mut config = FileConfig::load(cli.config.as_deref())?;
    if let Some(endpoint) = cli.endpoint {
        config.backend.endpoint = endpoint;
    }
    if let Some(token) = cli.auth_token {
        config.backend.auth_token = Some(token);
    }
    let data_dir = cli
        .data_dir
        .or(config.data_dir.take())
        .unwrap_or_else(default_data_dir);

    let events: Arc<dyn ErrorEvents> = Arc::new(TracingErrorEvents);
    let key_store = Arc::new(FileKeyStore::in_directory(&data_dir, Some(events.clone())));
    let server_list_store = Arc::new(FileServerListStore::in_directory(&data_dir));

    match cli.command {
        Command::Generate {
            prefer,
            avoid,
            output,
        } => {
            let selection_method = match (prefer, avoid) {
                (Some(name), _) => SelectionMethod::PreferredServer(name),
                (None, Some(name)) => SelectionMethod::AvoidServer(name),
                (None, None) => SelectionMethod::Automatic,
            };

            let client = BackendClient::new(config.backend).context("Invalid backend settings")?;
            let manager = DeviceManager::new(
                Arc::new(client),
                key_store,
                server_list_store,
                Some(events),
                config.device,
            );

            let (tunnel, server) = manager
                .generate_tunnel_configuration(&selection_method)
                .await
                .context("Failed to generate tunnel configuration")?;

            info!("Connected to {} ({})", server.name, server.server_location());

            let rendered = tunnel.to_wg_quick();
            match output {
                Some(path) => {
                    write_private(&path, rendered.as_bytes())
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                    info!("Wrote {}", path.display());
                }
                None => print!("{}", rendered),
            }
        }

        Command::Servers => {
            let servers = server_list_store
                .stored_list()
                .context("Failed to read cached server list")?;
            if servers.is_empty() {
                info!("No cached servers in {}", data_dir.display());
                return Ok(());
            }

            let public_key = key_store.stored_private_key().map(|key| key.public_key());
            for server in &servers {
                let registered = public_key
                    .as_ref()
                    .is_some_and(|key| server.is_registered(key));
                println!(
                    "{:<20} {:<32} {}",
                    server.name(),
                    server.info.server_location(),
                    if registered { "registered" } else { "-" }
                );
            }
        }

        Command::Reset => {
            key_store.reset_current_key_pair();
            server_list_store
                .remove_server_list()
                .context("Failed to remove cached server list")?;
            info!("Reset state in {}", data_dir.display());
        }
    }

    Ok(())
}

/// Write `data` readable only by the owner; the configuration holds the private key
fn write_private(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(data)?;
    file.sync_all()
}
