//! # sozvon
//!
//! Runs one of the two services: the relay (chat core) or the edge gateway.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sozvon_auth::{IdentityProvider, JwtIdentityProvider};
use sozvon_gateway::{GatewayConfig, GatewayServer};
use sozvon_relay::{RelayConfig, RelayServer};
use sozvon_settings::{SozvonSettings, load_settings_from_path, settings_path};
use sozvon_store::SqliteChatStore;

/// Sozvon real-time chat services.
#[derive(Parser, Debug)]
#[command(name = "sozvon", about = "Sozvon chat relay and edge gateway")]
struct Cli {
    /// Settings file (default `$SOZVON_SETTINGS` or `~/.sozvon/settings.json`).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    service: Service,
}

#[derive(Subcommand, Debug)]
enum Service {
    /// Run the relay: `/ws`, chat REST endpoints, persistence.
    Relay {
        /// Host to bind (overrides settings).
        #[arg(long)]
        host: Option<String>,
        /// Port to bind (overrides settings, 0 for auto-assign).
        #[arg(long)]
        port: Option<u16>,
        /// Path to the `SQLite` chat database (overrides settings).
        #[arg(long)]
        db_path: Option<PathBuf>,
    },
    /// Run the edge gateway in front of the relay.
    Gateway {
        /// Host to bind (overrides settings).
        #[arg(long)]
        host: Option<String>,
        /// Port to bind (overrides settings, 0 for auto-assign).
        #[arg(long)]
        port: Option<u16>,
        /// Relay WebSocket base URL (overrides settings).
        #[arg(long)]
        relay_url: Option<String>,
    },
}

impl Service {
    /// Fold command-line overrides into the loaded settings.
    fn apply(&self, settings: &mut SozvonSettings) {
        match self {
            Self::Relay {
                host,
                port,
                db_path,
            } => {
                if let Some(host) = host {
                    settings.relay.host.clone_from(host);
                }
                if let Some(port) = port {
                    settings.relay.port = *port;
                }
                if let Some(path) = db_path {
                    settings.relay.db_path = path.to_string_lossy().into_owned();
                }
            }
            Self::Gateway {
                host,
                port,
                relay_url,
            } => {
                if let Some(host) = host {
                    settings.gateway.host.clone_from(host);
                }
                if let Some(port) = port {
                    settings.gateway.port = *port;
                }
                if let Some(url) = relay_url {
                    settings.gateway.relay_url.clone_from(url);
                }
            }
        }
    }
}

fn load(cli: &Cli) -> Result<SozvonSettings> {
    let path = cli.config.clone().unwrap_or_else(settings_path);
    let mut settings = load_settings_from_path(&path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))?;
    cli.service.apply(&mut settings);
    settings.validate().context("Invalid settings")?;
    Ok(settings)
}

async fn wait_for_signal() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")
}

async fn run_relay(settings: &SozvonSettings, identity: Arc<dyn IdentityProvider>) -> Result<()> {
    let store = SqliteChatStore::open(&settings.relay.db_path)
        .with_context(|| format!("Failed to open database {}", settings.relay.db_path))?;
    let metrics = sozvon_relay::metrics::install_recorder()
        .context("Failed to install metrics recorder")?;

    let server = RelayServer::new(
        RelayConfig::from(&settings.relay),
        Arc::new(store),
        identity,
        metrics,
    );
    let (addr, handle) = server.listen().await.context("Failed to bind relay")?;
    tracing::info!("relay listening on http://{addr}");

    wait_for_signal().await?;
    if !server.shutdown_gracefully().await {
        tracing::warn!("relay sessions did not finish before the shutdown timeout");
    }
    let _ = handle.await;
    tracing::info!("relay stopped");
    Ok(())
}

async fn run_gateway(
    settings: &SozvonSettings,
    identity: Arc<dyn IdentityProvider>,
) -> Result<()> {
    let metrics = sozvon_relay::metrics::install_recorder()
        .context("Failed to install metrics recorder")?;
    let server = GatewayServer::new(GatewayConfig::from(&settings.gateway), identity, metrics)
        .context("Failed to configure gateway")?;
    let (addr, handle) = server.listen().await.context("Failed to bind gateway")?;
    tracing::info!(
        "gateway listening on http://{addr}, relay at {}",
        settings.gateway.relay_url
    );

    wait_for_signal().await?;
    if !server.shutdown_gracefully().await {
        tracing::warn!("tunnels did not finish before the shutdown timeout");
    }
    let _ = handle.await;
    tracing::info!("gateway stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load(&cli)?;
    sozvon_core::logging::init_subscriber(&settings.logging.level);

    let identity: Arc<dyn IdentityProvider> =
        Arc::new(JwtIdentityProvider::new(settings.auth.jwt_secret.as_bytes()));

    match cli.service {
        Service::Relay { .. } => run_relay(&settings, identity).await,
        Service::Gateway { .. } => run_gateway(&settings, identity).await,
    }
}
