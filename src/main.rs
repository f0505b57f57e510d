//! On-demand HTTP gateway (hestia-gateway).

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hestia_gateway::config::loader::load_config;
use hestia_gateway::config::watcher;
use hestia_gateway::http::GatewayServer;
use hestia_gateway::lifecycle::{signals, Shutdown};
use hestia_gateway::observability::metrics;
use hestia_gateway::store::MetadataStore;

#[derive(Parser, Debug)]
#[command(name = "hestia-gateway", version, about = "On-demand HTTP gateway")]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(long, env = "HESTIA_CONFIG", default_value = "./hestia_config.yml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hestia_gateway=info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    tracing::info!(version = env!("CARGO_PKG_VERSION"), config = ?args.config, "hestia-gateway starting");

    // Create a default config if it doesn't exist (for easier first run)
    if !args.config.exists() {
        tracing::warn!(path = ?args.config, "Config file not found, creating default configuration");
        let default_config = hestia_gateway::GatewayConfig::default();
        let yaml_string = serde_yaml::to_string(&default_config)?;
        std::fs::write(&args.config, yaml_string)?;
    }

    let config = match load_config(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!("Failed to load configuration: {}. Exiting.", e);
            std::process::exit(1);
        }
    };

    tracing::info!(
        bind_address = %config.listener.bind_address,
        services = config.services.len(),
        "Configuration loaded"
    );

    let store = if config.store.enabled {
        match MetadataStore::open(std::path::Path::new(&config.store.path)) {
            Ok(store) => Some(Arc::new(store)),
            Err(e) => {
                tracing::error!("Failed to open metadata store: {}. Exiting.", e);
                std::process::exit(1);
            }
        }
    } else {
        None
    };

    let metrics_handle = if config.observability.metrics_enabled {
        metrics::init_recorder()
    } else {
        None
    };

    let (_watcher, config_updates) = watcher::watch(&args.config)?;

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    tracing::info!(address = %listener.local_addr()?, "Listening for connections");

    let shutdown = Shutdown::new();
    tokio::spawn(signals::listen_for_signals(shutdown.clone()));

    let server = GatewayServer::new(config, store, metrics_handle, shutdown);
    server.run(listener, config_updates).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
