mod api;
mod config;
mod ha;
mod network;
mod provider;
mod provider_manager;
mod store;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use anyhow::{Context, Result};
use crate::config::{Config, DEFAULT_CONFIG_PATH};
use crate::ha::HaResources;
use crate::provider::Provider;
use crate::provider_manager::{ProviderHandle, ProviderSettings};
use crate::store::RelationDb;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("loadbalancerd=info"))
        )
        .init();

    tracing::info!("Starting loadbalancerd");

    // Load config
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;

    tracing::info!("Loaded config from {}", config_path);

    // Resolve VIPs to partitions
    let vips = config.network.partition_vips()?;
    for (partition, addresses) in &vips {
        tracing::info!("Partition {} served on {}", partition, addresses.join(", "));
    }

    let ha = if config.ha.enabled {
        let mut resources = HaResources::new();
        for vip in network::parse_vips(&config.network.vips)? {
            resources.add_vip(&config.provider.app, &vip);
        }
        resources.add_init_service(&config.provider.app, &config.ha.init_service);
        Some(resources)
    } else {
        None
    };

    // Open SQLite database
    let db = RelationDb::open(&config.store.db_path, &config.provider.app, &config.provider.unit)?;
    tracing::info!("Opened database at {:?}", config.store.db_path);

    // Compute initial hash from whatever survived a restart
    let mut provider = Provider::new(config.provider.endpoint.clone());
    let initial_hash = provider
        .refresh_requests_hash(&db)
        .context("Failed to aggregate stored requests")?
        .unwrap_or_default();
    tracing::info!("Initial requests hash: {}", initial_hash);

    // Create hash watch channel
    let (hash_tx, hash_rx) = watch::channel(initial_hash);

    // Start provider thread
    let settings = ProviderSettings {
        leader: config.provider.leader,
        respond_automatically: config.provider.respond_automatically,
        vips,
        ha,
    };
    let provider_handle = ProviderHandle::spawn(db, provider, settings, hash_tx);

    // Create cancellation token for graceful shutdown
    let cancel = CancellationToken::new();

    // Build API router
    let app_state = api::routes::AppState {
        provider: provider_handle.clone(),
        hash_rx,
    };
    let app = api::routes::router(app_state);

    // Bind HTTP server
    let listener = tokio::net::TcpListener::bind(&config.api.listen)
        .await
        .with_context(|| format!("Failed to bind to {}", config.api.listen))?;

    tracing::info!("API listening on {}", config.api.listen);

    // Run server with graceful shutdown
    let server_cancel = cancel.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
        {
            tracing::error!("Server error: {}", e);
        }
    });

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutdown signal received");

    cancel.cancel();
    let _ = server_handle.await;

    // Shutdown provider thread
    if let Err(e) = provider_handle.shutdown().await {
        tracing::error!("Failed to shutdown provider: {}", e);
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
