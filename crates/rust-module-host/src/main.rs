//! Rust Module Host - Main entry point
//!
//! Loads every module in the modules directory, watches it for changes and
//! serves the modules over HTTP until interrupted.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rust_module_host::gateway::{create_gateway_router, spawn_session_cleanup, GatewayState};
use rust_module_host::runtime::{Host, ModulePaths, ModuleServices};
use rust_module_host::session::SessionService;
use rust_module_host::storage::SqliteStore;
use rust_module_host::HostConfig;

const SESSION_CLEANUP_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "info,rust_module_host=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Rust Module Host");

    let config = HostConfig::from_env().context("Failed to load configuration")?;
    tracing::info!("Configuration loaded: {:?}", config);

    let store = Arc::new(SqliteStore::open(&config.data_dir)?);
    let sessions = Arc::new(SessionService::new(store.clone(), config.session_timeout()));
    tracing::info!("Storage initialized");

    let services = ModuleServices {
        storage: Some(store),
        sessions: Some(sessions.clone()),
        reply_timeout: config.message_timeout(),
    };
    let host = Host::with_dylibs(ModulePaths::new(&config.modules_dir), services, &config.base_path);

    host.registry
        .prepare_directories()
        .with_context(|| format!("Failed to prepare modules directory {:?}", config.modules_dir))?;
    let loaded = host.registry.load_all(&config.module_order).await?;
    tracing::info!(loaded, "Modules loaded");

    let watcher = host.watch().context("Failed to watch modules directory")?;
    let cleanup = spawn_session_cleanup(sessions.clone(), SESSION_CLEANUP_INTERVAL);

    let state = GatewayState::new(host.clone())
        .with_sessions(sessions)
        .with_max_body_size(config.max_body_size);
    let app = create_gateway_router(Arc::new(state));

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutting down");
    watcher.shutdown();
    cleanup.abort();
    host.registry.unload_all().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}
