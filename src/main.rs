//! shmcache worker
//!
//! An HTTP worker that attaches to the shared cache arena. Start as many
//! workers as needed with the same `SHM_NAME`; the first one creates the
//! arena and the rest attach to it.

use std::net::SocketAddr;

use anyhow::Context;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use shmcache::api::create_router;
use shmcache::{spawn_gc_task, AppState, Config};

/// Main entry point for a cache worker.
///
/// # Startup Sequence
/// 1. Initialize tracing subscriber for logging
/// 2. Load and validate configuration from environment variables
/// 3. Create or attach to the shared arena
/// 4. Start the background GC task
/// 5. Create Axum router with all endpoints
/// 6. Start HTTP server on configured port
/// 7. Handle graceful shutdown on SIGINT/SIGTERM
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Defaults to "info" level, can be overridden with RUST_LOG env var
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "shmcache=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting shmcache worker (pid {})", std::process::id());

    let config = Config::from_env();
    config.validate()?;
    info!(
        "Configuration loaded: shm={} size={} segments={} default_ttl={}s gc_ttl={}s port={}",
        config.shm_name,
        config.shm_size,
        config.shm_segments,
        config.default_ttl,
        config.gc_ttl,
        config.server_port
    );

    let state = AppState::from_config(&config)
        .with_context(|| format!("failed to open shared arena {}", config.shm_name))?;
    info!(
        "Cache ready, {} worker(s) attached",
        state.cache.arena().attached()
    );

    let gc_handle = spawn_gc_task(state.cache.clone(), config.gc_interval);
    info!("Background GC task started");

    let app = create_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server_port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(gc_handle))
        .await?;

    info!("Server shutdown complete");
    Ok(())
}

/// Waits for shutdown signal (Ctrl+C or SIGTERM).
///
/// On shutdown signal, aborts the GC task and allows graceful shutdown.
async fn shutdown_signal(gc_handle: tokio::task::JoinHandle<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }

    gc_handle.abort();
    warn!("GC task aborted");
}
