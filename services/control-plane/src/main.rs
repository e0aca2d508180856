//! fleet control plane
//!
//! Runs the workspace reconciler: periodic sweeps, the resync worker, the
//! lifecycle event feed and the health/internal HTTP endpoints.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use fleet_control_plane::{
    api,
    config::Config,
    db::{CleanupWorker, CleanupWorkerConfig, Database, WorkspaceEventFeed, WorkspaceEventFeedConfig},
    engine::{resync_queue, EngineDeps, EventBus, EventListener, SweepWorker, SyncWorker, WorkspaceManager},
    node_client::HttpNodeFactory,
    registry::HttpRegistryClient,
    state::AppState,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // RUST_LOG wins over FLEET_LOG_LEVEL.
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(listen_addr = %config.listen_addr, "Starting fleet control plane");

    let db = match Database::connect(&config.database).await {
        Ok(db) => db,
        Err(e) => {
            error!(error = %e, "Failed to connect to database");
            return Err(e.into());
        }
    };

    if config.dev_mode {
        if let Err(e) = db.run_migrations().await {
            error!(error = %e, "Failed to run migrations");
            return Err(e.into());
        }
    }

    let leases = Arc::new(db.leases());
    let deps = EngineDeps {
        workspaces: Arc::new(db.workspace_store()),
        nodes: Arc::new(db.node_registry()),
        clients: Arc::new(
            HttpNodeFactory::new(config.node_api_timeout).context("building node API client")?,
        ),
        registries: Arc::new(db.registry_resolver()),
        registry_client: Arc::new(
            HttpRegistryClient::new(config.node_api_timeout).context("building registry client")?,
        ),
        images: Arc::new(db.image_catalog()),
        locks: leases.clone(),
        counters: leases,
    };

    let (resync, receiver) = resync_queue();
    let manager = WorkspaceManager::new(deps, config.engine.clone(), resync);
    let bus = EventBus::default();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut workers: Vec<(&str, JoinHandle<()>)> = Vec::new();

    let sync_worker = SyncWorker::new(manager.clone(), receiver, config.sync_concurrency);
    workers.push((
        "sync worker",
        tokio::spawn(sync_worker.run(shutdown_rx.clone())),
    ));

    let sweeps = SweepWorker::new(
        manager.clone(),
        config.auto_stop_interval,
        config.sync_interval,
    );
    workers.push(("sweep worker", {
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move { sweeps.run(shutdown_rx).await })
    }));

    let listener = EventListener::new(manager.clone(), &bus);
    workers.push((
        "event listener",
        tokio::spawn(listener.run(shutdown_rx.clone())),
    ));

    let feed = WorkspaceEventFeed::new(
        db.pool().clone(),
        bus.clone(),
        WorkspaceEventFeedConfig::default(),
    );
    workers.push(("event feed", {
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = feed.run(shutdown_rx).await {
                error!(error = %e, "Workspace event feed failed");
            }
        })
    }));

    let cleanup = CleanupWorker::new(db.pool().clone(), CleanupWorkerConfig::default());
    workers.push(("cleanup worker", {
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move { cleanup.run(shutdown_rx).await })
    }));

    let app = api::create_router(AppState::new(db, manager));
    let tcp = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    let server_handle = tokio::spawn(async move {
        let mut shutdown_rx = shutdown_rx;
        axum::serve(tcp, app)
            .with_graceful_shutdown(async move {
                while !*shutdown_rx.borrow() {
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);

    let shutdown_timeout = Duration::from_secs(10);
    for (name, handle) in workers {
        if tokio::time::timeout(shutdown_timeout, handle).await.is_err() {
            warn!(worker = name, "Worker did not shut down in time");
        }
    }

    info!("Control plane shutdown complete");
    Ok(())
}
