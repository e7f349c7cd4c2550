//! Gateway Pool Binary
//!
//! Opens the session pool in front of the gateway and serves the status
//! endpoint until SIGINT/SIGTERM.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin gateway-pool
//! ```
//!
//! # Environment Variables
//!
//! - `GATEWAY_HOST` / `GATEWAY_PORT`: Gateway address (default: 127.0.0.1:4002)
//! - `REGISTRY_STATE_FILE`: Allocation table path (default: gateway-pool-sessions.json)
//! - `POOL_CAPACITY_<PURPOSE>`: Connections per purpose
//! - `STATUS_PORT`: Status HTTP port (default: 8090)
//! - `POOL_SHUTDOWN_GRACE_SECS`: Lease drain time on shutdown (default: 10)
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: true)
//! - `RUST_LOG`: Log level (default: info)
//!
//! See `Settings::from_env` for the full list.

use std::sync::Arc;

use anyhow::Context;
use gateway_pool::infrastructure::telemetry;
use gateway_pool::{
    ClassificationTable, ConnectionPool, FileAllocationStore, HandshakeCoordinator, HealthMonitor,
    JsonLinesTransport, PaceManager, SessionIdRegistry, Settings, StatusServer, StatusServerState,
    init_metrics,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();

    let _telemetry_guard = telemetry::init().context("failed to initialize telemetry")?;

    tracing::info!("Starting Gateway Pool");

    let _metrics_handle = init_metrics().context("failed to install metrics recorder")?;

    let settings = Settings::from_env().context("invalid configuration")?;
    log_settings(&settings);

    let store = Arc::new(FileAllocationStore::new(&settings.store.path));
    let registry = Arc::new(
        SessionIdRegistry::open(settings.registry.clone(), store)
            .context("failed to load session id allocations")?,
    );

    let classifier = ClassificationTable::default();
    let pace = Arc::new(PaceManager::new(settings.pacing.clone(), classifier.clone()));
    let coordinator = HandshakeCoordinator::new(
        Arc::new(JsonLinesTransport::new()),
        settings.gateway.clone(),
        settings.handshake,
        Arc::new(classifier),
    );

    let pool = ConnectionPool::new(settings.pool.clone(), registry, coordinator, pace);
    let reclaimed = pool.start().context("failed to start connection pool")?;
    if !reclaimed.is_empty() {
        tracing::info!(
            session_ids = ?reclaimed,
            "Reclaimed session ids from previous run"
        );
    }
    pool.spawn_monitor(HealthMonitor::new(pool.clone(), settings.monitor));

    let server_token = CancellationToken::new();
    let status_state = Arc::new(StatusServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        pool.clone(),
    ));
    let status_server = StatusServer::new(
        settings.server.status_port,
        status_state,
        server_token.clone(),
    );
    let status_task = tokio::spawn(async move {
        if let Err(e) = status_server.run().await {
            tracing::error!(error = %e, "Status server error");
        }
    });

    tracing::info!("Gateway pool ready");

    await_shutdown_signal().await?;

    tracing::info!(
        grace_secs = settings.server.shutdown_grace.as_secs(),
        "Graceful shutdown started"
    );
    let report = pool.shutdown(settings.server.shutdown_grace).await;
    tracing::info!(
        outstanding_leases = report.outstanding_leases,
        connections_closed = report.connections_closed,
        "Connection pool stopped"
    );

    server_token.cancel();
    if let Err(e) = status_task.await {
        tracing::warn!(error = %e, "Status server task failed");
    }

    tracing::info!("Gateway pool stopped");
    Ok(())
}

/// Load .env file from current or ancestor directories.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Log the parsed configuration.
fn log_settings(settings: &Settings) {
    tracing::info!(
        gateway = %settings.gateway,
        status_port = settings.server.status_port,
        state_file = %settings.store.path.display(),
        "Configuration loaded"
    );
    for (purpose, capacity) in &settings.pool.capacity {
        tracing::debug!(
            purpose = %purpose,
            capacity,
            range = ?settings.registry.ranges.get(purpose),
            "Pool purpose"
        );
    }
}

/// Wait for SIGINT or SIGTERM.
async fn await_shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("failed to install SIGTERM handler")?;
        tokio::select! {
            result = signal::ctrl_c() => {
                result.context("failed to listen for Ctrl+C")?;
                tracing::info!("Received Ctrl+C, initiating shutdown");
            }
            _ = terminate.recv() => {
                tracing::info!("Received SIGTERM, initiating shutdown");
            }
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c()
            .await
            .context("failed to listen for Ctrl+C")?;
        tracing::info!("Received Ctrl+C, initiating shutdown");
    }

    Ok(())
}
