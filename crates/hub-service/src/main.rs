//! Rendezvous Hub
//!
//! WebSocket server that tracks room membership, arbitrates screen-share
//! ownership and relays signaling between mesh participants.
//!
//! # Endpoints
//!
//! One listener (default: 0.0.0.0:4000) serves:
//! - `GET /ws` - client signaling
//! - `GET /health`, `GET /ready` - probes
//! - `GET /metrics` - Prometheus text
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize tracing
//! 3. Initialize Prometheus metrics recorder
//! 4. Spawn the `HubActor`
//! 5. Bind the listener and serve until a shutdown signal

#![warn(clippy::pedantic)]
#![allow(clippy::too_many_lines)] // main.rs orchestrates startup, naturally longer

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use hub_service::actors::{ActorMetrics, HubActor};
use hub_service::config::Config;
use hub_service::observability::{health_router, init_metrics_recorder, HealthState};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Configuration first: the log format depends on it
    let config = Config::from_env().map_err(|e| {
        eprintln!("Failed to load configuration: {e}");
        e
    })?;

    let level = &config.observability.log_level;
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("hub_service={level},tower_http={level}").into());

    if config.observability.json_logs {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    info!("Starting Rendezvous Hub");

    info!(
        hub_id = %config.hub_id,
        bind_address = %config.bind_address,
        connection_buffer = config.connection_buffer,
        shutdown_grace_seconds = config.shutdown_grace_seconds,
        "Configuration loaded successfully"
    );

    // Must happen before any metrics are recorded
    info!("Initializing Prometheus metrics recorder...");
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        e
    })?;
    info!("Prometheus metrics recorder initialized");

    let health_state = Arc::new(HealthState::new());

    // Initialize actor system
    info!("Initializing actor system...");
    let root_token = CancellationToken::new();
    let actor_metrics = ActorMetrics::new();
    let (hub, hub_task) = HubActor::spawn(
        config.hub_id.clone(),
        root_token.clone(),
        config.connection_buffer,
        Arc::clone(&actor_metrics),
    );
    info!("Actor system initialized");

    let metrics_router = Router::new().route(
        "/metrics",
        axum::routing::get(move || {
            let handle = prometheus_handle.clone();
            async move { handle.render() }
        }),
    );

    let app = hub_service::ws::router(hub.clone())
        .merge(health_router(Arc::clone(&health_state)))
        .merge(metrics_router)
        .layer(TraceLayer::new_for_http());

    // Bind listener before serving to fail fast on bind errors
    let listener = tokio::net::TcpListener::bind(config.bind_address)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %config.bind_address, "Failed to bind listener");
            format!("Failed to bind listener to {}: {e}", config.bind_address)
        })?;
    info!(addr = %config.bind_address, "Listener bound successfully");

    let server_token = root_token.child_token();
    let server = tokio::spawn(async move {
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            server_token.cancelled().await;
            info!("HTTP server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "HTTP server failed");
        }
    });

    health_state.set_ready();
    info!("Rendezvous Hub running - press Ctrl+C to shutdown");

    shutdown_signal().await;

    info!("Shutdown signal received, initiating graceful shutdown...");

    // Mark as not ready immediately so load balancers stop sending traffic
    health_state.set_not_ready();

    // Propagates to the hub, every connection actor and the HTTP server
    root_token.cancel();

    let grace = Duration::from_secs(config.shutdown_grace_seconds);
    match tokio::time::timeout(grace, hub_task).await {
        Ok(Ok(())) => info!("Hub actor stopped cleanly"),
        Ok(Err(e)) => warn!(error = ?e, "Hub actor task panicked during shutdown"),
        Err(_) => warn!(
            grace_seconds = config.shutdown_grace_seconds,
            "Hub actor shutdown timed out"
        ),
    }

    if tokio::time::timeout(grace, server).await.is_err() {
        warn!("HTTP server shutdown timed out");
    }

    info!(
        connections_at_exit = actor_metrics.connection_count(),
        "Rendezvous Hub shutdown complete"
    );
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
///
/// # Panics
///
/// Panics if signal handlers cannot be installed. This is acceptable because
/// without signal handlers, we cannot gracefully shut down the service.
async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
