mod handlers;
mod middleware;
mod models;
pub mod routes;
pub mod state;

use anyhow::Result;
use axum::http::{header, HeaderValue, Method};
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::commands::serve::{routes::create_routes, state::AppState};
use gateway_core::config::GatewayConfig;

/// Execute the serve command - start the gateway server
pub async fn execute(config: GatewayConfig) -> Result<()> {
    tracing::info!("Starting depth gateway on {}:{}", config.host, config.port);

    let state = AppState::new();
    let app = create_routes(state.clone());

    // Add middleware layers
    let app = app.layer(
        ServiceBuilder::new()
            // Logging layer for request/response tracing
            .layer(TraceLayer::new_for_http())
            .layer(build_cors(&config.allowed_origins))
            // Timeout layer - 30 second timeout for requests
            .layer(TimeoutLayer::new(Duration::from_secs(30))),
    );

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Gateway listening on http://{}", addr);
    tracing::info!("Health check available at: http://{}/health", addr);
    tracing::info!("Depth endpoint available at: http://{}/api/depth/:symbol", addr);
    tracing::info!("WebSocket endpoint available at: ws://{}/ws", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state))
        .await?;

    tracing::info!("Gateway stopped");
    Ok(())
}

/// Permissive CORS in development; exact allow-list with credentials when
/// origins are configured.
fn build_cors(origins: &[String]) -> CorsLayer {
    if origins.is_empty() {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
    }

    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    CorsLayer::new()
        .allow_origin(parsed)
        .allow_methods([Method::GET])
        .allow_headers([header::CONTENT_TYPE])
        .allow_credentials(true)
}

/// Wait for SIGINT/SIGTERM, then stop accepting clients, shut the upstream
/// coordinator down, and close all client connections via the shutdown
/// broadcast. A straggler that refuses to drain cannot hold the process
/// past the grace window.
async fn shutdown_signal(state: AppState) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received");
    let _ = state.shutdown_tx.send(());
    state.upstream.shutdown();

    tokio::spawn(async {
        tokio::time::sleep(Duration::from_secs(2)).await;
        tracing::warn!("shutdown grace elapsed, exiting");
        std::process::exit(0);
    });
}
