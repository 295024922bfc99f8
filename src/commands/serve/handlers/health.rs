use axum::{extract::State, Json};

use crate::commands::serve::{models::HealthResponse, state::AppState};

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let mut active_symbols: Vec<String> = state.registry.union().await.into_iter().collect();
    active_symbols.sort();

    Json(HealthResponse {
        ok: true,
        uptime: state.started_at.elapsed().as_secs(),
        ws_clients: state.registry.len().await,
        binance_ws_state: state.upstream.state(),
        cache_size: state.cache.len().await,
        active_symbols,
    })
}
