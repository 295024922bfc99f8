use axum::{routing::get, Router};

use crate::commands::serve::{handlers, state::AppState};

/// Create the gateway router: the bounded-depth REST surface, the health
/// probe, and the WS fan-out upgrade.
pub fn create_routes(state: AppState) -> Router {
    Router::new()
        .route("/api/depth/:symbol", get(handlers::depth::get_depth))
        .route("/health", get(handlers::health::health_check))
        .route("/ws", get(handlers::ws::ws_handler))
        .with_state(state)
}
