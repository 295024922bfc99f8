use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;

use gateway_core::cache::DepthCache;
use gateway_core::config::MAX_DEPTH_LIMIT;
use gateway_core::types::DepthSource;

use crate::commands::serve::{middleware::AppError, models::DepthResponse, state::AppState};

const DEFAULT_LIMIT: u32 = 100;

#[derive(Debug, Deserialize)]
pub struct DepthQuery {
    pub limit: Option<u32>,
}

/// GET /api/depth/:symbol?limit=N
///
/// Serves from cache while the symbol is throttled, otherwise fetches from
/// the upstream; a failed fetch falls back to any cached snapshot, and only
/// an empty cache surfaces a 503 with the current backoff as `retryAfter`.
pub async fn get_depth(
    State(state): State<AppState>,
    Path(symbol): Path<String>,
    Query(query): Query<DepthQuery>,
) -> Result<Json<DepthResponse>, AppError> {
    let symbol = symbol.trim().to_uppercase();
    if symbol.is_empty() {
        return Err(AppError::bad_request("symbol is required"));
    }
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_DEPTH_LIMIT);

    if state.throttle.should_throttle(&symbol).await {
        if let Some((snapshot, age_ms)) = state.cache.get(&symbol).await {
            if DepthCache::is_serveable(age_ms) {
                tracing::debug!(symbol, age_ms, "serving throttled request from cache");
                return Ok(Json(DepthResponse::from_snapshot(
                    &snapshot,
                    limit,
                    DepthSource::Cache,
                )));
            }
        }
    }

    if let Some(snapshot) = state.client.fetch_depth(&symbol, limit).await {
        return Ok(Json(DepthResponse::from_snapshot(
            &snapshot,
            limit,
            DepthSource::Binance,
        )));
    }

    // Upstream failed: any cached snapshot beats an error.
    if let Some((snapshot, age_ms)) = state.cache.get(&symbol).await {
        tracing::debug!(symbol, age_ms, "upstream fetch failed, serving stale cache");
        return Ok(Json(DepthResponse::from_snapshot(
            &snapshot,
            limit,
            DepthSource::Cache,
        )));
    }

    Err(AppError::ServiceUnavailable {
        retry_after_ms: state.throttle.backoff_ms(&symbol).await,
        symbol,
    })
}
