use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

use gateway_core::types::{DepthSnapshot, DepthSource, UpstreamState};

/// Custom serializer for DateTime<Utc> to UNIX timestamp in milliseconds
fn serialize_timestamp_as_millis<S>(dt: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_i64(dt.timestamp_millis())
}

/// Depth snapshot response for `/api/depth/:symbol`.
///
/// Bid/ask pairs are forwarded exactly as the upstream produced them.
#[derive(Debug, Serialize)]
pub struct DepthResponse {
    #[serde(rename = "lastUpdateId")]
    pub last_update_id: u64,
    pub bids: Vec<(String, String)>,
    pub asks: Vec<(String, String)>,
    #[serde(rename = "cachedAt", serialize_with = "serialize_timestamp_as_millis")]
    pub cached_at: DateTime<Utc>,
    pub source: DepthSource,
}

impl DepthResponse {
    /// Build a response from a snapshot, truncated to `limit` levels per side.
    pub fn from_snapshot(snapshot: &DepthSnapshot, limit: u32, source: DepthSource) -> Self {
        let limit = limit as usize;
        Self {
            last_update_id: snapshot.last_update_id,
            bids: snapshot.bids.iter().take(limit).cloned().collect(),
            asks: snapshot.asks.iter().take(limit).cloned().collect(),
            cached_at: snapshot.cached_at,
            source,
        }
    }
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub ok: bool,
    /// Seconds since process start.
    pub uptime: u64,
    #[serde(rename = "wsClients")]
    pub ws_clients: usize,
    #[serde(rename = "binanceWsState")]
    pub binance_ws_state: UpstreamState,
    #[serde(rename = "cacheSize")]
    pub cache_size: usize,
    #[serde(rename = "activeSymbols")]
    pub active_symbols: Vec<String>,
}

/// One-shot greeting sent to every WS client on connect.
#[derive(Debug, Serialize)]
pub struct ConnectedFrame {
    #[serde(rename = "type")]
    pub frame_type: &'static str,
    pub symbols: Vec<String>,
    pub timestamp: i64,
}

impl ConnectedFrame {
    pub fn new(symbols: Vec<String>) -> Self {
        Self {
            frame_type: "connected",
            symbols,
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

/// Error response structure
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}
