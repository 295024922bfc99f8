use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

use gateway_core::cache::DepthCache;
use gateway_core::config::{MAX_DEPTH_LIMIT, SNAPSHOT_FETCH_TIMEOUT};
use gateway_core::scheduler::SnapshotSource;
use gateway_core::throttle::RestThrottle;
use gateway_core::types::DepthSnapshot;

use crate::error::UpstreamError;

const BASE_URL: &str = "https://fapi.binance.com";

/// REST depth payload: `{"lastUpdateId":..., "bids":[["p","q"],...], ...}`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RestDepthResponse {
    last_update_id: u64,
    bids: Vec<(String, String)>,
    asks: Vec<(String, String)>,
}

/// Bounded-depth snapshot fetcher over the futures REST API.
///
/// One shot per call: the outcome is recorded with the rate-limit tracker
/// and successes are written through to the depth cache, but retries are
/// always driven by callers. HTTP 429/418 double the symbol's backoff; any
/// other failure (bad status, transport, malformed payload) is classified
/// as a plain error with the same backoff policy.
pub struct BinanceClient {
    base_url: String,
    client: reqwest::Client,
    cache: Arc<DepthCache>,
    throttle: Arc<RestThrottle>,
}

impl BinanceClient {
    pub fn new(cache: Arc<DepthCache>, throttle: Arc<RestThrottle>) -> Self {
        Self::with_base_url(BASE_URL.to_string(), cache, throttle)
    }

    /// Custom base URL, for the testnet and for tests.
    pub fn with_base_url(
        base_url: String,
        cache: Arc<DepthCache>,
        throttle: Arc<RestThrottle>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(SNAPSHOT_FETCH_TIMEOUT)
            .build()
            .expect("reqwest client");
        Self {
            base_url,
            client,
            cache,
            throttle,
        }
    }

    /// Fetch a depth snapshot. Returns None on any failure after recording
    /// the outcome; see the type-level docs for the classification.
    pub async fn fetch_depth(&self, symbol: &str, limit: u32) -> Option<DepthSnapshot> {
        match self.try_fetch(symbol, limit).await {
            Ok(snapshot) => {
                self.throttle.on_success(symbol).await;
                self.cache.insert(snapshot.clone()).await;
                Some(snapshot)
            }
            Err(UpstreamError::RateLimited(status)) => {
                warn!(symbol, status, "depth fetch rate limited");
                self.throttle.on_rate_limited(symbol).await;
                None
            }
            Err(error) => {
                warn!(symbol, %error, "depth fetch failed");
                self.throttle.on_error(symbol).await;
                None
            }
        }
    }

    async fn try_fetch(&self, symbol: &str, limit: u32) -> Result<DepthSnapshot, UpstreamError> {
        // The upstream rejects limits below its smallest tier; fetch that
        // tier and let the response layer truncate back down.
        let limit = limit.clamp(5, MAX_DEPTH_LIMIT);
        let url = format!(
            "{}/fapi/v1/depth?symbol={}&limit={}",
            self.base_url, symbol, limit
        );
        debug!(symbol, limit, "fetching depth snapshot");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;

        let status = response.status();
        if status.as_u16() == 429 || status.as_u16() == 418 {
            return Err(UpstreamError::RateLimited(status.as_u16()));
        }
        if !status.is_success() {
            return Err(UpstreamError::Status(status.as_u16()));
        }

        let payload: RestDepthResponse = response
            .json()
            .await
            .map_err(|e| UpstreamError::Malformed(e.to_string()))?;

        Ok(DepthSnapshot {
            symbol: symbol.to_string(),
            last_update_id: payload.last_update_id,
            bids: payload.bids,
            asks: payload.asks,
            cached_at: Utc::now(),
        })
    }
}

#[async_trait]
impl SnapshotSource for BinanceClient {
    async fn fetch(&self, symbol: &str, limit: u32) -> Option<DepthSnapshot> {
        self.fetch_depth(symbol, limit).await
    }
}
