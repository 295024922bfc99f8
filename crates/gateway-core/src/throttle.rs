//! Per-symbol REST rate-limit tracking with exponential backoff.
//!
//! The upstream REST endpoint rate-limits aggressively, so every call site
//! records its outcome here and asks `should_throttle` before the next call.
//! Backoff doubles on 429/418 and on transport errors, resets on success,
//! and is bounded to `[MIN_BACKOFF_MS, MAX_BACKOFF_MS]` at all times.

use std::collections::HashMap;
use std::time::Instant;
use tokio::sync::Mutex;

use crate::config::{MAX_BACKOFF_MS, MIN_BACKOFF_MS, RATE_LIMIT_INTERVAL_MS};

#[derive(Debug, Clone, Copy)]
struct ThrottleEntry {
    last_request: Instant,
    backoff_ms: u64,
}

/// Tracks the most recent upstream REST call and backoff state per symbol.
#[derive(Default)]
pub struct RestThrottle {
    entries: Mutex<HashMap<String, ThrottleEntry>>,
}

impl RestThrottle {
    pub fn new() -> Self {
        Self::default()
    }

    /// True if the next call for `symbol` should be held back.
    ///
    /// The window is `max(RATE_LIMIT_INTERVAL_MS, backoff_ms)` since the
    /// last recorded request; a symbol with no history is never throttled.
    pub async fn should_throttle(&self, symbol: &str) -> bool {
        let entries = self.entries.lock().await;
        match entries.get(symbol) {
            Some(entry) => {
                let window_ms = RATE_LIMIT_INTERVAL_MS.max(entry.backoff_ms);
                (entry.last_request.elapsed().as_millis() as u64) < window_ms
            }
            None => false,
        }
    }

    /// Record a successful upstream call: stamp the request time and reset
    /// backoff to the minimum.
    pub async fn on_success(&self, symbol: &str) {
        let mut entries = self.entries.lock().await;
        entries.insert(
            symbol.to_string(),
            ThrottleEntry {
                last_request: Instant::now(),
                backoff_ms: MIN_BACKOFF_MS,
            },
        );
    }

    /// Record an HTTP 429/418 response: double the backoff.
    pub async fn on_rate_limited(&self, symbol: &str) {
        self.bump(symbol).await;
        let backoff_ms = self.backoff_ms(symbol).await;
        tracing::warn!(symbol, backoff_ms, "upstream rate limit hit");
    }

    /// Record any other upstream failure. Same backoff policy as a rate
    /// limit: the upstream may be shedding load without saying so.
    pub async fn on_error(&self, symbol: &str) {
        self.bump(symbol).await;
    }

    /// Current backoff for `symbol`, for 503 `retryAfter` and diagnostics.
    pub async fn backoff_ms(&self, symbol: &str) -> u64 {
        let entries = self.entries.lock().await;
        entries
            .get(symbol)
            .map(|entry| entry.backoff_ms)
            .unwrap_or(MIN_BACKOFF_MS)
    }

    async fn bump(&self, symbol: &str) {
        let mut entries = self.entries.lock().await;
        let entry = entries.entry(symbol.to_string()).or_insert(ThrottleEntry {
            last_request: Instant::now(),
            backoff_ms: MIN_BACKOFF_MS,
        });
        entry.last_request = Instant::now();
        entry.backoff_ms = (entry.backoff_ms * 2).min(MAX_BACKOFF_MS);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unknown_symbol_not_throttled() {
        let throttle = RestThrottle::new();
        assert!(!throttle.should_throttle("BTCUSDT").await);
        assert_eq!(throttle.backoff_ms("BTCUSDT").await, MIN_BACKOFF_MS);
    }

    #[tokio::test]
    async fn test_throttled_right_after_success() {
        let throttle = RestThrottle::new();
        throttle.on_success("BTCUSDT").await;
        assert!(throttle.should_throttle("BTCUSDT").await);
        // Other symbols are unaffected.
        assert!(!throttle.should_throttle("ETHUSDT").await);
    }

    #[tokio::test]
    async fn test_backoff_doubles_and_caps() {
        let throttle = RestThrottle::new();

        throttle.on_rate_limited("BTCUSDT").await;
        assert_eq!(throttle.backoff_ms("BTCUSDT").await, 2 * MIN_BACKOFF_MS);

        throttle.on_error("BTCUSDT").await;
        assert_eq!(throttle.backoff_ms("BTCUSDT").await, 4 * MIN_BACKOFF_MS);

        for _ in 0..10 {
            throttle.on_rate_limited("BTCUSDT").await;
        }
        assert_eq!(throttle.backoff_ms("BTCUSDT").await, MAX_BACKOFF_MS);
    }

    #[tokio::test]
    async fn test_success_resets_backoff() {
        let throttle = RestThrottle::new();
        for _ in 0..5 {
            throttle.on_error("BTCUSDT").await;
        }
        throttle.on_success("BTCUSDT").await;
        assert_eq!(throttle.backoff_ms("BTCUSDT").await, MIN_BACKOFF_MS);
    }

    #[tokio::test]
    async fn test_bounds_hold() {
        let throttle = RestThrottle::new();
        for _ in 0..20 {
            throttle.on_rate_limited("BTCUSDT").await;
            let backoff = throttle.backoff_ms("BTCUSDT").await;
            assert!((MIN_BACKOFF_MS..=MAX_BACKOFF_MS).contains(&backoff));
        }
    }
}
