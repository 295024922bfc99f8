//! Gateway-wide constants and runtime configuration.

use std::time::Duration;

/// Minimum per-symbol REST backoff.
pub const MIN_BACKOFF_MS: u64 = 2_000;

/// Maximum per-symbol REST backoff.
pub const MAX_BACKOFF_MS: u64 = 30_000;

/// Minimum spacing between upstream REST calls for one symbol.
pub const RATE_LIMIT_INTERVAL_MS: u64 = 500;

/// Age below which a cached snapshot is considered fresh.
pub const CACHE_TTL_MS: u64 = 5_000;

/// A snapshot older than fresh but younger than this is still serveable.
pub const CACHE_SERVEABLE_MS: u64 = 2 * CACHE_TTL_MS;

/// Hard cap on buffered diff events per symbol.
pub const MAX_BUFFER: usize = 2_000;

/// Upper bound on the upstream WS reconnect delay.
pub const MAX_RECONNECT_DELAY_MS: u64 = 30_000;

/// Largest depth the upstream REST endpoint accepts.
pub const MAX_DEPTH_LIMIT: u32 = 1_000;

/// Per-client outbound queue capacity, in frames.
pub const CLIENT_QUEUE_CAPACITY: usize = 1_000;

/// Deadline for a single client WS send.
pub const CLIENT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Snapshot scheduler tick.
pub const SCHEDULER_TICK: Duration = Duration::from_millis(100);

/// Hard timeout for one snapshot fetch.
pub const SNAPSHOT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a book outlives its last subscriber.
pub const BOOK_IDLE_GRACE: Duration = Duration::from_secs(60);

/// Runtime configuration for the gateway process.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Host to bind the HTTP/WS listener to.
    pub host: String,

    /// Port to bind the HTTP/WS listener to.
    pub port: u16,

    /// Allowed CORS origins; empty means any origin (development mode).
    pub allowed_origins: Vec<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8787,
            allowed_origins: Vec::new(),
        }
    }
}
