//! Per-symbol snapshot cache with staleness-aware reads.

use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::config::{CACHE_SERVEABLE_MS, CACHE_TTL_MS};
use crate::types::DepthSnapshot;

/// Maps symbol to its latest REST snapshot. Writes overwrite
/// unconditionally; reads never mutate.
///
/// A snapshot has two notions of validity: *fresh* (young enough to serve
/// instead of a throttled upstream call) and *serveable* (old, but still
/// better than a 503 when the upstream is down).
#[derive(Default)]
pub struct DepthCache {
    snapshots: RwLock<HashMap<String, DepthSnapshot>>,
}

impl DepthCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the latest snapshot for its symbol.
    pub async fn insert(&self, snapshot: DepthSnapshot) {
        let mut snapshots = self.snapshots.write().await;
        snapshots.insert(snapshot.symbol.clone(), snapshot);
    }

    /// Return the cached snapshot and its age in milliseconds.
    pub async fn get(&self, symbol: &str) -> Option<(DepthSnapshot, u64)> {
        let snapshots = self.snapshots.read().await;
        snapshots.get(symbol).map(|snapshot| {
            let age_ms = Utc::now()
                .signed_duration_since(snapshot.cached_at)
                .num_milliseconds()
                .max(0) as u64;
            (snapshot.clone(), age_ms)
        })
    }

    /// Fresh: young enough to short-circuit a throttled upstream call.
    pub fn is_fresh(age_ms: u64) -> bool {
        age_ms <= CACHE_TTL_MS
    }

    /// Serveable: still acceptable as a fallback when the upstream fails.
    pub fn is_serveable(age_ms: u64) -> bool {
        age_ms <= CACHE_SERVEABLE_MS
    }

    pub async fn len(&self) -> usize {
        self.snapshots.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.snapshots.read().await.is_empty()
    }
}
