//! Serialized snapshot scheduling across symbols.
//!
//! The upstream REST endpoint rate-limits aggressively when per-symbol
//! calls fan out concurrently, so snapshot fetches are dispatched one at a
//! time process-wide. Each tick collects the symbols whose books are due
//! (needs resync, none in flight, backoff elapsed) and works through them
//! serially.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;

use crate::book::BookManager;
use crate::config::{MAX_DEPTH_LIMIT, SCHEDULER_TICK};
use crate::registry::ClientRegistry;
use crate::types::DepthSnapshot;

/// Ticks between idle-book pruning passes (~10 s at the 100 ms tick).
const PRUNE_EVERY: u64 = 100;

/// Where snapshots come from. The REST fetcher implements this; tests plug
/// in canned responses.
///
/// `fetch` returns None on any failure (rate limit, transport, malformed
/// payload) after recording the outcome with the rate-limit tracker; it
/// never retries internally.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch(&self, symbol: &str, limit: u32) -> Option<DepthSnapshot>;
}

/// Drives book resynchronization: one snapshot in flight process-wide.
pub struct SnapshotScheduler {
    books: Arc<BookManager>,
    registry: Arc<ClientRegistry>,
    source: Arc<dyn SnapshotSource>,
}

impl SnapshotScheduler {
    pub fn new(
        books: Arc<BookManager>,
        registry: Arc<ClientRegistry>,
        source: Arc<dyn SnapshotSource>,
    ) -> Self {
        Self {
            books,
            registry,
            source,
        }
    }

    /// Run until the shutdown signal fires.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(SCHEDULER_TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ticks: u64 = 0;

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("snapshot scheduler shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    self.tick().await;
                    ticks += 1;
                    if ticks % PRUNE_EVERY == 0 {
                        let active = self.registry.union().await;
                        self.maintain(&active).await;
                    }
                }
            }
        }
    }

    /// One scheduling pass: dispatch every due symbol, strictly serially.
    pub async fn tick(&self) {
        let due = self.books.resync_due().await;
        for symbol in due {
            if !self.books.begin_resync(&symbol).await {
                continue;
            }

            match self.source.fetch(&symbol, MAX_DEPTH_LIMIT).await {
                Some(snapshot) => match self.books.commit_snapshot(&symbol, &snapshot).await {
                    Some(Ok(replayed)) => {
                        tracing::debug!(symbol, replayed, "resync complete");
                    }
                    Some(Err(error)) => {
                        tracing::warn!(symbol, %error, "snapshot replay failed, will retry");
                    }
                    // Book was pruned while the fetch was in flight.
                    None => {}
                },
                None => {
                    self.books.fail_resync(&symbol).await;
                }
            }
        }
    }

    /// Housekeeping pass: prune idle books, report counters.
    pub async fn maintain(&self, active: &HashSet<String>) {
        self.books.prune_idle(active).await;
        let stats = self.books.stats();
        let books = self.books.len().await;
        tracing::debug!(
            applied = stats.applied,
            buffered = stats.buffered,
            dropped = stats.dropped,
            gaps = stats.gaps,
            books,
            "book manager counters"
        );
    }
}
