use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;

use gateway_binance::{BinanceClient, UpstreamHandle, UpstreamStreamManager};
use gateway_core::book::BookManager;
use gateway_core::cache::DepthCache;
use gateway_core::registry::ClientRegistry;
use gateway_core::scheduler::{SnapshotScheduler, SnapshotSource};
use gateway_core::throttle::RestThrottle;

/// Shared application state passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub cache: Arc<DepthCache>,
    pub throttle: Arc<RestThrottle>,
    pub client: Arc<BinanceClient>,
    pub books: Arc<BookManager>,
    pub registry: Arc<ClientRegistry>,
    pub upstream: UpstreamHandle,
    pub started_at: Instant,
    pub shutdown_tx: broadcast::Sender<()>,
}

impl AppState {
    /// Wire the gateway together: cache + throttle feed the REST fetcher,
    /// the upstream coordinator feeds registry fan-out and book engines,
    /// and the snapshot scheduler drives resynchronization.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Same wiring against a custom upstream REST base URL (testnet, tests).
    #[allow(dead_code)]
    pub fn with_rest_base_url(base_url: String) -> Self {
        Self::build(Some(base_url))
    }

    fn build(rest_base_url: Option<String>) -> Self {
        let cache = Arc::new(DepthCache::new());
        let throttle = Arc::new(RestThrottle::new());
        let client = Arc::new(match rest_base_url {
            Some(base_url) => {
                BinanceClient::with_base_url(base_url, cache.clone(), throttle.clone())
            }
            None => BinanceClient::new(cache.clone(), throttle.clone()),
        });
        let books = Arc::new(BookManager::new());
        let registry = Arc::new(ClientRegistry::new());
        let upstream = UpstreamStreamManager::spawn(registry.clone(), books.clone());
        let (shutdown_tx, _) = broadcast::channel(1);

        let scheduler = SnapshotScheduler::new(
            books.clone(),
            registry.clone(),
            client.clone() as Arc<dyn SnapshotSource>,
        );
        tokio::spawn(scheduler.run(shutdown_tx.subscribe()));

        Self {
            cache,
            throttle,
            client,
            books,
            registry,
            upstream,
            started_at: Instant::now(),
            shutdown_tx,
        }
    }

    /// Recompute the upstream subscription set after any client change.
    /// The upstream coordinator re-dials only when the union differs from
    /// what it is currently subscribed to.
    pub async fn recompute_subscriptions(&self) {
        let union = self.registry.union().await;
        self.books.sync_symbols(&union).await;
        self.upstream.set_symbols(union);
    }
}
