//! Connected downstream clients and per-frame symbol filtering.

use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::sync::RwLock;

/// Inbound control frame from a downstream client.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientCommand {
    Subscribe { symbols: Vec<String> },
    Unsubscribe { symbols: Vec<String> },
}

/// One connected client: its subscribed symbols and outbound queue.
#[derive(Debug)]
struct ClientHandle {
    symbols: HashSet<String>,
    tx: mpsc::Sender<String>,
}

/// Registry of connected WS clients.
///
/// Many-reader, occasional-writer: client add/remove and subscription edits
/// mutate; per-frame fan-out only reads. Forwards are best-effort over each
/// client's bounded queue; a full queue marks the client for disconnect and
/// is never retried.
#[derive(Default)]
pub struct ClientRegistry {
    clients: RwLock<HashMap<u64, ClientHandle>>,
    next_id: AtomicU64,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client with its initial symbol set (uppercased on entry).
    /// Returns the client id.
    pub async fn register(&self, symbols: Vec<String>, tx: mpsc::Sender<String>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let symbols: HashSet<String> = symbols.into_iter().map(|s| s.to_uppercase()).collect();
        let mut clients = self.clients.write().await;
        clients.insert(id, ClientHandle { symbols, tx });
        tracing::info!(client_id = id, total = clients.len(), "client connected");
        id
    }

    pub async fn unregister(&self, id: u64) {
        let mut clients = self.clients.write().await;
        if clients.remove(&id).is_some() {
            tracing::info!(client_id = id, total = clients.len(), "client disconnected");
        }
    }

    /// Apply a subscribe/unsubscribe control frame for one client.
    pub async fn apply_command(&self, id: u64, command: ClientCommand) {
        let mut clients = self.clients.write().await;
        let Some(client) = clients.get_mut(&id) else {
            return;
        };
        match command {
            ClientCommand::Subscribe { symbols } => {
                for symbol in symbols {
                    client.symbols.insert(symbol.to_uppercase());
                }
            }
            ClientCommand::Unsubscribe { symbols } => {
                for symbol in symbols {
                    client.symbols.remove(&symbol.to_uppercase());
                }
            }
        }
    }

    /// Symbols a client is currently subscribed to.
    pub async fn symbols_of(&self, id: u64) -> Vec<String> {
        let clients = self.clients.read().await;
        clients
            .get(&id)
            .map(|client| {
                let mut symbols: Vec<String> = client.symbols.iter().cloned().collect();
                symbols.sort();
                symbols
            })
            .unwrap_or_default()
    }

    /// Union of all client subscription sets; this is what the upstream
    /// connection must cover.
    pub async fn union(&self) -> HashSet<String> {
        let clients = self.clients.read().await;
        clients
            .values()
            .flat_map(|client| client.symbols.iter().cloned())
            .collect()
    }

    /// Fan a frame out to every client subscribed to `symbol`; a frame
    /// whose symbol could not be extracted goes to everyone.
    ///
    /// Returns the ids of clients whose queue overflowed; the caller must
    /// unregister them (dropping the sender closes their connection).
    pub async fn fan_out(&self, frame: &str, symbol: Option<&str>) -> Vec<u64> {
        let clients = self.clients.read().await;
        let mut overflowed = Vec::new();

        for (id, client) in clients.iter() {
            if let Some(symbol) = symbol {
                if !client.symbols.contains(symbol) {
                    continue;
                }
            }
            match client.tx.try_send(frame.to_string()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(client_id = id, "client send queue full, disconnecting");
                    overflowed.push(*id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    overflowed.push(*id);
                }
            }
        }

        overflowed
    }

    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.clients.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(capacity: usize) -> (mpsc::Sender<String>, mpsc::Receiver<String>) {
        mpsc::channel(capacity)
    }

    #[tokio::test]
    async fn test_register_uppercases_symbols() {
        let registry = ClientRegistry::new();
        let (tx, _rx) = channel(8);
        let id = registry
            .register(vec!["btcusdt".to_string(), "EthUsdt".to_string()], tx)
            .await;

        assert_eq!(
            registry.symbols_of(id).await,
            vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]
        );
    }

    #[tokio::test]
    async fn test_union_across_clients() {
        let registry = ClientRegistry::new();
        let (tx_a, _rx_a) = channel(8);
        let (tx_b, _rx_b) = channel(8);
        let a = registry.register(vec!["BTCUSDT".to_string()], tx_a).await;
        let b = registry.register(vec!["ETHUSDT".to_string()], tx_b).await;

        let union = registry.union().await;
        assert!(union.contains("BTCUSDT") && union.contains("ETHUSDT"));

        registry.unregister(b).await;
        let union = registry.union().await;
        assert!(union.contains("BTCUSDT") && !union.contains("ETHUSDT"));

        registry.unregister(a).await;
        assert!(registry.union().await.is_empty());
    }

    #[tokio::test]
    async fn test_fan_out_filters_by_symbol() {
        let registry = ClientRegistry::new();
        let (tx_a, mut rx_a) = channel(8);
        let (tx_b, mut rx_b) = channel(8);
        registry.register(vec!["BTCUSDT".to_string()], tx_a).await;
        registry.register(vec!["ETHUSDT".to_string()], tx_b).await;

        let overflowed = registry.fan_out("frame", Some("BTCUSDT")).await;
        assert!(overflowed.is_empty());

        assert_eq!(rx_a.try_recv().unwrap(), "frame");
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_fan_out_malformed_goes_to_all() {
        let registry = ClientRegistry::new();
        let (tx_a, mut rx_a) = channel(8);
        let (tx_b, mut rx_b) = channel(8);
        registry.register(vec!["BTCUSDT".to_string()], tx_a).await;
        registry.register(vec!["ETHUSDT".to_string()], tx_b).await;

        registry.fan_out("junk", None).await;
        assert_eq!(rx_a.try_recv().unwrap(), "junk");
        assert_eq!(rx_b.try_recv().unwrap(), "junk");
    }

    #[tokio::test]
    async fn test_fan_out_reports_overflow() {
        let registry = ClientRegistry::new();
        let (tx, _rx) = channel(1);
        let id = registry.register(vec!["BTCUSDT".to_string()], tx).await;

        assert!(registry.fan_out("one", Some("BTCUSDT")).await.is_empty());
        let overflowed = registry.fan_out("two", Some("BTCUSDT")).await;
        assert_eq!(overflowed, vec![id]);
    }

    #[tokio::test]
    async fn test_subscribe_unsubscribe_commands() {
        let registry = ClientRegistry::new();
        let (tx, _rx) = channel(8);
        let id = registry.register(vec!["BTCUSDT".to_string()], tx).await;

        registry
            .apply_command(
                id,
                ClientCommand::Subscribe {
                    symbols: vec!["ethusdt".to_string()],
                },
            )
            .await;
        assert_eq!(
            registry.symbols_of(id).await,
            vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]
        );

        registry
            .apply_command(
                id,
                ClientCommand::Unsubscribe {
                    symbols: vec!["BTCUSDT".to_string()],
                },
            )
            .await;
        assert_eq!(registry.symbols_of(id).await, vec!["ETHUSDT".to_string()]);
    }

    #[test]
    fn test_control_frame_parsing() {
        let command: ClientCommand =
            serde_json::from_str(r#"{"type":"subscribe","symbols":["BTCUSDT"]}"#).unwrap();
        assert_eq!(
            command,
            ClientCommand::Subscribe {
                symbols: vec!["BTCUSDT".to_string()]
            }
        );

        assert!(serde_json::from_str::<ClientCommand>(r#"{"type":"nope"}"#).is_err());
    }
}
