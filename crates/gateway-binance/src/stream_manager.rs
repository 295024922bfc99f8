//! Single shared upstream WebSocket: lifecycle, reconnect, stream-set
//! diffing.
//!
//! One coordinator task owns at most one connection to the combined-stream
//! endpoint. Whenever the subscription union changes, the connection is
//! closed and re-dialed with the new stream set; an abnormal close with
//! clients still attached reconnects under exponential backoff with jitter.
//! Frames are forwarded to the client registry in arrival order, and depth
//! updates are additionally tapped into the book engines.

use futures::{SinkExt, StreamExt};
use rand::Rng;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use url::Url;

use gateway_core::book::BookManager;
use gateway_core::config::MAX_RECONNECT_DELAY_MS;
use gateway_core::registry::ClientRegistry;
use gateway_core::types::UpstreamState;

use crate::ws_types::{CombinedFrame, DepthUpdateEvent};

const WS_BASE_URL: &str = "wss://fstream.binance.com";

/// Interval between our keepalive pings.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// The connection is dead after this long without a pong (two missed).
const PONG_DEADLINE: Duration = Duration::from_secs(60);

const STATE_DISCONNECTED: u8 = 0;
const STATE_CONNECTING: u8 = 1;
const STATE_CONNECTED: u8 = 2;

#[derive(Debug)]
enum Command {
    SetSymbols(HashSet<String>),
    Shutdown,
}

enum CloseReason {
    /// Subscription set changed; re-dial immediately.
    Resubscribe,
    /// Abnormal close or transport error; reconnect under backoff.
    Upstream,
    Shutdown,
}

/// Cheap clonable handle to the coordinator task.
#[derive(Clone)]
pub struct UpstreamHandle {
    command_tx: mpsc::UnboundedSender<Command>,
    state: Arc<AtomicU8>,
}

impl UpstreamHandle {
    /// Replace the desired subscription set (the union across clients).
    /// An empty set closes the upstream connection.
    pub fn set_symbols(&self, symbols: HashSet<String>) {
        let _ = self.command_tx.send(Command::SetSymbols(symbols));
    }

    pub fn shutdown(&self) {
        let _ = self.command_tx.send(Command::Shutdown);
    }

    pub fn state(&self) -> UpstreamState {
        match self.state.load(Ordering::Relaxed) {
            STATE_CONNECTED => UpstreamState::Connected,
            STATE_CONNECTING => UpstreamState::Connecting,
            _ => UpstreamState::Disconnected,
        }
    }
}

/// Coordinator for the shared upstream connection.
pub struct UpstreamStreamManager {
    ws_base_url: String,
    registry: Arc<ClientRegistry>,
    books: Arc<BookManager>,
    state: Arc<AtomicU8>,
}

impl UpstreamStreamManager {
    /// Spawn the coordinator task against the production endpoint.
    pub fn spawn(registry: Arc<ClientRegistry>, books: Arc<BookManager>) -> UpstreamHandle {
        Self::spawn_with_base_url(WS_BASE_URL.to_string(), registry, books)
    }

    pub fn spawn_with_base_url(
        ws_base_url: String,
        registry: Arc<ClientRegistry>,
        books: Arc<BookManager>,
    ) -> UpstreamHandle {
        let state = Arc::new(AtomicU8::new(STATE_DISCONNECTED));
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let manager = Self {
            ws_base_url,
            registry,
            books,
            state: state.clone(),
        };
        tokio::spawn(manager.run(command_rx));

        UpstreamHandle { command_tx, state }
    }

    async fn run(self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut desired: HashSet<String> = HashSet::new();
        let mut attempt: u32 = 0;

        'outer: loop {
            while desired.is_empty() {
                self.set_state(STATE_DISCONNECTED);
                match commands.recv().await {
                    Some(Command::SetSymbols(symbols)) => desired = symbols,
                    Some(Command::Shutdown) | None => break 'outer,
                }
            }

            let url = match combined_stream_url(&self.ws_base_url, &desired) {
                Ok(url) => url,
                Err(error) => {
                    error!(%error, "failed to build upstream stream URL");
                    break 'outer;
                }
            };

            self.set_state(STATE_CONNECTING);
            info!(symbols = desired.len(), %url, "connecting to upstream");

            let mut ws = match connect_async(url.as_str()).await {
                Ok((ws, response)) => {
                    info!(status = ?response.status(), "upstream connected");
                    attempt = 0;
                    self.set_state(STATE_CONNECTED);
                    ws
                }
                Err(error) => {
                    error!(%error, "upstream connect failed");
                    self.set_state(STATE_DISCONNECTED);
                    if !self
                        .backoff(&mut commands, &mut desired, &mut attempt)
                        .await
                    {
                        break 'outer;
                    }
                    continue 'outer;
                }
            };

            let subscribed = desired.clone();
            let mut ping_timer = tokio::time::interval(PING_INTERVAL);
            ping_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut last_pong = Instant::now();

            let reason = loop {
                tokio::select! {
                    command = commands.recv() => match command {
                        Some(Command::SetSymbols(symbols)) => {
                            desired = symbols;
                            if desired != subscribed {
                                info!(symbols = desired.len(), "subscription set changed, re-dialing");
                                break CloseReason::Resubscribe;
                            }
                        }
                        Some(Command::Shutdown) | None => break CloseReason::Shutdown,
                    },
                    message = ws.next() => match message {
                        Some(Ok(Message::Text(text))) => {
                            self.dispatch_frame(&text).await;
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            if ws.send(Message::Pong(payload)).await.is_err() {
                                break CloseReason::Upstream;
                            }
                        }
                        Some(Ok(Message::Pong(_))) => {
                            last_pong = Instant::now();
                        }
                        Some(Ok(Message::Close(frame))) => {
                            info!(?frame, "upstream closed the connection");
                            break CloseReason::Upstream;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(error)) => {
                            error!(%error, "upstream read error");
                            break CloseReason::Upstream;
                        }
                        None => {
                            warn!("upstream stream ended");
                            break CloseReason::Upstream;
                        }
                    },
                    _ = ping_timer.tick() => {
                        if last_pong.elapsed() > PONG_DEADLINE {
                            warn!("upstream missed two pongs, declaring connection dead");
                            break CloseReason::Upstream;
                        }
                        if ws.send(Message::Ping(Vec::new())).await.is_err() {
                            break CloseReason::Upstream;
                        }
                    }
                }
            };

            let _ = ws.close(None).await;
            self.set_state(STATE_DISCONNECTED);

            match reason {
                CloseReason::Shutdown => break 'outer,
                CloseReason::Resubscribe => continue 'outer,
                CloseReason::Upstream => {
                    if !self
                        .backoff(&mut commands, &mut desired, &mut attempt)
                        .await
                    {
                        break 'outer;
                    }
                }
            }
        }

        self.set_state(STATE_DISCONNECTED);
        info!("upstream coordinator stopped");
    }

    /// Sleep out the reconnect delay while staying responsive to commands.
    /// Returns false when a shutdown arrived.
    async fn backoff(
        &self,
        commands: &mut mpsc::UnboundedReceiver<Command>,
        desired: &mut HashSet<String>,
        attempt: &mut u32,
    ) -> bool {
        let delay = reconnect_delay(*attempt);
        *attempt = attempt.saturating_add(1);
        warn!(
            delay_ms = delay.as_millis() as u64,
            attempt = *attempt,
            "scheduling upstream reconnect"
        );

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                command = commands.recv() => match command {
                    Some(Command::SetSymbols(symbols)) => *desired = symbols,
                    Some(Command::Shutdown) | None => return false,
                },
            }
        }
    }

    /// Forward one upstream frame: registry fan-out (filtered on `data.s`,
    /// everyone when extraction fails) plus the book-engine tap for depth
    /// updates. Clients whose queues overflow are dropped here.
    async fn dispatch_frame(&self, text: &str) {
        let frame: CombinedFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(error) => {
                debug!(%error, "unparseable upstream frame, forwarding to all clients");
                let overflowed = self.registry.fan_out(text, None).await;
                self.drop_clients(overflowed).await;
                return;
            }
        };

        let symbol = frame
            .data
            .get("s")
            .and_then(|value| value.as_str())
            .map(str::to_string);

        if frame.data.get("e").and_then(|value| value.as_str()) == Some("depthUpdate") {
            match serde_json::from_value::<DepthUpdateEvent>(frame.data.clone()) {
                Ok(event) => {
                    if let Some(diff) = event.to_diff() {
                        self.books.on_diff(diff).await;
                    }
                }
                Err(error) => {
                    debug!(%error, "depth update failed to deserialize, skipping book tap");
                }
            }
        }

        let overflowed = self.registry.fan_out(text, symbol.as_deref()).await;
        self.drop_clients(overflowed).await;
    }

    async fn drop_clients(&self, ids: Vec<u64>) {
        for id in ids {
            self.registry.unregister(id).await;
        }
    }

    fn set_state(&self, state: u8) {
        self.state.store(state, Ordering::Relaxed);
    }
}

/// Build the combined-stream URL for a symbol set: each symbol contributes
/// its depth, aggregated-trade, and mini-ticker streams.
fn combined_stream_url(base_url: &str, symbols: &HashSet<String>) -> anyhow::Result<Url> {
    let mut ordered: Vec<&String> = symbols.iter().collect();
    ordered.sort();

    let streams: Vec<String> = ordered
        .iter()
        .flat_map(|symbol| {
            let lower = symbol.to_lowercase();
            [
                format!("{lower}@depth@100ms"),
                format!("{lower}@aggTrade"),
                format!("{lower}@miniTicker"),
            ]
        })
        .collect();

    let url = format!("{}/stream?streams={}", base_url, streams.join("/"));
    Url::parse(&url).map_err(|e| anyhow::anyhow!("invalid stream URL: {e}"))
}

/// Exponential reconnect delay with uniform jitter.
fn reconnect_delay(attempt: u32) -> Duration {
    let base = 1_000u64
        .saturating_mul(1u64 << attempt.min(16))
        .min(MAX_RECONNECT_DELAY_MS);
    let jitter = rand::thread_rng().gen_range(0..1_000);
    Duration::from_millis(base + jitter)
}
