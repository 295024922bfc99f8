use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use tokio::sync::mpsc;

use gateway_core::config::{CLIENT_QUEUE_CAPACITY, CLIENT_SEND_TIMEOUT};
use gateway_core::registry::ClientCommand;

use crate::commands::serve::{models::ConnectedFrame, state::AppState};

/// GET /ws?symbols=S1,S2,...
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<AppState>,
) -> Response {
    let symbols = parse_symbols_param(params.get("symbols").map(String::as_str));
    ws.on_upgrade(move |socket| handle_socket(socket, state, symbols))
}

/// Comma-separated, trimmed, uppercased; empty entries dropped.
fn parse_symbols_param(raw: Option<&str>) -> Vec<String> {
    raw.unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect()
}

async fn handle_socket(socket: WebSocket, state: AppState, symbols: Vec<String>) {
    let (tx, mut rx) = mpsc::channel::<String>(CLIENT_QUEUE_CAPACITY);
    let client_id = state.registry.register(symbols, tx).await;
    state.recompute_subscriptions().await;

    let (mut sink, mut stream) = socket.split();

    let greeting = ConnectedFrame::new(state.registry.symbols_of(client_id).await);
    let greeting = serde_json::to_string(&greeting).unwrap_or_default();
    if sink.send(Message::Text(greeting)).await.is_err() {
        state.registry.unregister(client_id).await;
        state.recompute_subscriptions().await;
        return;
    }

    let mut shutdown = state.shutdown_tx.subscribe();

    loop {
        tokio::select! {
            frame = rx.recv() => match frame {
                Some(frame) => {
                    // Bounded send: a client that cannot drain its socket
                    // within the deadline is closed, never retried.
                    match tokio::time::timeout(
                        CLIENT_SEND_TIMEOUT,
                        sink.send(Message::Text(frame)),
                    )
                    .await
                    {
                        Ok(Ok(())) => {}
                        Ok(Err(_)) => break,
                        Err(_) => {
                            tracing::warn!(client_id, "client send timed out, closing");
                            break;
                        }
                    }
                }
                // Sender dropped: the registry disconnected us (overflow).
                None => break,
            },
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ClientCommand>(&text) {
                        Ok(command) => {
                            state.registry.apply_command(client_id, command).await;
                            state.recompute_subscriptions().await;
                        }
                        // Invalid control frames are ignored; the
                        // connection stays open.
                        Err(_) => {}
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(_)) => break,
            },
            _ = shutdown.recv() => break,
        }
    }

    state.registry.unregister(client_id).await;
    state.recompute_subscriptions().await;
    let _ = sink.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_symbols_param() {
        assert_eq!(
            parse_symbols_param(Some("btcusdt, ethusdt ,,SOLUSDT")),
            vec![
                "BTCUSDT".to_string(),
                "ETHUSDT".to_string(),
                "SOLUSDT".to_string()
            ]
        );
        assert!(parse_symbols_param(Some("")).is_empty());
        assert!(parse_symbols_param(None).is_empty());
        assert!(parse_symbols_param(Some(" , ,")).is_empty());
    }
}
