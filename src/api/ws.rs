// =============================================================================
// WebSocket Handler — per-subscriber filtered fan-out
// =============================================================================
//
// Clients connect to `/ws` and manage their symbol set with
// `{"type":"subscribe","symbols":[...]}` / `{"type":"unsubscribe", ...}`.
// They receive every published payload for their symbols (metrics snapshots
// and raw venue frames) plus broadcast frames. Interest is refcounted on the
// hub so upstream streams reconfigure as subscribers come and go.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::app_state::AppState;
use crate::market::stream::BROADCAST_SYMBOL;

#[derive(Debug, Deserialize)]
struct ControlMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    symbols: Vec<String>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    info!("WebSocket subscriber connecting");
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn handle_connection(socket: WebSocket, state: Arc<AppState>) {
    let clients = state.hub.client_connected();
    info!(clients, "WebSocket subscriber connected");

    let (mut sender, mut receiver) = socket.split();
    let mut feed = state.hub.subscribe();
    let mut symbols: HashSet<String> = HashSet::new();

    loop {
        tokio::select! {
            // ── Outbound: filtered fan-out ──────────────────────────────
            msg = feed.recv() => {
                match msg {
                    Ok(out) => {
                        if out.symbol == BROADCAST_SYMBOL || symbols.contains(&out.symbol) {
                            if sender.send(Message::Text(out.json.as_str().into())).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "subscriber lagged — frames dropped");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }

            // ── Inbound: control messages ───────────────────────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_control(&state, &mut symbols, &text);
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("WebSocket subscriber disconnected");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket receive error");
                        break;
                    }
                }
            }
        }
    }

    // Release interest refcounts on disconnect.
    for symbol in &symbols {
        state.hub.remove_interest(symbol);
    }
    state.hub.client_disconnected();
}

fn handle_control(state: &Arc<AppState>, symbols: &mut HashSet<String>, text: &str) {
    let control: ControlMessage = match serde_json::from_str(text) {
        Ok(c) => c,
        Err(e) => {
            debug!(error = %e, msg = %text, "ignoring malformed control message");
            return;
        }
    };

    match control.kind.as_str() {
        "subscribe" => {
            for symbol in control.symbols {
                let symbol = symbol.to_uppercase();
                if symbols.insert(symbol.clone()) {
                    state.hub.add_interest(&symbol);
                    debug!(symbol = %symbol, "subscriber added symbol");
                }
            }
        }
        "unsubscribe" => {
            for symbol in control.symbols {
                let symbol = symbol.to_uppercase();
                if symbols.remove(&symbol) {
                    state.hub.remove_interest(&symbol);
                    debug!(symbol = %symbol, "subscriber removed symbol");
                }
            }
        }
        other => {
            debug!(kind = %other, "unknown control message type");
        }
    }
}
