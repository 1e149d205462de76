// =============================================================================
// Market Stream — combined futures WebSocket feed, fanned to symbol tasks
// =============================================================================
//
// One combined-stream connection carries aggTrade + depth diffs + miniTicker
// for every desired symbol. Decoded frames are routed to the owning symbol
// task; the raw text is forwarded to subscribers unchanged. When the desired
// symbol set changes (subscribe/unsubscribe), the reader returns so the
// caller can reconnect with the new stream list.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tracing::{debug, error, info, warn};

use crate::app_state::AppState;
use crate::engine::SymbolEvent;
use crate::market::frames::{self, VenueFrame};

/// Symbol used for frames that carry no symbol of their own; the fan-out
/// delivers these to every subscriber.
pub const BROADCAST_SYMBOL: &str = "*";

pub type SymbolRoutes = Arc<RwLock<HashMap<String, mpsc::Sender<SymbolEvent>>>>;

/// Build the combined-stream URL for the given symbols.
pub fn stream_url(symbols: &[String]) -> String {
    let mut streams = Vec::with_capacity(symbols.len() * 3);
    for symbol in symbols {
        let lower = symbol.to_lowercase();
        streams.push(format!("{lower}@aggTrade"));
        streams.push(format!("{lower}@depth@100ms"));
        streams.push(format!("{lower}@miniTicker"));
    }
    format!(
        "wss://fstream.binance.com/stream?streams={}",
        streams.join("/")
    )
}

/// Connect and pump the combined stream until it drops, errors, or the
/// desired symbol set changes (returns Ok to request a reconnect).
pub async fn run_market_stream(app: Arc<AppState>, routes: SymbolRoutes) -> Result<()> {
    let symbols: Vec<String> = app.hub.current_desired().into_iter().collect();
    if symbols.is_empty() {
        anyhow::bail!("no symbols to stream");
    }

    let url = stream_url(&symbols);
    info!(url = %url, count = symbols.len(), "connecting to market stream");

    let (ws_stream, _response) = connect_async(&url)
        .await
        .context("failed to connect to market stream")?;

    *app.upstream_ws_state.write() = "connected".to_string();
    info!("market stream connected");

    let (_write, mut read) = ws_stream.split();
    let mut desired = app.hub.desired_symbols();

    loop {
        tokio::select! {
            // ── Upstream reconfiguration ────────────────────────────────
            changed = desired.changed() => {
                if changed.is_ok() {
                    info!("desired symbol set changed — reconnecting stream");
                    *app.upstream_ws_state.write() = "reconfiguring".to_string();
                    return Ok(());
                }
            }

            // ── Frame pump ──────────────────────────────────────────────
            msg = read.next() => {
                match msg {
                    Some(Ok(tokio_tungstenite::tungstenite::Message::Text(text))) => {
                        dispatch_frame(&app, &routes, &text).await;
                    }
                    Some(Ok(_)) => {
                        // Ping/Pong/Binary handled by tungstenite or ignored.
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "market stream read error");
                        *app.upstream_ws_state.write() = "reconnecting".to_string();
                        return Err(e.into());
                    }
                    None => {
                        warn!("market stream ended");
                        *app.upstream_ws_state.write() = "reconnecting".to_string();
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Decode one frame, forward the raw text, route the typed event.
async fn dispatch_frame(app: &Arc<AppState>, routes: &SymbolRoutes, text: &str) {
    let frame = match frames::decode_frame(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(error = %e, "failed to decode stream frame");
            return;
        }
    };

    // Raw frames are forwarded regardless of what the aggregators do with
    // them.
    let raw_symbol = frame.symbol().unwrap_or(BROADCAST_SYMBOL).to_string();
    app.hub.publish(&raw_symbol, text.to_string());

    let symbol = match frame.symbol() {
        Some(s) => s.to_string(),
        None => {
            debug!("unknown frame forwarded raw only");
            return;
        }
    };

    let sender = routes.read().get(&symbol).cloned();
    if let Some(sender) = sender {
        match &frame {
            VenueFrame::Trade(_) | VenueFrame::Depth { .. } => {
                if sender.send(SymbolEvent::Frame(frame)).await.is_err() {
                    warn!(symbol = %symbol, "symbol engine channel closed");
                }
            }
            // Passthrough frames never drive state.
            VenueFrame::Passthrough { .. } | VenueFrame::Unknown(_) => {}
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_lists_all_streams_per_symbol() {
        let url = stream_url(&["BTCUSDT".to_string(), "ETHUSDT".to_string()]);
        assert!(url.starts_with("wss://fstream.binance.com/stream?streams="));
        assert!(url.contains("btcusdt@aggTrade"));
        assert!(url.contains("btcusdt@depth@100ms"));
        assert!(url.contains("btcusdt@miniTicker"));
        assert!(url.contains("ethusdt@aggTrade"));
    }

    #[tokio::test]
    async fn dispatch_routes_trades_and_forwards_raw() {
        let app = AppState::new(crate::config::EngineConfig::default());
        let routes: SymbolRoutes = Arc::new(RwLock::new(HashMap::new()));
        let (tx, mut rx) = mpsc::channel(8);
        routes.write().insert("BTCUSDT".to_string(), tx);

        let mut hub_rx = app.hub.subscribe();

        let text = r#"{"stream":"btcusdt@aggTrade","data":{"e":"aggTrade","E":1,"T":1,"s":"BTCUSDT","p":"100.0","q":"1.0"}}"#;
        dispatch_frame(&app, &routes, text).await;

        // Raw forwarded.
        let raw = hub_rx.recv().await.unwrap();
        assert_eq!(raw.symbol, "BTCUSDT");
        assert_eq!(*raw.json, text);

        // Typed event routed.
        match rx.recv().await.unwrap() {
            SymbolEvent::Frame(VenueFrame::Trade(t)) => assert_eq!(t.symbol, "BTCUSDT"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn mini_ticker_is_forwarded_but_not_routed() {
        let app = AppState::new(crate::config::EngineConfig::default());
        let routes: SymbolRoutes = Arc::new(RwLock::new(HashMap::new()));
        let (tx, mut rx) = mpsc::channel(8);
        routes.write().insert("BTCUSDT".to_string(), tx);

        let mut hub_rx = app.hub.subscribe();
        let text = r#"{"e":"24hrMiniTicker","s":"BTCUSDT","c":"100.0"}"#;
        dispatch_frame(&app, &routes, text).await;

        assert_eq!(hub_rx.recv().await.unwrap().symbol, "BTCUSDT");
        assert!(rx.try_recv().is_err());
    }
}
