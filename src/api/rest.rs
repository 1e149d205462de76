// =============================================================================
// REST API — health + depth endpoints, Axum 0.7
// =============================================================================
//
// `GET /health`                      — liveness and engine summary.
// `GET /api/depth/:symbol?limit=L`   — ladder from the engine's cache when
//                                      fresh, otherwise a direct venue fetch;
//                                      every response is labeled
//                                      `source: "cache" | "fresh"`; 503 when
//                                      neither is available.
//
// CORS is permissive: the dashboard runs on a different origin in dev.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tracing::warn;

use crate::app_state::{AppState, CachedDepth};

/// Cache entries older than this are refreshed from the venue.
const CACHE_FRESH_MS: i64 = 2_500;

/// Build the API router with CORS and the WebSocket endpoint mounted.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/api/depth/:symbol", get(depth))
        .route("/ws", get(crate::api::ws::ws_handler))
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health
// =============================================================================

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let active_symbols: Vec<String> = state.hub.current_desired().into_iter().collect();
    Json(json!({
        "ok": true,
        "uptime_s": state.uptime_s(),
        "ws_clients": state.hub.client_count(),
        "upstream_ws_state": *state.upstream_ws_state.read(),
        "cache_size": state.depth_cache.read().len(),
        "active_symbols": active_symbols,
    }))
}

// =============================================================================
// Depth
// =============================================================================

#[derive(Deserialize)]
struct DepthQuery {
    limit: Option<u32>,
}

async fn depth(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
    Query(query): Query<DepthQuery>,
) -> impl IntoResponse {
    let symbol = symbol.to_uppercase();
    let limit = query.limit.unwrap_or(20) as usize;
    let now_ms = chrono::Utc::now().timestamp_millis();

    // Fresh-enough cache wins.
    if let Some(cached) = state.cached_depth(&symbol) {
        if now_ms - cached.cached_at_ms <= CACHE_FRESH_MS {
            return depth_response(&cached, limit, "cache").into_response();
        }
    }

    // Cache stale or missing: go to the venue.
    match state.rest.get_depth_snapshot(&symbol, limit as u32).await {
        Ok(snap) => {
            let cached = CachedDepth {
                last_update_id: snap.last_update_id,
                bids: cumulate(&snap.bids),
                asks: cumulate(&snap.asks),
                cached_at_ms: now_ms,
            };
            state.cache_depth(&symbol, cached.clone());
            depth_response(&cached, limit, "fresh").into_response()
        }
        Err(e) => {
            warn!(symbol = %symbol, error = %e, "depth fetch failed");
            // Transient upstream failure: serve the stale cache if any.
            match state.cached_depth(&symbol) {
                Some(cached) => depth_response(&cached, limit, "cache").into_response(),
                None => (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(json!({ "error": "depth unavailable", "symbol": symbol })),
                )
                    .into_response(),
            }
        }
    }
}

fn depth_response(cached: &CachedDepth, limit: usize, source: &str) -> Json<serde_json::Value> {
    Json(json!({
        "lastUpdateId": cached.last_update_id,
        "bids": &cached.bids[..cached.bids.len().min(limit)],
        "asks": &cached.asks[..cached.asks.len().min(limit)],
        "cachedAt": cached.cached_at_ms,
        "source": source,
    }))
}

fn cumulate(rows: &[(f64, f64)]) -> Vec<crate::market::book::BookLevel> {
    let mut cumulative = 0.0;
    rows.iter()
        .map(|&(price, size)| {
            cumulative += size;
            crate::market::book::BookLevel {
                price,
                size,
                cumulative,
            }
        })
        .collect()
}
