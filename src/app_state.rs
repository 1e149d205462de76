// =============================================================================
// Shared Application State — process-wide services handed to symbol tasks
// =============================================================================
//
// Per-symbol state (book, aggregators, orchestrator runtime) is owned by the
// symbol's task and never appears here. This struct carries only the explicit
// process-wide services: the fan-out hub, intel cells, rate-limit table, REST
// client, the depth cache the HTTP API serves from, and the BTC cross-market
// cell.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use crate::binance::{RateLimitTable, VenueRestClient};
use crate::config::EngineConfig;
use crate::fanout::FanoutHub;
use crate::intel::IntelHub;
use crate::market::book::BookLevel;
use crate::orchestrator::CrossMarketContext;

/// Last published ladder per symbol, served by `GET /api/depth/:symbol`.
#[derive(Debug, Clone, Serialize)]
pub struct CachedDepth {
    pub last_update_id: u64,
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
    pub cached_at_ms: i64,
}

pub struct AppState {
    pub cfg: EngineConfig,
    pub hub: Arc<FanoutHub>,
    pub intel: Arc<IntelHub>,
    pub limits: Arc<RateLimitTable>,
    pub rest: Arc<VenueRestClient>,
    pub depth_cache: RwLock<HashMap<String, CachedDepth>>,
    pub upstream_ws_state: RwLock<String>,
    pub btc_context: RwLock<CrossMarketContext>,
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(cfg: EngineConfig) -> Arc<Self> {
        let limits = Arc::new(RateLimitTable::new());
        let api_key = std::env::var("BINANCE_API_KEY").unwrap_or_default();
        let api_secret = std::env::var("BINANCE_API_SECRET").unwrap_or_default();
        let rest = Arc::new(VenueRestClient::new(api_key, api_secret, limits.clone()));
        let hub = Arc::new(FanoutHub::new(&cfg.symbols));

        Arc::new(Self {
            cfg,
            hub,
            intel: Arc::new(IntelHub::new()),
            limits,
            rest,
            depth_cache: RwLock::new(HashMap::new()),
            upstream_ws_state: RwLock::new("connecting".to_string()),
            btc_context: RwLock::new(CrossMarketContext::default()),
            start_time: std::time::Instant::now(),
        })
    }

    pub fn cache_depth(&self, symbol: &str, cached: CachedDepth) {
        self.depth_cache.write().insert(symbol.to_string(), cached);
    }

    pub fn cached_depth(&self, symbol: &str) -> Option<CachedDepth> {
        self.depth_cache.read().get(symbol).cloned()
    }

    pub fn uptime_s(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
