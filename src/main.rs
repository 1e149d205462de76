// =============================================================================
// Meridian Orderflow Nexus — Main Entry Point
// =============================================================================
//
// Orders never leave the process: every intent goes to the dry-run paper
// ledger. Point MERIDIAN_ADVISOR_URL at a policy endpoint to enable the
// advisor; without it the deterministic path runs alone.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod advisor;
mod api;
mod app_state;
mod binance;
mod config;
mod engine;
mod equity;
mod fanout;
mod fills;
mod flow;
mod governor;
mod intel;
mod market;
mod orchestrator;
mod state;
mod types;

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::advisor::{HttpPolicyAdvisor, PolicyAdvisor};
use crate::app_state::AppState;
use crate::config::EngineConfig;
use crate::engine::{SymbolEngine, SymbolEvent};
use crate::equity::EquityStore;
use crate::fills::{FillSink, PaperLedger};
use crate::market::stream::{self, SymbolRoutes};

/// Aggregate tick cadence per symbol.
const TICK_INTERVAL_MS: u64 = 1_000;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Meridian Orderflow Nexus — Starting Up           ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let cfg = EngineConfig::from_env();
    info!(symbols = ?cfg.symbols, bind = %cfg.bind_addr, "configuration loaded");

    // ── 2. Process-wide services ─────────────────────────────────────────
    let app = AppState::new(cfg.clone());

    let starting_capital = std::env::var("MERIDIAN_STARTING_CAPITAL")
        .ok()
        .and_then(|s| s.parse::<f64>().ok())
        .unwrap_or(10_000.0);
    let sink: Arc<dyn FillSink> = Arc::new(PaperLedger::new(starting_capital));
    info!(starting_capital, "paper ledger initialised (dry-run)");

    let equity_store = Arc::new(EquityStore::open("equity_store.json"));

    let advisor: Option<Arc<dyn PolicyAdvisor>> = match std::env::var("MERIDIAN_ADVISOR_URL") {
        Ok(url) if !url.is_empty() => {
            info!(url = %url, "policy advisor enabled");
            Some(Arc::new(HttpPolicyAdvisor::new(url)))
        }
        _ => {
            info!("policy advisor disabled — deterministic path only");
            None
        }
    };

    // ── 3. Symbol engines for the configured set ─────────────────────────
    let routes: SymbolRoutes = Default::default();
    for symbol in &cfg.symbols {
        spawn_symbol(
            symbol.clone(),
            &cfg,
            &app,
            &sink,
            &advisor,
            &equity_store,
            &routes,
        );
    }
    info!(count = cfg.symbols.len(), "symbol engines launched");

    // ── 4. Dynamic symbol supervisor ─────────────────────────────────────
    {
        let cfg = cfg.clone();
        let app = app.clone();
        let sink = sink.clone();
        let advisor = advisor.clone();
        let equity_store = equity_store.clone();
        let routes = routes.clone();
        tokio::spawn(async move {
            let mut desired = app.hub.desired_symbols();
            while desired.changed().await.is_ok() {
                let wanted = desired.borrow().clone();
                for symbol in wanted {
                    let known = routes.read().contains_key(&symbol);
                    if !known {
                        info!(symbol = %symbol, "subscriber demand — spawning symbol engine");
                        spawn_symbol(
                            symbol,
                            &cfg,
                            &app,
                            &sink,
                            &advisor,
                            &equity_store,
                            &routes,
                        );
                    }
                }
            }
        });
    }

    // ── 5. Upstream market stream with reconnect ─────────────────────────
    {
        let app = app.clone();
        let routes = routes.clone();
        tokio::spawn(async move {
            loop {
                match stream::run_market_stream(app.clone(), routes.clone()).await {
                    Ok(()) => {
                        // Clean return: reconfiguration or orderly close.
                    }
                    Err(e) => {
                        error!(error = %e, "market stream error — reconnecting in 5s");
                        tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;
                    }
                }
            }
        });
    }

    // ── 6. Open interest / funding monitors ──────────────────────────────
    {
        let app = app.clone();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(tokio::time::Duration::from_secs(app.cfg.oi_poll_secs));
            loop {
                interval.tick().await;
                let symbols: Vec<String> = app.hub.current_desired().into_iter().collect();
                intel::open_interest::poll_once(&app.rest, &app.intel, &symbols).await;
            }
        });
    }
    {
        let app = app.clone();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(tokio::time::Duration::from_secs(app.cfg.funding_poll_secs));
            loop {
                interval.tick().await;
                let symbols: Vec<String> = app.hub.current_desired().into_iter().collect();
                intel::funding::poll_once(&app.rest, &app.intel, &symbols).await;
            }
        });
    }

    // ── 7. API server ────────────────────────────────────────────────────
    {
        let app = app.clone();
        let bind_addr = cfg.bind_addr.clone();
        tokio::spawn(async move {
            let router = api::rest::router(app);
            let listener = tokio::net::TcpListener::bind(&bind_addr)
                .await
                .expect("failed to bind API server");
            info!(addr = %bind_addr, "API server listening");
            axum::serve(listener, router)
                .await
                .expect("API server failed");
        });
    }

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 8. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping");

    if let Err(e) = equity_store.save() {
        error!(error = %e, "failed to persist equity store on shutdown");
    }

    info!("Meridian Orderflow Nexus shut down complete.");
    Ok(())
}

/// Spawn one symbol engine plus its aggregate ticker.
fn spawn_symbol(
    symbol: String,
    cfg: &EngineConfig,
    app: &Arc<AppState>,
    sink: &Arc<dyn FillSink>,
    advisor: &Option<Arc<dyn PolicyAdvisor>>,
    equity_store: &Arc<EquityStore>,
    routes: &SymbolRoutes,
) {
    let (tx, rx) = mpsc::channel::<SymbolEvent>(2_048);
    routes.write().insert(symbol.clone(), tx.clone());

    let engine = SymbolEngine::new(
        symbol.clone(),
        cfg.clone(),
        app.clone(),
        sink.clone(),
        advisor.clone(),
        equity_store.clone(),
        tx.clone(),
    );
    tokio::spawn(engine.run(rx));

    // Aggregate tick cadence; the ticker dies with the engine channel.
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(tokio::time::Duration::from_millis(TICK_INTERVAL_MS));
        loop {
            interval.tick().await;
            let now_ms = chrono::Utc::now().timestamp_millis();
            if tx.send(SymbolEvent::Tick { now_ms }).await.is_err() {
                warn!(symbol = %symbol, "ticker stopping — engine gone");
                return;
            }
        }
    });
}
