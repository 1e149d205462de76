// =============================================================================
// Open Interest Monitor — periodic poll with delta tracking
// =============================================================================
//
// Open interest rising means new money entering; falling means positions
// closing (or being liquidated). The monitor polls each configured symbol on
// its own timer and publishes absolute value + delta to the intel hub.
// =============================================================================

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::binance::client::VenueRestClient;
use crate::intel::IntelHub;

/// One open-interest observation with its change from the previous reading.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct OiReading {
    pub open_interest: f64,
    /// Absolute change from the previous reading (0 on the first).
    pub delta: f64,
    /// Percent change from the previous reading (0 on the first).
    pub change_pct: f64,
    pub ts_ms: i64,
}

impl OiReading {
    pub fn first(open_interest: f64, ts_ms: i64) -> Self {
        Self {
            open_interest,
            delta: 0.0,
            change_pct: 0.0,
            ts_ms,
        }
    }

    pub fn next(open_interest: f64, ts_ms: i64, prev: &Self) -> Self {
        let delta = open_interest - prev.open_interest;
        let change_pct = if prev.open_interest > 0.0 {
            delta / prev.open_interest * 100.0
        } else {
            0.0
        };
        Self {
            open_interest,
            delta,
            change_pct,
            ts_ms,
        }
    }
}

/// Poll open interest for every symbol once, publishing to the hub.
pub async fn poll_once(client: &VenueRestClient, hub: &Arc<IntelHub>, symbols: &[String]) {
    for symbol in symbols {
        match client.get_open_interest(symbol).await {
            Ok((oi, ts_ms)) => {
                let reading = match hub.oi(symbol) {
                    Some(prev) => OiReading::next(oi, ts_ms, &prev),
                    None => OiReading::first(oi, ts_ms),
                };
                debug!(symbol = %symbol, oi, change_pct = reading.change_pct, "open interest polled");
                hub.publish_oi(symbol, reading);
            }
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "open interest poll failed");
            }
        }
    }
}
