// =============================================================================
// Funding Monitor — periodic premium-index poll with delta tracking
// =============================================================================

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::binance::client::VenueRestClient;
use crate::intel::IntelHub;

/// One funding observation with its change from the previous reading.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FundingReading {
    /// Current (predicted) funding rate as a fraction, e.g. 0.0001 = 1 bp.
    pub funding_rate: f64,
    /// Change from the previous reading (0 on the first).
    pub delta: f64,
    /// Mark price reported alongside the rate.
    pub mark_price: f64,
    /// Perp basis: (mark - index) / index, when the index was present.
    pub basis: f64,
    pub ts_ms: i64,
}

impl FundingReading {
    pub fn first(funding_rate: f64, mark_price: f64, basis: f64, ts_ms: i64) -> Self {
        Self {
            funding_rate,
            delta: 0.0,
            mark_price,
            basis,
            ts_ms,
        }
    }

    pub fn next(funding_rate: f64, mark_price: f64, basis: f64, ts_ms: i64, prev: &Self) -> Self {
        Self {
            funding_rate,
            delta: funding_rate - prev.funding_rate,
            mark_price,
            basis,
            ts_ms,
        }
    }
}

/// Poll funding for every symbol once, publishing to the hub.
pub async fn poll_once(client: &VenueRestClient, hub: &Arc<IntelHub>, symbols: &[String]) {
    for symbol in symbols {
        match client.get_premium_index(symbol).await {
            Ok(premium) => {
                let reading = match hub.funding(symbol) {
                    Some(prev) => FundingReading::next(
                        premium.funding_rate,
                        premium.mark_price,
                        premium.basis,
                        premium.ts_ms,
                        &prev,
                    ),
                    None => FundingReading::first(
                        premium.funding_rate,
                        premium.mark_price,
                        premium.basis,
                        premium.ts_ms,
                    ),
                };
                debug!(symbol = %symbol, rate = reading.funding_rate, "funding polled");
                hub.publish_funding(symbol, reading);
            }
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "funding poll failed");
            }
        }
    }
}
