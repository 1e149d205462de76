// =============================================================================
// Venue REST Client — futures market data + HMAC-SHA256 signed account access
// =============================================================================
//
// Public market-data endpoints (depth, open interest, premium index) need no
// signature. The signed path is only used to seed live equity; the secret key
// is never logged or serialised.
//
// Every request goes through the process-wide rate-limit table; the caller's
// event loop owns retry pacing, this client only reports outcomes.
// =============================================================================

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use sha2::Sha256;
use tracing::{debug, instrument};

use crate::binance::rate_limit::{Permit, RateLimitTable};
use crate::market::frames::{self, DepthSnapshot};
use crate::market::snapshot::SnapshotFetcher;

type HmacSha256 = Hmac<Sha256>;

/// Recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5_000;

/// Premium-index reading used by the funding monitor.
#[derive(Debug, Clone)]
pub struct PremiumIndex {
    pub funding_rate: f64,
    pub mark_price: f64,
    pub basis: f64,
    pub ts_ms: i64,
}

/// Futures REST client.
#[derive(Clone)]
pub struct VenueRestClient {
    api_key: String,
    secret: String,
    base_url: String,
    client: reqwest::Client,
    limits: Arc<RateLimitTable>,
}

impl VenueRestClient {
    pub fn new(
        api_key: impl Into<String>,
        secret: impl Into<String>,
        limits: Arc<RateLimitTable>,
    ) -> Self {
        let api_key = api_key.into();
        let secret = secret.into();

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            api_key,
            secret,
            base_url: "https://fapi.binance.com".to_string(),
            client,
            limits,
        }
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// HMAC-SHA256 hex signature of `query`.
    fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    /// Wait out throttle/backoff windows for `symbol` before sending.
    async fn await_permit(&self, symbol: &str) {
        loop {
            let now_ms = Self::timestamp_ms() as i64;
            match self.limits.acquire(symbol, now_ms) {
                Permit::Allow => return,
                Permit::Throttled { wait_ms } => {
                    tokio::time::sleep(std::time::Duration::from_millis(wait_ms.max(1) as u64))
                        .await;
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Public market data
    // -------------------------------------------------------------------------

    /// GET /fapi/v1/depth — full depth snapshot. `limit` is rounded up to the
    /// nearest venue-accepted bucket.
    #[instrument(skip(self), name = "venue::get_depth")]
    pub async fn get_depth_snapshot(&self, symbol: &str, limit: u32) -> Result<DepthSnapshot> {
        self.await_permit(symbol).await;

        let limit = RateLimitTable::depth_limit_for(limit);
        let url = format!(
            "{}/fapi/v1/depth?symbol={}&limit={}",
            self.base_url, symbol, limit
        );

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /fapi/v1/depth request failed")?;

        let status = resp.status();
        self.limits
            .on_status(symbol, status.as_u16(), Self::timestamp_ms() as i64);

        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse depth response")?;

        if !status.is_success() {
            anyhow::bail!("venue GET /fapi/v1/depth returned {}: {}", status, body);
        }

        let snap = frames::decode_depth_snapshot(&body)?;
        debug!(
            symbol,
            last_update_id = snap.last_update_id,
            bids = snap.bids.len(),
            asks = snap.asks.len(),
            "depth snapshot fetched"
        );
        Ok(snap)
    }

    /// GET /fapi/v1/openInterest — returns (open interest, event time ms).
    #[instrument(skip(self), name = "venue::get_open_interest")]
    pub async fn get_open_interest(&self, symbol: &str) -> Result<(f64, i64)> {
        self.await_permit(symbol).await;

        let url = format!("{}/fapi/v1/openInterest?symbol={}", self.base_url, symbol);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /fapi/v1/openInterest request failed")?;

        let status = resp.status();
        self.limits
            .on_status(symbol, status.as_u16(), Self::timestamp_ms() as i64);

        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse openInterest response")?;

        if !status.is_success() {
            anyhow::bail!("venue GET /fapi/v1/openInterest returned {}: {}", status, body);
        }

        let oi = frames::parse_str_f64(&body["openInterest"], "openInterest")?;
        let ts_ms = body["time"].as_i64().unwrap_or(0);
        Ok((oi, ts_ms))
    }

    /// GET /fapi/v1/premiumIndex — funding rate + mark/index prices.
    #[instrument(skip(self), name = "venue::get_premium_index")]
    pub async fn get_premium_index(&self, symbol: &str) -> Result<PremiumIndex> {
        self.await_permit(symbol).await;

        let url = format!("{}/fapi/v1/premiumIndex?symbol={}", self.base_url, symbol);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /fapi/v1/premiumIndex request failed")?;

        let status = resp.status();
        self.limits
            .on_status(symbol, status.as_u16(), Self::timestamp_ms() as i64);

        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse premiumIndex response")?;

        if !status.is_success() {
            anyhow::bail!("venue GET /fapi/v1/premiumIndex returned {}: {}", status, body);
        }

        let funding_rate = frames::parse_str_f64(&body["lastFundingRate"], "lastFundingRate")?;
        let mark_price = frames::parse_str_f64(&body["markPrice"], "markPrice")?;
        let index_price = frames::parse_str_f64(&body["indexPrice"], "indexPrice").unwrap_or(0.0);
        let basis = if index_price > 0.0 {
            (mark_price - index_price) / index_price
        } else {
            0.0
        };

        Ok(PremiumIndex {
            funding_rate,
            mark_price,
            basis,
            ts_ms: body["time"].as_i64().unwrap_or(0),
        })
    }

    // -------------------------------------------------------------------------
    // Signed account access (live equity seed only)
    // -------------------------------------------------------------------------

    /// GET /fapi/v2/balance (signed) — total wallet balance of `asset`.
    ///
    /// Used once per day by the equity store when running against a live
    /// account; the dry-run path never calls this.
    #[instrument(skip(self), name = "venue::get_wallet_balance")]
    pub async fn get_wallet_balance(&self, asset: &str) -> Result<f64> {
        let qs = self.signed_query("");
        let url = format!("{}/fapi/v2/balance?{}", self.base_url, qs);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /fapi/v2/balance request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse balance response")?;

        if !status.is_success() {
            anyhow::bail!("venue GET /fapi/v2/balance returned {}: {}", status, body);
        }

        let rows = body
            .as_array()
            .context("balance response is not an array")?;
        for row in rows {
            if row["asset"].as_str() == Some(asset) {
                return frames::parse_str_f64(&row["balance"], "balance");
            }
        }

        anyhow::bail!("asset {asset} not present in balance response")
    }
}

impl SnapshotFetcher for VenueRestClient {
    fn fetch_depth<'a>(
        &'a self,
        symbol: &'a str,
        limit: u32,
    ) -> Pin<Box<dyn Future<Output = Result<DepthSnapshot>> + Send + 'a>> {
        Box::pin(self.get_depth_snapshot(symbol, limit))
    }
}

impl std::fmt::Debug for VenueRestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VenueRestClient")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> VenueRestClient {
        VenueRestClient::new("key", "hunter2", Arc::new(RateLimitTable::new()))
    }

    #[test]
    fn signature_is_stable_hex() {
        let c = client();
        let sig = c.sign("symbol=BTCUSDT&timestamp=1700000000000");
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|ch| ch.is_ascii_hexdigit()));
        // Same input, same signature.
        assert_eq!(sig, c.sign("symbol=BTCUSDT&timestamp=1700000000000"));
    }

    #[test]
    fn signed_query_carries_signature_and_window() {
        let c = client();
        let qs = c.signed_query("symbol=BTCUSDT");
        assert!(qs.starts_with("symbol=BTCUSDT&timestamp="));
        assert!(qs.contains("&recvWindow=5000&signature="));
    }

    #[test]
    fn debug_redacts_credentials() {
        let c = client();
        let dbg = format!("{c:?}");
        assert!(!dbg.contains("hunter2"), "{dbg}");
        assert!(dbg.contains("<redacted>"));
    }
}
