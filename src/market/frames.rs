// =============================================================================
// Frame Decoder — venue-native WebSocket frames to tagged variants
// =============================================================================
//
// Binance futures sends numeric fields as JSON strings. Everything coming off
// the combined stream is decoded here into typed variants; unknown event
// types are kept raw so the fan-out can forward them, but they never drive
// engine state.
// =============================================================================

use anyhow::{Context, Result};
use serde_json::Value;

/// REST depth snapshot (`/fapi/v1/depth`).
#[derive(Debug, Clone, PartialEq)]
pub struct DepthSnapshot {
    pub last_update_id: u64,
    /// (price, size) rows, descending price.
    pub bids: Vec<(f64, f64)>,
    /// (price, size) rows, ascending price.
    pub asks: Vec<(f64, f64)>,
}

/// Incremental depth diff (`depthUpdate`).
///
/// `first_update_id`/`final_update_id` are the venue's `U`/`u` sequence
/// bounds; `prev_final_id` is the futures-stream `pu` continuity hint.
#[derive(Debug, Clone, PartialEq)]
pub struct DepthDiff {
    pub event_time_ms: i64,
    pub first_update_id: u64,
    pub final_update_id: u64,
    pub prev_final_id: Option<u64>,
    /// Size 0 means remove the level.
    pub bids: Vec<(f64, f64)>,
    pub asks: Vec<(f64, f64)>,
}

/// Aggregated trade print (`aggTrade`), side not yet classified.
#[derive(Debug, Clone, PartialEq)]
pub struct AggTrade {
    pub event_time_ms: i64,
    pub trade_time_ms: i64,
    pub symbol: String,
    pub price: f64,
    pub qty: f64,
}

/// One decoded frame off the market stream.
#[derive(Debug, Clone)]
pub enum VenueFrame {
    Trade(AggTrade),
    Depth { symbol: String, diff: DepthDiff },
    /// `miniTicker` and anything else we recognise but do not consume:
    /// forwarded to subscribers unchanged.
    Passthrough { symbol: String, raw: Value },
    /// Entirely unknown event shape; forwarded raw, never drives state.
    Unknown(Value),
}

impl VenueFrame {
    pub fn symbol(&self) -> Option<&str> {
        match self {
            Self::Trade(t) => Some(&t.symbol),
            Self::Depth { symbol, .. } => Some(symbol),
            Self::Passthrough { symbol, .. } => Some(symbol),
            Self::Unknown(_) => None,
        }
    }
}

/// Decode one text frame from the combined stream.
///
/// Combined-stream envelopes (`{"stream": ..., "data": {...}}`) and direct
/// single-stream payloads are both accepted.
pub fn decode_frame(text: &str) -> Result<VenueFrame> {
    let root: Value = serde_json::from_str(text).context("failed to parse stream JSON")?;

    let data = if root.get("data").is_some() {
        root["data"].clone()
    } else {
        root
    };

    let event = data["e"].as_str().unwrap_or("");
    match event {
        "aggTrade" => decode_agg_trade(&data).map(VenueFrame::Trade),
        "depthUpdate" => {
            let symbol = data["s"]
                .as_str()
                .context("depthUpdate missing field s")?
                .to_uppercase();
            let diff = decode_depth_diff(&data)?;
            Ok(VenueFrame::Depth { symbol, diff })
        }
        "24hrMiniTicker" => {
            let symbol = data["s"]
                .as_str()
                .context("miniTicker missing field s")?
                .to_uppercase();
            Ok(VenueFrame::Passthrough { symbol, raw: data })
        }
        _ => Ok(VenueFrame::Unknown(data)),
    }
}

fn decode_agg_trade(data: &Value) -> Result<AggTrade> {
    Ok(AggTrade {
        event_time_ms: data["E"].as_i64().context("aggTrade missing field E")?,
        trade_time_ms: data["T"].as_i64().unwrap_or_else(|| data["E"].as_i64().unwrap_or(0)),
        symbol: data["s"]
            .as_str()
            .context("aggTrade missing field s")?
            .to_uppercase(),
        price: parse_str_f64(&data["p"], "p")?,
        qty: parse_str_f64(&data["q"], "q")?,
    })
}

fn decode_depth_diff(data: &Value) -> Result<DepthDiff> {
    Ok(DepthDiff {
        event_time_ms: data["E"].as_i64().unwrap_or(0),
        first_update_id: data["U"].as_u64().context("depthUpdate missing field U")?,
        final_update_id: data["u"].as_u64().context("depthUpdate missing field u")?,
        prev_final_id: data["pu"].as_u64(),
        bids: decode_levels(&data["b"], "b")?,
        asks: decode_levels(&data["a"], "a")?,
    })
}

/// Decode a REST depth snapshot body.
pub fn decode_depth_snapshot(body: &Value) -> Result<DepthSnapshot> {
    Ok(DepthSnapshot {
        last_update_id: body["lastUpdateId"]
            .as_u64()
            .context("snapshot missing field lastUpdateId")?,
        bids: decode_levels(&body["bids"], "bids")?,
        asks: decode_levels(&body["asks"], "asks")?,
    })
}

fn decode_levels(val: &Value, name: &str) -> Result<Vec<(f64, f64)>> {
    let rows = val
        .as_array()
        .with_context(|| format!("missing level array {name}"))?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let price = parse_str_f64(&row[0], name)?;
        let size = parse_str_f64(&row[1], name)?;
        out.push((price, size));
    }
    Ok(out)
}

/// Binance sends numeric values as JSON strings; accept raw numbers too.
pub fn parse_str_f64(val: &Value, name: &str) -> Result<f64> {
    match val {
        Value::String(s) => s
            .parse::<f64>()
            .with_context(|| format!("failed to parse {name} as f64: {s}")),
        Value::Number(n) => n
            .as_f64()
            .with_context(|| format!("field {name} is not a valid f64")),
        _ => anyhow::bail!("field {name} has unexpected JSON type"),
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_agg_trade_frame() {
        let json = r#"{
            "stream": "btcusdt@aggTrade",
            "data": { "e": "aggTrade", "E": 1700000000100, "T": 1700000000090,
                      "s": "BTCUSDT", "p": "37000.50", "q": "0.125" }
        }"#;
        match decode_frame(json).unwrap() {
            VenueFrame::Trade(t) => {
                assert_eq!(t.symbol, "BTCUSDT");
                assert!((t.price - 37000.50).abs() < 1e-9);
                assert!((t.qty - 0.125).abs() < 1e-9);
                assert_eq!(t.trade_time_ms, 1700000000090);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn decode_depth_update_frame() {
        let json = r#"{ "e": "depthUpdate", "E": 1, "s": "ethusdt",
                        "U": 100, "u": 105, "pu": 99,
                        "b": [["2000.0", "3.5"], ["1999.5", "0"]],
                        "a": [["2000.5", "1.0"]] }"#;
        match decode_frame(json).unwrap() {
            VenueFrame::Depth { symbol, diff } => {
                assert_eq!(symbol, "ETHUSDT");
                assert_eq!(diff.first_update_id, 100);
                assert_eq!(diff.final_update_id, 105);
                assert_eq!(diff.prev_final_id, Some(99));
                assert_eq!(diff.bids.len(), 2);
                assert_eq!(diff.bids[1], (1999.5, 0.0));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn unknown_event_is_passthrough_raw() {
        let json = r#"{ "e": "forceOrder", "s": "BTCUSDT", "o": {} }"#;
        match decode_frame(json).unwrap() {
            VenueFrame::Unknown(v) => assert_eq!(v["e"], "forceOrder"),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn decode_snapshot_body() {
        let body: Value = serde_json::from_str(
            r#"{ "lastUpdateId": 12345,
                 "bids": [["100.0", "2.0"], ["99.5", "1.0"]],
                 "asks": [["100.5", "3.0"]] }"#,
        )
        .unwrap();
        let snap = decode_depth_snapshot(&body).unwrap();
        assert_eq!(snap.last_update_id, 12345);
        assert_eq!(snap.bids.len(), 2);
        assert_eq!(snap.asks[0], (100.5, 3.0));
    }
}
