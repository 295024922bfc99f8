use gateway_core::types::{DepthDiff, PriceLevel};
use serde::{Deserialize, Serialize};

/// Combined stream wrapper: `{"stream":"btcusdt@depth@100ms","data":{...}}`.
///
/// `data` stays a raw value so unknown event kinds pass through the proxy
/// untouched and only depth updates pay for full deserialization.
#[derive(Debug, Clone, Deserialize)]
pub struct CombinedFrame {
    #[allow(dead_code)]
    pub stream: String,
    pub data: serde_json::Value,
}

/// Incremental depth event (`data.e == "depthUpdate"`).
/// Field mapping per the exchange docs:
/// https://developers.binance.com/docs/derivatives/usds-margined-futures/websocket-market-streams/Diff-Book-Depth-Streams
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DepthUpdateEvent {
    #[serde(rename = "e")]
    pub event_type: String,
    #[serde(rename = "E")]
    pub event_time: i64,
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "U")]
    pub first_update_id: u64,
    #[serde(rename = "u")]
    pub final_update_id: u64,
    /// Final update id of the previous event; 0 when absent.
    #[serde(rename = "pu", default)]
    pub previous_update_id: u64,
    #[serde(rename = "b")]
    pub bids: Vec<(String, String)>,
    #[serde(rename = "a")]
    pub asks: Vec<(String, String)>,
}

impl DepthUpdateEvent {
    /// Convert to the engine's diff type. Returns None when a price or
    /// quantity fails to parse; such frames still fan out to clients but
    /// never reach the book.
    pub fn to_diff(&self) -> Option<DepthDiff> {
        let parse_side = |pairs: &[(String, String)]| {
            pairs
                .iter()
                .map(|(price, qty)| PriceLevel::from_pair(price, qty))
                .collect::<Option<Vec<_>>>()
        };

        Some(DepthDiff {
            symbol: self.symbol.clone(),
            first_update_id: self.first_update_id,
            final_update_id: self.final_update_id,
            bids: parse_side(&self.bids)?,
            asks: parse_side(&self.asks)?,
            event_time: self.event_time,
        })
    }
}

/// Aggregated trade event (`data.e == "aggTrade"`).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AggTradeEvent {
    #[serde(rename = "e")]
    pub event_type: String,
    #[serde(rename = "E")]
    pub event_time: i64,
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "a")]
    pub aggregate_trade_id: i64,
    #[serde(rename = "p")]
    pub price: String,
    #[serde(rename = "q")]
    pub quantity: String,
    #[serde(rename = "f")]
    pub first_trade_id: i64,
    #[serde(rename = "l")]
    pub last_trade_id: i64,
    #[serde(rename = "T")]
    pub trade_time: i64,
    #[serde(rename = "m")]
    pub is_buyer_maker: bool,
}

/// 24h mini ticker event (`data.e == "24hrMiniTicker"`).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MiniTickerEvent {
    #[serde(rename = "e")]
    pub event_type: String,
    #[serde(rename = "E")]
    pub event_time: i64,
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "c")]
    pub close_price: String,
    #[serde(rename = "o", default)]
    pub open_price: String,
    #[serde(rename = "h")]
    pub high_price: String,
    #[serde(rename = "l")]
    pub low_price: String,
    #[serde(rename = "v")]
    pub volume: String,
    #[serde(rename = "q", default)]
    pub quote_volume: String,
}
