use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// A single price level with an absolute quantity.
///
/// Quantity zero means "remove this level".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PriceLevel {
    pub price: Decimal,
    pub quantity: Decimal,
}

impl PriceLevel {
    pub fn new(price: Decimal, quantity: Decimal) -> Self {
        Self { price, quantity }
    }

    /// Parse an upstream `["price", "qty"]` pair. Returns None on a
    /// non-numeric entry so callers can classify the payload as malformed.
    pub fn from_pair(price: &str, quantity: &str) -> Option<Self> {
        Some(Self {
            price: Decimal::from_str(price).ok()?,
            quantity: Decimal::from_str(quantity).ok()?,
        })
    }
}

/// A full bounded-depth view of one symbol's book at `last_update_id`.
///
/// Bid/ask pairs are kept verbatim as upstream strings; the book engine
/// parses them into `Decimal` when fusing, and the REST layer forwards them
/// unchanged to downstream clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepthSnapshot {
    pub symbol: String,
    pub last_update_id: u64,
    pub bids: Vec<(String, String)>,
    pub asks: Vec<(String, String)>,
    pub cached_at: DateTime<Utc>,
}

impl DepthSnapshot {
    /// Parse one side into levels. Returns None if any pair fails to parse.
    pub fn parse_side(pairs: &[(String, String)]) -> Option<Vec<PriceLevel>> {
        let mut levels = Vec::with_capacity(pairs.len());
        for (price, qty) in pairs {
            levels.push(PriceLevel::from_pair(price, qty)?);
        }
        Some(levels)
    }
}

/// An incremental depth event covering updates in `(first_update_id, final_update_id]`.
#[derive(Debug, Clone, PartialEq)]
pub struct DepthDiff {
    pub symbol: String,
    /// First update ID in this event (`U`).
    pub first_update_id: u64,
    /// Final update ID in this event (`u`).
    pub final_update_id: u64,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    pub event_time: i64,
}

/// One row of a book read: price, size at that price, and the running sum
/// from the best level outward.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BookLevel {
    pub price: Decimal,
    pub size: Decimal,
    pub cumulative_size: Decimal,
}

/// Where a depth response was served from.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DepthSource {
    Binance,
    Cache,
}

/// Upstream WS connection state, surfaced via `/health`.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamState {
    Disconnected,
    Connecting,
    Connected,
}
