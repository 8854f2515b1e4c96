//! Parser module for exchange wire messages
//!
//! Deserializes depth diff events and REST snapshots into typed envelopes.

use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer};
use std::str::FromStr;

/// Incremental depth diff event
///
/// Bid/ask changes carry absolute quantities; a zero quantity deletes
/// the level.
#[derive(Debug, Clone, Deserialize)]
pub struct DiffEnvelope {
    /// Event time (milliseconds)
    #[serde(rename = "E")]
    pub event_time: u64,

    /// Symbol
    #[serde(rename = "s")]
    pub symbol: String,

    /// First update ID covered by this event
    #[serde(rename = "U")]
    pub first_id: u64,

    /// Final update ID covered by this event
    #[serde(rename = "u")]
    pub final_id: u64,

    /// Bid level replacements
    #[serde(rename = "b", deserialize_with = "deserialize_price_levels")]
    pub bid_changes: Vec<PriceLevel>,

    /// Ask level replacements
    #[serde(rename = "a", deserialize_with = "deserialize_price_levels")]
    pub ask_changes: Vec<PriceLevel>,
}

/// Price level (price, quantity pair)
#[derive(Debug, Clone)]
pub struct PriceLevel {
    pub price: Decimal,
    pub quantity: Decimal,
}

/// Authoritative order book snapshot from the REST API
#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotResponse {
    /// Highest update ID the snapshot covers
    #[serde(rename = "lastUpdateId")]
    pub last_update_id: u64,

    /// Bid levels
    #[serde(deserialize_with = "deserialize_price_levels")]
    pub bids: Vec<PriceLevel>,

    /// Ask levels
    #[serde(deserialize_with = "deserialize_price_levels")]
    pub asks: Vec<PriceLevel>,

    /// Fetch time (milliseconds), stamped by the HTTP client
    #[serde(default)]
    pub timestamp: u64,
}

/// Combined stream message wrapper
#[derive(Debug, Clone, Deserialize)]
struct StreamMessage {
    stream: String,
    data: serde_json::Value,
}

/// Parsed stream message
#[derive(Debug, Clone)]
pub enum ParsedMessage {
    Diff(DiffEnvelope),
    Unknown(String),
}

impl ParsedMessage {
    /// Parse a raw stream message
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        // Combined streams wrap the payload with the stream name
        if let Ok(stream_msg) = serde_json::from_str::<StreamMessage>(raw) {
            if stream_msg.stream.contains("depth") {
                let diff: DiffEnvelope = serde_json::from_value(stream_msg.data)?;
                return Ok(ParsedMessage::Diff(diff));
            }
            return Ok(ParsedMessage::Unknown(stream_msg.data.to_string()));
        }

        if let Ok(diff) = serde_json::from_str::<DiffEnvelope>(raw) {
            return Ok(ParsedMessage::Diff(diff));
        }

        Ok(ParsedMessage::Unknown(raw.to_string()))
    }
}

/// Custom deserializer for price levels from arrays of string pairs
fn deserialize_price_levels<'de, D>(deserializer: D) -> Result<Vec<PriceLevel>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Vec<Vec<String>> = Deserialize::deserialize(deserializer)?;
    raw.into_iter()
        .map(|pair| {
            if pair.len() != 2 {
                return Err(serde::de::Error::custom("invalid price level format"));
            }
            Ok(PriceLevel {
                price: Decimal::from_str(&pair[0]).map_err(serde::de::Error::custom)?,
                quantity: Decimal::from_str(&pair[1]).map_err(serde::de::Error::custom)?,
            })
        })
        .collect()
}
