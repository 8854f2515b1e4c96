//! Order book module
//!
//! Maintains mirrored per-symbol book state from depth diff streams.

mod book;
mod key;
mod view;

pub use book::InMemoryOrderbook;
pub use key::{PriceRoundKey, PRICE_SCALE};
pub use view::SortedView;

use std::sync::Arc;

use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::Serialize;

/// Side of the order book
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Side {
    Bid,
    Ask,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Bid => "bid",
            Side::Ask => "ask",
        }
    }
}

/// A single mirrored price level
#[derive(Debug, Clone, Serialize)]
pub struct BookEntry {
    pub price: Decimal,
    pub quantity: Decimal,
    /// Last mutation time (milliseconds)
    pub time: u64,
    /// Mutations since the last statistics reset
    pub update_count: u64,
    /// Sequence id of the update that last touched this level
    pub last_update_id: u64,
}

/// Shared registry of per-symbol books
pub type BookMap = Arc<DashMap<String, Arc<InMemoryOrderbook>>>;
