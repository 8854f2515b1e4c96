//! Output handler plumbing
//!
//! Handlers receive the per-symbol sorted views at every collection cycle.
//! Raw handlers get the views directly; aggregating handlers consume a
//! [`BookSummary`] produced by the registry's aggregator.

use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::Result;
use crate::orderbook::SortedView;

/// Raw snapshot handler
///
/// Views are borrowed for the duration of the call and must not be retained.
#[async_trait]
pub trait DepthHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(
        &self,
        symbol: &str,
        bids: &SortedView<'_>,
        asks: &SortedView<'_>,
        cancel: &CancellationToken,
    ) -> Result<()>;
}

/// Aggregated snapshot handler
#[async_trait]
pub trait SummaryHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(&self, summary: &BookSummary, cancel: &CancellationToken) -> Result<()>;
}

/// Reduces a pair of views into the summary handed to [`SummaryHandler`]s
#[async_trait]
pub trait Aggregator: Send + Sync {
    async fn aggregate(
        &self,
        symbol: &str,
        bids: &SortedView<'_>,
        asks: &SortedView<'_>,
        cancel: &CancellationToken,
    ) -> Result<BookSummary>;
}

/// Aggregated per-symbol book state
#[derive(Debug, Clone, Serialize)]
pub struct BookSummary {
    pub symbol: String,
    pub timestamp: u64,
    pub best_bid: Option<Decimal>,
    pub best_ask: Option<Decimal>,
    /// Mid price (average of best bid and ask)
    pub mid_price: Option<Decimal>,
    /// Spread in basis points
    pub spread_bps: Option<Decimal>,
    /// Total bid volume
    pub bid_depth: Decimal,
    /// Total ask volume
    pub ask_depth: Decimal,
    pub bid_levels: usize,
    pub ask_levels: usize,
}

impl BookSummary {
    /// Check whether the summary carries a two-sided market
    pub fn is_healthy(&self) -> bool {
        self.mid_price.is_some() && self.bid_levels > 0 && self.ask_levels > 0
    }
}

/// Default aggregator: top of book, mid, spread and depth totals
#[derive(Debug, Default)]
pub struct DepthAggregator;

#[async_trait]
impl Aggregator for DepthAggregator {
    async fn aggregate(
        &self,
        symbol: &str,
        bids: &SortedView<'_>,
        asks: &SortedView<'_>,
        _cancel: &CancellationToken,
    ) -> Result<BookSummary> {
        let best_bid = bids.best().map(|e| e.price);
        let best_ask = asks.best().map(|e| e.price);

        let mid_price = match (best_bid, best_ask) {
            (Some(bid), Some(ask)) => Some((bid + ask) / Decimal::from(2)),
            _ => None,
        };
        let spread_bps = match (best_bid, best_ask, mid_price) {
            (Some(bid), Some(ask), Some(mid)) if mid > Decimal::ZERO => {
                Some((ask - bid) / mid * Decimal::from(10_000))
            }
            _ => None,
        };

        Ok(BookSummary {
            symbol: symbol.to_string(),
            timestamp: crate::now_ms(),
            best_bid,
            best_ask,
            mid_price,
            spread_bps,
            bid_depth: bids.iter().map(|e| e.quantity).sum(),
            ask_depth: asks.iter().map(|e| e.quantity).sum(),
            bid_levels: bids.len(),
            ask_levels: asks.len(),
        })
    }
}

/// Handlers and the aggregator wired into the collector at construction
pub struct HandlerRegistry {
    raw: Vec<Arc<dyn DepthHandler>>,
    summary: Vec<Arc<dyn SummaryHandler>>,
    aggregator: Arc<dyn Aggregator>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            raw: Vec::new(),
            summary: Vec::new(),
            aggregator: Arc::new(DepthAggregator),
        }
    }

    pub fn with_raw(mut self, handler: Arc<dyn DepthHandler>) -> Self {
        self.raw.push(handler);
        self
    }

    pub fn with_summary(mut self, handler: Arc<dyn SummaryHandler>) -> Self {
        self.summary.push(handler);
        self
    }

    pub fn with_aggregator(mut self, aggregator: Arc<dyn Aggregator>) -> Self {
        self.aggregator = aggregator;
        self
    }

    pub fn raw(&self) -> &[Arc<dyn DepthHandler>] {
        &self.raw
    }

    pub fn summary(&self) -> &[Arc<dyn SummaryHandler>] {
        &self.summary
    }

    pub fn aggregator(&self) -> &Arc<dyn Aggregator> {
        &self.aggregator
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty() && self.summary.is_empty()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Raw handler that logs top of book
#[derive(Debug, Default)]
pub struct LogHandler;

#[async_trait]
impl DepthHandler for LogHandler {
    fn name(&self) -> &str {
        "log"
    }

    async fn handle(
        &self,
        symbol: &str,
        bids: &SortedView<'_>,
        asks: &SortedView<'_>,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        info!(
            symbol = %symbol,
            best_bid = ?bids.best().map(|e| e.price),
            best_ask = ?asks.best().map(|e| e.price),
            bid_levels = bids.len(),
            ask_levels = asks.len(),
            "Order book snapshot"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orderbook::InMemoryOrderbook;
    use crate::parser::{DiffEnvelope, PriceLevel};
    use rust_decimal_macros::dec;

    fn seeded_book() -> InMemoryOrderbook {
        let book = InMemoryOrderbook::new("BTCUSDT");
        book.apply_diff(&DiffEnvelope {
            event_time: 1_000,
            symbol: "BTCUSDT".to_string(),
            first_id: 1,
            final_id: 1,
            bid_changes: vec![
                PriceLevel {
                    price: dec!(99.0),
                    quantity: dec!(1.0),
                },
                PriceLevel {
                    price: dec!(98.0),
                    quantity: dec!(2.0),
                },
            ],
            ask_changes: vec![PriceLevel {
                price: dec!(101.0),
                quantity: dec!(3.0),
            }],
        });
        book
    }

    #[tokio::test]
    async fn test_depth_aggregation() {
        let book = seeded_book();
        let (mut bids, mut asks) = book.views();
        bids.enforce();
        asks.enforce();

        let summary = DepthAggregator
            .aggregate("BTCUSDT", &bids, &asks, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.best_bid, Some(dec!(99.0)));
        assert_eq!(summary.best_ask, Some(dec!(101.0)));
        assert_eq!(summary.mid_price, Some(dec!(100.0)));
        assert_eq!(summary.spread_bps, Some(dec!(200)));
        assert_eq!(summary.bid_depth, dec!(3.0));
        assert_eq!(summary.ask_depth, dec!(3.0));
        assert_eq!(summary.bid_levels, 2);
        assert_eq!(summary.ask_levels, 1);
        assert!(summary.is_healthy());
    }

    #[tokio::test]
    async fn test_one_sided_book_summary() {
        let book = InMemoryOrderbook::new("BTCUSDT");
        book.apply_diff(&DiffEnvelope {
            event_time: 1_000,
            symbol: "BTCUSDT".to_string(),
            first_id: 1,
            final_id: 1,
            bid_changes: vec![PriceLevel {
                price: dec!(99.0),
                quantity: dec!(1.0),
            }],
            ask_changes: vec![],
        });
        let (mut bids, mut asks) = book.views();
        bids.enforce();
        asks.enforce();

        let summary = DepthAggregator
            .aggregate("BTCUSDT", &bids, &asks, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.mid_price, None);
        assert_eq!(summary.spread_bps, None);
        assert!(!summary.is_healthy());
    }
}
