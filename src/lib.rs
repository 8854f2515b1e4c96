//! BookMirror - live L2 orderbook mirroring
//!
//! This crate continuously mirrors level-2 order books from exchange depth
//! streams into memory, keeps them consistent with the exchange's sequence
//! numbering, repairs gaps from HTTP snapshots and dispatches periodic
//! sorted snapshots to registered handlers.

pub mod collector;
pub mod config;
pub mod error;
pub mod filter;
pub mod handler;
pub mod ingest;
pub mod orderbook;
pub mod parser;
pub mod repair;
pub mod rest;
pub mod scheduler;
pub mod websocket;

pub use collector::{CollectTask, OrderbookCollector};
pub use config::Config;
pub use error::{MirrorError, Result};
pub use filter::PairFilter;
pub use handler::{BookSummary, DepthHandler, HandlerRegistry, LogHandler, SummaryHandler};
pub use orderbook::{BookEntry, InMemoryOrderbook, PriceRoundKey, Side, SortedView};
pub use parser::{DiffEnvelope, ParsedMessage, SnapshotResponse};
pub use scheduler::{RecurringTask, TaskScheduler};
pub use websocket::{BinanceStreamFactory, StreamPool};

/// Wall-clock milliseconds since the epoch
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}
