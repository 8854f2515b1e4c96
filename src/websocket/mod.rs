//! Streaming module for depth diff connections
//!
//! Defines the stream capability the pool shards symbols across, plus the
//! Binance implementation.

mod client;
mod pool;

pub use client::{BinanceDepthStream, BinanceStreamFactory};
pub use pool::{hash_symbols, StreamPool};

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;

/// One streaming connection carrying depth diffs for a set of symbols
#[async_trait]
pub trait DepthStream: Send + Sync {
    /// Add a symbol to this connection; `false` when at capacity
    fn try_register(&self, symbol: &str) -> bool;

    /// Receive loop; resolves when the connection ends or stop is requested
    async fn run(&self) -> Result<()>;

    /// Wall-clock milliseconds of the last event on any symbol
    fn last_event(&self) -> Option<u64>;

    /// Wall-clock milliseconds of the last event for one symbol
    fn symbol_last_event(&self, symbol: &str) -> Option<u64>;

    /// Ask the receive loop to stop
    fn stop(&self);
}

/// Creates streaming connections for the pool
pub trait StreamFactory: Send + Sync {
    fn create(&self) -> Arc<dyn DepthStream>;
}
