//! Snapshot repair
//!
//! Symbols flagged with sequence gaps are resynchronized from authoritative
//! HTTP snapshots, one fetch at a time.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::orderbook::{BookMap, InMemoryOrderbook};
use crate::rest::HttpClient;

/// Set of symbols awaiting HTTP resync
#[derive(Debug, Default)]
pub struct PendingRepair {
    symbols: Mutex<HashSet<String>>,
}

impl PendingRepair {
    /// Flag a symbol; returns `false` when it was already pending
    pub fn insert(&self, symbol: &str) -> bool {
        self.symbols.lock().insert(symbol.to_uppercase())
    }

    /// Take any one pending symbol
    pub fn pop(&self) -> Option<String> {
        let mut symbols = self.symbols.lock();
        let symbol = symbols.iter().next().cloned()?;
        symbols.remove(&symbol);
        Some(symbol)
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.symbols.lock().contains(&symbol.to_uppercase())
    }

    pub fn len(&self) -> usize {
        self.symbols.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.lock().is_empty()
    }
}

/// Reconciles gapped books against HTTP snapshots
pub struct SnapshotRepairer {
    books: BookMap,
    pending: Arc<PendingRepair>,
    http: Arc<dyn HttpClient>,
    poll: Duration,
    depth_limit: u32,
}

impl SnapshotRepairer {
    pub fn new(
        books: BookMap,
        pending: Arc<PendingRepair>,
        http: Arc<dyn HttpClient>,
        config: &Config,
    ) -> Self {
        Self {
            books,
            pending,
            http,
            poll: Duration::from_millis(config.repair_poll_ms),
            depth_limit: config.snapshot_depth_limit,
        }
    }

    /// Poll loop; at most one snapshot fetch in flight
    pub async fn run(self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(self.poll) => {}
            }
            self.repair_one(&cancel).await;
        }
    }

    /// Repair a single pending symbol; returns whether one was attempted
    pub async fn repair_one(&self, cancel: &CancellationToken) -> bool {
        let Some(symbol) = self.pending.pop() else {
            return false;
        };

        match self
            .http
            .get_orderbook(&symbol, self.depth_limit, cancel)
            .await
        {
            Ok(snapshot) => {
                let book = self
                    .books
                    .entry(symbol.clone())
                    .or_insert_with(|| Arc::new(InMemoryOrderbook::new(&symbol)))
                    .value()
                    .clone();
                book.apply_snapshot(&snapshot, crate::now_ms());
                info!(
                    symbol = %symbol,
                    last_update_id = snapshot.last_update_id,
                    bids = snapshot.bids.len(),
                    asks = snapshot.asks.len(),
                    "Order book repaired from snapshot"
                );
            }
            Err(error) => {
                if cancel.is_cancelled() {
                    debug!(symbol = %symbol, error = %error, "Repair cancelled");
                } else {
                    warn!(symbol = %symbol, error = %error, "Snapshot repair failed, requeueing");
                }
                self.pending.insert(&symbol);
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use dashmap::DashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::error::{MirrorError, Result};
    use crate::parser::{PriceLevel, SnapshotResponse};
    use rust_decimal_macros::dec;

    struct MockHttp {
        fail: bool,
        calls: AtomicUsize,
    }

    impl MockHttp {
        fn new(fail: bool) -> Self {
            Self {
                fail,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl HttpClient for MockHttp {
        async fn get_orderbook(
            &self,
            _symbol: &str,
            limit: u32,
            _cancel: &CancellationToken,
        ) -> Result<SnapshotResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert_eq!(limit, 5000);
            if self.fail {
                return Err(MirrorError::RestApi("boom".to_string()));
            }
            Ok(SnapshotResponse {
                last_update_id: 100,
                bids: vec![PriceLevel {
                    price: dec!(10.0),
                    quantity: dec!(1.0),
                }],
                asks: vec![PriceLevel {
                    price: dec!(11.0),
                    quantity: dec!(2.0),
                }],
                timestamp: 1_000,
            })
        }

        async fn list_symbols(&self, _cancel: &CancellationToken) -> Result<Vec<String>> {
            Ok(vec![])
        }
    }

    fn repairer(http: Arc<MockHttp>) -> SnapshotRepairer {
        SnapshotRepairer::new(
            Arc::new(DashMap::new()),
            Arc::new(PendingRepair::default()),
            http,
            &Config::default(),
        )
    }

    #[tokio::test]
    async fn test_repair_seeds_book() {
        let http = Arc::new(MockHttp::new(false));
        let repairer = repairer(Arc::clone(&http));
        repairer.pending.insert("BTCUSDT");

        let attempted = repairer.repair_one(&CancellationToken::new()).await;

        assert!(attempted);
        assert!(repairer.pending.is_empty());
        let book = repairer.books.get("BTCUSDT").unwrap().clone();
        assert_eq!(book.last_update_id(), 100);
        assert_eq!(book.depth(), (1, 1));
    }

    #[tokio::test]
    async fn test_failed_repair_requeues() {
        let http = Arc::new(MockHttp::new(true));
        let repairer = repairer(Arc::clone(&http));
        repairer.pending.insert("BTCUSDT");

        let attempted = repairer.repair_one(&CancellationToken::new()).await;

        assert!(attempted);
        assert!(repairer.pending.contains("BTCUSDT"));
        assert_eq!(http.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_nothing_pending() {
        let http = Arc::new(MockHttp::new(false));
        let repairer = repairer(Arc::clone(&http));

        let attempted = repairer.repair_one(&CancellationToken::new()).await;

        assert!(!attempted);
        assert_eq!(http.calls.load(Ordering::SeqCst), 0);
    }
}
