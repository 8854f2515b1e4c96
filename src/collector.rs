//! Orderbook collector
//!
//! Orchestrates the pipeline: refreshes and filters the symbol universe,
//! keeps the stream pool matched to it, runs the ingest and repair loops in
//! the background, and dispatches sorted views to the registered handlers on
//! every collection cycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::future::join_all;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{MirrorError, Result};
use crate::filter::PairFilter;
use crate::handler::HandlerRegistry;
use crate::ingest::DiffIngestor;
use crate::orderbook::{BookMap, InMemoryOrderbook};
use crate::parser::DiffEnvelope;
use crate::repair::{PendingRepair, SnapshotRepairer};
use crate::rest::HttpClient;
use crate::scheduler::RecurringTask;
use crate::websocket::{hash_symbols, StreamFactory, StreamPool};

#[derive(Default)]
struct PoolSlot {
    hash: u64,
    task: Option<JoinHandle<()>>,
    cancel: Option<CancellationToken>,
}

#[derive(Default)]
struct SymbolCache {
    symbols: Vec<String>,
    refreshed_at: u64,
}

/// Mirrors filtered symbols and dispatches snapshots to handlers
pub struct OrderbookCollector {
    config: Arc<Config>,
    http: Arc<dyn HttpClient>,
    factory: Arc<dyn StreamFactory>,
    filter: PairFilter,
    handlers: HandlerRegistry,
    books: BookMap,
    pending: Arc<PendingRepair>,
    diff_rx: Mutex<Option<mpsc::Receiver<Arc<DiffEnvelope>>>>,
    pool: tokio::sync::Mutex<PoolSlot>,
    /// Serializes pool teardown/rebuild across concurrent cycles
    rebuild_gate: Semaphore,
    symbol_cache: Mutex<SymbolCache>,
    background: Mutex<Vec<JoinHandle<()>>>,
    loops_started: AtomicBool,
    root_cancel: CancellationToken,
}

impl OrderbookCollector {
    pub fn new(
        config: Arc<Config>,
        http: Arc<dyn HttpClient>,
        factory: Arc<dyn StreamFactory>,
        filter: PairFilter,
        handlers: HandlerRegistry,
        diff_rx: mpsc::Receiver<Arc<DiffEnvelope>>,
    ) -> Self {
        Self {
            config,
            http,
            factory,
            filter,
            handlers,
            books: Arc::new(DashMap::new()),
            pending: Arc::new(PendingRepair::default()),
            diff_rx: Mutex::new(Some(diff_rx)),
            pool: tokio::sync::Mutex::new(PoolSlot::default()),
            rebuild_gate: Semaphore::new(1),
            symbol_cache: Mutex::new(SymbolCache::default()),
            background: Mutex::new(Vec::new()),
            loops_started: AtomicBool::new(false),
            root_cancel: CancellationToken::new(),
        }
    }

    /// Number of mirrored books
    pub fn tracked_books(&self) -> usize {
        self.books.len()
    }

    /// Symbols currently awaiting snapshot repair
    pub fn pending_repairs(&self) -> usize {
        self.pending.len()
    }

    /// One collection cycle: setup, dispatch, maintenance
    pub async fn collect(&self, cancel: &CancellationToken) -> Result<()> {
        self.setup(cancel).await?;

        let cutoff = crate::now_ms().saturating_sub(self.config.entry_expiry_ms);
        let books: Vec<Arc<InMemoryOrderbook>> =
            self.books.iter().map(|entry| Arc::clone(entry.value())).collect();
        for book in books {
            if cancel.is_cancelled() {
                return Err(MirrorError::Cancelled);
            }
            if book.is_empty() {
                continue;
            }
            self.dispatch_book(&book, cancel).await;
            book.reset_statistics();
            book.drop_older_than(cutoff);
        }
        Ok(())
    }

    /// Refresh symbols, match the pool to them, ensure background loops
    async fn setup(&self, cancel: &CancellationToken) -> Result<()> {
        let symbols = self.tracked_symbols(cancel).await?;
        let hash = hash_symbols(&symbols);

        let stale = {
            let slot = self.pool.lock().await;
            slot.hash != hash || slot.task.as_ref().map_or(true, JoinHandle::is_finished)
        };
        if stale {
            let _permit = self
                .rebuild_gate
                .acquire()
                .await
                .map_err(|_| MirrorError::Cancelled)?;
            let mut slot = self.pool.lock().await;
            // Another cycle may have rebuilt while we waited on the gate
            if slot.hash != hash || slot.task.as_ref().map_or(true, JoinHandle::is_finished) {
                Self::teardown_pool(&mut slot).await;

                let pool = StreamPool::build(&symbols, self.factory.as_ref(), &self.config)?;
                info!(
                    streams = pool.stream_count(),
                    symbols = symbols.len(),
                    "Stream pool built"
                );
                let run_cancel = self.root_cancel.child_token();
                let task_cancel = run_cancel.clone();
                slot.hash = hash;
                slot.cancel = Some(run_cancel);
                slot.task = Some(tokio::spawn(async move {
                    let mut pool = pool;
                    if let Err(error) = pool.run(task_cancel).await {
                        warn!(error = %error, "Stream pool stopped with error");
                    }
                    pool.dispose();
                }));
            }
        }

        self.ensure_loops();
        Ok(())
    }

    /// Cached, filtered symbol universe
    async fn tracked_symbols(&self, cancel: &CancellationToken) -> Result<Vec<String>> {
        let now = crate::now_ms();
        let cached = {
            let cache = self.symbol_cache.lock();
            let fresh = !cache.symbols.is_empty()
                && now.saturating_sub(cache.refreshed_at) <= self.config.symbols_expiry_ms;
            fresh.then(|| cache.symbols.clone())
        };

        let raw = match cached {
            Some(symbols) => symbols,
            None => {
                let listed = self.http.list_symbols(cancel).await?;
                info!(count = listed.len(), "Symbol listing refreshed");
                let mut cache = self.symbol_cache.lock();
                cache.symbols = listed.clone();
                cache.refreshed_at = now;
                listed
            }
        };

        Ok(raw
            .into_iter()
            .filter(|symbol| self.filter.matches(symbol))
            .collect())
    }

    fn ensure_loops(&self) {
        if self.loops_started.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(rx) = self.diff_rx.lock().take() else {
            return;
        };

        let ingestor = DiffIngestor::new(
            Arc::clone(&self.books),
            Arc::clone(&self.pending),
            &self.config,
        );
        let repairer = SnapshotRepairer::new(
            Arc::clone(&self.books),
            Arc::clone(&self.pending),
            Arc::clone(&self.http),
            &self.config,
        );

        let mut background = self.background.lock();
        background.push(tokio::spawn(
            ingestor.run(rx, self.root_cancel.child_token()),
        ));
        background.push(tokio::spawn(repairer.run(self.root_cancel.child_token())));
        info!("Ingest and repair loops started");
    }

    async fn dispatch_book(&self, book: &InMemoryOrderbook, cancel: &CancellationToken) {
        let (mut bids, mut asks) = book.views();
        bids.enforce();
        asks.enforce();

        let symbol = book.symbol();
        let bids = &bids;
        let asks = &asks;

        let raw_calls = self.handlers.raw().iter().map(|handler| {
            let handler = Arc::clone(handler);
            async move {
                let result = handler.handle(symbol, bids, asks, cancel).await;
                (handler, result)
            }
        });
        for (handler, result) in join_all(raw_calls).await {
            if let Err(error) = result {
                self.log_handler_failure(handler.name(), symbol, &error, cancel);
            }
        }

        if self.handlers.summary().is_empty() {
            return;
        }
        match self
            .handlers
            .aggregator()
            .aggregate(symbol, bids, asks, cancel)
            .await
        {
            Ok(summary) => {
                let summary = &summary;
                let summary_calls = self.handlers.summary().iter().map(|handler| {
                    let handler = Arc::clone(handler);
                    async move {
                        let result = handler.handle(summary, cancel).await;
                        (handler, result)
                    }
                });
                for (handler, result) in join_all(summary_calls).await {
                    if let Err(error) = result {
                        self.log_handler_failure(handler.name(), symbol, &error, cancel);
                    }
                }
            }
            Err(error) => {
                warn!(symbol = %symbol, error = %error, "Aggregation failed");
            }
        }
    }

    fn log_handler_failure(
        &self,
        handler: &str,
        symbol: &str,
        error: &MirrorError,
        cancel: &CancellationToken,
    ) {
        if cancel.is_cancelled() {
            debug!(handler = %handler, symbol = %symbol, error = %error, "Handler cancelled");
        } else {
            warn!(handler = %handler, symbol = %symbol, error = %error, "Handler failed");
        }
    }

    async fn teardown_pool(slot: &mut PoolSlot) {
        if let Some(cancel) = slot.cancel.take() {
            cancel.cancel();
        }
        if let Some(task) = slot.task.take() {
            let _ = task.await;
        }
        slot.hash = 0;
    }

    /// Stop background loops and the stream pool, awaiting clean unwind
    pub async fn shutdown(&self) {
        self.root_cancel.cancel();
        {
            let mut slot = self.pool.lock().await;
            Self::teardown_pool(&mut slot).await;
        }
        let handles: Vec<JoinHandle<()>> = self.background.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        info!("Collector shut down");
    }

    #[cfg(test)]
    pub(crate) fn books(&self) -> &BookMap {
        &self.books
    }
}

/// Scheduler task driving periodic collection
pub struct CollectTask {
    collector: Arc<OrderbookCollector>,
}

impl CollectTask {
    pub fn new(collector: Arc<OrderbookCollector>) -> Self {
        Self { collector }
    }
}

#[async_trait]
impl RecurringTask for CollectTask {
    fn name(&self) -> &str {
        "collect"
    }

    async fn execute(&self, cancel: &CancellationToken) -> anyhow::Result<()> {
        match self.collector.collect(cancel).await {
            Ok(()) => Ok(()),
            // Shutdown races are not failures
            Err(MirrorError::Cancelled) if cancel.is_cancelled() => Ok(()),
            Err(error) => Err(error.into()),
        }
    }
}

/// Period helper for registering the collect task
pub fn collect_period(config: &Config) -> Duration {
    Duration::from_millis(config.collect_interval_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::sync::atomic::AtomicUsize;

    use crate::orderbook::{PriceRoundKey, Side, SortedView};
    use crate::parser::{PriceLevel, SnapshotResponse};
    use crate::websocket::DepthStream;

    struct MockHttp {
        list_calls: AtomicUsize,
        snapshot_calls: AtomicUsize,
    }

    impl MockHttp {
        fn new() -> Self {
            Self {
                list_calls: AtomicUsize::new(0),
                snapshot_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl HttpClient for MockHttp {
        async fn get_orderbook(
            &self,
            _symbol: &str,
            _limit: u32,
            _cancel: &CancellationToken,
        ) -> Result<SnapshotResponse> {
            self.snapshot_calls.fetch_add(1, Ordering::SeqCst);
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
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![
                "BTCUSDT".to_string(),
                "ETHUSDT".to_string(),
                "XRPUSDT".to_string(),
            ])
        }
    }

    struct MockStream {
        capacity: usize,
        registered: Mutex<Vec<String>>,
        cancel: CancellationToken,
    }

    #[async_trait]
    impl DepthStream for MockStream {
        fn try_register(&self, symbol: &str) -> bool {
            let mut registered = self.registered.lock();
            if registered.len() >= self.capacity {
                return false;
            }
            registered.push(symbol.to_string());
            true
        }

        async fn run(&self) -> Result<()> {
            self.cancel.cancelled().await;
            Ok(())
        }

        fn last_event(&self) -> Option<u64> {
            Some(crate::now_ms())
        }

        fn symbol_last_event(&self, _symbol: &str) -> Option<u64> {
            Some(crate::now_ms())
        }

        fn stop(&self) {
            self.cancel.cancel();
        }
    }

    struct MockFactory {
        capacity: usize,
        streams: Mutex<Vec<Arc<MockStream>>>,
    }

    impl MockFactory {
        fn new(capacity: usize) -> Self {
            Self {
                capacity,
                streams: Mutex::new(Vec::new()),
            }
        }

        fn created(&self) -> usize {
            self.streams.lock().len()
        }

        fn registered(&self) -> Vec<String> {
            self.streams
                .lock()
                .iter()
                .flat_map(|s| s.registered.lock().clone())
                .collect()
        }
    }

    impl StreamFactory for MockFactory {
        fn create(&self) -> Arc<dyn DepthStream> {
            let stream = Arc::new(MockStream {
                capacity: self.capacity,
                registered: Mutex::new(Vec::new()),
                cancel: CancellationToken::new(),
            });
            self.streams.lock().push(Arc::clone(&stream));
            stream
        }
    }

    struct RecordingHandler {
        seen: Mutex<Vec<(String, usize, usize)>>,
    }

    #[async_trait]
    impl crate::handler::DepthHandler for RecordingHandler {
        fn name(&self) -> &str {
            "recording"
        }

        async fn handle(
            &self,
            symbol: &str,
            bids: &SortedView<'_>,
            asks: &SortedView<'_>,
            _cancel: &CancellationToken,
        ) -> Result<()> {
            self.seen
                .lock()
                .push((symbol.to_string(), bids.len(), asks.len()));
            Ok(())
        }
    }

    fn envelope(symbol: &str, first: u64, last: u64) -> Arc<DiffEnvelope> {
        Arc::new(DiffEnvelope {
            event_time: crate::now_ms(),
            symbol: symbol.to_string(),
            first_id: first,
            final_id: last,
            bid_changes: vec![PriceLevel {
                price: dec!(10.0),
                quantity: dec!(1.0),
            }],
            ask_changes: vec![PriceLevel {
                price: dec!(11.0),
                quantity: dec!(2.0),
            }],
        })
    }

    struct Fixture {
        collector: Arc<OrderbookCollector>,
        http: Arc<MockHttp>,
        factory: Arc<MockFactory>,
        handler: Arc<RecordingHandler>,
        diff_tx: mpsc::Sender<Arc<DiffEnvelope>>,
    }

    fn fixture(rules: &str, capacity: usize) -> Fixture {
        let config = Arc::new(Config::default());
        let http = Arc::new(MockHttp::new());
        let factory = Arc::new(MockFactory::new(capacity));
        let handler = Arc::new(RecordingHandler {
            seen: Mutex::new(Vec::new()),
        });
        let (diff_tx, diff_rx) = mpsc::channel(config.diff_queue_capacity);
        let collector = Arc::new(OrderbookCollector::new(
            Arc::clone(&config),
            Arc::clone(&http) as Arc<dyn HttpClient>,
            Arc::clone(&factory) as Arc<dyn StreamFactory>,
            PairFilter::from_rules(rules),
            HandlerRegistry::new().with_raw(Arc::clone(&handler) as Arc<dyn crate::handler::DepthHandler>),
            diff_rx,
        ));
        Fixture {
            collector,
            http,
            factory,
            handler,
            diff_tx,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_collect_dispatches_and_resets() {
        let fx = fixture("BTCUSDT", 1024);
        let cancel = CancellationToken::new();

        // First cycle: builds the pool, starts loops, nothing to dispatch
        fx.collector.collect(&cancel).await.unwrap();
        assert!(fx.handler.seen.lock().is_empty());
        assert_eq!(fx.factory.registered(), vec!["BTCUSDT".to_string()]);

        fx.diff_tx.send(envelope("BTCUSDT", 1, 5)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        fx.collector.collect(&cancel).await.unwrap();

        let seen = fx.handler.seen.lock().clone();
        assert_eq!(seen, vec![("BTCUSDT".to_string(), 1, 1)]);

        // Statistics were reset after dispatch
        let book = fx.collector.books().get("BTCUSDT").unwrap().clone();
        let entry = book
            .levels(Side::Bid)
            .get(&PriceRoundKey::from_price(dec!(10.0)))
            .unwrap()
            .clone();
        assert_eq!(entry.update_count, 0);

        fx.collector.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_symbol_cache_and_stable_pool() {
        let fx = fixture("BTCUSDT", 1024);
        let cancel = CancellationToken::new();

        fx.collector.collect(&cancel).await.unwrap();
        fx.collector.collect(&cancel).await.unwrap();

        // Listing cached within the expiry, pool untouched
        assert_eq!(fx.http.list_calls.load(Ordering::SeqCst), 1);
        assert_eq!(fx.factory.created(), 1);

        fx.collector.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_gap_triggers_repair_flow() {
        let fx = fixture("BTCUSDT", 1024);
        let cancel = CancellationToken::new();

        fx.collector.collect(&cancel).await.unwrap();

        // First diff hits an empty book: gap flagged, repair runs on its poll
        fx.diff_tx.send(envelope("BTCUSDT", 60, 61)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fx.collector.pending_repairs(), 1);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(fx.collector.pending_repairs(), 0);
        assert_eq!(fx.http.snapshot_calls.load(Ordering::SeqCst), 1);

        // Snapshot is authoritative at fetch time
        let book = fx.collector.books().get("BTCUSDT").unwrap().clone();
        assert_eq!(book.last_update_id(), 100);

        fx.collector.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_over_capacity_surfaces() {
        let fx = fixture("", 1);
        let cancel = CancellationToken::new();

        // Three tracked symbols cannot fit one single-slot stream
        let result = fx.collector.collect(&cancel).await;
        assert!(matches!(result, Err(MirrorError::OverCapacity { .. })));

        fx.collector.shutdown().await;
    }
}
