//! Diff ingestion
//!
//! Drains the bounded envelope queue in batches, applies diffs to the
//! per-symbol books and flags gapped symbols for snapshot repair. Large
//! batches fan out across a worker set; small ones stay sequential to avoid
//! the spawn overhead.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::Config;
use crate::orderbook::{BookMap, InMemoryOrderbook};
use crate::parser::DiffEnvelope;
use crate::repair::PendingRepair;

/// Applies queued diff envelopes to the mirrored books
pub struct DiffIngestor {
    books: BookMap,
    pending: Arc<PendingRepair>,
    queue_capacity: usize,
    parallel_threshold: usize,
    post_batch_sleep: Duration,
}

impl DiffIngestor {
    pub fn new(books: BookMap, pending: Arc<PendingRepair>, config: &Config) -> Self {
        Self {
            books,
            pending,
            queue_capacity: config.diff_queue_capacity,
            parallel_threshold: config.parallel_batch_threshold,
            post_batch_sleep: Duration::from_millis(config.post_batch_sleep_ms),
        }
    }

    /// Drain-and-apply loop; resolves on cancellation or queue closure
    pub async fn run(
        self,
        mut rx: mpsc::Receiver<Arc<DiffEnvelope>>,
        cancel: CancellationToken,
    ) {
        let mut batch: Vec<Arc<DiffEnvelope>> = Vec::with_capacity(self.queue_capacity);
        loop {
            batch.clear();
            let drained = tokio::select! {
                _ = cancel.cancelled() => break,
                drained = rx.recv_many(&mut batch, self.queue_capacity) => drained,
            };
            if drained == 0 {
                info!("Diff queue closed, stopping ingest");
                break;
            }

            self.process_batch(&batch).await;

            // Fixed pause caps CPU share under heavy stream bursts
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(self.post_batch_sleep) => {}
            }
        }
    }

    /// Apply one drained batch
    pub async fn process_batch(&self, batch: &[Arc<DiffEnvelope>]) {
        if batch.len() <= self.parallel_threshold {
            for envelope in batch {
                Self::apply(&self.books, &self.pending, envelope);
            }
            return;
        }

        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        let chunk_size = batch.len().div_ceil(workers);

        let mut set = JoinSet::new();
        for chunk in batch.chunks(chunk_size) {
            let chunk: Vec<Arc<DiffEnvelope>> = chunk.to_vec();
            let books = Arc::clone(&self.books);
            let pending = Arc::clone(&self.pending);
            set.spawn(async move {
                for envelope in &chunk {
                    Self::apply(&books, &pending, envelope);
                }
            });
        }
        while set.join_next().await.is_some() {}
    }

    fn apply(books: &BookMap, pending: &PendingRepair, envelope: &DiffEnvelope) {
        let book = books
            .entry(envelope.symbol.clone())
            .or_insert_with(|| Arc::new(InMemoryOrderbook::new(&envelope.symbol)))
            .value()
            .clone();

        if book.apply_diff(envelope) {
            debug!(
                symbol = %envelope.symbol,
                first_id = envelope.first_id,
                last_applied = book.last_update_id(),
                "Sequence gap, scheduling repair"
            );
            pending.insert(&envelope.symbol);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dashmap::DashMap;
    use rust_decimal_macros::dec;

    use crate::parser::PriceLevel;

    fn envelope(symbol: &str, first: u64, last: u64) -> Arc<DiffEnvelope> {
        Arc::new(DiffEnvelope {
            event_time: 1_000,
            symbol: symbol.to_string(),
            first_id: first,
            final_id: last,
            bid_changes: vec![PriceLevel {
                price: dec!(10.0),
                quantity: dec!(1.0),
            }],
            ask_changes: vec![],
        })
    }

    fn ingestor(threshold: usize) -> DiffIngestor {
        let config = Config {
            parallel_batch_threshold: threshold,
            ..Config::default()
        };
        DiffIngestor::new(
            Arc::new(DashMap::new()),
            Arc::new(PendingRepair::default()),
            &config,
        )
    }

    #[tokio::test]
    async fn test_gap_flags_repair_in_same_batch() {
        let ingestor = ingestor(32);

        // Empty book means the very first diff is gapped
        ingestor.process_batch(&[envelope("BTCUSDT", 60, 61)]).await;

        assert!(ingestor.pending.contains("BTCUSDT"));
        let book = ingestor.books.get("BTCUSDT").unwrap().clone();
        assert_eq!(book.last_update_id(), 61);
        assert_eq!(book.depth().0, 1);
    }

    #[tokio::test]
    async fn test_contiguous_diffs_do_not_flag() {
        let ingestor = ingestor(32);

        ingestor.process_batch(&[envelope("BTCUSDT", 1, 5)]).await;
        ingestor.pending.pop();

        ingestor.process_batch(&[envelope("BTCUSDT", 6, 9)]).await;

        assert!(ingestor.pending.is_empty());
        let book = ingestor.books.get("BTCUSDT").unwrap().clone();
        assert_eq!(book.last_update_id(), 9);
    }

    #[tokio::test]
    async fn test_parallel_batch_applies_everything() {
        let ingestor = ingestor(2);

        let batch: Vec<_> = (0..20)
            .map(|i| envelope(&format!("SYM{}USDT", i), 1, 1))
            .collect();
        ingestor.process_batch(&batch).await;

        assert_eq!(ingestor.books.len(), 20);
        for entry in ingestor.books.iter() {
            assert_eq!(entry.value().last_update_id(), 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_drains_queue() {
        let ingestor = ingestor(32);
        let books = Arc::clone(&ingestor.books);
        let pending = Arc::clone(&ingestor.pending);

        let (tx, rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(ingestor.run(rx, cancel.clone()));

        tx.send(envelope("BTCUSDT", 1, 3)).await.unwrap();
        tx.send(envelope("BTCUSDT", 4, 6)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let book = books.get("BTCUSDT").unwrap().clone();
        assert_eq!(book.last_update_id(), 6);
        // Only the first diff hit an empty book
        assert_eq!(pending.len(), 1);

        cancel.cancel();
        task.await.unwrap();
    }
}
