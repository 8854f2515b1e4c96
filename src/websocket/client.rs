//! WebSocket client for Binance depth streams
//!
//! One connection subscribes the combined diff stream for its registered
//! symbols and forwards decoded envelopes into the ingest queue.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{DepthStream, StreamFactory};
use crate::error::{MirrorError, Result};
use crate::parser::{DiffEnvelope, ParsedMessage};

/// A single Binance combined-stream connection
pub struct BinanceDepthStream {
    endpoint: String,
    capacity: usize,
    symbols: Mutex<Vec<String>>,
    diff_tx: mpsc::Sender<Arc<DiffEnvelope>>,
    /// 0 = no event seen yet
    last_event: AtomicU64,
    symbol_events: DashMap<String, u64>,
    cancel: CancellationToken,
}

impl BinanceDepthStream {
    pub fn new(endpoint: &str, capacity: usize, diff_tx: mpsc::Sender<Arc<DiffEnvelope>>) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            capacity,
            symbols: Mutex::new(Vec::new()),
            diff_tx,
            last_event: AtomicU64::new(0),
            symbol_events: DashMap::new(),
            cancel: CancellationToken::new(),
        }
    }

    fn stamp(&self, symbol: &str, now: u64) {
        self.last_event.store(now, Ordering::Release);
        self.symbol_events.insert(symbol.to_uppercase(), now);
    }

    async fn forward(&self, text: &str) -> Result<()> {
        let parsed = match ParsedMessage::parse(text) {
            Ok(parsed) => parsed,
            Err(error) => {
                warn!(error = %error, "Failed to decode stream message");
                return Ok(());
            }
        };
        match parsed {
            ParsedMessage::Diff(diff) => {
                self.stamp(&diff.symbol, crate::now_ms());
                if self.diff_tx.send(Arc::new(diff)).await.is_err() {
                    return Err(MirrorError::StreamMessage(
                        "diff queue closed".to_string(),
                    ));
                }
            }
            ParsedMessage::Unknown(raw) => {
                debug!(len = raw.len(), "Ignoring non-depth message");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DepthStream for BinanceDepthStream {
    fn try_register(&self, symbol: &str) -> bool {
        let mut symbols = self.symbols.lock();
        if symbols.len() >= self.capacity {
            return false;
        }
        symbols.push(symbol.to_uppercase());
        true
    }

    async fn run(&self) -> Result<()> {
        let symbols = self.symbols.lock().clone();
        if symbols.is_empty() {
            // Nothing to subscribe; park until stopped
            self.cancel.cancelled().await;
            return Ok(());
        }

        let streams: Vec<String> = symbols
            .iter()
            .map(|s| format!("{}@depth@100ms", s.to_lowercase()))
            .collect();
        let url = format!("{}/stream?streams={}", self.endpoint, streams.join("/"));

        info!(symbols = symbols.len(), "Connecting depth stream");
        let (mut ws, response) = connect_async(&url).await.map_err(|e| {
            MirrorError::StreamConnection(format!("failed to connect: {}", e))
        })?;
        debug!(status = ?response.status(), "Depth stream connected");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = ws.close(None).await;
                    return Ok(());
                }
                message = ws.next() => match message {
                    Some(Ok(Message::Text(text))) => self.forward(&text).await?,
                    Some(Ok(Message::Binary(data))) => {
                        let text = String::from_utf8_lossy(&data).to_string();
                        self.forward(&text).await?;
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = ws.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                    Some(Ok(Message::Close(frame))) => {
                        warn!(frame = ?frame, "Depth stream closed by peer");
                        return Err(MirrorError::StreamConnection(
                            "connection closed".to_string(),
                        ));
                    }
                    Some(Err(error)) => {
                        warn!(error = %error, "Depth stream error");
                        return Err(error.into());
                    }
                    None => {
                        warn!("Depth stream ended");
                        return Err(MirrorError::StreamConnection(
                            "stream ended".to_string(),
                        ));
                    }
                }
            }
        }
    }

    fn last_event(&self) -> Option<u64> {
        match self.last_event.load(Ordering::Acquire) {
            0 => None,
            ms => Some(ms),
        }
    }

    fn symbol_last_event(&self, symbol: &str) -> Option<u64> {
        self.symbol_events
            .get(&symbol.to_uppercase())
            .map(|entry| *entry.value())
    }

    fn stop(&self) {
        self.cancel.cancel();
    }
}

/// Factory handing the pool Binance connections wired to the ingest queue
pub struct BinanceStreamFactory {
    endpoint: String,
    capacity: usize,
    diff_tx: mpsc::Sender<Arc<DiffEnvelope>>,
}

impl BinanceStreamFactory {
    pub fn new(endpoint: &str, capacity: usize, diff_tx: mpsc::Sender<Arc<DiffEnvelope>>) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            capacity,
            diff_tx,
        }
    }
}

impl StreamFactory for BinanceStreamFactory {
    fn create(&self) -> Arc<dyn DepthStream> {
        Arc::new(BinanceDepthStream::new(
            &self.endpoint,
            self.capacity,
            self.diff_tx.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registration_capacity() {
        let (tx, _rx) = mpsc::channel(8);
        let stream = BinanceDepthStream::new("wss://example", 2, tx);
        assert!(stream.try_register("btcusdt"));
        assert!(stream.try_register("ETHUSDT"));
        assert!(!stream.try_register("SOLUSDT"));
    }

    #[tokio::test]
    async fn test_forward_stamps_and_queues() {
        let (tx, mut rx) = mpsc::channel(8);
        let stream = BinanceDepthStream::new("wss://example", 8, tx);
        assert!(stream.last_event().is_none());

        let raw = r#"{
            "e": "depthUpdate",
            "E": 1,
            "s": "BTCUSDT",
            "U": 1,
            "u": 2,
            "b": [["10.0", "1.0"]],
            "a": []
        }"#;
        stream.forward(raw).await.unwrap();

        assert!(stream.last_event().is_some());
        assert!(stream.symbol_last_event("btcusdt").is_some());
        assert!(stream.symbol_last_event("ETHUSDT").is_none());

        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.symbol, "BTCUSDT");
        assert_eq!(envelope.final_id, 2);
    }
}
