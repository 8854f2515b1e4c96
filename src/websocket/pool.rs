//! Stream pool
//!
//! Shards tracked symbols across a set of streaming connections and watches
//! their liveness. The pool completes as soon as any receive loop exits; the
//! orchestrator rebuilds it on the next cycle.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{DepthStream, StreamFactory};
use crate::config::Config;
use crate::error::{MirrorError, Result};

/// Liveness check cadence
const MONITOR_INTERVAL: Duration = Duration::from_secs(10);

/// Symbol counts below this always get a single connection
const SINGLE_STREAM_THRESHOLD: usize = 10;

/// Stable hash over an ordered symbol list
///
/// Compared across setup cycles to detect filter output changes; only ever
/// used within one process lifetime.
pub fn hash_symbols(symbols: &[String]) -> u64 {
    let mut hasher = DefaultHasher::new();
    for symbol in symbols {
        symbol.hash(&mut hasher);
    }
    hasher.finish()
}

/// Pool of depth streams sharded by symbol
pub struct StreamPool {
    streams: Vec<Arc<dyn DepthStream>>,
    assigned: Vec<Vec<String>>,
    symbols_hash: u64,
    idle_global_ms: u64,
    idle_symbol_ms: u64,
    warmup_ms: u64,
}

impl StreamPool {
    /// Shard `symbols` across `clamp(log2(n)+1, 1, max_streams)` connections
    ///
    /// Registration is round-robin; a full lap of refusals for one symbol
    /// fails construction with `OverCapacity`.
    pub fn build(
        symbols: &[String],
        factory: &dyn StreamFactory,
        config: &Config,
    ) -> Result<Self> {
        let count = if symbols.len() < SINGLE_STREAM_THRESHOLD {
            1
        } else {
            ((symbols.len().ilog2() as usize) + 1).clamp(1, config.max_streams)
        };

        let streams: Vec<Arc<dyn DepthStream>> = (0..count).map(|_| factory.create()).collect();
        let mut assigned = vec![Vec::new(); count];

        let mut cursor = 0usize;
        for symbol in symbols {
            let mut refusals = 0usize;
            loop {
                if refusals == streams.len() {
                    return Err(MirrorError::OverCapacity {
                        symbol: symbol.clone(),
                        streams: streams.len(),
                    });
                }
                let idx = cursor % streams.len();
                cursor += 1;
                if streams[idx].try_register(symbol) {
                    assigned[idx].push(symbol.clone());
                    break;
                }
                refusals += 1;
            }
        }

        Ok(Self {
            streams,
            assigned,
            symbols_hash: hash_symbols(symbols),
            idle_global_ms: config.stream_idle_global_ms,
            idle_symbol_ms: config.stream_idle_symbol_ms,
            warmup_ms: config.stream_warmup_ms,
        })
    }

    pub fn symbols_hash(&self) -> u64 {
        self.symbols_hash
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Symbols registered per stream, in pool order
    pub fn assignments(&self) -> &[Vec<String>] {
        &self.assigned
    }

    /// Run every receive loop plus the liveness monitor
    ///
    /// Resolves when any receive loop exits (or on cancellation); the monitor
    /// is cancelled and the remaining streams are stopped and awaited first.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        if self.streams.is_empty() {
            cancel.cancelled().await;
            return Ok(());
        }

        let started_wall = crate::now_ms();
        let mut receivers = JoinSet::new();
        for stream in &self.streams {
            let stream = Arc::clone(stream);
            receivers.spawn(async move { stream.run().await });
        }

        let monitor_cancel = cancel.child_token();
        let monitor = tokio::spawn(Self::monitor(
            self.streams.clone(),
            self.assigned.clone(),
            self.idle_global_ms,
            self.idle_symbol_ms,
            self.warmup_ms,
            started_wall,
            monitor_cancel.clone(),
        ));

        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Stream pool cancelled");
            }
            exited = receivers.join_next() => {
                match exited {
                    Some(Ok(Err(error))) => warn!(error = %error, "Receive loop exited"),
                    Some(Err(error)) => warn!(error = %error, "Receive loop panicked"),
                    _ => info!("Receive loop completed"),
                }
            }
        }

        monitor_cancel.cancel();
        for stream in &self.streams {
            stream.stop();
        }
        while receivers.join_next().await.is_some() {}
        let _ = monitor.await;

        Ok(())
    }

    /// Stop all streams and clear bookkeeping
    pub fn dispose(&mut self) {
        for stream in &self.streams {
            stream.stop();
        }
        self.streams.clear();
        self.assigned.clear();
        self.symbols_hash = 0;
    }

    #[allow(clippy::too_many_arguments)]
    async fn monitor(
        streams: Vec<Arc<dyn DepthStream>>,
        assigned: Vec<Vec<String>>,
        idle_global_ms: u64,
        idle_symbol_ms: u64,
        warmup_ms: u64,
        started_wall: u64,
        cancel: CancellationToken,
    ) {
        let started = tokio::time::Instant::now();
        let mut ticker = interval(MONITOR_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let now = crate::now_ms();
            for (idx, stream) in streams.iter().enumerate() {
                let last = stream.last_event().unwrap_or(started_wall);
                let idle = now.saturating_sub(last);
                if idle > idle_global_ms {
                    warn!(stream = idx, idle_ms = idle, "Stream idle, stopping");
                    stream.stop();
                    continue;
                }

                if started.elapsed() > Duration::from_millis(warmup_ms) {
                    for symbol in &assigned[idx] {
                        let last = stream.symbol_last_event(symbol).unwrap_or(started_wall);
                        let idle = now.saturating_sub(last);
                        if idle > idle_symbol_ms {
                            warn!(
                                stream = idx,
                                symbol = %symbol,
                                idle_ms = idle,
                                "Symbol idle, stopping stream"
                            );
                            stream.stop();
                            break;
                        }
                    }
                }
            }
        }
    }
}
