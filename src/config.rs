//! Configuration module for the orderbook mirror

use std::env;
use std::thread;

use serde::Deserialize;

/// Application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// WebSocket endpoint for diff streams
    pub ws_endpoint: String,

    /// REST API endpoint for snapshots and symbol listing
    pub rest_endpoint: String,

    /// Pair filter rules (inline blob; see [`crate::filter::PairFilter`])
    pub pair_rules: String,

    /// How long the cached symbol listing stays fresh
    pub symbols_expiry_ms: u64,

    /// Book entries untouched for this long are expired after dispatch
    pub entry_expiry_ms: u64,

    /// Capacity of the bounded diff envelope queue
    pub diff_queue_capacity: usize,

    /// Batches larger than this are applied across a worker pool
    pub parallel_batch_threshold: usize,

    /// Cooperative pause after each ingest batch
    pub post_batch_sleep_ms: u64,

    /// Delay between snapshot repair attempts
    pub repair_poll_ms: u64,

    /// A stream with no events at all for this long is stopped
    pub stream_idle_global_ms: u64,

    /// After warmup, a tracked symbol silent for this long stops its stream
    pub stream_idle_symbol_ms: u64,

    /// Per-symbol idle checks only start this long after pool start
    pub stream_warmup_ms: u64,

    /// Maximum concurrently queued scheduler ticks
    pub max_tick_queue: usize,

    /// Upper bound on streaming connections in the pool
    pub max_streams: usize,

    /// Maximum symbols a single streaming connection accepts
    pub stream_symbol_capacity: usize,

    /// Depth levels requested per repair snapshot
    pub snapshot_depth_limit: u32,

    /// Period of the snapshot dispatch task
    pub collect_interval_ms: u64,

    /// Port for the health endpoint
    pub health_port: u16,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn default_tick_queue() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2)
        .clamp(2, 32)
}

impl Config {
    /// Load configuration from environment variables
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let pair_rules = match env::var("PAIR_RULES_FILE") {
            Ok(path) => std::fs::read_to_string(&path)?,
            Err(_) => env::var("PAIR_RULES").unwrap_or_default(),
        };

        Ok(Self {
            ws_endpoint: env::var("WS_ENDPOINT")
                .unwrap_or_else(|_| "wss://stream.binance.com:9443".to_string()),
            rest_endpoint: env::var("REST_ENDPOINT")
                .unwrap_or_else(|_| "https://api.binance.com/api/v3".to_string()),
            pair_rules,
            symbols_expiry_ms: env_parse("SYMBOLS_EXPIRY_MS", 300_000),
            entry_expiry_ms: env_parse("ENTRY_EXPIRY_MS", 864_000_000),
            diff_queue_capacity: env_parse("DIFF_QUEUE_CAPACITY", 8192),
            parallel_batch_threshold: env_parse("PARALLEL_BATCH_THRESHOLD", 32),
            post_batch_sleep_ms: env_parse("POST_BATCH_SLEEP_MS", 10),
            repair_poll_ms: env_parse("REPAIR_POLL_MS", 5000),
            stream_idle_global_ms: env_parse("STREAM_IDLE_GLOBAL_MS", 20_000),
            stream_idle_symbol_ms: env_parse("STREAM_IDLE_SYMBOL_MS", 60_000),
            stream_warmup_ms: env_parse("STREAM_WARMUP_MS", 120_000),
            max_tick_queue: env_parse("MAX_TICK_QUEUE", default_tick_queue()),
            max_streams: env_parse("MAX_STREAMS", 256),
            stream_symbol_capacity: env_parse("STREAM_SYMBOL_CAPACITY", 1024),
            snapshot_depth_limit: env_parse("SNAPSHOT_DEPTH_LIMIT", 5000),
            collect_interval_ms: env_parse("COLLECT_INTERVAL_MS", 10_000),
            health_port: env_parse("HEALTH_PORT", 9090),
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ws_endpoint: "wss://stream.binance.com:9443".to_string(),
            rest_endpoint: "https://api.binance.com/api/v3".to_string(),
            pair_rules: String::new(),
            symbols_expiry_ms: 300_000,
            entry_expiry_ms: 864_000_000,
            diff_queue_capacity: 8192,
            parallel_batch_threshold: 32,
            post_batch_sleep_ms: 10,
            repair_poll_ms: 5000,
            stream_idle_global_ms: 20_000,
            stream_idle_symbol_ms: 60_000,
            stream_warmup_ms: 120_000,
            max_tick_queue: default_tick_queue(),
            max_streams: 256,
            stream_symbol_capacity: 1024,
            snapshot_depth_limit: 5000,
            collect_interval_ms: 10_000,
            health_port: 9090,
        }
    }
}
