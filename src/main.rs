//! BookMirror - orderbook mirroring service
//!
//! Wires the collector pipeline: config, REST and stream clients, handler
//! registry, scheduler and the health endpoint.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::{routing::get, Json, Router};
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use bookmirror::collector::collect_period;
use bookmirror::rest::BinanceRestClient;
use bookmirror::{
    CollectTask, Config, HandlerRegistry, LogHandler, OrderbookCollector, PairFilter,
    BinanceStreamFactory, TaskScheduler,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer().json())
        .with(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    info!("Starting BookMirror");

    let config = Arc::new(Config::load()?);
    let filter = PairFilter::from_rules(&config.pair_rules);
    info!(
        rules = filter.len(),
        ws = %config.ws_endpoint,
        rest = %config.rest_endpoint,
        "Configuration loaded"
    );

    let http = Arc::new(BinanceRestClient::new(&config.rest_endpoint, true)?);
    let (diff_tx, diff_rx) = mpsc::channel(config.diff_queue_capacity);
    let factory = Arc::new(BinanceStreamFactory::new(
        &config.ws_endpoint,
        config.stream_symbol_capacity,
        diff_tx,
    ));
    let handlers = HandlerRegistry::new().with_raw(Arc::new(LogHandler));

    let collector = Arc::new(OrderbookCollector::new(
        Arc::clone(&config),
        http,
        factory,
        filter,
        handlers,
        diff_rx,
    ));

    let scheduler = TaskScheduler::new(config.max_tick_queue);
    scheduler.register(
        Arc::new(CollectTask::new(Arc::clone(&collector))),
        collect_period(&config),
        Duration::ZERO,
    );

    // Health endpoint
    let health_collector = Arc::clone(&collector);
    let health_port = config.health_port;
    tokio::spawn(async move {
        if let Err(error) = start_health_server(health_collector, health_port).await {
            warn!(error = %error, "Health server error");
        }
    });

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            signal_cancel.cancel();
        }
    });

    let mut ticker = interval(Duration::from_millis(500));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                scheduler.tick(&cancel).await;
            }
        }
    }

    collector.shutdown().await;
    info!("BookMirror stopped");
    Ok(())
}

/// HTTP server for liveness checks
async fn start_health_server(
    collector: Arc<OrderbookCollector>,
    port: u16,
) -> anyhow::Result<()> {
    use std::net::SocketAddr;

    let app = Router::new()
        .route("/health", get(health_check))
        .with_state(collector);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(addr = %addr, "Starting health server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_check(
    State(collector): State<Arc<OrderbookCollector>>,
) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "component": "bookmirror",
        "books": collector.tracked_books(),
        "pending_repairs": collector.pending_repairs(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}
