//! Error types for the orderbook mirror

use thiserror::Error;

/// Orderbook mirror errors
#[derive(Error, Debug)]
pub enum MirrorError {
    #[error("stream connection error: {0}")]
    StreamConnection(String),

    #[error("stream message error: {0}")]
    StreamMessage(String),

    #[error("failed to parse message: {0}")]
    Parse(String),

    #[error("REST API error: {0}")]
    RestApi(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("stream pool over capacity: symbol {symbol} refused by all {streams} streams")]
    OverCapacity { symbol: String, streams: usize },

    #[error("concurrent modification of {side} view for {symbol}")]
    ConcurrentModification { symbol: String, side: &'static str },

    #[error("operation cancelled")]
    Cancelled,
}

impl From<tokio_tungstenite::tungstenite::Error> for MirrorError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        MirrorError::StreamConnection(err.to_string())
    }
}

impl From<serde_json::Error> for MirrorError {
    fn from(err: serde_json::Error) -> Self {
        MirrorError::Parse(err.to_string())
    }
}

impl From<reqwest::Error> for MirrorError {
    fn from(err: reqwest::Error) -> Self {
        MirrorError::RestApi(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MirrorError>;
