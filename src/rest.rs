//! REST snapshot and symbol-listing client

use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{MirrorError, Result};
use crate::parser::SnapshotResponse;

/// HTTP capability the pipeline depends on
///
/// Implementations own their timeouts; calls race the cancellation token.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Fetch an authoritative depth snapshot
    async fn get_orderbook(
        &self,
        symbol: &str,
        limit: u32,
        cancel: &CancellationToken,
    ) -> Result<SnapshotResponse>;

    /// List tradeable symbols
    async fn list_symbols(&self, cancel: &CancellationToken) -> Result<Vec<String>>;
}

#[derive(Debug, Deserialize)]
struct ExchangeInfo {
    symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
struct SymbolInfo {
    symbol: String,
    status: String,
}

/// Binance REST API client
#[derive(Debug)]
pub struct BinanceRestClient {
    client: reqwest::Client,
    base_url: String,
    check_status: bool,
}

impl BinanceRestClient {
    /// Create a new REST client
    ///
    /// `check_status` restricts symbol listings to markets in TRADING state.
    pub fn new(base_url: &str, check_status: bool) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            check_status,
        })
    }
}

#[async_trait]
impl HttpClient for BinanceRestClient {
    async fn get_orderbook(
        &self,
        symbol: &str,
        limit: u32,
        cancel: &CancellationToken,
    ) -> Result<SnapshotResponse> {
        let url = format!(
            "{}/depth?symbol={}&limit={}",
            self.base_url,
            symbol.to_uppercase(),
            limit
        );
        debug!(symbol = %symbol, url = %url, "Fetching order book snapshot");

        let request = async {
            let mut snapshot = self
                .client
                .get(&url)
                .send()
                .await?
                .error_for_status()?
                .json::<SnapshotResponse>()
                .await?;
            snapshot.timestamp = crate::now_ms();
            Ok(snapshot)
        };

        tokio::select! {
            result = request => result,
            _ = cancel.cancelled() => Err(MirrorError::Cancelled),
        }
    }

    async fn list_symbols(&self, cancel: &CancellationToken) -> Result<Vec<String>> {
        let url = format!("{}/exchangeInfo", self.base_url);
        debug!(url = %url, "Fetching symbol listing");

        let request = async {
            let info = self
                .client
                .get(&url)
                .send()
                .await?
                .error_for_status()?
                .json::<ExchangeInfo>()
                .await?;
            Ok(info
                .symbols
                .into_iter()
                .filter(|s| !self.check_status || s.status == "TRADING")
                .map(|s| s.symbol)
                .collect())
        };

        tokio::select! {
            result = request => result,
            _ = cancel.cancelled() => Err(MirrorError::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exchange_info_decoding() {
        let raw = r#"{
            "timezone": "UTC",
            "symbols": [
                {"symbol": "BTCUSDT", "status": "TRADING", "baseAsset": "BTC"},
                {"symbol": "DELISTED", "status": "BREAK", "baseAsset": "X"}
            ]
        }"#;

        let info: ExchangeInfo = serde_json::from_str(raw).unwrap();
        assert_eq!(info.symbols.len(), 2);
        assert_eq!(info.symbols[0].symbol, "BTCUSDT");
        assert_eq!(info.symbols[1].status, "BREAK");
    }
}
