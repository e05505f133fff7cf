//! External price feed contract and its HTTP client

use crate::config::FeedConfig;
use crate::error::FeedError;
use crate::instrument::{Instrument, InstrumentKind};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use tracing::debug;

/// Source of current prices and dividends
#[async_trait::async_trait]
pub trait PriceFeed: Send + Sync {
    /// Current price of one instrument
    async fn price(&self, instrument: &Instrument) -> Result<Decimal, FeedError>;

    /// Current dividend per unit of one symbol
    async fn dividend(&self, symbol: &str) -> Result<Decimal, FeedError>;

    /// Prices of every instrument of `kind` in one call
    async fn prices_for_kind(
        &self,
        kind: InstrumentKind,
    ) -> Result<HashMap<String, Decimal>, FeedError> {
        Err(FeedError::Unsupported(kind))
    }
}

#[derive(Debug, Deserialize)]
struct PriceResponse {
    price: Decimal,
}

#[derive(Debug, Deserialize)]
struct DividendResponse {
    dividend: Decimal,
}

/// JSON-over-HTTP price feed
///
/// - `GET {base}/price/{symbol}` -> `{"price": n}`
/// - `GET {base}/dividend/{symbol}` -> `{"dividend": n}`
/// - `GET {base}/prices/{kind}` -> `{"SYM": n, ...}`
pub struct HttpPriceFeed {
    client: reqwest::Client,
    base_url: String,
}

impl HttpPriceFeed {
    pub fn new(config: &FeedConfig) -> Result<Self, FeedError> {
        let client = reqwest::Client::builder().timeout(config.request_timeout()).build()?;
        Ok(Self { client, base_url: config.base_url.trim_end_matches('/').to_string() })
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<T, FeedError> {
        let url = format!("{}/{}", self.base_url, path);
        debug!("Fetching {}", url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| FeedError::Unreachable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FeedError::Status { url, status: status.as_u16() });
        }

        Ok(response.json::<T>().await?)
    }
}

#[async_trait::async_trait]
impl PriceFeed for HttpPriceFeed {
    async fn price(&self, instrument: &Instrument) -> Result<Decimal, FeedError> {
        let response: PriceResponse = self.get_json(&format!("price/{}", instrument.symbol)).await?;
        Ok(response.price)
    }

    async fn dividend(&self, symbol: &str) -> Result<Decimal, FeedError> {
        let response: DividendResponse = self.get_json(&format!("dividend/{symbol}")).await?;
        Ok(response.dividend)
    }

    async fn prices_for_kind(
        &self,
        kind: InstrumentKind,
    ) -> Result<HashMap<String, Decimal>, FeedError> {
        if !kind.is_batch_fetchable() {
            return Err(FeedError::Unsupported(kind));
        }
        self.get_json(&format!("prices/{kind}")).await
    }
}
