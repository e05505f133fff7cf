//! Error types for the market registry

use crate::instrument::InstrumentKind;
use rust_decimal::Decimal;
use sync_bus::SyncError;
use thiserror::Error;

/// Result type for market registry operations
pub type Result<T> = std::result::Result<T, MarketError>;

/// Errors raised by the registry itself
#[derive(Error, Debug)]
pub enum MarketError {
    #[error("Unknown symbol: {0}")]
    UnknownSymbol(String),

    #[error("Symbol {0} has no price yet")]
    NoPrice(String),

    #[error("Duplicate symbol in configuration: {0}")]
    DuplicateSymbol(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failures of the external price feed
///
/// None of these is fatal: the refresh cycle keeps the previous price and
/// moves on to the next instrument.
#[derive(Error, Debug)]
pub enum FeedError {
    #[error("Price feed unreachable: {0}")]
    Unreachable(String),

    #[error("Price {price} for {symbol} outside accepted range")]
    OutOfRange { symbol: String, price: Decimal },

    #[error("Feed returned no price for {0}")]
    MissingSymbol(String),

    #[error("Batch fetch not supported for {0:?}")]
    Unsupported(InstrumentKind),

    #[error("Feed request to {url} failed with status {status}")]
    Status { url: String, status: u16 },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}
