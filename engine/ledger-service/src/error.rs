//! Error types for LedgerService

use market_registry::MarketError;
use rust_decimal::Decimal;
use sync_bus::SyncError;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Unknown symbol: {0}")]
    UnknownSymbol(String),

    #[error("Insufficient funds: required {required}, available {available}, short by {shortfall}")]
    InsufficientFunds { required: Decimal, available: Decimal, shortfall: Decimal },

    #[error("Cash account failure: {0}")]
    ExternalFailure(String),

    #[error("Position {position_id} not found for {actor_id}")]
    PositionNotFound { actor_id: String, position_id: Uuid },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Market error: {0}")]
    Market(#[from] MarketError),
}

impl LedgerError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Funds check failure for `required` against `available`
    pub fn insufficient(required: Decimal, available: Decimal) -> Self {
        Self::InsufficientFunds { required, available, shortfall: required - available }
    }
}

/// Failures reported by an external cash account
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CashError {
    #[error("Insufficient cash: requested {requested}, available {available}")]
    Insufficient { requested: Decimal, available: Decimal },

    #[error("Cash account unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(Decimal),
}
