//! Market Registry
//!
//! Authoritative instrument table for the shared market. The authority node
//! refreshes prices from a [`PriceFeed`], records them in the [`HistoryStore`],
//! asks the ledger layer to sweep affected positions through a [`MarketHook`],
//! and pushes the changed subset to replicas over the sync bus.

pub mod config;
pub mod error;
pub mod feed;
pub mod history;
pub mod instrument;
pub mod registry;

pub use config::{FeedConfig, HistoryConfig, InstrumentConfig, MarketConfig};
pub use error::{FeedError, MarketError, Result};
pub use feed::{HttpPriceFeed, PriceFeed};
pub use history::{HistoryRecord, HistoryStore, PriceSample};
pub use instrument::{
    HighLow, HighLowSnapshot, Instrument, InstrumentDisplay, InstrumentKind, PriceSnapshot,
    PriceUpdate,
};
pub use registry::{MarketHook, MarketRegistry, RefreshReport};

/// Re-export the decimal type used for every price and amount
pub use rust_decimal::Decimal;
