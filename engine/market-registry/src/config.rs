//! Configuration for the market registry

use crate::instrument::InstrumentKind;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// Market registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketConfig {
    /// Minimum age of a price before it is fetched again (seconds)
    pub refresh_interval_secs: u64,

    /// Cadence of the refresh and dividend timers (seconds)
    pub refresh_tick_secs: u64,

    /// Readings above this value are treated as feed failures
    pub price_ceiling: Decimal,

    /// Minimum time between two dividend payouts of one instrument (seconds)
    pub dividend_period_secs: u64,

    /// Dividends at or below this value are not paid
    pub dividend_epsilon: Decimal,

    /// Instruments tradable on this market
    pub instruments: Vec<InstrumentConfig>,
}

/// One configured instrument
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentConfig {
    pub symbol: String,
    pub kind: InstrumentKind,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
}

/// Price history retention configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Samples older than this are evicted (seconds)
    pub retention_secs: u64,

    /// How often eviction and persistence run (seconds)
    pub evict_interval_secs: u64,
}

/// External price feed configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// Base URL of the price service
    pub base_url: String,

    /// Per-request timeout in milliseconds
    pub request_timeout_ms: u64,

    /// Upper bound on concurrent feed requests during one refresh cycle
    pub max_concurrent_requests: usize,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: 60,
            refresh_tick_secs: 10,
            price_ceiling: Decimal::from(1_000_000_000u64),
            dividend_period_secs: 82_800, // 23 hours
            dividend_epsilon: Decimal::new(1, 4),
            instruments: Vec::new(),
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            retention_secs: 86_400, // 24 hours
            evict_interval_secs: 300,
        }
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080".to_string(),
            request_timeout_ms: 5_000,
            max_concurrent_requests: 8,
        }
    }
}

impl MarketConfig {
    pub fn refresh_interval(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.refresh_interval_secs as i64)
    }

    pub fn refresh_tick(&self) -> Duration {
        Duration::from_secs(self.refresh_tick_secs)
    }

    pub fn dividend_period(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.dividend_period_secs as i64)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.refresh_tick_secs == 0 {
            return Err("refresh_tick_secs must be greater than 0".to_string());
        }
        if self.price_ceiling <= Decimal::ZERO {
            return Err("price_ceiling must be positive".to_string());
        }
        if self.dividend_period_secs == 0 {
            return Err("dividend_period_secs must be greater than 0".to_string());
        }
        if self.dividend_epsilon < Decimal::ZERO {
            return Err("dividend_epsilon must not be negative".to_string());
        }

        let mut seen = HashSet::new();
        for instrument in &self.instruments {
            if instrument.symbol.trim().is_empty() {
                return Err("instrument symbol must not be empty".to_string());
            }
            if !seen.insert(instrument.symbol.as_str()) {
                return Err(format!("duplicate instrument symbol: {}", instrument.symbol));
            }
        }
        Ok(())
    }
}

impl HistoryConfig {
    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.retention_secs as i64)
    }

    pub fn evict_interval(&self) -> Duration {
        Duration::from_secs(self.evict_interval_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.retention_secs == 0 || self.evict_interval_secs == 0 {
            return Err("history intervals must be greater than 0".to_string());
        }
        Ok(())
    }
}

impl FeedConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_concurrent_requests == 0 {
            return Err("max_concurrent_requests must be greater than 0".to_string());
        }
        Ok(())
    }
}
