//! Instrument model and the wire forms pushed to replicas

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Asset class of an instrument
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstrumentKind {
    Equity,
    Crypto,
    Currency,
    Commodity,
}

impl InstrumentKind {
    /// Kinds whose prices the feed can return in one call
    pub fn is_batch_fetchable(self) -> bool {
        matches!(self, InstrumentKind::Crypto)
    }

    /// Kinds whose dividend is refreshed from the feed
    pub fn pays_dividends(self) -> bool {
        matches!(self, InstrumentKind::Equity)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InstrumentKind::Equity => "equity",
            InstrumentKind::Crypto => "crypto",
            InstrumentKind::Currency => "currency",
            InstrumentKind::Commodity => "commodity",
        }
    }
}

impl fmt::Display for InstrumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Presentation metadata, never interpreted by the engine
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentDisplay {
    pub name: String,
    pub description: Option<String>,
    pub icon: Option<String>,
}

/// A tradable synthetic symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instrument {
    pub symbol: String,
    pub kind: InstrumentKind,
    /// Zero until the first successful refresh
    pub price: Decimal,
    pub dividend: Decimal,
    pub last_price_update: Option<DateTime<Utc>>,
    pub last_dividend: DateTime<Utc>,
    pub display: InstrumentDisplay,
}

impl Instrument {
    /// Create an unpriced instrument; the dividend window starts at `created_at`
    pub fn new(
        symbol: impl Into<String>,
        kind: InstrumentKind,
        display: InstrumentDisplay,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            kind,
            price: Decimal::ZERO,
            dividend: Decimal::ZERO,
            last_price_update: None,
            last_dividend: created_at,
            display,
        }
    }

    pub fn is_priced(&self) -> bool {
        self.price > Decimal::ZERO
    }

    pub fn is_refresh_due(&self, now: DateTime<Utc>, interval: chrono::Duration) -> bool {
        match self.last_price_update {
            Some(updated) => now - updated >= interval,
            None => true,
        }
    }

    pub fn is_dividend_due(
        &self,
        now: DateTime<Utc>,
        period: chrono::Duration,
        epsilon: Decimal,
    ) -> bool {
        self.dividend > epsilon && now - self.last_dividend >= period
    }

    /// Wire form of the mutable part of the instrument
    pub fn price_update(&self) -> PriceUpdate {
        PriceUpdate {
            price: self.price,
            last_updated: self.last_price_update,
            dividend: self.dividend,
            last_dividend_timestamp: self.last_dividend,
        }
    }

    /// Overwrite the mutable part wholesale (last writer wins)
    pub fn apply_update(&mut self, update: &PriceUpdate) {
        self.price = update.price;
        self.last_price_update = update.last_updated;
        self.dividend = update.dividend;
        self.last_dividend = update.last_dividend_timestamp;
    }
}

/// Per-symbol entry of a `market.prices` push
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceUpdate {
    pub price: Decimal,
    pub last_updated: Option<DateTime<Utc>>,
    pub dividend: Decimal,
    pub last_dividend_timestamp: DateTime<Utc>,
}

/// `market.prices` payload: symbol -> price update
pub type PriceSnapshot = HashMap<String, PriceUpdate>;

/// Running high/low of an instrument's retained history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HighLow {
    pub high: Decimal,
    pub low: Decimal,
}

/// `market.highlow` payload: symbol -> high/low
pub type HighLowSnapshot = HashMap<String, HighLow>;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn instrument() -> Instrument {
        Instrument::new("AAA", InstrumentKind::Equity, InstrumentDisplay::default(), t(0))
    }

    #[test]
    fn test_new_instrument_is_unpriced_and_due() {
        let instrument = instrument();
        assert!(!instrument.is_priced());
        assert!(instrument.is_refresh_due(t(0), chrono::Duration::seconds(60)));
    }

    #[test]
    fn test_refresh_due_after_interval() {
        let mut instrument = instrument();
        instrument.last_price_update = Some(t(100));

        let interval = chrono::Duration::seconds(60);
        assert!(!instrument.is_refresh_due(t(159), interval));
        assert!(instrument.is_refresh_due(t(160), interval));
    }

    #[test]
    fn test_dividend_due_requires_amount_and_elapsed_period() {
        let mut instrument = instrument();
        let period = chrono::Duration::hours(23);
        let epsilon = Decimal::new(1, 4);

        assert!(!instrument.is_dividend_due(t(100_000), period, epsilon));

        instrument.dividend = Decimal::new(5, 1);
        assert!(!instrument.is_dividend_due(t(82_799), period, epsilon));
        assert!(instrument.is_dividend_due(t(82_800), period, epsilon));
    }

    #[test]
    fn test_apply_update_overwrites_wholesale() {
        let mut source = instrument();
        source.price = Decimal::new(1234, 2);
        source.dividend = Decimal::new(5, 1);
        source.last_price_update = Some(t(10));
        source.last_dividend = t(20);

        let mut replica = instrument();
        replica.apply_update(&source.price_update());
        assert_eq!(replica, source);
    }

    #[test]
    fn test_price_update_wire_names() {
        let json = serde_json::to_value(instrument().price_update()).unwrap();
        assert!(json.get("lastUpdated").is_some());
        assert!(json.get("lastDividendTimestamp").is_some());
    }
}
