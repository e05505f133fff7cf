//! MarketRegistry: instrument table plus the authority's refresh and dividend cycles

use crate::config::MarketConfig;
use crate::error::{FeedError, MarketError, Result};
use crate::feed::PriceFeed;
use crate::history::HistoryStore;
use crate::instrument::{Instrument, InstrumentDisplay, InstrumentKind, PriceSnapshot};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use sync_bus::{channels, stores, SyncBus};
use tracing::{debug, info, warn};

/// Ledger-side reactions to market changes
///
/// The registry never owns the ledger layer; the scheduler passes the hook into
/// every cycle.
#[async_trait::async_trait]
pub trait MarketHook: Send + Sync {
    /// `symbol` got a new price, already recorded in history
    async fn on_price_changed(&self, symbol: &str);

    /// `symbol` pays `dividend_per_unit` to every holder
    async fn on_dividend(&self, symbol: &str, dividend_per_unit: Decimal);
}

/// Outcome of one refresh cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshReport {
    /// Symbols whose price was updated
    pub updated: Vec<String>,
    /// Symbols whose feed reading was rejected; previous price kept
    pub failed: Vec<String>,
}

struct FetchOutcome {
    symbol: String,
    price: std::result::Result<Decimal, FeedError>,
    dividend: Option<std::result::Result<Decimal, FeedError>>,
}

/// Authoritative symbol -> instrument table
pub struct MarketRegistry {
    config: MarketConfig,
    instruments: DashMap<String, Instrument>,
    history: Arc<HistoryStore>,
    bus: SyncBus,
    feed: Arc<dyn PriceFeed>,
    max_concurrent_requests: usize,
}

impl MarketRegistry {
    /// Build the registry from configuration; instruments start unpriced
    pub fn new(
        config: MarketConfig,
        max_concurrent_requests: usize,
        history: Arc<HistoryStore>,
        bus: SyncBus,
        feed: Arc<dyn PriceFeed>,
    ) -> Result<Self> {
        config.validate().map_err(MarketError::Config)?;

        let now = Utc::now();
        let instruments = DashMap::new();
        for entry in &config.instruments {
            let display = InstrumentDisplay {
                name: entry.name.clone().unwrap_or_else(|| entry.symbol.clone()),
                description: entry.description.clone(),
                icon: entry.icon.clone(),
            };
            let instrument = Instrument::new(entry.symbol.clone(), entry.kind, display, now);
            if instruments.insert(entry.symbol.clone(), instrument).is_some() {
                return Err(MarketError::DuplicateSymbol(entry.symbol.clone()));
            }
        }

        info!("Market registry created with {} instruments", instruments.len());

        Ok(Self {
            config,
            instruments,
            history,
            bus,
            feed,
            max_concurrent_requests: max_concurrent_requests.max(1),
        })
    }

    pub fn config(&self) -> &MarketConfig {
        &self.config
    }

    pub fn history(&self) -> &Arc<HistoryStore> {
        &self.history
    }

    pub fn instrument(&self, symbol: &str) -> Option<Instrument> {
        self.instruments.get(symbol).map(|i| i.value().clone())
    }

    /// All instruments, ordered by symbol
    pub fn instruments(&self) -> Vec<Instrument> {
        let mut all: Vec<Instrument> = self.instruments.iter().map(|i| i.value().clone()).collect();
        all.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        all
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.instruments.contains_key(symbol)
    }

    /// Current price of a priced instrument
    pub fn price(&self, symbol: &str) -> Result<Decimal> {
        let instrument =
            self.instruments.get(symbol).ok_or_else(|| MarketError::UnknownSymbol(symbol.to_string()))?;
        if !instrument.is_priced() {
            return Err(MarketError::NoPrice(symbol.to_string()));
        }
        Ok(instrument.price)
    }

    /// Restore prices and dividend timestamps from the `market` store
    ///
    /// Unknown or malformed records are skipped.
    pub async fn load_snapshot(&self) -> Result<usize> {
        let raw = self.bus.get_all_raw(stores::MARKET).await?;
        let mut restored = 0;

        for (symbol, value) in raw {
            let stored: Instrument = match serde_json::from_str(&value) {
                Ok(instrument) => instrument,
                Err(e) => {
                    warn!("Skipping corrupt market record for {}: {}", symbol, e);
                    continue;
                }
            };

            match self.instruments.get_mut(&symbol) {
                Some(mut instrument) => {
                    instrument.apply_update(&stored.price_update());
                    restored += 1;
                }
                None => debug!("Ignoring stored instrument {} absent from configuration", symbol),
            }
        }

        info!("Restored {} instruments from market store", restored);
        Ok(restored)
    }

    /// Replica path: overwrite local instruments with a pushed snapshot
    pub fn apply_price_snapshot(&self, snapshot: &PriceSnapshot) -> usize {
        let mut applied = 0;
        for (symbol, update) in snapshot {
            match self.instruments.get_mut(symbol) {
                Some(mut instrument) => {
                    instrument.apply_update(update);
                    applied += 1;
                }
                None => debug!("Ignoring price push for unknown symbol {}", symbol),
            }
        }
        applied
    }

    pub async fn refresh_cycle(&self, hook: &dyn MarketHook) -> RefreshReport {
        self.refresh_cycle_at(Utc::now(), hook).await
    }

    /// Fetch every stale instrument, apply valid readings and push the changes
    ///
    /// Per symbol the order is strictly: price update, history append, sweep.
    pub async fn refresh_cycle_at(&self, now: DateTime<Utc>, hook: &dyn MarketHook) -> RefreshReport {
        let interval = self.config.refresh_interval();
        let due: Vec<Instrument> = self
            .instruments
            .iter()
            .filter(|i| i.is_refresh_due(now, interval))
            .map(|i| i.value().clone())
            .collect();

        let mut report = RefreshReport::default();
        if due.is_empty() {
            return report;
        }

        let mut outcomes = self.fetch(due).await;
        outcomes.sort_by(|a, b| a.symbol.cmp(&b.symbol));

        let mut changed = Vec::new();
        for outcome in outcomes {
            let symbol = outcome.symbol;

            let dividend_updated = match outcome.dividend {
                Some(Ok(dividend)) if dividend >= Decimal::ZERO => self.set_dividend(&symbol, dividend),
                Some(Ok(dividend)) => {
                    warn!(symbol = %symbol, "Ignoring negative dividend {}", dividend);
                    false
                }
                Some(Err(e)) => {
                    warn!(symbol = %symbol, "Keeping previous dividend: {}", e);
                    false
                }
                None => false,
            };

            match outcome.price.and_then(|price| self.check_range(&symbol, price)) {
                Ok(price) => {
                    if let Some(mut instrument) = self.instruments.get_mut(&symbol) {
                        instrument.price = price;
                        instrument.last_price_update = Some(now);
                    }
                    self.history.append(&symbol, price, now);
                    hook.on_price_changed(&symbol).await;

                    report.updated.push(symbol.clone());
                    changed.push(symbol);
                }
                Err(e) => {
                    warn!(symbol = %symbol, "Keeping previous price: {}", e);
                    report.failed.push(symbol.clone());
                    if dividend_updated {
                        changed.push(symbol);
                    }
                }
            }
        }

        if !changed.is_empty() {
            self.broadcast(&changed).await;
        }

        debug!("Refresh cycle: {} updated, {} failed", report.updated.len(), report.failed.len());
        report
    }

    pub async fn dividend_cycle(&self, hook: &dyn MarketHook) -> Vec<String> {
        self.dividend_cycle_at(Utc::now(), hook).await
    }

    /// Pay every instrument whose dividend period elapsed
    pub async fn dividend_cycle_at(&self, now: DateTime<Utc>, hook: &dyn MarketHook) -> Vec<String> {
        let period = self.config.dividend_period();
        let epsilon = self.config.dividend_epsilon;

        let mut due: Vec<(String, Decimal)> = self
            .instruments
            .iter()
            .filter(|i| i.is_dividend_due(now, period, epsilon))
            .map(|i| (i.symbol.clone(), i.dividend))
            .collect();
        due.sort();

        let mut paid = Vec::with_capacity(due.len());
        for (symbol, dividend) in due {
            self.pay_dividend(&symbol, dividend, now, hook).await;
            paid.push(symbol);
        }

        if !paid.is_empty() {
            self.broadcast(&paid).await;
        }
        paid
    }

    /// Administrative payout regardless of the dividend period
    pub async fn force_dividend(&self, symbol: &str, hook: &dyn MarketHook) -> Result<Decimal> {
        let dividend = self
            .instruments
            .get(symbol)
            .map(|i| i.dividend)
            .ok_or_else(|| MarketError::UnknownSymbol(symbol.to_string()))?;

        self.pay_dividend(symbol, dividend, Utc::now(), hook).await;
        self.broadcast(&[symbol.to_string()]).await;
        Ok(dividend)
    }

    async fn pay_dividend(
        &self,
        symbol: &str,
        dividend: Decimal,
        now: DateTime<Utc>,
        hook: &dyn MarketHook,
    ) {
        hook.on_dividend(symbol, dividend).await;
        if let Some(mut instrument) = self.instruments.get_mut(symbol) {
            instrument.last_dividend = now;
        }
        info!(symbol = %symbol, "Issued dividend of {} per unit", dividend);
    }

    fn check_range(&self, symbol: &str, price: Decimal) -> std::result::Result<Decimal, FeedError> {
        if price <= Decimal::ZERO || price > self.config.price_ceiling {
            return Err(FeedError::OutOfRange { symbol: symbol.to_string(), price });
        }
        Ok(price)
    }

    fn set_dividend(&self, symbol: &str, dividend: Decimal) -> bool {
        match self.instruments.get_mut(symbol) {
            Some(mut instrument) if instrument.dividend != dividend => {
                instrument.dividend = dividend;
                true
            }
            _ => false,
        }
    }

    /// Run feed calls with bounded concurrency; batchable kinds cost one call
    async fn fetch(&self, due: Vec<Instrument>) -> Vec<FetchOutcome> {
        let mut batches: HashMap<InstrumentKind, Vec<Instrument>> = HashMap::new();
        let mut singles = Vec::new();
        for instrument in due {
            if instrument.kind.is_batch_fetchable() {
                batches.entry(instrument.kind).or_default().push(instrument);
            } else {
                singles.push(instrument);
            }
        }

        let mut jobs: Vec<BoxFuture<'_, Vec<FetchOutcome>>> = Vec::new();
        for (kind, members) in batches {
            jobs.push(self.fetch_batch(kind, members).boxed());
        }
        for instrument in singles {
            jobs.push(async move { vec![self.fetch_single(instrument).await] }.boxed());
        }

        futures::stream::iter(jobs)
            .buffer_unordered(self.max_concurrent_requests)
            .flat_map(futures::stream::iter)
            .collect()
            .await
    }

    async fn fetch_batch(&self, kind: InstrumentKind, members: Vec<Instrument>) -> Vec<FetchOutcome> {
        match self.feed.prices_for_kind(kind).await {
            Ok(prices) => members
                .into_iter()
                .map(|instrument| FetchOutcome {
                    price: prices
                        .get(&instrument.symbol)
                        .copied()
                        .ok_or_else(|| FeedError::MissingSymbol(instrument.symbol.clone())),
                    symbol: instrument.symbol,
                    dividend: None,
                })
                .collect(),
            Err(FeedError::Unsupported(_)) => {
                let mut outcomes = Vec::with_capacity(members.len());
                for instrument in members {
                    outcomes.push(self.fetch_single(instrument).await);
                }
                outcomes
            }
            Err(e) => {
                let reason = e.to_string();
                members
                    .into_iter()
                    .map(|instrument| FetchOutcome {
                        symbol: instrument.symbol,
                        price: Err(FeedError::Unreachable(reason.clone())),
                        dividend: None,
                    })
                    .collect()
            }
        }
    }

    async fn fetch_single(&self, instrument: Instrument) -> FetchOutcome {
        let price = self.feed.price(&instrument).await;
        let dividend = if instrument.kind.pays_dividends() {
            Some(self.feed.dividend(&instrument.symbol).await)
        } else {
            None
        };
        FetchOutcome { symbol: instrument.symbol, price, dividend }
    }

    /// Push the changed subset and record it in the `market` store
    async fn broadcast(&self, symbols: &[String]) {
        let prices: PriceSnapshot = symbols
            .iter()
            .filter_map(|s| self.instruments.get(s).map(|i| (s.clone(), i.price_update())))
            .collect();
        if let Err(e) = self.bus.publish(channels::PRICES, &prices).await {
            warn!("Failed to push price snapshot: {}", e);
        }

        let high_low = self.history.high_low_snapshot(symbols);
        if !high_low.is_empty() {
            if let Err(e) = self.bus.publish(channels::HIGH_LOW, &high_low).await {
                warn!("Failed to push high/low snapshot: {}", e);
            }
        }

        for symbol in symbols {
            if let Some(instrument) = self.instrument(symbol) {
                if let Err(e) = self.bus.put(stores::MARKET, symbol, &instrument).await {
                    warn!(symbol = %symbol, "Failed to store instrument: {}", e);
                }
            }
        }
    }
}
