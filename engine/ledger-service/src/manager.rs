//! LedgerManager implementation

use crate::cash::CashAccount;
use crate::config::LedgerConfig;
use crate::economy::{economy_check, EconomyQuote};
use crate::ledger::PositionLedger;
use crate::position::{CloseReason, ClosedPosition, Direction, Position};
use crate::{LedgerError, Result};
use chrono::Utc;
use dashmap::DashMap;
use market_registry::{MarketError, MarketHook, MarketRegistry};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use sync_bus::{stores, SyncBus};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

type LedgerHandle = Arc<Mutex<PositionLedger>>;

/// Parameters of a position to open
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenRequest {
    pub symbol: String,
    pub direction: Direction,
    pub quantity: Decimal,
    pub leverage: u32,
    pub upper_margin: Decimal,
    pub lower_margin: Decimal,
}

/// A position valued at the current price
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionView {
    pub position: Position,
    /// `None` while the instrument has no price
    pub current_price: Option<Decimal>,
    pub gains: Option<Decimal>,
}

/// Read-only portfolio of one actor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioSummary {
    pub actor_id: String,
    pub balance: Decimal,
    pub auto_liquidate: bool,
    pub positions: Vec<PositionView>,
    pub unrealized_gains: Decimal,
}

/// LedgerManager owns every position-affecting operation
///
/// Each resident ledger sits behind its own async mutex, which is the single
/// mutation owner for that actor: open, close, sweep, dividends and reloads hold
/// it for their whole read-modify-write sequence, external cash calls included.
/// The map itself is only used for lookup and insertion, and handles are cloned
/// out of it before any await.
pub struct LedgerManager {
    config: LedgerConfig,
    ledgers: DashMap<String, LedgerHandle>,
    market: Arc<MarketRegistry>,
    cash: Arc<dyn CashAccount>,
    bus: SyncBus,
    closures: broadcast::Sender<ClosedPosition>,
    /// Authority nodes keep every ledger resident so sweeps see all of them
    keep_all_resident: bool,
}

impl LedgerManager {
    pub fn new(
        config: LedgerConfig,
        market: Arc<MarketRegistry>,
        cash: Arc<dyn CashAccount>,
        bus: SyncBus,
        keep_all_resident: bool,
    ) -> Self {
        let (closures, _) = broadcast::channel(config.closure_buffer.max(1));
        Self { config, ledgers: DashMap::new(), market, cash, bus, closures, keep_all_resident }
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Number of ledgers held in memory
    pub fn resident_count(&self) -> usize {
        self.ledgers.len()
    }

    pub fn is_resident(&self, actor_id: &str) -> bool {
        self.ledgers.contains_key(actor_id)
    }

    /// Stream of every position closed on this node
    pub fn subscribe_closures(&self) -> broadcast::Receiver<ClosedPosition> {
        self.closures.subscribe()
    }

    /// Load every ledger from the `ledgers` store, replacing resident copies
    ///
    /// Corrupt records are skipped.
    pub async fn load_all(&self) -> Result<usize> {
        let raw = self.bus.get_all_raw(stores::LEDGERS).await?;
        let mut loaded = 0;

        for (actor_id, value) in raw {
            let ledger = match decode_ledger(&actor_id, &value) {
                Ok(ledger) => ledger,
                Err(e) => {
                    warn!(actor_id = %actor_id, "Skipping corrupt ledger record: {}", e);
                    continue;
                }
            };

            let handle = self.handle(&actor_id);
            match handle {
                Some(handle) => handle.lock().await.replace_with(ledger),
                None => {
                    self.ledgers.insert(actor_id, Arc::new(Mutex::new(ledger)));
                }
            }
            loaded += 1;
        }

        info!("Loaded {} ledgers from store", loaded);
        Ok(loaded)
    }

    /// Handle a `ledger.changed` notice from another node
    ///
    /// Resident ledgers are replaced by the stored copy. Unseen actors are only
    /// loaded when this node keeps every ledger resident. Returns whether a
    /// ledger was (re)loaded.
    pub async fn reload(&self, actor_id: &str) -> Result<bool> {
        let handle = self.handle(actor_id);
        if handle.is_none() && !self.keep_all_resident {
            debug!(actor_id = %actor_id, "Ignoring change notice for non-resident ledger");
            return Ok(false);
        }

        let Some(stored) = self.fetch_stored(actor_id).await? else {
            warn!(actor_id = %actor_id, "Change notice for a ledger missing from the store");
            return Ok(false);
        };

        match handle {
            Some(handle) => {
                let mut ledger = handle.lock().await;
                if ledger.is_dirty() {
                    warn!(actor_id = %actor_id, "Unsaved local ledger changes overwritten by remote write");
                }
                ledger.replace_with(stored);
            }
            None => {
                self.ledgers
                    .entry(actor_id.to_string())
                    .or_insert_with(|| Arc::new(Mutex::new(stored)));
            }
        }

        debug!(actor_id = %actor_id, "Reloaded ledger after remote change");
        Ok(true)
    }

    /// Catch up after change notices may have been missed
    ///
    /// Local changes are persisted first, then every ledger this node would
    /// have reloaded on notice is re-read from the store.
    pub async fn resync(&self) -> Result<usize> {
        self.persist_dirty().await;

        let mut actors: BTreeSet<String> = self.ledgers.iter().map(|e| e.key().clone()).collect();
        if self.keep_all_resident {
            actors.extend(self.bus.get_all_raw(stores::LEDGERS).await?.into_keys());
        }

        let mut reloaded = 0;
        for actor_id in actors {
            match self.reload(&actor_id).await {
                Ok(true) => reloaded += 1,
                Ok(false) => {}
                Err(e) => warn!(actor_id = %actor_id, "Failed to resync ledger: {}", e),
            }
        }

        info!("Resynced {} ledgers from store", reloaded);
        Ok(reloaded)
    }

    /// Persist every dirty ledger and announce it on `ledger.changed`
    ///
    /// Failures are logged and the ledger stays dirty for the next pass.
    pub async fn persist_dirty(&self) -> usize {
        let mut persisted = 0;

        for (actor_id, handle) in self.handles() {
            let mut ledger = handle.lock().await;
            if !ledger.is_dirty() {
                continue;
            }

            if let Err(e) = self.bus.put(stores::LEDGERS, &actor_id, &*ledger).await {
                warn!(actor_id = %actor_id, "Failed to persist ledger: {}", e);
                continue;
            }
            ledger.clear_dirty();
            drop(ledger);

            if let Err(e) = self.bus.notify_ledger_changed(&actor_id).await {
                warn!(actor_id = %actor_id, "Failed to publish ledger change: {}", e);
            }
            persisted += 1;
        }

        if persisted > 0 {
            debug!("Persisted {} dirty ledgers", persisted);
        }
        persisted
    }

    /// Cost and commission of an open, without committing anything
    pub fn quote(&self, symbol: &str, quantity: Decimal, leverage: u32) -> Result<EconomyQuote> {
        validate_size(quantity, leverage)?;
        let price = self.price_of(symbol)?;
        Ok(economy_check(price, quantity, leverage, self.config.commission_rate))
    }

    /// Open a position, debiting notional plus commission
    ///
    /// Nothing is mutated when validation or the funds check fails.
    pub async fn open(&self, actor_id: &str, request: OpenRequest) -> Result<Position> {
        if request.upper_margin <= Decimal::ZERO || request.lower_margin <= Decimal::ZERO {
            return Err(LedgerError::validation("margins must be positive"));
        }
        validate_size(request.quantity, request.leverage)?;
        let price = self.price_of(&request.symbol)?;
        let quote =
            economy_check(price, request.quantity, request.leverage, self.config.commission_rate);

        let handle = self.ledger(actor_id).await?;
        let mut ledger = handle.lock().await;

        if !quote.affordable(ledger.balance) {
            return Err(LedgerError::insufficient(quote.total(), ledger.balance));
        }

        let position = Position::new(
            actor_id,
            request.symbol,
            request.direction,
            request.quantity,
            price,
            request.leverage,
            request.upper_margin,
            request.lower_margin,
            quote.commission,
        );

        ledger.debit(quote.total());
        ledger.insert(position.clone());

        info!(
            actor_id = %actor_id,
            symbol = %position.symbol,
            position_id = %position.id,
            "Opened {} x{} {} at {} (commission {})",
            position.direction, position.leverage, position.quantity, price, quote.commission
        );
        Ok(position)
    }

    /// Close a position at the current price
    pub async fn close(
        &self,
        actor_id: &str,
        symbol: &str,
        position_id: Uuid,
        reason: CloseReason,
    ) -> Result<ClosedPosition> {
        let price = self.price_of(symbol)?;
        let handle = self.ledger(actor_id).await?;
        let mut ledger = handle.lock().await;

        self.close_locked(&mut ledger, symbol, position_id, price, reason).ok_or_else(|| {
            LedgerError::PositionNotFound { actor_id: actor_id.to_string(), position_id }
        })
    }

    /// Evaluate every resident position in `symbol` against bankruptcy and
    /// margin thresholds; returns the positions closed
    pub async fn sweep(&self, symbol: &str) -> Result<Vec<ClosedPosition>> {
        let price = self.price_of(symbol)?;
        let mut closed = Vec::new();

        for (_, handle) in self.handles() {
            let mut ledger = handle.lock().await;
            if !ledger.holds(symbol) {
                continue;
            }

            let candidates: Vec<Position> = ledger.positions_in(symbol).to_vec();
            for position in candidates {
                let gains = position.gains(price);

                if is_bankrupt(gains, ledger.balance) {
                    if ledger.auto_liquidate && self.cover_shortfall(&mut ledger, gains).await {
                        continue;
                    }
                    closed.extend(self.close_locked(
                        &mut ledger,
                        symbol,
                        position.id,
                        price,
                        CloseReason::Bankruptcy,
                    ));
                } else if position.is_margin_call(gains) {
                    closed.extend(self.close_locked(
                        &mut ledger,
                        symbol,
                        position.id,
                        price,
                        CloseReason::MarginCall,
                    ));
                }
            }
        }

        if !closed.is_empty() {
            info!(symbol = %symbol, "Sweep at {} closed {} positions", price, closed.len());
        }
        Ok(closed)
    }

    /// Credit `per_unit` per unit held to every resident ledger holding `symbol`
    pub async fn issue_dividend(&self, symbol: &str, per_unit: Decimal) -> Decimal {
        if per_unit <= Decimal::ZERO {
            return Decimal::ZERO;
        }

        let mut total = Decimal::ZERO;
        for (actor_id, handle) in self.handles() {
            let mut ledger = handle.lock().await;
            let paid = ledger.pay_dividend(symbol, per_unit);
            if paid > Decimal::ZERO {
                debug!(actor_id = %actor_id, symbol = %symbol, "Credited dividend {}", paid);
                total += paid;
            }
        }

        info!(symbol = %symbol, "Dividend of {} per unit paid {} in total", per_unit, total);
        total
    }

    /// Move `amount` from the external cash account into the ledger
    pub async fn deposit(&self, actor_id: &str, amount: Decimal) -> Result<Decimal> {
        validate_amount(amount)?;
        let handle = self.ledger(actor_id).await?;
        let mut ledger = handle.lock().await;

        self.cash
            .withdraw(actor_id, amount)
            .await
            .map_err(|e| LedgerError::ExternalFailure(e.to_string()))?;
        ledger.credit(amount);

        info!(actor_id = %actor_id, "Deposited {} into ledger", amount);
        Ok(ledger.balance)
    }

    /// Move `amount` from the ledger back to the external cash account
    pub async fn withdraw(&self, actor_id: &str, amount: Decimal) -> Result<Decimal> {
        validate_amount(amount)?;
        let handle = self.ledger(actor_id).await?;
        let mut ledger = handle.lock().await;

        if ledger.balance < amount {
            return Err(LedgerError::insufficient(amount, ledger.balance));
        }
        self.cash
            .deposit(actor_id, amount)
            .await
            .map_err(|e| LedgerError::ExternalFailure(e.to_string()))?;
        ledger.debit(amount);

        info!(actor_id = %actor_id, "Withdrew {} from ledger", amount);
        Ok(ledger.balance)
    }

    pub async fn set_auto_liquidate(&self, actor_id: &str, enabled: bool) -> Result<()> {
        let handle = self.ledger(actor_id).await?;
        let mut ledger = handle.lock().await;
        if ledger.auto_liquidate != enabled {
            ledger.auto_liquidate = enabled;
            ledger.mark_dirty();
        }
        Ok(())
    }

    pub async fn balance(&self, actor_id: &str) -> Result<Decimal> {
        let handle = self.ledger(actor_id).await?;
        let balance = handle.lock().await.balance;
        Ok(balance)
    }

    /// Copy of an actor's ledger
    pub async fn snapshot(&self, actor_id: &str) -> Result<PositionLedger> {
        let handle = self.ledger(actor_id).await?;
        let ledger = handle.lock().await.clone();
        Ok(ledger)
    }

    /// Balance and open positions valued at current prices
    pub async fn summary(&self, actor_id: &str) -> Result<PortfolioSummary> {
        let ledger = self.snapshot(actor_id).await?;

        let mut positions: Vec<PositionView> = ledger
            .positions()
            .map(|position| {
                let current_price = self.market.price(&position.symbol).ok();
                PositionView {
                    gains: current_price.map(|price| position.gains(price)),
                    current_price,
                    position: position.clone(),
                }
            })
            .collect();
        positions.sort_by(|a, b| a.position.opened_at.cmp(&b.position.opened_at));

        let unrealized_gains = positions.iter().filter_map(|view| view.gains).sum();

        Ok(PortfolioSummary {
            actor_id: ledger.actor_id,
            balance: ledger.balance,
            auto_liquidate: ledger.auto_liquidate,
            positions,
            unrealized_gains,
        })
    }

    /// Remove a position and credit gains plus notional; caller holds the lock
    fn close_locked(
        &self,
        ledger: &mut PositionLedger,
        symbol: &str,
        position_id: Uuid,
        price: Decimal,
        reason: CloseReason,
    ) -> Option<ClosedPosition> {
        let position = ledger.remove(symbol, position_id)?;
        let gains = position.gains(price);
        let credited = gains + position.notional();
        ledger.credit(credited);

        info!(
            actor_id = %position.actor_id,
            symbol = %symbol,
            position_id = %position_id,
            reason = reason.code(),
            "Closed position ({}) at {} with gains {}",
            reason, price, gains
        );

        let closed = ClosedPosition {
            position,
            reason,
            exit_price: price,
            gains,
            credited,
            closed_at: Utc::now(),
        };
        // No subscribers is fine
        let _ = self.closures.send(closed.clone());
        Some(closed)
    }

    /// Auto-liquidation: pull the shortfall from the cash account
    async fn cover_shortfall(&self, ledger: &mut PositionLedger, gains: Decimal) -> bool {
        let shortfall = -(gains + ledger.balance);
        if shortfall <= Decimal::ZERO {
            return true;
        }

        match self.cash.withdraw(&ledger.actor_id, shortfall).await {
            Ok(()) => {
                ledger.credit(shortfall);
                info!(actor_id = %ledger.actor_id, "Auto-liquidated {} to cover losses", shortfall);
                true
            }
            Err(e) => {
                warn!(actor_id = %ledger.actor_id, "Auto-liquidation of {} failed: {}", shortfall, e);
                false
            }
        }
    }

    fn price_of(&self, symbol: &str) -> Result<Decimal> {
        self.market.price(symbol).map_err(|e| match e {
            MarketError::UnknownSymbol(symbol) => LedgerError::UnknownSymbol(symbol),
            other => LedgerError::Market(other),
        })
    }

    fn handle(&self, actor_id: &str) -> Option<LedgerHandle> {
        self.ledgers.get(actor_id).map(|entry| entry.value().clone())
    }

    fn handles(&self) -> Vec<(String, LedgerHandle)> {
        self.ledgers.iter().map(|entry| (entry.key().clone(), entry.value().clone())).collect()
    }

    /// Resident ledger, loaded from the store or created on first access
    async fn ledger(&self, actor_id: &str) -> Result<LedgerHandle> {
        if let Some(handle) = self.handle(actor_id) {
            return Ok(handle);
        }
        if actor_id.trim().is_empty() {
            return Err(LedgerError::validation("actor id must not be empty"));
        }

        let ledger = match self.fetch_stored(actor_id).await? {
            Some(ledger) => ledger,
            None => {
                debug!(actor_id = %actor_id, "Creating ledger on first access");
                PositionLedger::new(actor_id, self.config.default_auto_liquidate)
            }
        };

        let handle = self
            .ledgers
            .entry(actor_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(ledger)))
            .value()
            .clone();
        Ok(handle)
    }

    async fn fetch_stored(&self, actor_id: &str) -> Result<Option<PositionLedger>> {
        match self.bus.get_raw(stores::LEDGERS, actor_id).await? {
            Some(value) => Ok(Some(decode_ledger(actor_id, &value)?)),
            None => Ok(None),
        }
    }
}

fn decode_ledger(actor_id: &str, value: &str) -> Result<PositionLedger> {
    let ledger: PositionLedger = serde_json::from_str(value)?;
    if ledger.actor_id != actor_id {
        return Err(LedgerError::validation(format!(
            "ledger stored under {} belongs to {}",
            actor_id, ledger.actor_id
        )));
    }
    ledger.validate().map_err(LedgerError::Validation)?;
    Ok(ledger)
}

/// Losses would leave the ledger with a negative balance, or exactly zero
///
/// Positions with non-negative gains are still bankrupt once the balance has
/// already gone negative.
fn is_bankrupt(gains: Decimal, balance: Decimal) -> bool {
    let remaining = gains + balance;
    remaining < Decimal::ZERO || (gains < Decimal::ZERO && remaining == Decimal::ZERO)
}

fn validate_size(quantity: Decimal, leverage: u32) -> Result<()> {
    if quantity <= Decimal::ZERO {
        return Err(LedgerError::validation("quantity must be positive"));
    }
    if leverage < 1 {
        return Err(LedgerError::validation("leverage must be at least 1"));
    }
    Ok(())
}

fn validate_amount(amount: Decimal) -> Result<()> {
    if amount <= Decimal::ZERO {
        return Err(LedgerError::validation("amount must be positive"));
    }
    Ok(())
}

#[async_trait::async_trait]
impl MarketHook for LedgerManager {
    async fn on_price_changed(&self, symbol: &str) {
        if let Err(e) = self.sweep(symbol).await {
            warn!(symbol = %symbol, "Sweep failed: {}", e);
        }
    }

    async fn on_dividend(&self, symbol: &str, dividend_per_unit: Decimal) {
        self.issue_dividend(symbol, dividend_per_unit).await;
    }
}
