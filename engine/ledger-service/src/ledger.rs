//! Per-actor balance and open positions

use crate::position::Position;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// One actor's ledger
///
/// The dirty flag is local bookkeeping and never leaves the node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionLedger {
    pub actor_id: String,
    pub balance: Decimal,
    #[serde(default)]
    positions: HashMap<String, Vec<Position>>,
    #[serde(default)]
    pub auto_liquidate: bool,
    #[serde(skip)]
    dirty: bool,
}

impl PositionLedger {
    pub fn new(actor_id: impl Into<String>, auto_liquidate: bool) -> Self {
        Self {
            actor_id: actor_id.into(),
            balance: Decimal::ZERO,
            positions: HashMap::new(),
            auto_liquidate,
            dirty: false,
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    pub fn credit(&mut self, amount: Decimal) {
        self.balance += amount;
        self.dirty = true;
    }

    pub fn debit(&mut self, amount: Decimal) {
        self.balance -= amount;
        self.dirty = true;
    }

    pub fn holds(&self, symbol: &str) -> bool {
        self.positions.get(symbol).is_some_and(|p| !p.is_empty())
    }

    pub fn positions_in(&self, symbol: &str) -> &[Position] {
        self.positions.get(symbol).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.values().flatten()
    }

    pub fn position_count(&self) -> usize {
        self.positions.values().map(Vec::len).sum()
    }

    pub fn find(&self, symbol: &str, id: Uuid) -> Option<&Position> {
        self.positions_in(symbol).iter().find(|p| p.id == id)
    }

    pub fn insert(&mut self, position: Position) {
        self.positions.entry(position.symbol.clone()).or_default().push(position);
        self.dirty = true;
    }

    /// Remove a position; `None` when it is not in the ledger
    pub fn remove(&mut self, symbol: &str, id: Uuid) -> Option<Position> {
        let held = self.positions.get_mut(symbol)?;
        let index = held.iter().position(|p| p.id == id)?;
        let position = held.remove(index);
        if held.is_empty() {
            self.positions.remove(symbol);
        }
        self.dirty = true;
        Some(position)
    }

    /// Credit `per_unit` for every unit held in `symbol`; returns the total paid
    pub fn pay_dividend(&mut self, symbol: &str, per_unit: Decimal) -> Decimal {
        let mut total = Decimal::ZERO;
        if let Some(held) = self.positions.get_mut(symbol) {
            for position in held.iter_mut() {
                let amount = per_unit * position.quantity;
                if amount > Decimal::ZERO {
                    position.dividends += amount;
                    total += amount;
                }
            }
        }
        if total > Decimal::ZERO {
            self.credit(total);
        }
        total
    }

    /// Replace the persisted state wholesale, keeping nothing local
    pub fn replace_with(&mut self, other: PositionLedger) {
        *self = Self { dirty: false, ..other };
    }

    /// Check a decoded ledger before accepting it
    pub fn validate(&self) -> Result<(), String> {
        let mut seen = std::collections::HashSet::new();
        for (symbol, held) in &self.positions {
            for position in held {
                if position.symbol != *symbol {
                    return Err(format!("position {} filed under {}", position.id, symbol));
                }
                if !position.is_valid() {
                    return Err(format!("position {} has invalid quantity or leverage", position.id));
                }
                if !seen.insert(position.id) {
                    return Err(format!("duplicate position id {}", position.id));
                }
            }
        }
        Ok(())
    }
}
