//! Leveraged positions held in an actor's ledger

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Direction of the bet on the instrument's price
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// +1 for long, -1 for short
    pub fn sign(self) -> Decimal {
        match self {
            Direction::Long => Decimal::ONE,
            Direction::Short => Decimal::NEGATIVE_ONE,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Long => f.write_str("long"),
            Direction::Short => f.write_str("short"),
        }
    }
}

/// Why a position left its ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    MarginCall,
    Bankruptcy,
    Manual,
}

impl CloseReason {
    /// Numeric code carried by close notifications
    pub fn code(self) -> u8 {
        match self {
            CloseReason::MarginCall => 1,
            CloseReason::Bankruptcy => 2,
            CloseReason::Manual => 3,
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::MarginCall => f.write_str("margin call"),
            CloseReason::Bankruptcy => f.write_str("bankruptcy"),
            CloseReason::Manual => f.write_str("manual"),
        }
    }
}

/// An open leveraged position
///
/// Everything except `dividends` is fixed at open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub actor_id: String,
    pub symbol: String,
    pub direction: Direction,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub leverage: u32,
    /// Gains at or above which the position is taken as profit
    pub upper_margin: Decimal,
    /// Loss magnitude at or above which the position is stopped out
    pub lower_margin: Decimal,
    pub commission: Decimal,
    pub opened_at: DateTime<Utc>,
    /// Cumulative dividends credited for this position
    #[serde(default)]
    pub dividends: Decimal,
}

impl Position {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        actor_id: impl Into<String>,
        symbol: impl Into<String>,
        direction: Direction,
        quantity: Decimal,
        entry_price: Decimal,
        leverage: u32,
        upper_margin: Decimal,
        lower_margin: Decimal,
        commission: Decimal,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            actor_id: actor_id.into(),
            symbol: symbol.into(),
            direction,
            quantity,
            entry_price,
            leverage,
            upper_margin,
            lower_margin,
            commission,
            opened_at: Utc::now(),
            dividends: Decimal::ZERO,
        }
    }

    /// Unrealized gain (negative for a loss) at `price`
    pub fn gains(&self, price: Decimal) -> Decimal {
        self.direction.sign() * (price - self.entry_price) * self.quantity * Decimal::from(self.leverage)
    }

    /// Amount paid for the position at open, excluding commission
    pub fn notional(&self) -> Decimal {
        self.entry_price * self.quantity
    }

    /// Take-profit or stop-loss threshold crossed at `gains`
    pub fn is_margin_call(&self, gains: Decimal) -> bool {
        gains >= self.upper_margin || (gains < Decimal::ZERO && -gains >= self.lower_margin)
    }

    pub fn is_valid(&self) -> bool {
        self.quantity > Decimal::ZERO && self.leverage >= 1 && self.entry_price > Decimal::ZERO
    }
}

/// Terminal record of a closed position, sent to close-event subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedPosition {
    pub position: Position,
    pub reason: CloseReason,
    pub exit_price: Decimal,
    pub gains: Decimal,
    /// Amount credited to the ledger: gains plus the original notional
    pub credited: Decimal,
    pub closed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn position(direction: Direction, entry: i64, quantity: i64, leverage: u32) -> Position {
        Position::new(
            "actor-1",
            "AAA",
            direction,
            Decimal::from(quantity),
            Decimal::from(entry),
            leverage,
            Decimal::from(100),
            Decimal::from(100),
            Decimal::ZERO,
        )
    }

    #[test]
    fn test_long_gains() {
        let long = position(Direction::Long, 10, 5, 2);
        assert_eq!(long.gains(Decimal::from(15)), Decimal::from(50));
        assert_eq!(long.gains(Decimal::from(8)), Decimal::from(-20));
    }

    #[test]
    fn test_short_gains() {
        let short = position(Direction::Short, 10, 5, 2);
        assert_eq!(short.gains(Decimal::from(15)), Decimal::from(-50));
        assert_eq!(short.gains(Decimal::from(8)), Decimal::from(20));
    }

    #[test]
    fn test_margin_call_boundaries() {
        let long = position(Direction::Long, 10, 1, 1);

        assert!(!long.is_margin_call(long.gains(Decimal::new(10999, 2))));
        assert!(long.is_margin_call(long.gains(Decimal::from(110))));

        // Stop-loss needs a real loss of at least the lower margin
        assert!(!long.is_margin_call(Decimal::from(-99)));
        assert!(long.is_margin_call(Decimal::from(-100)));
    }

    #[test]
    fn test_position_ids_are_unique() {
        let a = position(Direction::Long, 10, 1, 1);
        let b = position(Direction::Long, 10, 1, 1);
        assert_ne!(a.id, b.id);
    }

    proptest! {
        #[test]
        fn prop_short_mirrors_long(
            entry in 1i64..10_000,
            price in 1i64..10_000,
            quantity in 1i64..1_000,
            leverage in 1u32..100,
        ) {
            let long = position(Direction::Long, entry, quantity, leverage);
            let short = position(Direction::Short, entry, quantity, leverage);
            let price = Decimal::from(price);

            prop_assert_eq!(long.gains(price), -short.gains(price));
            prop_assert_eq!(
                long.gains(price),
                (price - Decimal::from(entry)) * Decimal::from(quantity) * Decimal::from(leverage)
            );
        }
    }
}
