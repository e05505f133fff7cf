//! LedgerService - Per-actor ledgers and the leveraged position lifecycle
//!
//! This crate provides the LedgerManager which opens and closes margin
//! positions, sweeps ledgers for margin calls and bankruptcies when a price
//! moves, pays dividends, and keeps ledgers in sync across nodes through the
//! pull-notify protocol of the sync bus.

pub mod cash;
pub mod config;
pub mod economy;
pub mod error;
pub mod ledger;
pub mod manager;
pub mod position;

pub use cash::{CashAccount, InMemoryCashAccount, StoreCashAccount};
pub use config::LedgerConfig;
pub use economy::{economy_check, surcharge, EconomyQuote};
pub use error::{CashError, LedgerError};
pub use ledger::PositionLedger;
pub use manager::{LedgerManager, OpenRequest, PortfolioSummary, PositionView};
pub use position::{CloseReason, ClosedPosition, Direction, Position};

// Result type alias
pub type Result<T> = std::result::Result<T, LedgerError>;

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    #[test]
    fn test_direction_sign() {
        assert_eq!(Direction::Long.sign(), Decimal::ONE);
        assert_eq!(Direction::Short.sign(), Decimal::NEGATIVE_ONE);
    }

    #[test]
    fn test_close_reason_codes() {
        assert_eq!(CloseReason::MarginCall.code(), 1);
        assert_eq!(CloseReason::Bankruptcy.code(), 2);
        assert_eq!(CloseReason::Manual.code(), 3);
    }
}
