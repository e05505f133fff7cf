//! Cost and commission preview for opening a position
//!
//! Pure functions; nothing here touches a ledger.

use rust_decimal::{Decimal, MathematicalOps};
use serde::{Deserialize, Serialize};

/// Leverage from which the progressive surcharge applies
pub const SURCHARGE_THRESHOLD: u32 = 10;

/// Price of opening a position before it is committed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EconomyQuote {
    /// Notional debited from the ledger: price x quantity
    pub cost: Decimal,
    pub commission: Decimal,
}

impl EconomyQuote {
    /// Total the ledger must hold to open
    pub fn total(&self) -> Decimal {
        self.cost + self.commission
    }

    /// Whether `balance` covers the total
    pub fn affordable(&self, balance: Decimal) -> bool {
        balance >= self.total()
    }
}

/// Commission multiplier for `leverage`: 1 below the threshold, then
/// `1 + l^0.6 - 10^0.6`
pub fn surcharge(leverage: u32) -> Decimal {
    if leverage <= SURCHARGE_THRESHOLD {
        return Decimal::ONE;
    }
    let curve = |l: u32| Decimal::from(l).powf(0.6);
    Decimal::ONE + curve(leverage) - curve(SURCHARGE_THRESHOLD)
}

/// Cost and commission of opening `quantity` units at `price` with `leverage`
pub fn economy_check(
    price: Decimal,
    quantity: Decimal,
    leverage: u32,
    commission_rate: Decimal,
) -> EconomyQuote {
    let cost = price * quantity;
    let commission = cost * commission_rate * surcharge(leverage);
    EconomyQuote { cost, commission }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_flat_below_threshold() {
        for leverage in 1..SURCHARGE_THRESHOLD {
            assert_eq!(surcharge(leverage), Decimal::ONE);
        }
        assert_eq!(surcharge(SURCHARGE_THRESHOLD), Decimal::ONE);
    }

    #[test]
    fn test_progressive_above_threshold() {
        // 20^0.6 - 10^0.6 ~= 6.034 - 3.981
        let at_20 = surcharge(20);
        assert!(at_20 > Decimal::new(305, 2) && at_20 < Decimal::new(306, 2), "{at_20}");
        assert!(surcharge(50) > at_20);
    }

    #[test]
    fn test_quote_for_low_leverage() {
        let quote = economy_check(Decimal::from(10), Decimal::from(5), 2, Decimal::new(1, 3));
        assert_eq!(quote.cost, Decimal::from(50));
        assert_eq!(quote.commission, Decimal::new(5, 2));
        assert_eq!(quote.total(), Decimal::new(5005, 2));
        assert!(quote.affordable(Decimal::new(5005, 2)));
        assert!(!quote.affordable(Decimal::from(50)));
    }

    proptest! {
        #[test]
        fn prop_commission_never_below_flat_rate(
            price in 1i64..100_000,
            quantity in 1i64..1_000,
            leverage in 1u32..200,
        ) {
            let rate = Decimal::new(1, 3);
            let quote = economy_check(Decimal::from(price), Decimal::from(quantity), leverage, rate);

            prop_assert_eq!(quote.cost, Decimal::from(price * quantity));
            prop_assert!(surcharge(leverage) >= Decimal::ONE);
            prop_assert!(quote.commission >= quote.cost * rate);
            prop_assert_eq!(quote.total(), quote.cost + quote.commission);
        }
    }
}
