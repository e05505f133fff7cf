//! Configuration for LedgerService

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// LedgerService configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Fraction of the notional charged at open, before the leverage surcharge
    pub commission_rate: Decimal,
    /// Cadence of the dirty-ledger persistence task
    pub persist_interval_secs: u64,
    /// Auto-liquidate flag given to ledgers created on first access
    pub default_auto_liquidate: bool,
    /// Buffered close events per subscriber
    pub closure_buffer: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            commission_rate: Decimal::new(1, 3), // 0.1%
            persist_interval_secs: 5,
            default_auto_liquidate: false,
            closure_buffer: 256,
        }
    }
}

impl LedgerConfig {
    pub fn persist_interval(&self) -> Duration {
        Duration::from_secs(self.persist_interval_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.commission_rate < Decimal::ZERO || self.commission_rate >= Decimal::ONE {
            return Err(format!("commission_rate must be in [0, 1), got {}", self.commission_rate));
        }
        if self.persist_interval_secs == 0 {
            return Err("persist_interval_secs must be greater than 0".to_string());
        }
        if self.closure_buffer == 0 {
            return Err("closure_buffer must be greater than 0".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = LedgerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.persist_interval(), Duration::from_secs(5));
    }

    #[test]
    fn test_commission_rate_bounds() {
        let config = LedgerConfig { commission_rate: Decimal::ONE, ..Default::default() };
        assert!(config.validate().is_err());

        let config = LedgerConfig { commission_rate: Decimal::new(-1, 2), ..Default::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_deserialize_uses_defaults() {
        let config: LedgerConfig = serde_json::from_str(r#"{"default_auto_liquidate": true}"#).unwrap();
        assert!(config.default_auto_liquidate);
        assert_eq!(config.commission_rate, Decimal::new(1, 3));
    }
}
