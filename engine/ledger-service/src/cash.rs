//! External cash accounts that fund ledger balances

use crate::error::CashError;
use async_trait::async_trait;
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicBool, Ordering};
use sync_bus::{stores, SyncBus};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Spendable balance held outside the market, per actor
#[async_trait]
pub trait CashAccount: Send + Sync {
    async fn balance(&self, actor_id: &str) -> Result<Decimal, CashError>;

    /// Take `amount` out of the account
    async fn withdraw(&self, actor_id: &str, amount: Decimal) -> Result<(), CashError>;

    /// Put `amount` into the account
    async fn deposit(&self, actor_id: &str, amount: Decimal) -> Result<(), CashError>;
}

fn check_amount(amount: Decimal) -> Result<(), CashError> {
    if amount <= Decimal::ZERO {
        return Err(CashError::InvalidAmount(amount));
    }
    Ok(())
}

/// Process-local cash accounts
#[derive(Debug, Default)]
pub struct InMemoryCashAccount {
    balances: DashMap<String, Decimal>,
    offline: AtomicBool,
}

impl InMemoryCashAccount {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_balance(&self, actor_id: &str, amount: Decimal) {
        self.balances.insert(actor_id.to_string(), amount);
    }

    /// While offline every call fails with `Unavailable`
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn ensure_online(&self) -> Result<(), CashError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(CashError::Unavailable("cash service offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl CashAccount for InMemoryCashAccount {
    async fn balance(&self, actor_id: &str) -> Result<Decimal, CashError> {
        self.ensure_online()?;
        Ok(self.balances.get(actor_id).map(|b| *b.value()).unwrap_or_default())
    }

    async fn withdraw(&self, actor_id: &str, amount: Decimal) -> Result<(), CashError> {
        self.ensure_online()?;
        check_amount(amount)?;

        let mut balance = self.balances.entry(actor_id.to_string()).or_default();
        if *balance < amount {
            return Err(CashError::Insufficient { requested: amount, available: *balance });
        }
        *balance -= amount;
        Ok(())
    }

    async fn deposit(&self, actor_id: &str, amount: Decimal) -> Result<(), CashError> {
        self.ensure_online()?;
        check_amount(amount)?;

        *self.balances.entry(actor_id.to_string()).or_default() += amount;
        Ok(())
    }
}

/// Cash balances kept in the shared `cash` store
///
/// Read-modify-write is serialized within this node only; concurrent writers on
/// other nodes resolve last-writer-wins.
pub struct StoreCashAccount {
    bus: SyncBus,
    write_lock: Mutex<()>,
}

impl StoreCashAccount {
    pub fn new(bus: SyncBus) -> Self {
        Self { bus, write_lock: Mutex::new(()) }
    }

    async fn read(&self, actor_id: &str) -> Result<Decimal, CashError> {
        let raw = self
            .bus
            .get_raw(stores::CASH, actor_id)
            .await
            .map_err(|e| CashError::Unavailable(e.to_string()))?;

        match raw {
            Some(value) => serde_json::from_str(&value).map_err(|e| {
                warn!(actor_id = %actor_id, "Corrupt cash record: {}", e);
                CashError::Unavailable(format!("corrupt cash record for {actor_id}"))
            }),
            None => Ok(Decimal::ZERO),
        }
    }

    async fn write(&self, actor_id: &str, balance: Decimal) -> Result<(), CashError> {
        self.bus
            .put(stores::CASH, actor_id, &balance)
            .await
            .map_err(|e| CashError::Unavailable(e.to_string()))
    }
}

#[async_trait]
impl CashAccount for StoreCashAccount {
    async fn balance(&self, actor_id: &str) -> Result<Decimal, CashError> {
        self.read(actor_id).await
    }

    async fn withdraw(&self, actor_id: &str, amount: Decimal) -> Result<(), CashError> {
        check_amount(amount)?;
        let _guard = self.write_lock.lock().await;

        let balance = self.read(actor_id).await?;
        if balance < amount {
            return Err(CashError::Insufficient { requested: amount, available: balance });
        }
        self.write(actor_id, balance - amount).await?;
        debug!(actor_id = %actor_id, "Withdrew {} from cash account", amount);
        Ok(())
    }

    async fn deposit(&self, actor_id: &str, amount: Decimal) -> Result<(), CashError> {
        check_amount(amount)?;
        let _guard = self.write_lock.lock().await;

        let balance = self.read(actor_id).await?;
        self.write(actor_id, balance + amount).await?;
        debug!(actor_id = %actor_id, "Deposited {} into cash account", amount);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use sync_bus::{InMemoryTransport, NodeId, SyncTransport};

    #[tokio::test]
    async fn test_in_memory_withdraw_and_deposit() {
        let cash = InMemoryCashAccount::new();
        cash.set_balance("alice", Decimal::from(100));

        cash.withdraw("alice", Decimal::from(40)).await.unwrap();
        cash.deposit("alice", Decimal::from(5)).await.unwrap();
        assert_eq!(cash.balance("alice").await.unwrap(), Decimal::from(65));

        let err = cash.withdraw("alice", Decimal::from(66)).await.unwrap_err();
        assert!(matches!(err, CashError::Insufficient { .. }));
        assert_eq!(cash.balance("alice").await.unwrap(), Decimal::from(65));
    }

    #[tokio::test]
    async fn test_in_memory_offline_and_invalid_amounts() {
        let cash = InMemoryCashAccount::new();
        assert!(matches!(
            cash.deposit("bob", Decimal::ZERO).await,
            Err(CashError::InvalidAmount(_))
        ));

        cash.set_offline(true);
        assert!(matches!(
            cash.deposit("bob", Decimal::ONE).await,
            Err(CashError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_store_account_persists_in_cash_store() {
        let transport = Arc::new(InMemoryTransport::default());
        let bus = SyncBus::new(NodeId::new("node-a"), transport.clone());
        let cash = StoreCashAccount::new(bus);

        assert_eq!(cash.balance("carol").await.unwrap(), Decimal::ZERO);
        cash.deposit("carol", Decimal::from(30)).await.unwrap();
        cash.withdraw("carol", Decimal::from(12)).await.unwrap();

        assert_eq!(cash.balance("carol").await.unwrap(), Decimal::from(18));
        assert!(transport.hash_get(stores::CASH, "carol").await.unwrap().is_some());
        assert!(cash.withdraw("carol", Decimal::from(19)).await.is_err());
    }
}
