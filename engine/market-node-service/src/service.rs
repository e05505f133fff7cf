//! Node wiring: component initialization, replication consumers, periodic
//! tasks and administrative operations

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::NodeConfig;
use crate::scheduler::PeriodicTask;
use ledger_service::{
    CashAccount, CloseReason, ClosedPosition, LedgerManager, OpenRequest, PortfolioSummary,
    Position, StoreCashAccount,
};
use market_registry::{
    HighLowSnapshot, HistoryStore, HttpPriceFeed, MarketRegistry, PriceFeed, PriceSnapshot,
};
use sync_bus::{channels, InMemoryTransport, NodeId, RedisTransport, SyncBus, SyncTransport};

/// One market node with all of its components
pub struct NodeService {
    config: NodeConfig,
    bus: SyncBus,
    market: Arc<MarketRegistry>,
    history: Arc<HistoryStore>,
    ledger: Arc<LedgerManager>,
    tasks: Vec<PeriodicTask>,
    consumers: Mutex<Vec<JoinHandle<()>>>,
    consuming: AtomicBool,
}

impl NodeService {
    /// Connect the configured transport and price feed and build the node
    pub async fn new(config: NodeConfig) -> Result<Self> {
        info!("Initializing node {}...", config.node.node_id);

        let transport: Arc<dyn SyncTransport> = if config.sync.in_memory {
            info!("Using in-process sync transport");
            Arc::new(InMemoryTransport::new(config.sync.channel_capacity))
        } else {
            info!("Connecting to Redis at {}", config.sync.redis_url);
            Arc::new(
                RedisTransport::connect(&config.sync.redis_url)
                    .await
                    .context("Failed to connect to Redis")?,
            )
        };

        let feed = Arc::new(
            HttpPriceFeed::new(&config.feed).context("Failed to create price feed client")?,
        );
        let bus = SyncBus::new(NodeId::new(config.node.node_id.clone()), transport);
        let cash = Arc::new(StoreCashAccount::new(bus.clone()));

        Self::with_components(config, bus, feed, cash)
    }

    /// Build the node over explicit collaborators
    pub fn with_components(
        config: NodeConfig,
        bus: SyncBus,
        feed: Arc<dyn PriceFeed>,
        cash: Arc<dyn CashAccount>,
    ) -> Result<Self> {
        let history = Arc::new(HistoryStore::new(config.history.clone()));

        let market = Arc::new(
            MarketRegistry::new(
                config.market.clone(),
                config.feed.max_concurrent_requests,
                history.clone(),
                bus.clone(),
                feed,
            )
            .context("Failed to create market registry")?,
        );

        let ledger = Arc::new(LedgerManager::new(
            config.ledger.clone(),
            market.clone(),
            cash,
            bus.clone(),
            config.node.authority,
        ));

        let tasks = build_tasks(&config, &bus, &market, &history, &ledger);

        info!(
            "Node {} initialized as {} with {} periodic tasks",
            config.node.node_id,
            if config.node.authority { "authority" } else { "replica" },
            tasks.len()
        );

        Ok(Self {
            config,
            bus,
            market,
            history,
            ledger,
            tasks,
            consumers: Mutex::new(Vec::new()),
            consuming: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn is_authority(&self) -> bool {
        self.config.node.authority
    }

    pub fn bus(&self) -> &SyncBus {
        &self.bus
    }

    pub fn market(&self) -> &Arc<MarketRegistry> {
        &self.market
    }

    pub fn history(&self) -> &Arc<HistoryStore> {
        &self.history
    }

    pub fn ledger(&self) -> &Arc<LedgerManager> {
        &self.ledger
    }

    /// Restore instruments, price history and (on the authority) every ledger
    /// from the shared stores
    pub async fn bootstrap(&self) -> Result<()> {
        info!("Restoring state from shared stores...");

        let instruments =
            self.market.load_snapshot().await.context("Failed to load market snapshot")?;

        let samples = self
            .history
            .load(&self.bus, Utc::now(), self.config.market.price_ceiling)
            .await
            .context("Failed to load price history")?;

        let ledgers = if self.is_authority() {
            self.ledger.load_all().await.context("Failed to load ledgers")?
        } else {
            0
        };

        info!(
            "Restored {} instruments, {} price samples and {} ledgers",
            instruments, samples, ledgers
        );
        Ok(())
    }

    /// Start replication consumers and periodic tasks
    pub async fn start(&self) -> Result<()> {
        self.start_consumers().await?;
        for task in &self.tasks {
            task.start();
        }
        info!("Node {} is running", self.config.node.node_id);
        Ok(())
    }

    /// Subscribe to the replication channels; a second call is a no-op
    pub async fn start_consumers(&self) -> Result<()> {
        if self.consuming.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let result = self.spawn_consumers().await;
        if result.is_err() {
            self.consuming.store(false, Ordering::SeqCst);
        }
        result
    }

    async fn spawn_consumers(&self) -> Result<()> {
        let prices = self
            .bus
            .subscribe::<PriceSnapshot>(channels::PRICES)
            .await
            .context("Failed to subscribe to price pushes")?;
        let high_low = self
            .bus
            .subscribe::<HighLowSnapshot>(channels::HIGH_LOW)
            .await
            .context("Failed to subscribe to high/low pushes")?;
        let notices = self
            .bus
            .subscribe::<String>(channels::LEDGER_CHANGED)
            .await
            .context("Failed to subscribe to ledger notices")?;

        let consumer = Consumer {
            bus: self.bus.clone(),
            initial_delay: self.config.sync.resubscribe_delay(),
            max_delay: self.config.sync.max_resubscribe_delay(),
        };

        let (market, resync_market) = (self.market.clone(), self.market.clone());
        let is_replica = !self.is_authority();
        let price_consumer = tokio::spawn(consumer.clone().run(
            channels::PRICES,
            prices,
            move |snapshot: PriceSnapshot| {
                let applied = market.apply_price_snapshot(&snapshot);
                debug!("Applied pushed prices for {} instruments", applied);
                futures::future::ready(())
            },
            move || {
                let market = resync_market.clone();
                async move {
                    if is_replica {
                        if let Err(e) = market.load_snapshot().await {
                            warn!("Failed to resync market snapshot: {}", e);
                        }
                    }
                }
            },
        ));

        let history = self.history.clone();
        let high_low_consumer = tokio::spawn(consumer.clone().run(
            channels::HIGH_LOW,
            high_low,
            move |snapshot: HighLowSnapshot| {
                history.apply_high_low(&snapshot);
                futures::future::ready(())
            },
            || futures::future::ready(()),
        ));

        let (ledger, resync_ledger) = (self.ledger.clone(), self.ledger.clone());
        let notice_consumer = tokio::spawn(consumer.run(
            channels::LEDGER_CHANGED,
            notices,
            move |actor_id: String| {
                let ledger = ledger.clone();
                async move {
                    if let Err(e) = ledger.reload(&actor_id).await {
                        warn!(actor_id = %actor_id, "Failed to reload ledger: {}", e);
                    }
                }
            },
            move || {
                let ledger = resync_ledger.clone();
                async move {
                    if let Err(e) = ledger.resync().await {
                        warn!("Failed to resync ledgers: {}", e);
                    }
                }
            },
        ));

        self.consumers.lock().extend([price_consumer, high_low_consumer, notice_consumer]);
        info!("Replication consumers started");
        Ok(())
    }

    /// Stop everything and flush dirty state; safe to call more than once
    pub async fn shutdown(&self) {
        for task in &self.tasks {
            task.stop().await;
        }

        let consumers: Vec<JoinHandle<()>> = self.consumers.lock().drain(..).collect();
        for consumer in consumers {
            consumer.abort();
        }
        self.consuming.store(false, Ordering::SeqCst);

        let persisted = self.ledger.persist_dirty().await;
        info!("Final persistence wrote {} ledgers", persisted);

        if self.is_authority() {
            if let Err(e) = self.history.persist(&self.bus).await {
                warn!("Failed to persist price history on shutdown: {}", e);
            }
        }
    }

    /// Persist dirty ledgers and notify the other nodes
    async fn commit(&self) {
        self.ledger.persist_dirty().await;
    }

    pub async fn open_position(&self, actor_id: &str, request: OpenRequest) -> Result<Position> {
        let position = self.ledger.open(actor_id, request).await?;
        self.commit().await;
        Ok(position)
    }

    pub async fn close_position(
        &self,
        actor_id: &str,
        symbol: &str,
        position_id: Uuid,
    ) -> Result<ClosedPosition> {
        let closed = self.ledger.close(actor_id, symbol, position_id, CloseReason::Manual).await?;
        self.commit().await;
        Ok(closed)
    }

    /// Move external cash into the actor's ledger; returns the new balance
    pub async fn deposit(&self, actor_id: &str, amount: Decimal) -> Result<Decimal> {
        let balance = self.ledger.deposit(actor_id, amount).await?;
        self.commit().await;
        Ok(balance)
    }

    /// Move ledger balance back to external cash; returns the new balance
    pub async fn withdraw(&self, actor_id: &str, amount: Decimal) -> Result<Decimal> {
        let balance = self.ledger.withdraw(actor_id, amount).await?;
        self.commit().await;
        Ok(balance)
    }

    pub async fn set_auto_liquidate(&self, actor_id: &str, enabled: bool) -> Result<()> {
        self.ledger.set_auto_liquidate(actor_id, enabled).await?;
        self.commit().await;
        Ok(())
    }

    pub async fn summary(&self, actor_id: &str) -> Result<PortfolioSummary> {
        Ok(self.ledger.summary(actor_id).await?)
    }

    /// Wipe one symbol's price history here and in the shared store
    pub async fn prune_history(&self, symbol: &str) -> Result<()> {
        if !self.market.contains(symbol) {
            return Err(anyhow!("Unknown symbol: {}", symbol));
        }
        self.history.prune_all(&self.bus, symbol).await?;
        Ok(())
    }

    /// Pay `symbol`'s dividend now, regardless of the dividend period
    ///
    /// Every ledger is loaded first so that all holders are paid.
    pub async fn force_dividend(&self, symbol: &str) -> Result<Decimal> {
        self.commit().await;
        if !self.is_authority() {
            self.ledger.load_all().await?;
        }

        let dividend = self.market.force_dividend(symbol, &*self.ledger).await?;
        self.commit().await;
        Ok(dividend)
    }
}

/// Subscription driver shared by the replication consumers
#[derive(Clone)]
struct Consumer {
    bus: SyncBus,
    initial_delay: Duration,
    max_delay: Duration,
}

impl Consumer {
    /// Apply every message on `channel` for as long as the node runs
    ///
    /// When the subscription ends (a dropped Redis connection) it is renewed
    /// with doubling delays, then `resync` runs to make up for messages
    /// published during the gap.
    async fn run<T, A, AF, R, RF>(
        self,
        channel: &'static str,
        mut stream: BoxStream<'static, T>,
        mut apply: A,
        mut resync: R,
    ) where
        T: DeserializeOwned + Send + 'static,
        A: FnMut(T) -> AF + Send,
        AF: Future<Output = ()> + Send,
        R: FnMut() -> RF + Send,
        RF: Future<Output = ()> + Send,
    {
        loop {
            while let Some(message) = stream.next().await {
                apply(message).await;
            }
            warn!(%channel, "Subscription ended, resubscribing");

            stream = self.resubscribe(channel).await;
            resync().await;
        }
    }

    async fn resubscribe<T>(&self, channel: &'static str) -> BoxStream<'static, T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let mut delay = self.initial_delay;
        let mut attempt = 1u32;

        loop {
            sleep(delay).await;
            match self.bus.subscribe::<T>(channel).await {
                Ok(stream) => {
                    info!(%channel, "Resubscribed after {} attempts", attempt);
                    return stream;
                }
                Err(e) => {
                    delay = (delay * 2).min(self.max_delay);
                    warn!(%channel, "Resubscribe attempt {} failed: {}, retrying in {:?}", attempt, e, delay);
                    attempt += 1;
                }
            }
        }
    }
}

fn build_tasks(
    config: &NodeConfig,
    bus: &SyncBus,
    market: &Arc<MarketRegistry>,
    history: &Arc<HistoryStore>,
    ledger: &Arc<LedgerManager>,
) -> Vec<PeriodicTask> {
    let mut tasks = Vec::new();

    if config.node.authority {
        let (market_ref, ledger_ref) = (market.clone(), ledger.clone());
        tasks.push(PeriodicTask::new("price-refresh", config.market.refresh_tick(), move || {
            let (market, ledger) = (market_ref.clone(), ledger_ref.clone());
            async move {
                let report = market.refresh_cycle(&*ledger).await;
                if !report.failed.is_empty() {
                    warn!("Kept previous prices for {:?}", report.failed);
                }
            }
        }));

        let (market_ref, ledger_ref) = (market.clone(), ledger.clone());
        tasks.push(PeriodicTask::new("dividends", config.market.refresh_tick(), move || {
            let (market, ledger) = (market_ref.clone(), ledger_ref.clone());
            async move {
                market.dividend_cycle(&*ledger).await;
            }
        }));

        let (history_ref, bus_ref) = (history.clone(), bus.clone());
        tasks.push(PeriodicTask::new("history-evict", config.history.evict_interval(), move || {
            let (history, bus) = (history_ref.clone(), bus_ref.clone());
            async move {
                history.evict();
                if let Err(e) = history.persist(&bus).await {
                    warn!("Failed to persist price history: {}", e);
                }
            }
        }));
    }

    let ledger_ref = ledger.clone();
    tasks.push(PeriodicTask::new("ledger-persist", config.ledger.persist_interval(), move || {
        let ledger = ledger_ref.clone();
        async move {
            ledger.persist_dirty().await;
        }
    }));

    tasks
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledger_service::{Direction, InMemoryCashAccount, LedgerError};
    use market_registry::{FeedError, Instrument, InstrumentConfig, InstrumentKind};
    use std::collections::HashMap;
    use sync_bus::stores;

    #[derive(Default)]
    struct StubFeed {
        prices: Mutex<HashMap<String, Decimal>>,
        dividends: Mutex<HashMap<String, Decimal>>,
    }

    impl StubFeed {
        fn set_price(&self, symbol: &str, price: i64) {
            self.prices.lock().insert(symbol.to_string(), Decimal::from(price));
        }
    }

    #[async_trait::async_trait]
    impl PriceFeed for StubFeed {
        async fn price(&self, instrument: &Instrument) -> std::result::Result<Decimal, FeedError> {
            self.prices
                .lock()
                .get(&instrument.symbol)
                .copied()
                .ok_or_else(|| FeedError::Unreachable("no quote".to_string()))
        }

        async fn dividend(&self, symbol: &str) -> std::result::Result<Decimal, FeedError> {
            Ok(self.dividends.lock().get(symbol).copied().unwrap_or_default())
        }
    }

    struct TestNode {
        service: NodeService,
        cash: Arc<InMemoryCashAccount>,
    }

    fn test_config(node_id: &str, authority: bool) -> NodeConfig {
        let mut config = NodeConfig::default();
        config.node.node_id = node_id.to_string();
        config.node.authority = authority;
        config.market.instruments = vec![InstrumentConfig {
            symbol: "AAA".to_string(),
            kind: InstrumentKind::Equity,
            name: Some("Triple A".to_string()),
            description: None,
            icon: None,
        }];
        config.sync.resubscribe_delay_ms = 10;
        config.sync.max_resubscribe_delay_ms = 40;
        config
    }

    fn test_node(
        transport: &Arc<InMemoryTransport>,
        node_id: &str,
        authority: bool,
        feed: Arc<StubFeed>,
    ) -> TestNode {
        let config = test_config(node_id, authority);
        let bus = SyncBus::new(NodeId::new(node_id), transport.clone());
        let cash = Arc::new(InMemoryCashAccount::new());
        let service = NodeService::with_components(config, bus, feed, cash.clone()).unwrap();
        TestNode { service, cash }
    }

    async fn eventually<F, Fut>(what: &str, mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {what}");
    }

    async fn refresh(node: &TestNode, at: chrono::DateTime<Utc>) {
        let service = &node.service;
        service.market().refresh_cycle_at(at, &**service.ledger()).await;
    }

    fn long(quantity: i64, upper: i64) -> OpenRequest {
        OpenRequest {
            symbol: "AAA".to_string(),
            direction: Direction::Long,
            quantity: Decimal::from(quantity),
            leverage: 1,
            upper_margin: Decimal::from(upper),
            lower_margin: Decimal::from(1000),
        }
    }

    #[tokio::test]
    async fn test_replica_follows_price_pushes() {
        let transport = Arc::new(InMemoryTransport::default());
        let feed = Arc::new(StubFeed::default());
        feed.set_price("AAA", 10);

        let authority = test_node(&transport, "authority", true, feed.clone());
        let replica = test_node(&transport, "replica", false, feed);
        replica.service.start_consumers().await.unwrap();

        refresh(&authority, Utc::now()).await;

        let replica = &replica.service;
        eventually("replica price", || async move {
            replica.market().price("AAA").ok() == Some(Decimal::from(10))
        })
        .await;
        eventually("replica high/low", || async move {
            replica.history().high_low("AAA").is_some()
        })
        .await;
    }

    #[tokio::test]
    async fn test_replica_recovers_from_dropped_subscriptions() {
        let transport = Arc::new(InMemoryTransport::default());
        let feed = Arc::new(StubFeed::default());
        feed.set_price("AAA", 10);

        let authority = test_node(&transport, "authority", true, feed.clone());
        let replica = test_node(&transport, "replica", false, feed);
        replica.service.start_consumers().await.unwrap();

        replica.cash.set_balance("erin", Decimal::from(20));
        replica.service.deposit("erin", Decimal::from(20)).await.unwrap();

        // Stored without a notice, as if the notice were lost with the connection
        let mut stored = replica.service.ledger().snapshot("erin").await.unwrap();
        stored.credit(Decimal::from(5));
        authority.service.bus().put(stores::LEDGERS, "erin", &stored).await.unwrap();

        transport.close_channel(channels::PRICES);
        transport.close_channel(channels::LEDGER_CHANGED);

        let replica_service = &replica.service;
        eventually("ledger resync after resubscribe", || async move {
            replica_service.ledger().balance("erin").await.ok() == Some(Decimal::from(25))
        })
        .await;

        let transport_ref = &transport;
        eventually("price resubscribe", || async move {
            transport_ref.subscriber_count(channels::PRICES) == 1
        })
        .await;

        refresh(&authority, Utc::now()).await;
        eventually("pushed price after resubscribe", || async move {
            replica_service.market().price("AAA").ok() == Some(Decimal::from(10))
        })
        .await;
    }

    #[tokio::test]
    async fn test_margin_call_on_authority_reaches_replica() {
        let transport = Arc::new(InMemoryTransport::default());
        let feed = Arc::new(StubFeed::default());
        feed.set_price("AAA", 10);

        let authority = test_node(&transport, "authority", true, feed.clone());
        let replica = test_node(&transport, "replica", false, feed.clone());
        authority.service.start_consumers().await.unwrap();
        replica.service.start_consumers().await.unwrap();
        let mut closures = authority.service.ledger().subscribe_closures();

        let start = Utc::now();
        refresh(&authority, start).await;
        let (authority_service, replica_service) = (&authority.service, &replica.service);
        eventually("replica price", || async move {
            replica_service.market().price("AAA").is_ok()
        })
        .await;

        // Actor trades on the replica
        replica.cash.set_balance("alice", Decimal::from(1000));
        replica.service.deposit("alice", Decimal::from(1000)).await.unwrap();
        replica.service.open_position("alice", long(1, 5)).await.unwrap();

        eventually("authority picks up the new ledger", || async move {
            match authority_service.ledger().snapshot("alice").await {
                Ok(ledger) => ledger.position_count() == 1,
                Err(_) => false,
            }
        })
        .await;

        feed.set_price("AAA", 20);
        refresh(&authority, start + chrono::Duration::minutes(2)).await;

        let closed = closures.recv().await.unwrap();
        assert_eq!(closed.reason, CloseReason::MarginCall);
        assert_eq!(closed.gains, Decimal::from(10));

        authority.service.ledger().persist_dirty().await;

        // 1000 - 10.01 paid at open + 20 credited at close
        eventually("replica reloads the closed ledger", || async move {
            let ledger = replica_service.ledger().snapshot("alice").await.unwrap();
            ledger.position_count() == 0 && ledger.balance == Decimal::new(100999, 2)
        })
        .await;
    }

    #[tokio::test]
    async fn test_admin_dividend_and_prune() {
        let transport = Arc::new(InMemoryTransport::default());
        let feed = Arc::new(StubFeed::default());
        feed.set_price("AAA", 10);
        feed.dividends.lock().insert("AAA".to_string(), Decimal::new(5, 1));

        let node = test_node(&transport, "authority", true, feed);
        refresh(&node, Utc::now()).await;

        node.cash.set_balance("bob", Decimal::from(100));
        node.service.deposit("bob", Decimal::from(100)).await.unwrap();
        node.service.open_position("bob", long(5, 1000)).await.unwrap();
        let before = node.service.summary("bob").await.unwrap().balance;

        let dividend = node.service.force_dividend("AAA").await.unwrap();

        assert_eq!(dividend, Decimal::new(5, 1));
        let after = node.service.summary("bob").await.unwrap().balance;
        assert_eq!(after - before, Decimal::new(25, 1));

        assert!(node.service.history().high_low("AAA").is_some());
        node.service.prune_history("AAA").await.unwrap();
        assert!(node.service.history().samples("AAA").is_empty());
        assert!(node.service.prune_history("ZZZ").await.is_err());
    }

    #[tokio::test]
    async fn test_admin_errors_keep_ledger_types() {
        let transport = Arc::new(InMemoryTransport::default());
        let feed = Arc::new(StubFeed::default());
        feed.set_price("AAA", 10);
        let node = test_node(&transport, "authority", true, feed);
        refresh(&node, Utc::now()).await;

        let err = node.service.open_position("carol", long(1, 100)).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LedgerError>(),
            Some(LedgerError::InsufficientFunds { .. })
        ));

        let err = node.service.close_position("carol", "AAA", Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LedgerError>(),
            Some(LedgerError::PositionNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_shutdown_flushes_and_restart_restores() {
        let transport = Arc::new(InMemoryTransport::default());
        let feed = Arc::new(StubFeed::default());
        feed.set_price("AAA", 10);

        let node = test_node(&transport, "authority", true, feed.clone());
        node.service.start().await.unwrap();
        refresh(&node, Utc::now()).await;

        node.cash.set_balance("dave", Decimal::from(40));
        node.service.ledger().deposit("dave", Decimal::from(40)).await.unwrap();

        node.service.shutdown().await;
        node.service.shutdown().await;

        let restarted = test_node(&transport, "authority", true, feed);
        restarted.service.bootstrap().await.unwrap();

        assert!(restarted.service.ledger().is_resident("dave"));
        assert_eq!(restarted.service.ledger().balance("dave").await.unwrap(), Decimal::from(40));
        assert_eq!(restarted.service.market().price("AAA").unwrap(), Decimal::from(10));
        assert_eq!(restarted.service.history().samples("AAA").len(), 1);
    }
}
