//! Bounded per-symbol price history with running high/low

use crate::config::HistoryConfig;
use crate::instrument::{HighLow, HighLowSnapshot};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sync_bus::{stores, SyncBus};
use tracing::{debug, info, warn};

/// One price observation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceSample {
    pub price: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Time-ordered samples of one symbol plus the derived high/low
///
/// Timestamps are unique within a record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryRecord {
    samples: Vec<PriceSample>,
    high_low: Option<HighLow>,
}

impl HistoryRecord {
    /// Insert a sample keeping time order; a sample whose timestamp is already
    /// present is discarded (first one wins)
    pub fn insert(&mut self, sample: PriceSample) -> bool {
        let index = match self.samples.binary_search_by_key(&sample.timestamp, |s| s.timestamp) {
            Ok(_) => return false,
            Err(index) => index,
        };
        self.samples.insert(index, sample);

        self.high_low = Some(match self.high_low {
            Some(hl) => HighLow { high: hl.high.max(sample.price), low: hl.low.min(sample.price) },
            None => HighLow { high: sample.price, low: sample.price },
        });
        true
    }

    /// Drop samples older than `cutoff` and any duplicate timestamps, then
    /// recompute the high/low from what is left
    pub fn evict_before(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.samples.len();
        self.samples.retain(|s| s.timestamp >= cutoff);
        self.samples.dedup_by_key(|s| s.timestamp);
        let removed = before - self.samples.len();

        if removed > 0 {
            self.recompute_high_low();
        }
        removed
    }

    fn recompute_high_low(&mut self) {
        self.high_low = self.samples.iter().fold(None, |acc, s| {
            Some(match acc {
                Some(HighLow { high, low }) => {
                    HighLow { high: high.max(s.price), low: low.min(s.price) }
                }
                None => HighLow { high: s.price, low: s.price },
            })
        });
    }

    pub fn samples(&self) -> &[PriceSample] {
        &self.samples
    }

    pub fn high_low(&self) -> Option<HighLow> {
        self.high_low
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Bounded per-symbol price history
pub struct HistoryStore {
    config: HistoryConfig,
    records: DashMap<String, HistoryRecord>,
}

impl HistoryStore {
    pub fn new(config: HistoryConfig) -> Self {
        Self { config, records: DashMap::new() }
    }

    pub fn config(&self) -> &HistoryConfig {
        &self.config
    }

    /// Record a price observation
    pub fn append(&self, symbol: &str, price: Decimal, timestamp: DateTime<Utc>) -> bool {
        let inserted = self
            .records
            .entry(symbol.to_string())
            .or_default()
            .insert(PriceSample { price, timestamp });

        if !inserted {
            debug!("Collapsed duplicate history timestamp {} for {}", timestamp, symbol);
        }
        inserted
    }

    /// Evict samples outside the retention window
    pub fn evict(&self) -> usize {
        self.evict_at(Utc::now())
    }

    pub fn evict_at(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.config.retention();
        let removed: usize =
            self.records.iter_mut().map(|mut record| record.evict_before(cutoff)).sum();

        if removed > 0 {
            info!("Evicted {} expired price samples", removed);
        }
        removed
    }

    /// Administrative wipe of one symbol, in memory and in the shared store
    pub async fn prune_all(&self, bus: &SyncBus, symbol: &str) -> sync_bus::Result<()> {
        self.records.remove(symbol);
        bus.delete(stores::HISTORY, symbol).await?;
        info!("Pruned price history for {}", symbol);
        Ok(())
    }

    pub fn samples(&self, symbol: &str) -> Vec<PriceSample> {
        self.records.get(symbol).map(|r| r.samples().to_vec()).unwrap_or_default()
    }

    pub fn high_low(&self, symbol: &str) -> Option<HighLow> {
        self.records.get(symbol).and_then(|r| r.high_low())
    }

    /// High/low of the given symbols, for the `market.highlow` push
    pub fn high_low_snapshot(&self, symbols: &[String]) -> HighLowSnapshot {
        symbols
            .iter()
            .filter_map(|symbol| self.high_low(symbol).map(|hl| (symbol.clone(), hl)))
            .collect()
    }

    /// Replica path: take the authority's aggregates wholesale
    pub fn apply_high_low(&self, snapshot: &HighLowSnapshot) {
        for (symbol, high_low) in snapshot {
            self.records.entry(symbol.clone()).or_default().high_low = Some(*high_low);
        }
    }

    /// Write every record to the `history` store
    pub async fn persist(&self, bus: &SyncBus) -> sync_bus::Result<usize> {
        // Snapshot first so no map guard is held across an await
        let records: Vec<(String, Vec<PriceSample>)> = self
            .records
            .iter()
            .filter(|r| !r.is_empty())
            .map(|r| (r.key().clone(), r.samples().to_vec()))
            .collect();

        for (symbol, samples) in &records {
            bus.put(stores::HISTORY, symbol, samples).await?;
        }

        debug!("Persisted price history for {} symbols", records.len());
        Ok(records.len())
    }

    /// Load the `history` store; malformed or out-of-range samples are dropped
    /// without aborting the load
    pub async fn load(
        &self,
        bus: &SyncBus,
        now: DateTime<Utc>,
        price_ceiling: Decimal,
    ) -> sync_bus::Result<usize> {
        let raw = bus.get_all_raw(stores::HISTORY).await?;
        let cutoff = now - self.config.retention();
        let mut loaded = 0;

        for (symbol, value) in raw {
            let entries: Vec<serde_json::Value> = match serde_json::from_str(&value) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("Skipping corrupt history record for {}: {}", symbol, e);
                    continue;
                }
            };

            let mut record = HistoryRecord::default();
            let mut dropped = 0;
            for entry in entries {
                match serde_json::from_value::<PriceSample>(entry) {
                    Ok(sample)
                        if sample.price > Decimal::ZERO
                            && sample.price <= price_ceiling
                            && sample.timestamp >= cutoff
                            && sample.timestamp <= now =>
                    {
                        if record.insert(sample) {
                            loaded += 1;
                        } else {
                            dropped += 1;
                        }
                    }
                    _ => dropped += 1,
                }
            }

            if dropped > 0 {
                warn!("Dropped {} invalid history samples for {}", dropped, symbol);
            }
            if !record.is_empty() {
                self.records.insert(symbol, record);
            }
        }

        info!("Loaded {} price samples from history store", loaded);
        Ok(loaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Arc;
    use sync_bus::{InMemoryTransport, NodeId, SyncTransport};

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn d(value: i64) -> Decimal {
        Decimal::from(value)
    }

    fn store(retention_secs: u64) -> HistoryStore {
        HistoryStore::new(HistoryConfig { retention_secs, evict_interval_secs: 60 })
    }

    fn bus() -> SyncBus {
        SyncBus::new(NodeId::new("node-a"), Arc::new(InMemoryTransport::default()))
    }

    #[test]
    fn test_append_tracks_high_low() {
        let history = store(3600);
        history.append("AAA", d(10), t(0));
        history.append("AAA", d(15), t(1));
        history.append("AAA", d(7), t(2));

        assert_eq!(history.high_low("AAA"), Some(HighLow { high: d(15), low: d(7) }));
        assert_eq!(history.samples("AAA").len(), 3);
        assert_eq!(history.high_low("BBB"), None);
    }

    #[test]
    fn test_duplicate_timestamp_collapses() {
        let history = store(3600);
        assert!(history.append("AAA", d(10), t(5)));
        assert!(!history.append("AAA", d(99), t(5)));

        let samples = history.samples("AAA");
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].price, d(10));
        assert_eq!(history.high_low("AAA").unwrap().high, d(10));
    }

    #[test]
    fn test_out_of_order_samples_stay_sorted() {
        let history = store(3600);
        history.append("AAA", d(3), t(30));
        history.append("AAA", d(1), t(10));
        history.append("AAA", d(2), t(20));

        let timestamps: Vec<_> = history.samples("AAA").iter().map(|s| s.timestamp).collect();
        assert_eq!(timestamps, vec![t(10), t(20), t(30)]);
    }

    #[test]
    fn test_evict_drops_expired_and_recomputes_high_low() {
        let history = store(100);
        history.append("AAA", d(50), t(0));
        history.append("AAA", d(10), t(150));
        history.append("AAA", d(12), t(190));

        // now = 200: t(0) is 200s old (> 100), t(150) is 50s old
        let removed = history.evict_at(t(200));
        assert_eq!(removed, 1);

        let samples = history.samples("AAA");
        assert!(samples.iter().all(|s| s.timestamp != t(0)));
        assert_eq!(history.high_low("AAA"), Some(HighLow { high: d(12), low: d(10) }));
    }

    #[test]
    fn test_evict_keeps_sample_exactly_at_retention_edge() {
        let history = store(100);
        history.append("AAA", d(1), t(100));
        assert_eq!(history.evict_at(t(200)), 0);
        assert_eq!(history.samples("AAA").len(), 1);
    }

    #[test]
    fn test_apply_high_low_from_authority() {
        let history = store(3600);
        let mut snapshot = HighLowSnapshot::new();
        snapshot.insert("AAA".to_string(), HighLow { high: d(20), low: d(5) });

        history.apply_high_low(&snapshot);
        assert_eq!(history.high_low("AAA"), Some(HighLow { high: d(20), low: d(5) }));
    }

    #[tokio::test]
    async fn test_persist_then_load_on_another_node() {
        let transport = Arc::new(InMemoryTransport::default());
        let authority = SyncBus::new(NodeId::new("a"), transport.clone());
        let replica = SyncBus::new(NodeId::new("b"), transport);

        let history = store(3600);
        history.append("AAA", d(10), t(0));
        history.append("AAA", d(11), t(60));
        assert_eq!(history.persist(&authority).await.unwrap(), 1);

        let restored = store(3600);
        let loaded = restored.load(&replica, t(120), d(1_000)).await.unwrap();
        assert_eq!(loaded, 2);
        assert_eq!(restored.samples("AAA"), history.samples("AAA"));
    }

    #[tokio::test]
    async fn test_load_skips_bad_records_and_samples() {
        let bus = bus();
        let transport = bus.transport().clone();
        let ts = |secs: i64| serde_json::to_string(&t(secs)).unwrap();

        let mixed = format!(
            r#"[{{"price":"10","timestamp":{}}},{{"price":"-1","timestamp":{}}},{{"garbage":true}},{{"price":"5000","timestamp":{}}},{{"price":"12","timestamp":{}}}]"#,
            ts(10),
            ts(20),
            ts(30),
            ts(-10_000)
        );
        transport.hash_set(stores::HISTORY, "AAA", mixed).await.unwrap();
        transport.hash_set(stores::HISTORY, "BBB", "{not json".to_string()).await.unwrap();

        let history = store(3600);
        let loaded = history.load(&bus, t(100), d(1_000)).await.unwrap();

        assert_eq!(loaded, 1);
        assert_eq!(history.samples("AAA")[0].price, d(10));
        assert!(history.samples("BBB").is_empty());
    }

    #[tokio::test]
    async fn test_prune_all_clears_memory_and_store() {
        let bus = bus();
        let history = store(3600);
        history.append("AAA", d(10), t(0));
        history.persist(&bus).await.unwrap();

        history.prune_all(&bus, "AAA").await.unwrap();

        assert!(history.samples("AAA").is_empty());
        assert!(bus.get_raw(stores::HISTORY, "AAA").await.unwrap().is_none());
    }
}
