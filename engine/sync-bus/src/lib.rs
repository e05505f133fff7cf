//! # Sync Bus
//!
//! Replication substrate shared by every market node.
//!
//! ## Architecture
//!
//! - **SyncTransport**: abstract pub/sub + hash-store trait
//! - **RedisTransport**: production transport backed by Redis
//! - **InMemoryTransport**: in-process transport for tests and single-node runs
//! - **SyncBus**: origin-tagged publishing and echo-suppressed subscriptions
//!
//! Two replication shapes are built on top of it. Price snapshots are *pushed*:
//! the authority publishes the full changed subset and replicas overwrite their
//! local copy. Ledger mutations are *pull-notify*: only the actor id travels on
//! the channel and receivers re-read the ledger from the shared `ledgers` store.

pub mod bus;
pub mod config;
pub mod envelope;
pub mod error;
pub mod memory;
pub mod redis_transport;
pub mod transport;

pub use bus::SyncBus;
pub use config::SyncConfig;
pub use envelope::{Envelope, NodeId};
pub use error::{Result, SyncError};
pub use memory::InMemoryTransport;
pub use redis_transport::RedisTransport;
pub use transport::{PayloadStream, SyncTransport};

/// Pub/sub channel names
pub mod channels {
    /// Full price snapshot of the changed instruments, pushed by the authority
    pub const PRICES: &str = "market.prices";
    /// High/low aggregates of the changed instruments, pushed by the authority
    pub const HIGH_LOW: &str = "market.highlow";
    /// Actor id whose ledger was persisted; receivers pull the new state
    pub const LEDGER_CHANGED: &str = "ledger.changed";
}

/// Hash store names
pub mod stores {
    /// field = actor id, value = serialized position ledger
    pub const LEDGERS: &str = "ledgers";
    /// field = symbol, value = serialized price history
    pub const HISTORY: &str = "history";
    /// field = symbol, value = serialized instrument
    pub const MARKET: &str = "market";
    /// field = actor id, value = external cash balance
    pub const CASH: &str = "cash";
}
