//! Market Node Service Library
//!
//! Process wiring for one market node: configuration loading, logging,
//! periodic tasks, replication consumers, administrative operations and
//! graceful shutdown. A node is either the single authority, which drives
//! price refresh, dividends and history eviction, or a replica that only
//! consumes broadcasts.

use anyhow::{Context, Result};
use std::path::Path;

pub mod config;
pub mod logging;
pub mod scheduler;
pub mod service;
pub mod signals;

pub use config::NodeConfig;
pub use logging::initialize_logging_with_config;
pub use scheduler::PeriodicTask;
pub use service::NodeService;
pub use signals::{graceful_shutdown, setup_signal_handlers};

/// Load configuration from the optional file, `.env` and environment variables
pub fn load_configuration(path: Option<&Path>) -> Result<NodeConfig> {
    config::load_config(path).context("Failed to load node configuration")
}
