//! Node configuration management

use anyhow::{anyhow, Context, Result};
use ledger_service::LedgerConfig;
use market_registry::{FeedConfig, HistoryConfig, MarketConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use sync_bus::SyncConfig;

/// Config file read when `--config` is not given; optional
pub const DEFAULT_CONFIG_FILE: &str = "market-node.toml";

/// Prefix of environment overrides, e.g. `MARKET_NODE__NODE__AUTHORITY=true`
pub const ENV_PREFIX: &str = "MARKET_NODE";

/// Main node configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Node identity and role
    pub node: NodeSettings,

    /// Replication transport
    pub sync: SyncConfig,

    /// External price feed
    pub feed: FeedConfig,

    /// Instruments and market cycles
    pub market: MarketConfig,

    /// Price history retention
    pub history: HistoryConfig,

    /// Ledger economics and persistence cadence
    pub ledger: LedgerConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Node-level settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSettings {
    /// Identity used for origin tagging; random when not configured
    pub node_id: String,

    /// Whether this node drives refresh, dividend and eviction cycles
    pub authority: bool,

    /// Graceful shutdown timeout in seconds
    pub shutdown_timeout_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (json, pretty, compact)
    pub format: String,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            node_id: uuid::Uuid::new_v4().to_string(),
            authority: false,
            shutdown_timeout_secs: 10,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), format: "pretty".to_string() }
    }
}

/// Load configuration: file, then `MARKET_NODE__*` environment overrides
///
/// An explicit `path` must exist; the default file is optional.
pub fn load_config(path: Option<&Path>) -> Result<NodeConfig> {
    dotenv::dotenv().ok();

    let (file, required) = match path {
        Some(path) => (path.to_path_buf(), true),
        None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
    };
    tracing::debug!("Loading configuration from file: {:?}", file);

    let settings = config::Config::builder()
        .add_source(config::File::from(file.as_path()).required(required))
        .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__").try_parsing(true))
        .build()
        .with_context(|| format!("Failed to read configuration from {:?}", file))?;

    let config: NodeConfig =
        settings.try_deserialize().context("Failed to deserialize configuration")?;

    validate_config(&config)?;
    Ok(config)
}

/// Validate configuration
pub fn validate_config(config: &NodeConfig) -> Result<()> {
    if config.node.node_id.trim().is_empty() {
        return Err(anyhow!("node_id must not be empty"));
    }

    match config.logging.level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => {}
        _ => return Err(anyhow!("Invalid log level: {}", config.logging.level)),
    }

    match config.logging.format.as_str() {
        "json" | "pretty" | "compact" => {}
        _ => return Err(anyhow!("Invalid log format: {}", config.logging.format)),
    }

    config.sync.validate().map_err(|e| anyhow!("Invalid sync configuration: {}", e))?;
    config.feed.validate().map_err(|e| anyhow!("Invalid feed configuration: {}", e))?;
    config.market.validate().map_err(|e| anyhow!("Invalid market configuration: {}", e))?;
    config.history.validate().map_err(|e| anyhow!("Invalid history configuration: {}", e))?;
    config.ledger.validate().map_err(|e| anyhow!("Invalid ledger configuration: {}", e))?;

    Ok(())
}
