//! Signal handling for graceful shutdown

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::service::NodeService;

/// Resolve once on Ctrl+C (SIGINT) or SIGTERM
pub fn setup_signal_handlers() -> Result<oneshot::Receiver<()>> {
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    let sigterm = Arc::new(AtomicBool::new(false));
    #[cfg(unix)]
    signal_hook::flag::register(signal_hook::consts::SIGTERM, sigterm.clone())
        .context("Failed to register SIGTERM handler")?;

    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C signal: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Ctrl+C signal received");
        };

        let terminate = async {
            while !sigterm.load(Ordering::Relaxed) {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            info!("SIGTERM signal received");
        };

        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate => {}
        }
        let _ = shutdown_tx.send(());
    });

    Ok(shutdown_rx)
}

/// Stop periodic tasks and flush state, bounded by the configured timeout
pub async fn graceful_shutdown(service: Arc<NodeService>) -> Result<()> {
    info!("Starting graceful shutdown...");

    let shutdown_timeout = Duration::from_secs(service.config().node.shutdown_timeout_secs);
    match timeout(shutdown_timeout, service.shutdown()).await {
        Ok(()) => info!("Graceful shutdown complete"),
        Err(_) => warn!("Shutdown did not finish within {:?}, forcing exit", shutdown_timeout),
    }

    Ok(())
}
