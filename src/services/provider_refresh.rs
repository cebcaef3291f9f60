//! Provider refresh service
//!
//! Pulls candidates from every registered adapter on startup and then on a
//! fixed interval.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::interval;
use tracing::{info, instrument, warn};

use crate::models::RefreshReport;
use crate::pool::PoolManager;

#[derive(Debug, Clone)]
pub struct ProviderRefreshConfig {
    /// Time between refreshes
    pub refresh_interval: Duration,
}

impl Default for ProviderRefreshConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(900),
        }
    }
}

pub struct ProviderRefreshService {
    manager: PoolManager,
    config: ProviderRefreshConfig,
}

impl ProviderRefreshService {
    pub fn new(manager: PoolManager, config: ProviderRefreshConfig) -> Self {
        Self { manager, config }
    }

    /// Run the refresh loop. The first tick fires immediately.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Starting provider refresh service ({}s interval)",
            self.config.refresh_interval.as_secs()
        );

        let mut refresh_interval = interval(self.config.refresh_interval);

        loop {
            tokio::select! {
                _ = refresh_interval.tick() => {
                    self.refresh_once().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Provider refresh service shutting down");
                        break;
                    }
                }
            }
        }
    }

    pub async fn refresh_once(&self) -> RefreshReport {
        let report = self.manager.refresh_from_providers().await;
        if report.failed_count() > 0 {
            warn!(
                failed = report.failed_count(),
                providers = report.providers.len(),
                "Some providers could not be refreshed"
            );
        }
        report
    }
}

/// Handle for managing the provider refresh service
pub struct ProviderRefreshHandle {
    shutdown_tx: watch::Sender<bool>,
}

impl ProviderRefreshHandle {
    pub fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { shutdown_tx: tx }, rx)
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Default for ProviderRefreshHandle {
    fn default() -> Self {
        Self::new().0
    }
}
