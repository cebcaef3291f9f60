//! Rota Pool - Entry Point
//!
//! Starts the pool manager, its background loops and the API server with
//! graceful shutdown support.

use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use rota_pool::api::ApiServer;
use rota_pool::config::{Config, LogConfig};
use rota_pool::error::Result;
use rota_pool::pool::{
    HealthChecker, HealthCheckerConfig, HealthCheckerHandle, HttpApiProvider, PoolManager,
    PoolOptions, SchedulerConfig, StaticListProvider, TcpProbe,
};
use rota_pool::services::{ProviderRefreshConfig, ProviderRefreshHandle, ProviderRefreshService};

/// Upper bound on waiting for in-flight rotations at shutdown
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for vendor provider API calls
const PROVIDER_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config.log);

    info!("Starting Rota Pool");

    let probe = Arc::new(TcpProbe::from_url(&config.runtime.probe_target_url)?);
    info!("Health probes target {}", probe.target());

    let manager = PoolManager::new(
        config.policy.clone(),
        probe,
        PoolOptions {
            scheduler: SchedulerConfig {
                tick: config.runtime.scheduler_tick,
                workers: config.runtime.rotation_workers,
                probe_after_rotate: true,
            },
            health_workers: config.runtime.health_check_workers,
        },
    )?;

    // Providers
    if !config.providers.static_proxies.is_empty() {
        manager.register_provider(Arc::new(StaticListProvider::new(
            "static",
            config.providers.static_proxies.clone(),
        )))?;
    }
    if let Some(vendor) = &config.providers.vendor {
        manager.register_provider(Arc::new(HttpApiProvider::new(
            vendor.name.clone(),
            vendor.api_url.clone(),
            vendor.api_key.clone(),
            PROVIDER_HTTP_TIMEOUT,
        )?))?;
    }
    if manager.provider_names().is_empty() {
        warn!("No providers configured; endpoints can only be added through the API");
    }

    // Provider refresh (first refresh runs immediately)
    let (refresh_handle, refresh_shutdown) = ProviderRefreshHandle::new();
    let refresh_service = ProviderRefreshService::new(
        manager.clone(),
        ProviderRefreshConfig {
            refresh_interval: config.runtime.provider_refresh_interval,
        },
    );
    let refresh_task = tokio::spawn(async move {
        refresh_service.run(refresh_shutdown).await;
    });

    // Health checker
    let (health_handle, health_shutdown) = HealthCheckerHandle::new();
    let health_task = match config.runtime.health_check_interval {
        Some(check_interval) => {
            let checker = HealthChecker::new(manager.clone(), HealthCheckerConfig { check_interval });
            Some(tokio::spawn(async move {
                checker.run(health_shutdown).await;
            }))
        }
        None => {
            info!("Periodic health checks disabled");
            None
        }
    };

    // Rotation scheduler
    manager.start_rotation();

    // API server
    let (shutdown_tx, api_shutdown) = watch::channel(false);
    let api_server = ApiServer::new(config.clone(), manager.clone());
    let api_task = tokio::spawn(async move {
        if let Err(e) = api_server.run(api_shutdown).await {
            error!("API server error: {}", e);
        }
    });

    info!("Pool manager started - API: {}", config.api_addr());

    shutdown_signal().await;
    info!("Shutdown signal received");

    let _ = shutdown_tx.send(true);
    refresh_handle.shutdown();
    health_handle.shutdown();
    manager.stop_rotation();

    if tokio::time::timeout(DRAIN_TIMEOUT, manager.drain_rotations())
        .await
        .is_err()
    {
        warn!("Timed out waiting for in-flight rotations");
    }

    let _ = tokio::join!(api_task, refresh_task);
    if let Some(task) = health_task {
        let _ = task.await;
    }

    info!("Rota Pool stopped");
    Ok(())
}

fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("rota_pool={},tower_http=info", log.level).into());

    let registry = tracing_subscriber::registry().with(filter);
    if log.format.eq_ignore_ascii_case("json") {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
