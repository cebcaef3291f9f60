//! Health probing for pool endpoints
//!
//! A probe opens a tunnel through the endpoint to a known target and times
//! it. Results feed the same EMA as consumer reports: a pass counts as a
//! success and sets latency, a failure counts as a failed outcome.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{interval, timeout};
use tracing::{debug, info, instrument, warn};

use super::manager::PoolManager;
use super::registry::ProxyRegistry;
use super::transport;
use crate::error::{PoolError, Result};
use crate::models::{Endpoint, UNMEASURED_LATENCY};

/// Outcome of a single probe
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeResult {
    pub latency_ms: i64,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProbeResult {
    pub fn success(latency_ms: i64) -> Self {
        Self {
            latency_ms,
            ok: true,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            latency_ms: UNMEASURED_LATENCY,
            ok: false,
            error: Some(error.into()),
        }
    }
}

/// Measures an endpoint. Implementations must finish within `timeout`.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn measure(&self, endpoint: &Endpoint, timeout: Duration) -> ProbeResult;
}

/// Probe that tunnels a TCP connection through the endpoint to a fixed target
#[derive(Debug, Clone)]
pub struct TcpProbe {
    target_host: String,
    target_port: u16,
}

impl TcpProbe {
    pub fn new(target_host: impl Into<String>, target_port: u16) -> Self {
        Self {
            target_host: target_host.into(),
            target_port,
        }
    }

    /// Target taken from a URL such as `https://api.ipify.org`
    pub fn from_url(raw: &str) -> Result<Self> {
        let url = url::Url::parse(raw)?;
        let host = url
            .host_str()
            .ok_or_else(|| PoolError::InvalidConfig(format!("probe URL '{}' has no host", raw)))?;
        let port = url.port_or_known_default().ok_or_else(|| {
            PoolError::InvalidConfig(format!("probe URL '{}' has no port", raw))
        })?;

        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        Ok(Self::new(host, port))
    }

    pub fn target(&self) -> String {
        transport::format_authority(&self.target_host, self.target_port)
    }
}

#[async_trait]
impl HealthProbe for TcpProbe {
    #[instrument(skip(self, endpoint), fields(address = %endpoint.address))]
    async fn measure(&self, endpoint: &Endpoint, probe_timeout: Duration) -> ProbeResult {
        let parsed = match endpoint.parsed() {
            Ok(parsed) => parsed,
            Err(e) => return ProbeResult::failure(e.to_string()),
        };

        let started = Instant::now();
        let attempt = transport::connect_through(&parsed, &self.target_host, self.target_port);

        match timeout(probe_timeout, attempt).await {
            Ok(Ok(_stream)) => {
                let latency_ms = i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX);
                debug!(latency_ms, target = %self.target(), "Probe passed");
                ProbeResult::success(latency_ms)
            }
            Ok(Err(e)) => {
                debug!(error = %e, "Probe failed");
                ProbeResult::failure(e.to_string())
            }
            Err(_) => {
                let err = PoolError::ProbeTimeout {
                    address: endpoint.address.clone(),
                    timeout_ms: u64::try_from(probe_timeout.as_millis()).unwrap_or(u64::MAX),
                };
                debug!(error = %err, "Probe timed out");
                ProbeResult::failure(err.to_string())
            }
        }
    }
}

/// Probe one endpoint and record the result in the registry
pub(crate) async fn probe_and_record(
    registry: &ProxyRegistry,
    probe: &dyn HealthProbe,
    address: &str,
    probe_timeout: Duration,
) -> Result<ProbeResult> {
    let endpoint = registry
        .get(address)
        .ok_or_else(|| PoolError::UnknownEndpoint(address.to_string()))?;

    let result = probe.measure(&endpoint, probe_timeout).await;
    if result.ok {
        registry.record_probe(address, result.latency_ms);
    } else {
        registry.record_probe_failure(address);
    }

    Ok(result)
}

/// Health checker configuration
#[derive(Debug, Clone)]
pub struct HealthCheckerConfig {
    /// Interval between probe rounds
    pub check_interval: Duration,
}

impl Default for HealthCheckerConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(300),
        }
    }
}

/// Periodic probe round over the whole pool, quarantined endpoints included
/// so they can recover
pub struct HealthChecker {
    manager: PoolManager,
    config: HealthCheckerConfig,
}

impl HealthChecker {
    pub fn new(manager: PoolManager, config: HealthCheckerConfig) -> Self {
        Self { manager, config }
    }

    /// Run until shutdown (call in a spawned task)
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Starting health checker with {}s interval",
            self.config.check_interval.as_secs()
        );

        let mut check_interval = interval(self.config.check_interval);

        loop {
            tokio::select! {
                _ = check_interval.tick() => {
                    let report = self.manager.probe_all().await;
                    if report.unhealthy > 0 {
                        warn!(
                            healthy = report.healthy,
                            unhealthy = report.unhealthy,
                            recovered = report.recovered,
                            "Health check round complete"
                        );
                    } else {
                        info!(
                            healthy = report.healthy,
                            recovered = report.recovered,
                            "Health check round complete"
                        );
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Health checker shutting down");
                        break;
                    }
                }
            }
        }
    }
}

/// Guard for managing health checker lifecycle
pub struct HealthCheckerHandle {
    shutdown_tx: watch::Sender<bool>,
}

impl HealthCheckerHandle {
    pub fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { shutdown_tx: tx }, rx)
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Default for HealthCheckerHandle {
    fn default() -> Self {
        Self::new().0
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    use parking_lot::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use crate::models::{Candidate, ParsedAddress, RotationPolicy};
    use crate::pool::manager::PoolOptions;

    /// Probe with scripted results; unscripted endpoints pass at 50ms
    #[derive(Default)]
    pub(crate) struct ScriptedProbe {
        results: Mutex<HashMap<String, ProbeResult>>,
        delay: Option<Duration>,
    }

    impl ScriptedProbe {
        pub(crate) fn with_delay(delay: Duration) -> Self {
            Self {
                results: Mutex::new(HashMap::new()),
                delay: Some(delay),
            }
        }

        pub(crate) fn set(&self, address: &str, result: ProbeResult) {
            self.results.lock().insert(address.to_string(), result);
        }
    }

    #[async_trait]
    impl HealthProbe for ScriptedProbe {
        async fn measure(&self, endpoint: &Endpoint, _timeout: Duration) -> ProbeResult {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.results
                .lock()
                .get(&endpoint.address)
                .cloned()
                .unwrap_or_else(|| ProbeResult::success(50))
        }
    }

    fn endpoint_at(address: &str) -> Endpoint {
        let candidate = Candidate::new(address, "static");
        let parsed = ParsedAddress::parse(address).unwrap();
        Endpoint::new(parsed, &candidate, 1, chrono::Utc::now())
    }

    #[test]
    fn test_probe_target_from_url() {
        let probe = TcpProbe::from_url("https://api.ipify.org").unwrap();
        assert_eq!(probe.target(), "api.ipify.org:443");

        let probe = TcpProbe::from_url("http://[::1]:8080/ip").unwrap();
        assert_eq!(probe.target(), "[::1]:8080");

        assert!(TcpProbe::from_url("not a url").is_err());
    }

    #[tokio::test]
    async fn test_tcp_probe_passes_through_connect_endpoint() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            let (mut client, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let _ = client.read(&mut buf).await.unwrap();
            client
                .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
                .await
                .unwrap();
        });

        let probe = TcpProbe::new("example.com", 443);
        let result = probe
            .measure(&endpoint_at(&addr.to_string()), Duration::from_secs(2))
            .await;

        assert!(result.ok, "{:?}", result.error);
        assert!(result.latency_ms >= 0);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_tcp_probe_times_out_on_silent_endpoint() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            let (client, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_millis(500)).await;
            drop(client);
        });

        let probe = TcpProbe::new("example.com", 443);
        let result = probe
            .measure(&endpoint_at(&addr.to_string()), Duration::from_millis(100))
            .await;

        assert!(!result.ok);
        assert_eq!(result.latency_ms, UNMEASURED_LATENCY);
        assert!(result.error.unwrap().contains("timed out"));
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_probe_and_record_updates_registry() {
        let registry = ProxyRegistry::new(crate::pool::registry::tests::policy_handle(
            RotationPolicy::default(),
        ));
        registry.upsert(&Candidate::new("1.1.1.1:80", "static")).unwrap();
        registry.upsert(&Candidate::new("2.2.2.2:80", "static")).unwrap();

        let probe = ScriptedProbe::default();
        probe.set("2.2.2.2:80", ProbeResult::failure("refused"));

        let ok = probe_and_record(&registry, &probe, "1.1.1.1:80", Duration::from_secs(1))
            .await
            .unwrap();
        assert!(ok.ok);
        assert_eq!(registry.get("1.1.1.1:80").unwrap().latency_ms, 50);

        let failed = probe_and_record(&registry, &probe, "2.2.2.2:80", Duration::from_secs(1))
            .await
            .unwrap();
        assert!(!failed.ok);
        let endpoint = registry.get("2.2.2.2:80").unwrap();
        assert_eq!(endpoint.latency_ms, UNMEASURED_LATENCY);
        assert_eq!(endpoint.consecutive_failures, 1);

        assert!(matches!(
            probe_and_record(&registry, &probe, "9.9.9.9:1", Duration::from_secs(1)).await,
            Err(PoolError::UnknownEndpoint(_))
        ));
    }

    #[tokio::test]
    async fn test_health_checker_runs_until_shutdown() {
        let manager = PoolManager::new(
            RotationPolicy::default(),
            Arc::new(ScriptedProbe::default()),
            PoolOptions::default(),
        )
        .unwrap();
        manager.add_custom_proxy("1.1.1.1", 80, None, None).unwrap();

        let checker = HealthChecker::new(
            manager.clone(),
            HealthCheckerConfig {
                check_interval: Duration::from_millis(20),
            },
        );
        let (handle, shutdown_rx) = HealthCheckerHandle::new();
        let task = tokio::spawn(async move { checker.run(shutdown_rx).await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.shutdown();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();

        let endpoint = manager.export_snapshot().pop().unwrap();
        assert_eq!(endpoint.latency_ms, 50);
        assert_eq!(endpoint.last_probe_ok, Some(true));
    }
}
