//! Pool manager: the single entry point consumers and the API talk to

use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

use super::assignment::AssignmentTable;
use super::health::{probe_and_record, HealthProbe, ProbeResult};
use super::provider::{ProviderAdapter, CUSTOM_ORIGIN};
use super::registry::{PolicyHandle, ProxyRegistry};
use super::scheduler::{RotationScheduler, SchedulerConfig};
use super::transport::format_authority;
use crate::error::{PoolError, Result};
use crate::models::{
    Candidate, Endpoint, EndpointRecord, HealthReport, LeaseOutcome, PolicyUpdate, PoolStats,
    ProviderRefresh, ProxyLease, RefreshReport, RestoreReport, RotationPolicy, RotationReport,
};

/// Runtime knobs that are not part of the hot-reloadable policy
#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub scheduler: SchedulerConfig,
    /// Probes running concurrently in a health round
    pub health_workers: usize,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            health_workers: 8,
        }
    }
}

struct ManagerInner {
    registry: Arc<ProxyRegistry>,
    assignments: Arc<AssignmentTable>,
    scheduler: RotationScheduler,
    policy: PolicyHandle,
    /// Serializes policy writers so partial updates never race
    policy_writer: Mutex<()>,
    probe: Arc<dyn HealthProbe>,
    providers: RwLock<Vec<Arc<dyn ProviderAdapter>>>,
    health_workers: usize,
}

/// Shared handle to one proxy pool. Cheap to clone.
#[derive(Clone)]
pub struct PoolManager {
    inner: Arc<ManagerInner>,
}

fn require_consumer_id(consumer_id: &str) -> Result<()> {
    if consumer_id.trim().is_empty() {
        return Err(PoolError::InvalidRequest("consumerId must not be empty".into()));
    }
    Ok(())
}

impl PoolManager {
    pub fn new(
        policy: RotationPolicy,
        probe: Arc<dyn HealthProbe>,
        options: PoolOptions,
    ) -> Result<Self> {
        policy.validate()?;

        let policy: PolicyHandle = Arc::new(ArcSwap::from_pointee(policy));
        let registry = Arc::new(ProxyRegistry::new(policy.clone()));
        let assignments = Arc::new(AssignmentTable::new(registry.clone(), policy.clone()));
        let scheduler = RotationScheduler::new(
            assignments.clone(),
            registry.clone(),
            policy.clone(),
            probe.clone(),
            options.scheduler,
        );

        Ok(Self {
            inner: Arc::new(ManagerInner {
                registry,
                assignments,
                scheduler,
                policy,
                policy_writer: Mutex::new(()),
                probe,
                providers: RwLock::new(Vec::new()),
                health_workers: options.health_workers.max(1),
            }),
        })
    }

    // Providers

    /// Register an adapter. Names must be unique and not the reserved "custom".
    pub fn register_provider(&self, adapter: Arc<dyn ProviderAdapter>) -> Result<()> {
        let name = adapter.name().trim().to_string();
        if name.is_empty() {
            return Err(PoolError::InvalidConfig("provider name must not be empty".into()));
        }
        if name == CUSTOM_ORIGIN {
            return Err(PoolError::InvalidConfig(format!(
                "provider name '{}' is reserved",
                CUSTOM_ORIGIN
            )));
        }

        let mut providers = self.inner.providers.write();
        if providers.iter().any(|p| p.name() == name) {
            return Err(PoolError::InvalidConfig(format!(
                "provider '{}' is already registered",
                name
            )));
        }

        providers.push(adapter);
        info!(provider = %name, "Registered provider");
        Ok(())
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.inner
            .providers
            .read()
            .iter()
            .map(|p| p.name().to_string())
            .collect()
    }

    /// Pull candidates from every adapter. One adapter failing never affects
    /// the others or the existing pool.
    #[instrument(skip(self))]
    pub async fn refresh_from_providers(&self) -> RefreshReport {
        let adapters: Vec<Arc<dyn ProviderAdapter>> = self.inner.providers.read().clone();

        let results = futures::future::join_all(adapters.iter().map(|adapter| async move {
            let name = adapter.name().to_string();
            match adapter.fetch_candidates().await {
                Ok(candidates) => self.ingest(&name, candidates),
                Err(e) => {
                    warn!(provider = %name, error = %e, "Provider refresh failed");
                    ProviderRefresh::Failed {
                        provider: name,
                        error: e.to_string(),
                    }
                }
            }
        }))
        .await;

        let report = RefreshReport { providers: results };
        info!(
            providers = report.providers.len(),
            failed = report.failed_count(),
            inserted = report.inserted_count(),
            total = self.inner.registry.count(),
            "Provider refresh complete"
        );
        report
    }

    fn ingest(&self, provider: &str, candidates: Vec<Candidate>) -> ProviderRefresh {
        let (mut inserted, mut refreshed, mut rejected) = (0, 0, 0);

        for mut candidate in candidates {
            candidate.origin = provider.to_string();
            match self.inner.registry.upsert(&candidate) {
                Ok(upserted) if upserted.inserted => inserted += 1,
                Ok(_) => refreshed += 1,
                Err(e) => {
                    warn!(provider = %provider, address = %candidate.address, error = %e, "Rejected candidate");
                    rejected += 1;
                }
            }
        }

        ProviderRefresh::Ok {
            provider: provider.to_string(),
            inserted,
            refreshed,
            rejected,
        }
    }

    /// Add a manually supplied endpoint with origin "custom". Returns its key.
    pub fn add_custom_proxy(
        &self,
        host: &str,
        port: u16,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Result<String> {
        let host = host.trim();
        if host.is_empty() {
            return Err(PoolError::InvalidProxyAddress("host must not be empty".into()));
        }
        if port == 0 {
            return Err(PoolError::InvalidProxyAddress("port must not be 0".into()));
        }

        let address = if host.contains("://") {
            format!("{}:{}", host, port)
        } else {
            format_authority(host, port)
        };

        let mut candidate = Candidate::new(address, CUSTOM_ORIGIN);
        if let Some(username) = username.filter(|u| !u.is_empty()) {
            candidate = candidate.with_credentials(username, password.unwrap_or_default());
        }

        let upserted = self.inner.registry.upsert(&candidate)?;
        info!(address = %upserted.address, inserted = upserted.inserted, "Added custom endpoint");
        Ok(upserted.address)
    }

    // Consumers

    pub fn acquire_proxy(&self, consumer_id: &str) -> Result<LeaseOutcome> {
        require_consumer_id(consumer_id)?;
        let outcome = self.inner.assignments.acquire(consumer_id);
        if outcome.is_exhausted() {
            warn!(consumer_id = %consumer_id, total = self.inner.registry.count(), "Pool exhausted");
        }
        Ok(outcome)
    }

    pub fn release_proxy(&self, consumer_id: &str) -> Result<()> {
        require_consumer_id(consumer_id)?;
        self.inner.assignments.release(consumer_id)?;
        Ok(())
    }

    /// Forget a consumer, dropping its binding
    pub fn remove_consumer(&self, consumer_id: &str) -> bool {
        self.inner.assignments.remove_consumer(consumer_id)
    }

    /// Feed a consumer's request outcome into its current endpoint.
    ///
    /// Returns false when the consumer has no binding; the report is dropped.
    pub fn report_outcome(&self, consumer_id: &str, success: bool) -> Result<bool> {
        require_consumer_id(consumer_id)?;

        let Some(address) = self.inner.assignments.current_address(consumer_id) else {
            warn!(consumer_id = %consumer_id, success, "Outcome from consumer without assignment ignored");
            return Ok(false);
        };

        Ok(self.inner.registry.report_outcome(&address, success).is_some())
    }

    /// Move a consumer to a different endpoint now
    pub fn rotate_proxy(&self, consumer_id: &str) -> Result<LeaseOutcome> {
        require_consumer_id(consumer_id)?;
        self.inner.assignments.force_rotate(consumer_id)
    }

    pub fn lease(&self, consumer_id: &str) -> Option<ProxyLease> {
        self.inner.assignments.lease(consumer_id)
    }

    /// Whether a lease handed out earlier is still the consumer's live binding
    pub fn is_lease_current(&self, lease: &ProxyLease) -> bool {
        self.inner.assignments.is_current(lease)
    }

    // Policy

    pub fn policy(&self) -> RotationPolicy {
        self.inner.policy.load_full().as_ref().clone()
    }

    /// Merge and validate a partial update. On error the policy is unchanged.
    pub fn update_policy(&self, update: &PolicyUpdate) -> Result<RotationPolicy> {
        let _writer = self.inner.policy_writer.lock();
        let merged = self.inner.policy.load().merged(update)?;
        self.inner.policy.store(Arc::new(merged.clone()));
        info!(policy = ?merged, "Rotation policy updated");
        Ok(merged)
    }

    // Endpoints

    pub fn get_stats(&self) -> PoolStats {
        PoolStats {
            total: self.inner.registry.count(),
            healthy: self.inner.registry.healthy_count(),
            quarantined: self.inner.registry.quarantined_count(),
            assigned: self.inner.assignments.len(),
            scheduler_running: self.inner.scheduler.is_running(),
        }
    }

    pub fn endpoint(&self, address: &str) -> Option<Endpoint> {
        self.inner.registry.get(address)
    }

    pub fn quarantine(&self, address: &str) -> Result<bool> {
        self.inner.registry.quarantine(address)
    }

    pub fn unquarantine(&self, address: &str) -> Result<bool> {
        self.inner.registry.unquarantine(address)
    }

    pub fn clear_quarantine(&self) -> usize {
        let cleared = self.inner.registry.clear_quarantine();
        info!(count = cleared, "Cleared quarantine");
        cleared
    }

    /// Copy of every endpoint with its statistics, ordered by address.
    /// Credentials are redacted when serialized.
    pub fn export_snapshot(&self) -> Vec<Endpoint> {
        self.inner.registry.snapshot()
    }

    /// Snapshot for persistence, credentials included. Feed it back through
    /// [`restore_snapshot`](Self::restore_snapshot).
    pub fn export_records(&self) -> Vec<EndpointRecord> {
        self.inner
            .registry
            .snapshot()
            .into_iter()
            .map(EndpointRecord::from)
            .collect()
    }

    /// Load exported endpoints, rejecting malformed entries one at a time
    pub fn restore_snapshot<I, R>(&self, records: I) -> RestoreReport
    where
        I: IntoIterator<Item = R>,
        R: Into<EndpointRecord>,
    {
        self.inner.registry.restore(records)
    }

    /// Drop every endpoint and assignment
    pub fn reset_pool(&self) -> usize {
        let released = self.inner.assignments.clear();
        let removed = self.inner.registry.reset();
        warn!(endpoints = removed, assignments = released, "Pool reset");
        removed
    }

    // Health

    /// Probe one endpoint and record the result
    pub async fn probe(&self, address: &str) -> Result<ProbeResult> {
        let timeout = self.inner.policy.load().probe_timeout();
        probe_and_record(&self.inner.registry, self.inner.probe.as_ref(), address, timeout).await
    }

    /// Probe every endpoint, quarantined ones included, then release those
    /// whose cooldown elapsed and whose latest probe passed
    pub async fn probe_all(&self) -> HealthReport {
        self.probe_all_at(Utc::now()).await
    }

    pub(crate) async fn probe_all_at(&self, now: DateTime<Utc>) -> HealthReport {
        let addresses: Vec<String> = self
            .inner
            .registry
            .snapshot()
            .into_iter()
            .map(|e| e.address)
            .collect();
        debug!(count = addresses.len(), "Probing endpoints");

        let outcomes = futures::stream::iter(addresses)
            .map(|address| async move { self.probe(&address).await.map(|r| r.ok).unwrap_or(false) })
            .buffer_unordered(self.inner.health_workers)
            .collect::<Vec<bool>>()
            .await;

        let healthy = outcomes.iter().filter(|&&ok| ok).count();
        let mut report = HealthReport {
            healthy,
            unhealthy: outcomes.len().saturating_sub(healthy),
            recovered: 0,
        };

        if let Some(cooldown) = self.inner.policy.load().quarantine_cooldown() {
            let released = self.inner.registry.release_cooled_down(now, cooldown);
            for address in &released {
                info!(address = %address, "Endpoint released from quarantine after cooldown");
            }
            report.recovered = released.len();
        }

        report
    }

    // Scheduler

    pub fn start_rotation(&self) -> bool {
        self.inner.scheduler.start()
    }

    pub fn stop_rotation(&self) -> bool {
        self.inner.scheduler.stop()
    }

    pub fn is_rotation_running(&self) -> bool {
        self.inner.scheduler.is_running()
    }

    /// Rotate every consumer due at `now` and wait for the batch
    pub async fn rotate_due(&self, now: DateTime<Utc>) -> RotationReport {
        self.inner.scheduler.rotate_due(now).await
    }

    /// Wait for in-flight scheduled rotations to finish
    pub async fn drain_rotations(&self) {
        self.inner.scheduler.drain().await
    }
}
