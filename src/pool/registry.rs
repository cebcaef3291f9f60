//! Authoritative in-memory store of pool endpoints
//!
//! Endpoints live in a sharded map, so writers for different addresses do not
//! contend and every mutation of a single address is applied under that
//! entry's exclusive guard.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::error::{PoolError, Result};
use crate::models::{
    Candidate, Endpoint, EndpointRecord, ParsedAddress, RestoreReport, RotationPolicy,
};

/// Shared, hot-swappable rotation policy
pub type PolicyHandle = Arc<ArcSwap<RotationPolicy>>;

/// Result of an upsert
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upserted {
    /// Normalized registry key
    pub address: String,
    /// False when an existing endpoint was refreshed
    pub inserted: bool,
}

/// State of an endpoint right after an outcome was applied
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OutcomeEffect {
    pub success_rate: f64,
    /// Position of this report in the endpoint's report history (1-based)
    pub sequence: u64,
    pub quarantined: bool,
    /// True when this report pushed the endpoint into quarantine
    pub newly_quarantined: bool,
}

/// Store of all known endpoints and their health statistics
pub struct ProxyRegistry {
    endpoints: DashMap<String, Endpoint>,
    generation: AtomicU64,
    policy: PolicyHandle,
}

impl ProxyRegistry {
    pub fn new(policy: PolicyHandle) -> Self {
        Self {
            endpoints: DashMap::new(),
            generation: AtomicU64::new(0),
            policy,
        }
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Insert a new endpoint or merge into an existing one.
    ///
    /// Merging never touches the learned score; only origin and freshness
    /// metadata change.
    pub fn upsert(&self, candidate: &Candidate) -> Result<Upserted> {
        if candidate.origin.trim().is_empty() {
            return Err(PoolError::InvalidRequest(format!(
                "candidate {} has an empty origin",
                candidate.address
            )));
        }

        let parsed = ParsedAddress::parse(&candidate.address)?;
        let address = parsed.key();
        let now = Utc::now();

        match self.endpoints.entry(address.clone()) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().refresh_from(candidate, now);
                debug!(address = %address, origin = %candidate.origin, "Refreshed endpoint");
                Ok(Upserted {
                    address,
                    inserted: false,
                })
            }
            Entry::Vacant(entry) => {
                let generation = self.next_generation();
                entry.insert(Endpoint::new(parsed, candidate, generation, now));
                debug!(address = %address, origin = %candidate.origin, "Added endpoint");
                Ok(Upserted {
                    address,
                    inserted: true,
                })
            }
        }
    }

    /// Re-create endpoints from an exported snapshot, keeping their statistics.
    ///
    /// Each entry is normalized to its registry key; entries with a malformed
    /// address or out-of-range statistics are rejected one at a time.
    pub fn restore<I, R>(&self, records: I) -> RestoreReport
    where
        I: IntoIterator<Item = R>,
        R: Into<EndpointRecord>,
    {
        let mut report = RestoreReport::default();
        for record in records {
            let endpoint = record.into().into_endpoint();
            let address = endpoint.address.clone();

            match endpoint.normalized() {
                Ok(mut endpoint) => {
                    endpoint.generation = self.next_generation();
                    self.endpoints.insert(endpoint.address.clone(), endpoint);
                    report.restored += 1;
                }
                Err(e) => {
                    warn!(address = %address, error = %e, "Rejected snapshot entry");
                    report.rejected += 1;
                }
            }
        }
        info!(
            restored = report.restored,
            rejected = report.rejected,
            "Restored endpoints from snapshot"
        );
        report
    }

    /// Feed one outcome into the endpoint's EMA.
    ///
    /// Unknown addresses are ignored: a report can legitimately race with a
    /// pool reset.
    pub fn report_outcome(&self, address: &str, success: bool) -> Option<OutcomeEffect> {
        self.apply_outcome(address, success, |_| {})
    }

    /// Record a successful probe: sets latency and counts as a success
    pub fn record_probe(&self, address: &str, latency_ms: i64) -> Option<OutcomeEffect> {
        self.apply_outcome(address, true, |endpoint| {
            endpoint.latency_ms = latency_ms.max(0);
            endpoint.last_probe_ok = Some(true);
        })
    }

    /// Record a failed probe as a failed outcome
    pub fn record_probe_failure(&self, address: &str) -> Option<OutcomeEffect> {
        self.apply_outcome(address, false, |endpoint| {
            endpoint.last_probe_ok = Some(false);
        })
    }

    fn apply_outcome(
        &self,
        address: &str,
        success: bool,
        before: impl FnOnce(&mut Endpoint),
    ) -> Option<OutcomeEffect> {
        let threshold = self.policy.load().auto_quarantine_threshold;

        let Some(mut endpoint) = self.endpoints.get_mut(address) else {
            warn!(address = %address, success, "Outcome for unknown endpoint ignored");
            return None;
        };

        before(endpoint.value_mut());
        let newly_quarantined = endpoint.apply_outcome(success, threshold, Utc::now());
        if newly_quarantined {
            endpoint.generation = self.next_generation();
            warn!(
                address = %address,
                failures = endpoint.consecutive_failures,
                "Endpoint quarantined after consecutive failures"
            );
        }

        Some(OutcomeEffect {
            success_rate: endpoint.success_rate,
            sequence: endpoint.reports(),
            quarantined: endpoint.quarantined,
            newly_quarantined,
        })
    }

    /// Exclude an endpoint from selection. Returns whether the state changed.
    pub fn quarantine(&self, address: &str) -> Result<bool> {
        self.set_quarantined(address, true)
    }

    /// Return an endpoint to selection. Returns whether the state changed.
    pub fn unquarantine(&self, address: &str) -> Result<bool> {
        self.set_quarantined(address, false)
    }

    fn set_quarantined(&self, address: &str, quarantined: bool) -> Result<bool> {
        let mut endpoint = self
            .endpoints
            .get_mut(address)
            .ok_or_else(|| PoolError::UnknownEndpoint(address.to_string()))?;

        if endpoint.quarantined == quarantined {
            return Ok(false);
        }

        endpoint.set_quarantined(quarantined, Utc::now());
        endpoint.generation = self.next_generation();
        info!(address = %address, quarantined, "Endpoint quarantine changed");
        Ok(true)
    }

    /// Unquarantine every endpoint. Returns how many changed.
    pub fn clear_quarantine(&self) -> usize {
        let now = Utc::now();
        let mut cleared = 0;
        for mut endpoint in self.endpoints.iter_mut() {
            if endpoint.quarantined {
                endpoint.set_quarantined(false, now);
                endpoint.generation = self.next_generation();
                cleared += 1;
            }
        }
        cleared
    }

    /// Unquarantine endpoints quarantined for at least `cooldown` whose most
    /// recent probe passed
    pub fn release_cooled_down(&self, now: DateTime<Utc>, cooldown: chrono::Duration) -> Vec<String> {
        let mut released = Vec::new();
        for mut endpoint in self.endpoints.iter_mut() {
            let cooled = endpoint
                .quarantined_at
                .map(|at| now - at >= cooldown)
                .unwrap_or(false);

            if endpoint.quarantined && cooled && endpoint.last_probe_ok == Some(true) {
                endpoint.set_quarantined(false, now);
                endpoint.generation = self.next_generation();
                released.push(endpoint.address.clone());
            }
        }
        released
    }

    /// Stamp an endpoint as just assigned
    pub fn mark_used(&self, address: &str, at: DateTime<Utc>) -> bool {
        match self.endpoints.get_mut(address) {
            Some(mut endpoint) => {
                endpoint.last_used_at = at;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, address: &str) -> Option<Endpoint> {
        self.endpoints.get(address).map(|e| e.value().clone())
    }

    /// Point-in-time copy of every endpoint, ordered by address
    pub fn snapshot(&self) -> Vec<Endpoint> {
        let mut endpoints: Vec<Endpoint> =
            self.endpoints.iter().map(|e| e.value().clone()).collect();
        endpoints.sort_by(|a, b| a.address.cmp(&b.address));
        endpoints
    }

    pub fn count(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Endpoints not quarantined and at or above the policy's minimum success rate
    pub fn healthy_count(&self) -> usize {
        let min_success_rate = self.policy.load().min_success_rate;
        self.endpoints
            .iter()
            .filter(|e| e.is_eligible(min_success_rate))
            .count()
    }

    pub fn quarantined_count(&self) -> usize {
        self.endpoints.iter().filter(|e| e.quarantined).count()
    }

    /// Drop every endpoint. The only hard delete.
    pub fn reset(&self) -> usize {
        let removed = self.endpoints.len();
        self.endpoints.clear();
        info!(count = removed, "Registry reset");
        removed
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::ema_update;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    pub(crate) fn policy_handle(policy: RotationPolicy) -> PolicyHandle {
        Arc::new(ArcSwap::from_pointee(policy))
    }

    fn registry() -> ProxyRegistry {
        ProxyRegistry::new(policy_handle(RotationPolicy::default()))
    }

    /// Exported-snapshot style endpoint with a chosen score
    pub(crate) fn scored_endpoint(address: &str, latency_ms: i64, success_rate: f64) -> Endpoint {
        let candidate = Candidate::new(address, "static");
        let parsed = ParsedAddress::parse(address).unwrap();
        let mut endpoint = Endpoint::new(parsed, &candidate, 0, Utc::now());
        endpoint.latency_ms = latency_ms;
        endpoint.success_rate = success_rate;
        endpoint
    }

    #[test]
    fn test_upsert_inserts_then_refreshes() {
        let registry = registry();

        let first = registry
            .upsert(&Candidate::new("1.2.3.4:8080", "static"))
            .unwrap();
        assert!(first.inserted);
        assert_eq!(first.address, "1.2.3.4:8080");

        let second = registry
            .upsert(&Candidate::new("http://1.2.3.4:8080", "vendor").with_location("US"))
            .unwrap();
        assert!(!second.inserted);
        assert_eq!(registry.count(), 1);

        let endpoint = registry.get("1.2.3.4:8080").unwrap();
        assert_eq!(endpoint.origin, "vendor");
        assert_eq!(endpoint.location.as_deref(), Some("US"));
    }

    #[test]
    fn test_upsert_preserves_learned_score() {
        let registry = registry();
        registry.restore(vec![scored_endpoint("1.2.3.4:8080", 40, 0.4)]);
        let before = registry.get("1.2.3.4:8080").unwrap();

        registry
            .upsert(&Candidate::new("1.2.3.4:8080", "vendor"))
            .unwrap();

        let after = registry.get("1.2.3.4:8080").unwrap();
        assert_eq!(after.success_rate, 0.4);
        assert_eq!(after.latency_ms, 40);
        assert_eq!(after.last_used_at, before.last_used_at);
        assert_eq!(after.origin, "vendor");
        assert!(after.refreshed_at >= before.refreshed_at);
    }

    #[test]
    fn test_upsert_rejects_malformed_candidates() {
        let registry = registry();
        assert!(registry.upsert(&Candidate::new("", "static")).is_err());
        assert!(registry
            .upsert(&Candidate::new("gopher://1.2.3.4:70", "static"))
            .is_err());
        assert!(registry.upsert(&Candidate::new("1.2.3.4:80", " ")).is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_report_outcome_applies_ema() {
        let registry = registry();
        registry
            .upsert(&Candidate::new("1.2.3.4:8080", "static"))
            .unwrap();

        let effect = registry.report_outcome("1.2.3.4:8080", false).unwrap();
        assert!((effect.success_rate - 0.9).abs() < 1e-12);
        assert_eq!(effect.sequence, 1);

        let effect = registry.report_outcome("1.2.3.4:8080", true).unwrap();
        assert!((effect.success_rate - 0.91).abs() < 1e-12);
        assert_eq!(effect.sequence, 2);
    }

    #[test]
    fn test_report_outcome_unknown_endpoint_is_noop() {
        let registry = registry();
        assert!(registry.report_outcome("9.9.9.9:1", false).is_none());
        assert!(registry.record_probe("9.9.9.9:1", 10).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_consecutive_failures_force_quarantine() {
        let registry = registry();
        registry
            .upsert(&Candidate::new("1.2.3.4:8080", "static"))
            .unwrap();
        let generation = registry.get("1.2.3.4:8080").unwrap().generation;

        registry.report_outcome("1.2.3.4:8080", false);
        registry.report_outcome("1.2.3.4:8080", false);
        let effect = registry.report_outcome("1.2.3.4:8080", false).unwrap();

        assert!(effect.newly_quarantined);
        assert!(effect.quarantined);
        assert_eq!(registry.quarantined_count(), 1);
        assert!(registry.get("1.2.3.4:8080").unwrap().generation > generation);
    }

    #[test]
    fn test_probe_counts_as_success_and_sets_latency() {
        let registry = registry();
        registry
            .upsert(&Candidate::new("1.2.3.4:8080", "static"))
            .unwrap();
        registry.report_outcome("1.2.3.4:8080", false);

        let effect = registry.record_probe("1.2.3.4:8080", 42).unwrap();
        let endpoint = registry.get("1.2.3.4:8080").unwrap();

        assert_eq!(endpoint.latency_ms, 42);
        assert_eq!(endpoint.last_probe_ok, Some(true));
        assert_eq!(endpoint.consecutive_failures, 0);
        assert!((effect.success_rate - ema_update(0.9, true)).abs() < 1e-12);
    }

    #[test]
    fn test_quarantine_is_idempotent() {
        let registry = registry();
        registry
            .upsert(&Candidate::new("1.2.3.4:8080", "static"))
            .unwrap();

        assert!(registry.quarantine("1.2.3.4:8080").unwrap());
        let generation = registry.get("1.2.3.4:8080").unwrap().generation;
        assert!(!registry.quarantine("1.2.3.4:8080").unwrap());
        assert_eq!(registry.get("1.2.3.4:8080").unwrap().generation, generation);

        assert!(registry.unquarantine("1.2.3.4:8080").unwrap());
        assert!(!registry.unquarantine("1.2.3.4:8080").unwrap());

        assert!(matches!(
            registry.quarantine("5.6.7.8:1"),
            Err(PoolError::UnknownEndpoint(_))
        ));
    }

    #[test]
    fn test_clear_quarantine_keeps_scores() {
        let registry = registry();
        registry.restore(vec![
            scored_endpoint("1.1.1.1:80", 10, 0.5),
            scored_endpoint("2.2.2.2:80", 10, 0.95),
        ]);
        registry.quarantine("1.1.1.1:80").unwrap();
        registry.quarantine("2.2.2.2:80").unwrap();

        assert_eq!(registry.clear_quarantine(), 2);
        assert_eq!(registry.quarantined_count(), 0);
        assert_eq!(registry.get("1.1.1.1:80").unwrap().success_rate, 0.5);
    }

    #[test]
    fn test_release_cooled_down_requires_passing_probe() {
        let registry = registry();
        registry.upsert(&Candidate::new("1.1.1.1:80", "static")).unwrap();
        registry.upsert(&Candidate::new("2.2.2.2:80", "static")).unwrap();
        registry.quarantine("1.1.1.1:80").unwrap();
        registry.quarantine("2.2.2.2:80").unwrap();

        registry.record_probe("1.1.1.1:80", 25);
        registry.record_probe_failure("2.2.2.2:80");

        let cooldown = chrono::Duration::minutes(30);
        assert!(registry.release_cooled_down(Utc::now(), cooldown).is_empty());

        let later = Utc::now() + chrono::Duration::minutes(31);
        let released = registry.release_cooled_down(later, cooldown);
        assert_eq!(released, vec!["1.1.1.1:80".to_string()]);
        assert!(registry.get("2.2.2.2:80").unwrap().quarantined);
    }

    #[test]
    fn test_counts_follow_policy_threshold() {
        let policy = policy_handle(RotationPolicy::default());
        let registry = ProxyRegistry::new(policy.clone());
        registry.restore(vec![
            scored_endpoint("1.1.1.1:80", 10, 1.0),
            scored_endpoint("2.2.2.2:80", 10, 0.7),
            scored_endpoint("3.3.3.3:80", 10, 0.9),
        ]);
        registry.quarantine("3.3.3.3:80").unwrap();

        assert_eq!(registry.count(), 3);
        assert_eq!(registry.healthy_count(), 1);
        assert_eq!(registry.quarantined_count(), 1);

        policy.store(Arc::new(RotationPolicy {
            min_success_rate: 0.5,
            ..RotationPolicy::default()
        }));
        assert_eq!(registry.healthy_count(), 2);
    }

    #[test]
    fn test_reset_removes_everything() {
        let registry = registry();
        registry.upsert(&Candidate::new("1.1.1.1:80", "static")).unwrap();
        registry.upsert(&Candidate::new("2.2.2.2:80", "static")).unwrap();

        assert_eq!(registry.reset(), 2);
        assert!(registry.is_empty());
        assert!(registry.snapshot().is_empty());
    }

    #[test]
    fn test_restore_normalizes_and_rejects_invalid_entries() {
        let registry = registry();

        let mut aliased = scored_endpoint("1.2.3.4:80", 10, 0.9);
        aliased.address = "http://1.2.3.4:80".to_string();
        let mut out_of_range = scored_endpoint("5.5.5.5:80", 10, 1.0);
        out_of_range.success_rate = 7.5;
        let mut not_a_number = scored_endpoint("6.6.6.6:80", 10, 1.0);
        not_a_number.success_rate = f64::NAN;

        let report = registry.restore(vec![aliased, out_of_range, not_a_number]);
        assert_eq!(report.restored, 1);
        assert_eq!(report.rejected, 2);
        assert!(registry.get("5.5.5.5:80").is_none());

        // A later upsert of the same proxy merges instead of duplicating
        let upserted = registry.upsert(&Candidate::new("1.2.3.4:80", "vendor")).unwrap();
        assert!(!upserted.inserted);
        assert_eq!(registry.count(), 1);
        assert_eq!(registry.get("1.2.3.4:80").unwrap().success_rate, 0.9);
    }

    #[test]
    fn test_snapshot_is_detached_copy() {
        let registry = registry();
        registry.upsert(&Candidate::new("1.1.1.1:80", "static")).unwrap();

        let snapshot = registry.snapshot();
        registry.report_outcome("1.1.1.1:80", false);

        assert_eq!(snapshot[0].success_rate, 1.0);
        assert!(registry.get("1.1.1.1:80").unwrap().success_rate < 1.0);
    }

    #[test]
    fn test_ema_stays_within_bounds_for_random_sequences() {
        let mut rng = StdRng::seed_from_u64(0x5eed);

        for _ in 0..10_000 {
            let mut rate = 1.0;
            let len = rng.gen_range(1..64);
            for _ in 0..len {
                rate = ema_update(rate, rng.gen_bool(0.5));
                assert!((0.0..=1.0).contains(&rate), "rate escaped bounds: {}", rate);
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reports_match_sequential_replay() {
        let registry = Arc::new(registry());
        registry.upsert(&Candidate::new("1.1.1.1:80", "static")).unwrap();

        let mut rng = StdRng::seed_from_u64(42);
        let outcomes: Vec<bool> = (0..100).map(|_| rng.gen_bool(0.7)).collect();

        let tasks: Vec<_> = outcomes
            .iter()
            .map(|&success| {
                let registry = registry.clone();
                tokio::spawn(async move {
                    let effect = registry.report_outcome("1.1.1.1:80", success).unwrap();
                    (effect.sequence, success)
                })
            })
            .collect();

        let mut applied = Vec::with_capacity(tasks.len());
        for task in tasks {
            applied.push(task.await.unwrap());
        }
        applied.sort_by_key(|(sequence, _)| *sequence);

        let sequences: Vec<u64> = applied.iter().map(|(s, _)| *s).collect();
        assert_eq!(sequences, (1..=100).collect::<Vec<u64>>());

        let replayed = applied
            .iter()
            .fold(1.0, |rate, (_, success)| ema_update(rate, *success));
        let endpoint = registry.get("1.1.1.1:80").unwrap();
        assert_eq!(endpoint.success_rate, replayed);
        assert_eq!(endpoint.reports(), 100);
    }
}
