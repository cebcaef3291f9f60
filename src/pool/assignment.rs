//! Consumer to endpoint bindings
//!
//! Every read-modify-write on a consumer's binding runs under that
//! consumer's map entry, so a consumer never has more than one live binding
//! even when acquire and rotate race.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use tracing::{debug, info, warn};

use super::registry::{PolicyHandle, ProxyRegistry};
use super::selection;
use crate::error::{PoolError, Result};
use crate::models::{LeaseOutcome, ProxyLease};

#[derive(Debug, Clone)]
struct Binding {
    address: String,
    origin: String,
    generation: u64,
    assigned_at: DateTime<Utc>,
}

impl Binding {
    fn lease(&self, consumer_id: &str) -> ProxyLease {
        ProxyLease {
            consumer_id: consumer_id.to_string(),
            address: self.address.clone(),
            origin: self.origin.clone(),
            generation: self.generation,
            assigned_at: self.assigned_at,
        }
    }
}

/// Maps each active consumer to its current endpoint
pub struct AssignmentTable {
    bindings: DashMap<String, Binding>,
    /// Every consumer that ever acquired, to tell "released" from "never seen"
    seen: DashSet<String>,
    registry: Arc<ProxyRegistry>,
    policy: PolicyHandle,
}

impl AssignmentTable {
    pub fn new(registry: Arc<ProxyRegistry>, policy: PolicyHandle) -> Self {
        Self {
            bindings: DashMap::new(),
            seen: DashSet::new(),
            registry,
            policy,
        }
    }

    /// Select, stamp and build a binding, skipping `exclude`
    fn pick(&self, exclude: &HashSet<&str>, now: DateTime<Utc>) -> Option<Binding> {
        let snapshot = self.registry.snapshot();
        let min_success_rate = self.policy.load().min_success_rate;
        let endpoint = selection::select(&snapshot, exclude, min_success_rate)?;

        self.registry.mark_used(&endpoint.address, now);

        Some(Binding {
            address: endpoint.address.clone(),
            origin: endpoint.origin.clone(),
            generation: endpoint.generation,
            assigned_at: now,
        })
    }

    /// Return the consumer's binding if it is still healthy, otherwise bind a
    /// newly selected endpoint.
    ///
    /// On exhaustion an existing (unhealthy) binding is left in place.
    pub fn acquire(&self, consumer_id: &str) -> LeaseOutcome {
        self.seen.insert(consumer_id.to_string());
        let now = Utc::now();

        match self.bindings.entry(consumer_id.to_string()) {
            Entry::Occupied(mut entry) => {
                let min_success_rate = self.policy.load().min_success_rate;
                let current = self
                    .registry
                    .get(&entry.get().address)
                    .filter(|e| e.is_eligible(min_success_rate));
                if let Some(current) = current {
                    // Pick up quarantine cycles the binding survived
                    entry.get_mut().generation = current.generation;
                    return LeaseOutcome::Assigned(entry.get().lease(consumer_id));
                }

                debug!(
                    consumer_id = %consumer_id,
                    address = %entry.get().address,
                    "Current endpoint no longer healthy, reselecting"
                );

                match self.pick(&HashSet::new(), now) {
                    Some(binding) => {
                        let lease = binding.lease(consumer_id);
                        *entry.get_mut() = binding;
                        LeaseOutcome::Assigned(lease)
                    }
                    None => LeaseOutcome::Exhausted,
                }
            }
            Entry::Vacant(entry) => match self.pick(&HashSet::new(), now) {
                Some(binding) => {
                    let lease = binding.lease(consumer_id);
                    entry.insert(binding);
                    info!(consumer_id = %consumer_id, address = %lease.address, "Assigned endpoint");
                    LeaseOutcome::Assigned(lease)
                }
                None => LeaseOutcome::Exhausted,
            },
        }
    }

    /// Replace `binding` with a newly selected endpoint other than its current
    /// one. On exhaustion the binding is left as is.
    fn rotate_binding(&self, consumer_id: &str, binding: &mut Binding, now: DateTime<Utc>) -> LeaseOutcome {
        let previous = binding.address.clone();
        let exclude: HashSet<&str> = [previous.as_str()].into_iter().collect();

        match self.pick(&exclude, now) {
            Some(next) => {
                let lease = next.lease(consumer_id);
                *binding = next;
                info!(
                    consumer_id = %consumer_id,
                    from = %previous,
                    to = %lease.address,
                    "Rotated endpoint"
                );
                LeaseOutcome::Assigned(lease)
            }
            None => {
                warn!(
                    consumer_id = %consumer_id,
                    address = %previous,
                    "No alternative endpoint, keeping current assignment"
                );
                LeaseOutcome::Exhausted
            }
        }
    }

    /// Rebind the consumer to a newly selected endpoint other than its current one.
    ///
    /// Fails with `UnknownConsumer` only for a consumer that never acquired.
    /// A released consumer is bound afresh. On exhaustion the current
    /// binding is kept.
    pub fn force_rotate(&self, consumer_id: &str) -> Result<LeaseOutcome> {
        if !self.seen.contains(consumer_id) {
            return Err(PoolError::UnknownConsumer(consumer_id.to_string()));
        }
        let now = Utc::now();

        match self.bindings.entry(consumer_id.to_string()) {
            Entry::Occupied(mut entry) => Ok(self.rotate_binding(consumer_id, entry.get_mut(), now)),
            Entry::Vacant(entry) => match self.pick(&HashSet::new(), now) {
                Some(binding) => {
                    let lease = binding.lease(consumer_id);
                    entry.insert(binding);
                    Ok(LeaseOutcome::Assigned(lease))
                }
                None => Ok(LeaseOutcome::Exhausted),
            },
        }
    }

    /// Rotate the consumer only if it still holds a binding.
    ///
    /// Returns `None` for a consumer without one, such as a consumer released
    /// after a scheduler tick picked it.
    pub fn rotate_existing(&self, consumer_id: &str) -> Option<LeaseOutcome> {
        let now = Utc::now();
        let mut binding = self.bindings.get_mut(consumer_id)?;
        Some(self.rotate_binding(consumer_id, binding.value_mut(), now))
    }

    /// Drop the consumer's binding. The endpoint's registry state is untouched.
    ///
    /// Releasing an already released consumer is a no-op returning `None`.
    pub fn release(&self, consumer_id: &str) -> Result<Option<ProxyLease>> {
        if let Some((_, binding)) = self.bindings.remove(consumer_id) {
            debug!(consumer_id = %consumer_id, address = %binding.address, "Released endpoint");
            return Ok(Some(binding.lease(consumer_id)));
        }

        if self.seen.contains(consumer_id) {
            Ok(None)
        } else {
            Err(PoolError::UnknownConsumer(consumer_id.to_string()))
        }
    }

    /// Forget a consumer entirely
    pub fn remove_consumer(&self, consumer_id: &str) -> bool {
        let had_binding = self.bindings.remove(consumer_id).is_some();
        let was_seen = self.seen.remove(consumer_id).is_some();
        had_binding || was_seen
    }

    pub fn lease(&self, consumer_id: &str) -> Option<ProxyLease> {
        self.bindings.get(consumer_id).map(|b| b.lease(consumer_id))
    }

    pub fn current_address(&self, consumer_id: &str) -> Option<String> {
        self.bindings.get(consumer_id).map(|b| b.address.clone())
    }

    /// Whether the lease is still the consumer's binding and its endpoint has
    /// not been quarantined or replaced since
    pub fn is_current(&self, lease: &ProxyLease) -> bool {
        let bound = self
            .bindings
            .get(&lease.consumer_id)
            .map(|b| b.address == lease.address && b.generation == lease.generation)
            .unwrap_or(false);

        bound
            && self
                .registry
                .get(&lease.address)
                .map(|e| !e.quarantined && e.generation == lease.generation)
                .unwrap_or(false)
    }

    /// Consumers whose binding is at least `interval` old at `now`
    pub fn due_for_rotation(&self, now: DateTime<Utc>, interval: chrono::Duration) -> Vec<String> {
        self.bindings
            .iter()
            .filter(|b| now - b.assigned_at >= interval)
            .map(|b| b.key().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Drop every binding. Consumers stay known.
    pub fn clear(&self) -> usize {
        let removed = self.bindings.len();
        self.bindings.clear();
        removed
    }
}
