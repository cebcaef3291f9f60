//! Endpoint selection policy
//!
//! A pure function over a registry snapshot: filter to eligible endpoints,
//! then prefer lowest measured latency, highest success rate and least
//! recent use, in that order.

use std::cmp::Ordering;
use std::collections::HashSet;

use crate::models::Endpoint;

/// Pick the best eligible endpoint from `snapshot`.
///
/// Returns `None` when nothing is eligible (pool exhaustion), which callers
/// are expected to handle as a normal outcome.
pub fn select<'a>(
    snapshot: &'a [Endpoint],
    exclude: &HashSet<&str>,
    min_success_rate: f64,
) -> Option<&'a Endpoint> {
    snapshot
        .iter()
        .filter(|e| e.is_eligible(min_success_rate) && !exclude.contains(e.address.as_str()))
        .min_by(|a, b| compare(a, b))
}

/// Total order used for selection. `Less` means "preferred".
pub fn compare(a: &Endpoint, b: &Endpoint) -> Ordering {
    latency_key(a)
        .cmp(&latency_key(b))
        .then_with(|| b.success_rate.total_cmp(&a.success_rate))
        .then_with(|| a.last_used_at.cmp(&b.last_used_at))
        .then_with(|| a.address.cmp(&b.address))
}

/// Unmeasured latency sorts after every measured value
fn latency_key(endpoint: &Endpoint) -> (bool, i64) {
    (!endpoint.is_measured(), endpoint.latency_ms)
}
