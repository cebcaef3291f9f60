use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{PoolError, Result};

/// An endpoint handed to a consumer
///
/// `generation` is the endpoint's generation at bind time. It changes when
/// the endpoint is quarantined or released from quarantine, so a consumer
/// holding an old lease can detect that it went stale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyLease {
    pub consumer_id: String,
    pub address: String,
    pub origin: String,
    pub generation: u64,
    pub assigned_at: DateTime<Utc>,
}

/// Result of an acquire or rotate request
///
/// Exhaustion is an expected outcome, not an error.
#[derive(Debug, Clone, PartialEq)]
pub enum LeaseOutcome {
    Assigned(ProxyLease),
    Exhausted,
}

impl LeaseOutcome {
    pub fn lease(&self) -> Option<&ProxyLease> {
        match self {
            LeaseOutcome::Assigned(lease) => Some(lease),
            LeaseOutcome::Exhausted => None,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, LeaseOutcome::Exhausted)
    }

    /// Convert into a `Result` for callers that surface exhaustion as `PoolExhausted`
    pub fn into_result(self) -> Result<ProxyLease> {
        match self {
            LeaseOutcome::Assigned(lease) => Ok(lease),
            LeaseOutcome::Exhausted => Err(PoolError::PoolExhausted),
        }
    }
}
