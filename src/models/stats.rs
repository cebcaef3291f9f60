use serde::Serialize;

/// Pool summary consumed by dashboards
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub total: usize,
    pub healthy: usize,
    pub quarantined: usize,
    pub assigned: usize,
    pub scheduler_running: bool,
}

/// Result of ingesting one adapter's candidates
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "status")]
pub enum ProviderRefresh {
    Ok {
        provider: String,
        inserted: usize,
        refreshed: usize,
        rejected: usize,
    },
    Failed {
        provider: String,
        error: String,
    },
}

impl ProviderRefresh {
    pub fn provider(&self) -> &str {
        match self {
            ProviderRefresh::Ok { provider, .. } | ProviderRefresh::Failed { provider, .. } => {
                provider
            }
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, ProviderRefresh::Ok { .. })
    }
}

/// Result of a full `refresh_from_providers` pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
pub struct RefreshReport {
    pub providers: Vec<ProviderRefresh>,
}

impl RefreshReport {
    pub fn failed_count(&self) -> usize {
        self.providers.iter().filter(|p| !p.is_ok()).count()
    }

    pub fn inserted_count(&self) -> usize {
        self.providers
            .iter()
            .map(|p| match p {
                ProviderRefresh::Ok { inserted, .. } => *inserted,
                ProviderRefresh::Failed { .. } => 0,
            })
            .sum()
    }
}

/// Result of one rotation scheduler tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub struct RotationReport {
    pub rotated: usize,
    pub exhausted: usize,
    /// Consumers released between being claimed and their rotation running
    pub skipped: usize,
}

/// Result of restoring a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub struct RestoreReport {
    pub restored: usize,
    pub rejected: usize,
}

/// Result of one health check round
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub struct HealthReport {
    pub healthy: usize,
    pub unhealthy: usize,
    pub recovered: usize,
}
