use crate::error::{PoolError, Result};
use crate::models::RotationPolicy;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// API server configuration
    pub api: ApiServerConfig,
    /// Initial rotation policy
    pub policy: RotationPolicy,
    /// Background loops
    pub runtime: RuntimeConfig,
    /// Candidate sources
    pub providers: ProvidersConfig,
    /// Logging configuration
    pub log: LogConfig,
}

#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// Port for the API server (default: 8001)
    pub port: u16,
    /// Host to bind to (default: 0.0.0.0)
    pub host: String,
    /// Allowed CORS origins (comma-separated, empty = localhost only)
    pub cors_origins: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Rotation scheduler period
    pub scheduler_tick: Duration,
    /// Concurrent rotations per tick
    pub rotation_workers: usize,
    /// Health round period, `None` when disabled
    pub health_check_interval: Option<Duration>,
    /// Concurrent probes per health round
    pub health_check_workers: usize,
    /// Target dialed through each endpoint by the probe
    pub probe_target_url: String,
    /// Provider refresh period
    pub provider_refresh_interval: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VendorProviderConfig {
    pub name: String,
    pub api_url: String,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ProvidersConfig {
    /// Addresses ingested by the `static` adapter
    pub static_proxies: Vec<String>,
    /// Vendor list API, if configured
    pub vendor: Option<VendorProviderConfig>,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let policy = RotationPolicy {
            interval_minutes: parse_env("ROTATION_INTERVAL_MINUTES", "60")?,
            min_success_rate: parse_env("MIN_SUCCESS_RATE", "0.8")?,
            auto_quarantine_threshold: parse_env("AUTO_QUARANTINE_THRESHOLD", "3")?,
            quarantine_cooldown_minutes: parse_env("QUARANTINE_COOLDOWN_MINUTES", "30")?,
            probe_timeout_secs: parse_env("PROBE_TIMEOUT_SECS", "5")?,
        };
        policy.validate()?;

        let health_secs: u64 = parse_env("HEALTH_CHECK_INTERVAL_SECS", "300")?;
        let scheduler_secs: u64 = parse_env("SCHEDULER_TICK_SECS", "60")?;
        let refresh_secs: u64 = parse_env("PROVIDER_REFRESH_INTERVAL_SECS", "900")?;

        Ok(Config {
            api: ApiServerConfig {
                port: get_env_or("POOL_API_PORT", "8001").parse().map_err(|_| {
                    PoolError::InvalidConfig("POOL_API_PORT must be a valid port number".into())
                })?,
                host: get_env_or("POOL_API_HOST", "0.0.0.0"),
                cors_origins: split_list(&get_env_or("CORS_ORIGINS", "")),
            },
            policy,
            runtime: RuntimeConfig {
                scheduler_tick: Duration::from_secs(scheduler_secs.max(1)),
                rotation_workers: parse_env::<usize>("ROTATION_WORKERS", "4")?.max(1),
                health_check_interval: (health_secs > 0).then(|| Duration::from_secs(health_secs)),
                health_check_workers: parse_env::<usize>("HEALTH_CHECK_WORKERS", "8")?.max(1),
                probe_target_url: get_env_or("PROBE_TARGET_URL", "https://api.ipify.org"),
                provider_refresh_interval: Duration::from_secs(refresh_secs.max(1)),
            },
            providers: ProvidersConfig {
                static_proxies: split_list(&get_env_or("STATIC_PROXIES", "")),
                vendor: parse_vendor_provider()?,
            },
            log: LogConfig {
                level: get_env_or("LOG_LEVEL", "info"),
                format: get_env_or("LOG_FORMAT", "json"),
            },
        })
    }

    /// Get the API server address
    pub fn api_addr(&self) -> String {
        format!("{}:{}", self.api.host, self.api.port)
    }
}

fn parse_vendor_provider() -> Result<Option<VendorProviderConfig>> {
    let api_url = get_env_or("PROVIDER_API_URL", "");
    let api_url = api_url.trim();
    if api_url.is_empty() {
        return Ok(None);
    }

    url::Url::parse(api_url).map_err(|e| {
        PoolError::InvalidConfig(format!("PROVIDER_API_URL must be a valid URL: {}", e))
    })?;

    let name = get_env_or("PROVIDER_NAME", "vendor").trim().to_string();
    let api_key = Some(get_env_or("PROVIDER_API_KEY", ""))
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty());

    Ok(Some(VendorProviderConfig {
        name,
        api_url: api_url.to_string(),
        api_key,
    }))
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_env<T: FromStr>(key: &str, default: &str) -> Result<T> {
    get_env_or(key, default)
        .trim()
        .parse()
        .map_err(|_| PoolError::InvalidConfig(format!("{} has an invalid value", key)))
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}
