use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{PoolError, Result};

/// Latency value for an endpoint that has never been probed
pub const UNMEASURED_LATENCY: i64 = -1;

/// Success rate given to every newly created endpoint
pub const INITIAL_SUCCESS_RATE: f64 = 1.0;

/// Weight kept from the previous rate on each outcome report
const EMA_DECAY: f64 = 0.9;

/// Contribution of a successful outcome
const EMA_SUCCESS_WEIGHT: f64 = 0.1;

/// Exponential moving average update used for `success_rate`.
///
/// `rate * 0.9 + (success ? 0.1 : 0.0)`. For inputs in `[0, 1]` the output
/// stays in `[0, 1]` without clamping.
pub fn ema_update(rate: f64, success: bool) -> f64 {
    rate * EMA_DECAY + if success { EMA_SUCCESS_WEIGHT } else { 0.0 }
}

/// Proxy protocol spoken by an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProxyScheme {
    #[default]
    Http,
    Socks5,
}

impl ProxyScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyScheme::Http => "http",
            ProxyScheme::Socks5 => "socks5",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "http" | "https" => Some(ProxyScheme::Http),
            "socks5" | "socks5h" => Some(ProxyScheme::Socks5),
            _ => None,
        }
    }

    fn default_port(&self) -> u16 {
        match self {
            ProxyScheme::Http => 80,
            ProxyScheme::Socks5 => 1080,
        }
    }
}

impl std::fmt::Display for ProxyScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Upstream proxy credentials. Only serialized inside an [`EndpointRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    #[serde(default)]
    pub password: String,
}

/// A proxy address split into its parts, with the registry key derived from it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedAddress {
    pub scheme: ProxyScheme,
    /// Host as it appears in a URL (IPv6 stays bracketed)
    pub host: String,
    pub port: u16,
    pub credentials: Option<Credentials>,
}

impl ParsedAddress {
    /// Parse `host:port`, `http://[user:pass@]host:port` or
    /// `socks5://[user:pass@]host:port`.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(PoolError::InvalidProxyAddress("address is empty".into()));
        }

        let with_scheme = if raw.contains("://") {
            raw.to_string()
        } else {
            format!("http://{}", raw)
        };

        let url = Url::parse(&with_scheme)
            .map_err(|e| PoolError::InvalidProxyAddress(format!("'{}': {}", raw, e)))?;

        let scheme = ProxyScheme::from_str(url.scheme())
            .ok_or_else(|| PoolError::UnsupportedProtocol(url.scheme().to_string()))?;

        if url.fragment().is_some() || url.query().is_some() {
            return Err(PoolError::InvalidProxyAddress(format!(
                "'{}': must not include query/fragment",
                raw
            )));
        }
        if !(url.path().is_empty() || url.path() == "/") {
            return Err(PoolError::InvalidProxyAddress(format!(
                "'{}': must not include a path",
                raw
            )));
        }

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| PoolError::InvalidProxyAddress(format!("'{}': missing host", raw)))?;

        let port = url.port().unwrap_or_else(|| scheme.default_port());

        let credentials = if url.username().is_empty() {
            None
        } else {
            Some(Credentials {
                username: url.username().to_string(),
                password: url.password().unwrap_or("").to_string(),
            })
        };

        Ok(Self {
            scheme,
            host: host.to_string(),
            port,
            credentials,
        })
    }

    /// Registry key: `host:port` for HTTP, `socks5://host:port` for SOCKS5
    pub fn key(&self) -> String {
        match self.scheme {
            ProxyScheme::Http => format!("{}:{}", self.host, self.port),
            ProxyScheme::Socks5 => format!("socks5://{}:{}", self.host, self.port),
        }
    }

    /// Host without IPv6 brackets, suitable for dialing
    pub fn dial_host(&self) -> &str {
        self.host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(&self.host)
    }
}

/// An endpoint offered by a provider adapter
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub address: String,
    pub origin: String,
    pub location: Option<String>,
    pub credentials: Option<Credentials>,
}

impl Candidate {
    pub fn new(address: impl Into<String>, origin: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            origin: origin.into(),
            location: None,
            credentials: None,
        }
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some(Credentials {
            username: username.into(),
            password: password.into(),
        });
        self
    }
}

/// A proxy endpoint and its health statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    /// Registry key
    pub address: String,
    /// Provider that supplied it ("custom" for manual adds)
    pub origin: String,
    pub scheme: ProxyScheme,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing, default)]
    pub credentials: Option<Credentials>,
    /// Last measured round trip, `-1` if never measured
    pub latency_ms: i64,
    pub success_rate: f64,
    /// Epoch zero if never assigned
    pub last_used_at: DateTime<Utc>,
    pub quarantined: bool,
    pub quarantined_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub successes: u64,
    pub failures: u64,
    pub last_probe_ok: Option<bool>,
    pub generation: u64,
    pub created_at: DateTime<Utc>,
    pub refreshed_at: DateTime<Utc>,
}

impl Endpoint {
    pub(crate) fn new(
        parsed: ParsedAddress,
        candidate: &Candidate,
        generation: u64,
        now: DateTime<Utc>,
    ) -> Self {
        let credentials = candidate.credentials.clone().or(parsed.credentials.clone());
        Self {
            address: parsed.key(),
            origin: candidate.origin.clone(),
            scheme: parsed.scheme,
            location: candidate.location.clone(),
            credentials,
            latency_ms: UNMEASURED_LATENCY,
            success_rate: INITIAL_SUCCESS_RATE,
            last_used_at: DateTime::<Utc>::UNIX_EPOCH,
            quarantined: false,
            quarantined_at: None,
            consecutive_failures: 0,
            successes: 0,
            failures: 0,
            last_probe_ok: None,
            generation,
            created_at: now,
            refreshed_at: now,
        }
    }

    /// Eligible for new selection under the given threshold
    pub fn is_eligible(&self, min_success_rate: f64) -> bool {
        !self.quarantined && self.success_rate >= min_success_rate
    }

    pub fn is_measured(&self) -> bool {
        self.latency_ms >= 0
    }

    pub fn is_never_used(&self) -> bool {
        self.last_used_at == DateTime::<Utc>::UNIX_EPOCH
    }

    /// Total outcome reports applied so far
    pub fn reports(&self) -> u64 {
        self.successes + self.failures
    }

    /// Dialing target for this endpoint
    pub fn parsed(&self) -> Result<ParsedAddress> {
        let mut parsed = ParsedAddress::parse(&self.address)?;
        parsed.credentials = self.credentials.clone();
        Ok(parsed)
    }

    /// Merge a re-ingested candidate: only origin and freshness metadata change
    pub(crate) fn refresh_from(&mut self, candidate: &Candidate, now: DateTime<Utc>) {
        self.origin = candidate.origin.clone();
        if candidate.location.is_some() {
            self.location = candidate.location.clone();
        }
        if candidate.credentials.is_some() {
            self.credentials = candidate.credentials.clone();
        }
        self.refreshed_at = now;
    }

    /// Apply one outcome through the EMA. Returns true when the failure
    /// streak reached `quarantine_threshold` and the endpoint was quarantined
    /// by this call.
    pub(crate) fn apply_outcome(
        &mut self,
        success: bool,
        quarantine_threshold: u32,
        now: DateTime<Utc>,
    ) -> bool {
        self.success_rate = ema_update(self.success_rate, success);

        if success {
            self.successes += 1;
            self.consecutive_failures = 0;
            return false;
        }

        self.failures += 1;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);

        if !self.quarantined
            && quarantine_threshold > 0
            && self.consecutive_failures >= quarantine_threshold
        {
            self.quarantined = true;
            self.quarantined_at = Some(now);
            return true;
        }

        false
    }

    /// Check an endpoint loaded from a snapshot and rewrite its address to
    /// the registry key
    pub(crate) fn normalized(mut self) -> Result<Self> {
        let parsed = ParsedAddress::parse(&self.address)?;

        if !(0.0..=1.0).contains(&self.success_rate) {
            return Err(PoolError::InvalidRequest(format!(
                "'{}': success rate {} outside [0, 1]",
                self.address, self.success_rate
            )));
        }
        if self.latency_ms < UNMEASURED_LATENCY {
            return Err(PoolError::InvalidRequest(format!(
                "'{}': latency {} below -1",
                self.address, self.latency_ms
            )));
        }
        if self.origin.trim().is_empty() {
            return Err(PoolError::InvalidRequest(format!(
                "'{}': empty origin",
                self.address
            )));
        }

        if self.credentials.is_none() {
            self.credentials = parsed.credentials.clone();
        }
        self.scheme = parsed.scheme;
        self.address = parsed.key();
        Ok(self)
    }

    pub(crate) fn set_quarantined(&mut self, quarantined: bool, now: DateTime<Utc>) {
        self.quarantined = quarantined;
        if quarantined {
            self.quarantined_at = Some(now);
        } else {
            self.quarantined_at = None;
            self.consecutive_failures = 0;
        }
    }
}

/// Export form of an endpoint that keeps its credentials, for snapshot
/// persistence. The plain [`Endpoint`] view redacts them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointRecord {
    #[serde(flatten)]
    pub endpoint: Endpoint,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credentials>,
}

impl From<Endpoint> for EndpointRecord {
    fn from(endpoint: Endpoint) -> Self {
        let credentials = endpoint.credentials.clone();
        Self {
            endpoint,
            credentials,
        }
    }
}

impl EndpointRecord {
    pub fn into_endpoint(self) -> Endpoint {
        let mut endpoint = self.endpoint;
        if self.credentials.is_some() {
            endpoint.credentials = self.credentials;
        }
        endpoint
    }
}
