//! Provider adapters
//!
//! An adapter turns some external source into a list of candidates. Adapters
//! never touch the registry: the manager ingests what they return and
//! isolates their failures from one another.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::transport::format_authority;
use crate::error::{PoolError, Result};
use crate::models::Candidate;

/// Origin label reserved for manually added endpoints
pub const CUSTOM_ORIGIN: &str = "custom";

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Unique name, used as the candidates' origin
    fn name(&self) -> &str;

    async fn fetch_candidates(&self) -> Result<Vec<Candidate>>;
}

/// Fixed list of addresses, usually from configuration
#[derive(Debug, Clone)]
pub struct StaticListProvider {
    name: String,
    entries: Vec<String>,
}

impl StaticListProvider {
    pub fn new(name: impl Into<String>, entries: Vec<String>) -> Self {
        Self {
            name: name.into(),
            entries,
        }
    }

    /// Split a comma or whitespace separated list, dropping empty items
    pub fn from_list(name: impl Into<String>, list: &str) -> Self {
        let entries = list
            .split(|c: char| c == ',' || c.is_whitespace())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        Self::new(name, entries)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl ProviderAdapter for StaticListProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_candidates(&self) -> Result<Vec<Candidate>> {
        Ok(self
            .entries
            .iter()
            .map(|address| Candidate::new(address.clone(), self.name.clone()))
            .collect())
    }
}

#[derive(Debug, Deserialize)]
struct VendorResponse {
    #[serde(default)]
    proxies: Vec<VendorProxy>,
}

#[derive(Debug, Deserialize)]
struct VendorProxy {
    ip: String,
    port: Option<u16>,
    country: Option<String>,
    city: Option<String>,
    username: Option<String>,
    password: Option<String>,
}

impl VendorProxy {
    fn into_candidate(self, origin: &str) -> Candidate {
        let address = match self.port {
            Some(port) => format_authority(&self.ip, port),
            None => self.ip,
        };

        let location = match (self.country, self.city) {
            (Some(country), Some(city)) => Some(format!("{} ({})", country, city)),
            (Some(country), None) => Some(country),
            (None, Some(city)) => Some(city),
            (None, None) => None,
        };

        let mut candidate = Candidate::new(address, origin);
        candidate.location = location;
        if let Some(username) = self.username {
            candidate = candidate.with_credentials(username, self.password.unwrap_or_default());
        }
        candidate
    }
}

/// Vendor HTTP API returning `{"proxies": [{"ip": ..., "country": ...}]}`,
/// authenticated with a bearer key
pub struct HttpApiProvider {
    name: String,
    url: String,
    api_key: Option<String>,
    http: reqwest::Client,
}

impl HttpApiProvider {
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let url = url.into();
        url::Url::parse(&url)?;

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PoolError::InvalidConfig(format!("HTTP client: {}", e)))?;

        Ok(Self {
            name: name.into(),
            url,
            api_key,
            http,
        })
    }

    fn unavailable(&self, reason: impl Into<String>) -> PoolError {
        PoolError::ProviderUnavailable {
            provider: self.name.clone(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl ProviderAdapter for HttpApiProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_candidates(&self) -> Result<Vec<Candidate>> {
        let mut request = self.http.get(&self.url);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| self.unavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(self.unavailable(format!("status {}", response.status())));
        }

        let body: VendorResponse = response
            .json()
            .await
            .map_err(|e| self.unavailable(format!("malformed response: {}", e)))?;

        debug!(provider = %self.name, count = body.proxies.len(), "Fetched vendor proxies");

        Ok(body
            .proxies
            .into_iter()
            .map(|p| p.into_candidate(&self.name))
            .collect())
    }
}
