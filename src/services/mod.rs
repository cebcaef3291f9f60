//! Background services

pub mod provider_refresh;

pub use provider_refresh::{ProviderRefreshConfig, ProviderRefreshHandle, ProviderRefreshService};
