//! Proxy pool core
//!
//! - `registry`: endpoints and their health statistics
//! - `selection`: pure choice of the best eligible endpoint
//! - `assignment`: consumer to endpoint bindings
//! - `scheduler`: time-based rotation
//! - `health` / `transport`: probing endpoints by tunnelling through them
//! - `provider`: sources of candidates
//! - `manager`: the facade tying these together

pub mod assignment;
pub mod health;
pub mod manager;
pub mod provider;
pub mod registry;
pub mod scheduler;
pub mod selection;
pub mod transport;

pub use assignment::AssignmentTable;
pub use health::{HealthChecker, HealthCheckerConfig, HealthCheckerHandle, HealthProbe, ProbeResult, TcpProbe};
pub use manager::{PoolManager, PoolOptions};
pub use provider::{HttpApiProvider, ProviderAdapter, StaticListProvider, CUSTOM_ORIGIN};
pub use registry::{PolicyHandle, ProxyRegistry};
pub use scheduler::{RotationScheduler, SchedulerConfig};
