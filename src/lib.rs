//! Rota Pool - proxy pool manager
//!
//! Keeps a pool of upstream proxy endpoints, learns their health from probes
//! and consumer reports, and hands each consumer a stable endpoint that is
//! rotated on a schedule.
//!
//! ## Features
//!
//! - Selection by measured latency, success rate and least recent use
//! - Automatic quarantine after consecutive failures, with cooldown recovery
//! - HTTP CONNECT and SOCKS5 health probes
//! - Static and vendor API provider adapters
//! - Hot-reloadable rotation policy and a REST management surface

pub mod api;
pub mod config;
pub mod error;
pub mod models;
pub mod pool;
pub mod services;

pub use config::Config;
pub use error::{PoolError, Result};
pub use pool::PoolManager;
