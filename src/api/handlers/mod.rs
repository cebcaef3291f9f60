//! API request handlers

pub mod health;
pub mod policy;
pub mod pool;
