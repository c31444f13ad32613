//! Metrics helpers: moving averages, health reports and resource sampling.

pub mod ema;
pub mod health;

pub use ema::Ema;
pub use health::{ComponentHealth, HealthStatus, ResourceSampler, ResourceUsage, SystemHealth};
