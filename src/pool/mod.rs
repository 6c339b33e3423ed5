//! Admission control: per-class concurrency, rate limiting, circuit
//! breaking, and adaptive scaling.

mod circuit;
mod manager;
mod metrics;
mod rate;

pub use circuit::{CircuitBreaker, CircuitEvent, CircuitState};
pub use manager::{
    ClassSnapshot, PoolSnapshot, ProcResourceProbe, ResourceProbe, ResourceSnapshot, SlotGuard,
    WorkerPoolManager,
};
pub use metrics::ClassMetrics;
pub use rate::RateLimiter;
