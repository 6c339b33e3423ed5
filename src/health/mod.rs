//! Dependency probing, worker health derivation, and bounded auto-recovery.

mod monitor;
mod probes;

pub use monitor::{Alert, HealthMonitor, HealthReport, HealthState, WorkerHealth};
pub use probes::{BrokerProbe, DependencyProbe, ProbeResult, SinkProbe, StoreProbe};
