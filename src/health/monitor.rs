//! Health aggregation and bounded auto-recovery.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::config::HealthConfig;
use crate::error::Error;
use crate::health::probes::{DependencyProbe, ProbeResult};
use crate::pool::{ResourceProbe, ResourceSnapshot, WorkerPoolManager};
use crate::store::SqliteStore;

/// Aggregated health states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthState {
    Healthy,
    Warning,
    Unhealthy,
}

/// A deduplicated operator alert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub alert_type: String,
    pub subject: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Health derived from one worker class's metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHealth {
    pub class: String,
    pub state: HealthState,
    pub detail: String,
}

/// One global aggregation cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub at: DateTime<Utc>,
    pub state: HealthState,
    pub dependencies: Vec<ProbeResult>,
    pub workers: Vec<WorkerHealth>,
    pub resources: Option<ResourceSnapshot>,
}

struct MonitorState {
    consecutive_failures: u32,
    consecutive_successes: u32,
    dependency_failures: HashMap<String, u32>,
    last_dependency_results: Vec<ProbeResult>,
    last_alert_at: HashMap<(String, String), Instant>,
    alerts: Vec<Alert>,
    history: Vec<HealthReport>,
}

/// Probes dependencies, derives worker health from pool metrics, and takes
/// bounded recovery actions. Alerts are deduplicated by (type, subject)
/// under a cooldown.
pub struct HealthMonitor {
    probes: Vec<Arc<dyn DependencyProbe>>,
    pool: Arc<WorkerPoolManager>,
    store: Arc<SqliteStore>,
    resource_probe: Arc<dyn ResourceProbe>,
    config: HealthConfig,
    stop_on_fatal_dependency: bool,
    fatal: mpsc::Sender<Error>,
    state: Mutex<MonitorState>,
}

impl HealthMonitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        probes: Vec<Arc<dyn DependencyProbe>>,
        pool: Arc<WorkerPoolManager>,
        store: Arc<SqliteStore>,
        resource_probe: Arc<dyn ResourceProbe>,
        config: HealthConfig,
        stop_on_fatal_dependency: bool,
        fatal: mpsc::Sender<Error>,
    ) -> Self {
        Self {
            probes,
            pool,
            store,
            resource_probe,
            config,
            stop_on_fatal_dependency,
            fatal,
            state: Mutex::new(MonitorState {
                consecutive_failures: 0,
                consecutive_successes: 0,
                dependency_failures: HashMap::new(),
                last_dependency_results: Vec::new(),
                last_alert_at: HashMap::new(),
                alerts: Vec::new(),
                history: Vec::new(),
            }),
        }
    }

    /// Run the three probe timers until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut global = tokio::time::interval(Duration::from_millis(self.config.global_interval_ms));
        let mut worker = tokio::time::interval(Duration::from_millis(self.config.worker_interval_ms));
        let mut dependency =
            tokio::time::interval(Duration::from_millis(self.config.dependency_interval_ms));

        loop {
            tokio::select! {
                _ = global.tick() => { self.global_cycle().await; }
                _ = worker.tick() => { let _ = self.worker_cycle(); }
                _ = dependency.tick() => { self.dependency_cycle().await; }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// Probe every dependency with a timeout, invoking recovery actions and
    /// escalating to a fatal signal when a dependency stays down past the
    /// unhealthy threshold and the run is configured to stop.
    pub async fn dependency_cycle(&self) -> Vec<ProbeResult> {
        let timeout = Duration::from_millis(self.config.probe_timeout_ms);
        let mut results = Vec::with_capacity(self.probes.len());

        for probe in &self.probes {
            let result = match tokio::time::timeout(timeout, probe.probe()).await {
                Ok(result) => result,
                Err(_) => ProbeResult::unhealthy(
                    probe.name(),
                    format!("probe timed out after {}ms", timeout.as_millis()),
                    timeout.as_millis() as u64,
                ),
            };

            if result.healthy {
                if let Ok(mut state) = self.state.lock() {
                    state.dependency_failures.remove(&result.name);
                }
            } else {
                warn!(dependency = %result.name, detail = %result.detail, "dependency probe failed");
                let failures = {
                    let mut state = match self.state.lock() {
                        Ok(state) => state,
                        Err(_) => return results,
                    };
                    let entry = state
                        .dependency_failures
                        .entry(result.name.clone())
                        .or_insert(0);
                    *entry += 1;
                    *entry
                };

                if let Err(e) = probe.recover().await {
                    warn!(dependency = %result.name, error = %e, "recovery action failed");
                }
                self.alert("dependency", &result.name, &result.detail);

                if self.stop_on_fatal_dependency && failures >= self.config.unhealthy_threshold {
                    let _ = self
                        .fatal
                        .send(Error::dependency(&result.name, &result.detail))
                        .await;
                }
            }
            results.push(result);
        }

        if let Ok(mut state) = self.state.lock() {
            state.last_dependency_results = results.clone();
        }
        results
    }

    /// Derive per-class health from the pool snapshot.
    pub fn worker_cycle(&self) -> Vec<WorkerHealth> {
        let snapshot = self.pool.snapshot();
        let mut healths = Vec::with_capacity(snapshot.classes.len());

        for class in snapshot.classes {
            let (state, detail) = if class.circuit_open {
                (HealthState::Unhealthy, "circuit open".to_string())
            } else if class.error_rate > 0.2 {
                (
                    HealthState::Unhealthy,
                    format!("error rate {:.0}%", class.error_rate * 100.0),
                )
            } else if class.avg_response_ms > 120_000.0 {
                (
                    HealthState::Unhealthy,
                    format!("avg response {:.0}ms", class.avg_response_ms),
                )
            } else if class.utilization > 0.95 {
                (
                    HealthState::Warning,
                    format!("utilization {:.0}%", class.utilization * 100.0),
                )
            } else {
                (HealthState::Healthy, "ok".to_string())
            };

            if state == HealthState::Unhealthy {
                self.alert("worker", &class.name, &detail);
            }
            healths.push(WorkerHealth {
                class: class.name,
                state,
                detail,
            });
        }
        healths
    }

    /// Aggregate dependencies, workers, and a resource snapshot; run bounded
    /// recovery on sustained pressure.
    pub async fn global_cycle(&self) -> HealthReport {
        let workers = self.worker_cycle();
        let resources = self.resource_probe.snapshot();
        let dependencies = match self.state.lock() {
            Ok(state) => state.last_dependency_results.clone(),
            Err(_) => Vec::new(),
        };

        let dependency_unhealthy = dependencies.iter().any(|d| !d.healthy);
        let worker_unhealthy = workers.iter().any(|w| w.state == HealthState::Unhealthy);
        let worker_warning = workers.iter().any(|w| w.state == HealthState::Warning);
        let pressure = resources.map(|r| r.pressure()).unwrap_or(0.0);

        let state = if dependency_unhealthy || worker_unhealthy || pressure > 0.9 {
            HealthState::Unhealthy
        } else if worker_warning || pressure > 0.8 {
            HealthState::Warning
        } else {
            HealthState::Healthy
        };

        // Bounded recovery: shed load and compact the store under memory
        // pressure; shed load alone under CPU pressure.
        if let Some(snapshot) = resources {
            if snapshot.memory > 0.85 {
                if let Err(e) = self.store.checkpoint() {
                    warn!(error = %e, "checkpoint during memory recovery failed");
                }
                self.pool.scale_all(0.8);
                self.alert("resources", "memory", "memory pressure recovery applied");
            } else if snapshot.cpu > 0.85 {
                self.pool.scale_all(0.8);
                self.alert("resources", "cpu", "cpu pressure recovery applied");
            }
        }

        let report = HealthReport {
            at: Utc::now(),
            state,
            dependencies,
            workers,
            resources,
        };

        if let Ok(mut monitor_state) = self.state.lock() {
            match state {
                HealthState::Healthy => {
                    monitor_state.consecutive_failures = 0;
                    monitor_state.consecutive_successes += 1;
                    if monitor_state.consecutive_successes == self.config.recovery_threshold {
                        info!("health recovered");
                    }
                }
                HealthState::Warning => {
                    monitor_state.consecutive_successes = 0;
                }
                HealthState::Unhealthy => {
                    monitor_state.consecutive_successes = 0;
                    monitor_state.consecutive_failures += 1;
                    if monitor_state.consecutive_failures >= self.config.unhealthy_threshold {
                        drop(monitor_state);
                        self.alert("global", "pipeline", "sustained unhealthy state");
                        if let Ok(mut monitor_state) = self.state.lock() {
                            monitor_state.history.push(report.clone());
                        }
                        return report;
                    }
                }
            }
            monitor_state.history.push(report.clone());
        }
        report
    }

    /// Emit an alert unless the same (type, subject) fired within the
    /// cooldown.
    fn alert(&self, alert_type: &str, subject: &str, message: &str) {
        let cooldown = Duration::from_millis(self.config.alert_cooldown_ms);
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        let key = (alert_type.to_string(), subject.to_string());
        if let Some(last) = state.last_alert_at.get(&key) {
            if last.elapsed() < cooldown {
                return;
            }
        }
        state.last_alert_at.insert(key, Instant::now());
        warn!(alert_type, subject, message, "health alert");
        state.alerts.push(Alert {
            alert_type: alert_type.to_string(),
            subject: subject.to_string(),
            message: message.to_string(),
            at: Utc::now(),
        });
    }

    /// All alerts emitted so far.
    pub fn alerts(&self) -> Vec<Alert> {
        self.state
            .lock()
            .map(|s| s.alerts.clone())
            .unwrap_or_default()
    }

    /// Full health history for the run summary artifact.
    pub fn history(&self) -> Vec<HealthReport> {
        self.state
            .lock()
            .map(|s| s.history.clone())
            .unwrap_or_default()
    }
}
