//! Worker pool manager: slot admission, adaptive scaling, and
//! resource-pressure response.
//!
//! Admission order is fixed: hard ceiling, configured global cap, per-class
//! cap, rate limiter (with one short retry), circuit breaker. Workers never
//! self-scale; per-class concurrency targets move only in the scaler ticks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{
    CircuitBreakerConfig, ClassLimits, PipelineConfig, RateLimitConfig, HARD_CONCURRENCY_CEILING,
};
use crate::error::{Error, ErrorKind, Result};
use crate::pool::circuit::{CircuitBreaker, CircuitState};
use crate::pool::metrics::ClassMetrics;
use crate::pool::rate::RateLimiter;

/// Window over which error rate and latency are aggregated for scaling.
const SCALING_WINDOW: Duration = Duration::from_secs(60);

/// One CPU/memory sample, both as fractions in [0,1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub cpu: f64,
    pub memory: f64,
}

impl ResourceSnapshot {
    /// Combined pressure: CPU dominates.
    pub fn pressure(&self) -> f64 {
        0.7 * self.cpu + 0.3 * self.memory
    }
}

/// Source of system resource samples. Injected so tests stay hermetic.
pub trait ResourceProbe: Send + Sync {
    /// Sample CPU and memory; None when the platform offers no counters.
    fn snapshot(&self) -> Option<ResourceSnapshot>;
}

/// Resource probe backed by /proc. Reports None off Linux.
#[derive(Default)]
pub struct ProcResourceProbe {
    #[cfg_attr(not(target_os = "linux"), allow(dead_code))]
    prev_cpu: Mutex<Option<(u64, u64)>>,
}

impl ProcResourceProbe {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ResourceProbe for ProcResourceProbe {
    #[cfg(target_os = "linux")]
    fn snapshot(&self) -> Option<ResourceSnapshot> {
        let stat = std::fs::read_to_string("/proc/stat").ok()?;
        let first = stat.lines().next()?;
        let fields: Vec<u64> = first
            .split_whitespace()
            .skip(1)
            .filter_map(|v| v.parse().ok())
            .collect();
        if fields.len() < 5 {
            return None;
        }
        let total: u64 = fields.iter().sum();
        let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
        let busy = total.saturating_sub(idle);

        let cpu = {
            let mut prev = self.prev_cpu.lock().ok()?;
            let sample = match *prev {
                Some((prev_busy, prev_total)) => {
                    let dt = total.saturating_sub(prev_total);
                    if dt == 0 {
                        0.0
                    } else {
                        busy.saturating_sub(prev_busy) as f64 / dt as f64
                    }
                }
                None => 0.0,
            };
            *prev = Some((busy, total));
            sample
        };

        let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
        let mut total_kb = 0u64;
        let mut available_kb = 0u64;
        for line in meminfo.lines() {
            if let Some(rest) = line.strip_prefix("MemTotal:") {
                total_kb = rest.trim().split_whitespace().next()?.parse().ok()?;
            } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
                available_kb = rest.trim().split_whitespace().next()?.parse().ok()?;
            }
        }
        if total_kb == 0 {
            return None;
        }
        let memory = 1.0 - available_kb as f64 / total_kb as f64;

        Some(ResourceSnapshot {
            cpu: cpu.clamp(0.0, 1.0),
            memory: memory.clamp(0.0, 1.0),
        })
    }

    #[cfg(not(target_os = "linux"))]
    fn snapshot(&self) -> Option<ResourceSnapshot> {
        None
    }
}

#[derive(Debug)]
struct ClassState {
    name: String,
    /// Position in registration order; breaks priority ties.
    registration_index: usize,
    limits: ClassLimits,
    /// Current concurrency target; moved only by the scaler.
    concurrency: AtomicUsize,
    metrics: ClassMetrics,
    breaker: CircuitBreaker,
    limiter: Option<RateLimiter>,
}

impl ClassState {
    fn try_admit(&self) -> bool {
        let limit = self.concurrency.load(Ordering::Acquire);
        let mut current = self.metrics.active();
        loop {
            if current >= limit {
                return false;
            }
            // Cap check and increment must be one atomic step.
            match self.metrics.try_increment_active(current) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }
}

/// Point-in-time view of one class.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassSnapshot {
    pub name: String,
    pub active: usize,
    pub concurrency: usize,
    pub min: usize,
    pub max: usize,
    pub priority: u8,
    pub utilization: f64,
    pub error_rate: f64,
    pub avg_response_ms: f64,
    pub throttled: u64,
    pub circuit_open: bool,
}

/// Point-in-time view of the whole pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub global_active: usize,
    pub global_cap: usize,
    pub classes: Vec<ClassSnapshot>,
}

/// A held job slot. Dropping without an explicit release counts the job as
/// failed, which keeps accounting correct on every exit path.
#[derive(Debug)]
pub struct SlotGuard {
    class: Arc<ClassState>,
    global: Arc<AtomicUsize>,
    started: Instant,
    released: bool,
}

impl SlotGuard {
    /// Release the slot, recording the outcome and elapsed time.
    pub fn release(mut self, success: bool) {
        self.finish(success);
    }

    fn finish(&mut self, success: bool) {
        if self.released {
            return;
        }
        self.released = true;
        self.global.fetch_sub(1, Ordering::AcqRel);
        self.class
            .metrics
            .record_release(success, self.started.elapsed());
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.finish(false);
    }
}

/// Global and per-class concurrency control with adaptive scaling.
pub struct WorkerPoolManager {
    global_cap: usize,
    high_performance: bool,
    global_active: Arc<AtomicUsize>,
    breaker_config: CircuitBreakerConfig,
    registration_counter: AtomicUsize,
    classes: RwLock<HashMap<String, Arc<ClassState>>>,
}

impl WorkerPoolManager {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            global_cap: config.effective_global_cap(),
            high_performance: config.run.high_performance,
            global_active: Arc::new(AtomicUsize::new(0)),
            breaker_config: config.circuit_breaker,
            registration_counter: AtomicUsize::new(0),
            classes: RwLock::new(HashMap::new()),
        }
    }

    /// Register a worker class. Target concurrency starts at `min`.
    pub fn register_class(
        &self,
        name: &str,
        limits: ClassLimits,
        rate: Option<RateLimitConfig>,
    ) {
        let registration_index = self.registration_counter.fetch_add(1, Ordering::Relaxed);
        let state = Arc::new(ClassState {
            name: name.to_string(),
            registration_index,
            limits,
            concurrency: AtomicUsize::new(limits.min),
            metrics: ClassMetrics::new(),
            breaker: CircuitBreaker::new(name, self.breaker_config),
            limiter: rate.map(RateLimiter::new),
        });
        if let Ok(mut classes) = self.classes.write() {
            classes.insert(name.to_string(), state);
        }
    }

    fn class(&self, name: &str) -> Result<Arc<ClassState>> {
        self.classes
            .read()
            .map_err(|e| Error::Internal(format!("class table poisoned: {e}")))?
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Internal(format!("unregistered worker class {name}")))
    }

    /// Current global in-flight count.
    pub fn global_active(&self) -> usize {
        self.global_active.load(Ordering::Acquire)
    }

    /// The circuit breaker state for a class; Open when unregistered.
    pub fn circuit_state(&self, class: &str) -> CircuitState {
        self.class(class)
            .map(|c| c.breaker.state())
            .unwrap_or(CircuitState::Open)
    }

    /// Request a job slot for a class.
    ///
    /// Checks, in order: hard ceiling, configured global cap, per-class cap,
    /// rate limiter (with a single 100 ms retry), circuit breaker. The first
    /// rejection increments the class's throttle counter and returns a typed
    /// error.
    pub async fn request_slot(&self, class_name: &str) -> Result<SlotGuard> {
        let class = self.class(class_name)?;

        let global = self.global_active.fetch_add(1, Ordering::AcqRel) + 1;
        if global > HARD_CONCURRENCY_CEILING || global > self.global_cap {
            self.global_active.fetch_sub(1, Ordering::AcqRel);
            class.metrics.record_throttle();
            return Err(Error::throttled(class_name));
        }

        if !class.try_admit() {
            self.global_active.fetch_sub(1, Ordering::AcqRel);
            class.metrics.record_throttle();
            return Err(Error::throttled(class_name));
        }

        // Rate limit after the slot accounting so a rollback path exists.
        if let Some(limiter) = &class.limiter {
            if !limiter.consume() {
                tokio::time::sleep(Duration::from_millis(100)).await;
                if !limiter.consume() {
                    self.rollback_admission(&class);
                    class.metrics.record_throttle();
                    return Err(Error::rate_limited(class_name));
                }
            }
        }

        if let Err(e) = class.breaker.check() {
            self.rollback_admission(&class);
            class.metrics.record_throttle();
            return Err(e);
        }

        Ok(SlotGuard {
            class,
            global: Arc::clone(&self.global_active),
            started: Instant::now(),
            released: false,
        })
    }

    fn rollback_admission(&self, class: &ClassState) {
        self.global_active.fetch_sub(1, Ordering::AcqRel);
        class.metrics.decrement_active();
    }

    /// Run an operation under full management: slot admission, circuit
    /// breaker accounting, timeout, and guaranteed slot release on every
    /// exit path.
    pub async fn execute_with_management<T, F>(
        &self,
        class_name: &str,
        timeout: Duration,
        op: F,
    ) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        let slot = self.request_slot(class_name).await?;
        let class = Arc::clone(&slot.class);

        let result = match tokio::time::timeout(timeout, op).await {
            Ok(inner) => inner,
            Err(_) => Err(Error::timeout(timeout.as_millis() as u64)),
        };

        match &result {
            Ok(_) => {
                class.breaker.record_success();
                slot.release(true);
            }
            Err(e) => {
                // Domain and integrity failures are the work's fault, not
                // the dependency's; they do not trip the breaker.
                if matches!(e.kind(), ErrorKind::Transient | ErrorKind::Fatal) {
                    class.breaker.record_failure();
                }
                slot.release(false);
            }
        }
        result
    }

    /// One adaptive scaling pass over all classes.
    ///
    /// Scale up on high utilization with healthy error/latency numbers and
    /// global headroom; scale down on idleness, error spikes, or slow
    /// responses. Disabled entirely in high-performance mode.
    pub fn scaling_tick(&self) {
        if self.high_performance {
            return;
        }
        let classes = self.sorted_classes();

        for class in classes.iter() {
            let concurrency = class.concurrency.load(Ordering::Acquire);
            let active = class.metrics.active();
            let utilization = if concurrency == 0 {
                0.0
            } else {
                active as f64 / concurrency as f64
            };
            let error_rate = class.metrics.error_rate(SCALING_WINDOW);
            let avg_ms = class.metrics.avg_response_ms(SCALING_WINDOW);

            if utilization > 0.8
                && error_rate < 0.05
                && avg_ms < 30_000.0
                && self.total_target() < self.global_cap
            {
                let target = ((concurrency as f64 * 1.2).ceil() as usize)
                    .clamp(class.limits.min, class.limits.max);
                if target > concurrency {
                    class.concurrency.store(target, Ordering::Release);
                    debug!(class = %class.name, from = concurrency, to = target, "scaled up");
                }
            } else if utilization < 0.2 || error_rate > 0.2 || avg_ms > 60_000.0 {
                let target = ((concurrency as f64 * 0.8).floor() as usize)
                    .clamp(class.limits.min, class.limits.max);
                if target < concurrency {
                    class.concurrency.store(target, Ordering::Release);
                    debug!(class = %class.name, from = concurrency, to = target, "scaled down");
                }
            }
        }
    }

    /// React to a system resource sample.
    pub fn resource_tick(&self, snapshot: Option<ResourceSnapshot>) {
        if self.high_performance {
            return;
        }
        let Some(snapshot) = snapshot else {
            return;
        };
        let pressure = snapshot.pressure();

        if pressure > 0.8 {
            warn!(pressure, "resource pressure high, shrinking all classes");
            self.scale_all(0.8);
        } else if pressure < 0.3 {
            // Grow the most important classes first, while headroom lasts.
            for class in self.sorted_classes() {
                if self.total_target() >= self.global_cap {
                    break;
                }
                let concurrency = class.concurrency.load(Ordering::Acquire);
                let target = ((concurrency as f64 * 1.2).ceil() as usize)
                    .clamp(class.limits.min, class.limits.max);
                if target > concurrency {
                    class.concurrency.store(target, Ordering::Release);
                }
            }
        }
    }

    /// Proportional shrink of every class; used by pressure response and
    /// health auto-recovery.
    pub fn scale_all(&self, factor: f64) {
        for class in self.sorted_classes() {
            let concurrency = class.concurrency.load(Ordering::Acquire);
            let target = ((concurrency as f64 * factor).floor() as usize)
                .clamp(class.limits.min, class.limits.max);
            if target != concurrency {
                class.concurrency.store(target, Ordering::Release);
                info!(class = %class.name, from = concurrency, to = target, "concurrency adjusted");
            }
        }
    }

    /// Sum of current per-class targets.
    fn total_target(&self) -> usize {
        self.classes
            .read()
            .map(|classes| {
                classes
                    .values()
                    .map(|c| c.concurrency.load(Ordering::Acquire))
                    .sum()
            })
            .unwrap_or(0)
    }

    /// Classes ordered by priority (highest first), ties broken by
    /// registration order.
    fn sorted_classes(&self) -> Vec<Arc<ClassState>> {
        let Ok(classes) = self.classes.read() else {
            return Vec::new();
        };
        let mut sorted: Vec<Arc<ClassState>> = classes.values().cloned().collect();
        sorted.sort_by(|a, b| {
            b.limits
                .priority
                .cmp(&a.limits.priority)
                .then_with(|| a.registration_index.cmp(&b.registration_index))
        });
        sorted
    }

    /// Point-in-time view of the pool for health derivation and summaries.
    pub fn snapshot(&self) -> PoolSnapshot {
        let classes = self
            .sorted_classes()
            .iter()
            .map(|class| {
                let concurrency = class.concurrency.load(Ordering::Acquire);
                let active = class.metrics.active();
                ClassSnapshot {
                    name: class.name.clone(),
                    active,
                    concurrency,
                    min: class.limits.min,
                    max: class.limits.max,
                    priority: class.limits.priority,
                    utilization: if concurrency == 0 {
                        0.0
                    } else {
                        active as f64 / concurrency as f64
                    },
                    error_rate: class.metrics.error_rate(SCALING_WINDOW),
                    avg_response_ms: class.metrics.avg_response_ms(SCALING_WINDOW),
                    throttled: class.metrics.throttled(),
                    circuit_open: class.breaker.state() == CircuitState::Open,
                }
            })
            .collect();

        PoolSnapshot {
            global_active: self.global_active(),
            global_cap: self.global_cap,
            classes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueueName;

    fn manager_with(global: usize, class_max: usize) -> WorkerPoolManager {
        let mut config = PipelineConfig::default();
        config.max_global_concurrency = global;
        let manager = WorkerPoolManager::new(&config);
        manager.register_class(
            QueueName::FileAnalysis.as_str(),
            ClassLimits {
                min: class_max,
                max: class_max,
                priority: 5,
            },
            None,
        );
        manager
    }

    #[tokio::test]
    async fn per_class_cap_is_enforced() {
        let manager = manager_with(100, 2);
        let a = manager.request_slot("file-analysis").await.unwrap();
        let b = manager.request_slot("file-analysis").await.unwrap();
        let err = manager.request_slot("file-analysis").await.unwrap_err();
        assert!(matches!(err, Error::Throttled { .. }));

        a.release(true);
        b.release(true);
        assert_eq!(manager.global_active(), 0);
    }

    #[tokio::test]
    async fn global_cap_is_enforced_across_classes() {
        let mut config = PipelineConfig::default();
        config.max_global_concurrency = 1;
        let manager = WorkerPoolManager::new(&config);
        manager.register_class(
            "file-analysis",
            ClassLimits { min: 4, max: 4, priority: 5 },
            None,
        );
        manager.register_class(
            "validation",
            ClassLimits { min: 4, max: 4, priority: 5 },
            None,
        );

        let _held = manager.request_slot("file-analysis").await.unwrap();
        let err = manager.request_slot("validation").await.unwrap_err();
        assert!(matches!(err, Error::Throttled { .. }));
    }

    #[tokio::test]
    async fn execute_releases_slot_on_failure() {
        let manager = manager_with(100, 1);
        let result: Result<()> = manager
            .execute_with_management("file-analysis", Duration::from_secs(1), async {
                Err(Error::Llm("boom".into()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(manager.global_active(), 0);

        // Slot is free again.
        let slot = manager.request_slot("file-analysis").await.unwrap();
        slot.release(true);
    }

    #[tokio::test]
    async fn execute_times_out_and_frees_slot() {
        let manager = manager_with(100, 1);
        let result: Result<()> = manager
            .execute_with_management("file-analysis", Duration::from_millis(20), async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(Error::Timeout { .. })));
        assert_eq!(manager.global_active(), 0);
    }

    #[tokio::test]
    async fn repeated_failures_open_the_circuit_and_fail_fast() {
        let mut config = PipelineConfig::default();
        config.circuit_breaker.failure_threshold = 3;
        let manager = WorkerPoolManager::new(&config);
        manager.register_class(
            "file-analysis",
            ClassLimits { min: 4, max: 4, priority: 5 },
            None,
        );

        for _ in 0..3 {
            let _: Result<()> = manager
                .execute_with_management("file-analysis", Duration::from_secs(1), async {
                    Err(Error::Llm("provider down".into()))
                })
                .await;
        }
        assert_eq!(manager.circuit_state("file-analysis"), CircuitState::Open);

        let before = manager.snapshot().classes[0].throttled;
        let err = manager.request_slot("file-analysis").await.unwrap_err();
        assert!(matches!(err, Error::CircuitOpen { .. }));
        let after = manager.snapshot().classes[0].throttled;
        assert_eq!(after, before + 1);
    }

    #[tokio::test]
    async fn domain_errors_do_not_trip_the_breaker() {
        let mut config = PipelineConfig::default();
        config.circuit_breaker.failure_threshold = 2;
        let manager = WorkerPoolManager::new(&config);
        manager.register_class(
            "validation",
            ClassLimits { min: 4, max: 4, priority: 5 },
            None,
        );

        for _ in 0..5 {
            let _: Result<()> = manager
                .execute_with_management("validation", Duration::from_secs(1), async {
                    Err(Error::MalformedPayload("bad".into()))
                })
                .await;
        }
        assert_eq!(manager.circuit_state("validation"), CircuitState::Closed);
    }

    #[tokio::test]
    async fn dropped_guard_still_releases_accounting() {
        let manager = manager_with(100, 1);
        {
            let _slot = manager.request_slot("file-analysis").await.unwrap();
            // Dropped without release: simulates a panic unwinding path.
        }
        assert_eq!(manager.global_active(), 0);
    }

    #[test]
    fn scaling_respects_bounds_and_mode() {
        let mut config = PipelineConfig::default();
        config.run.high_performance = true;
        let manager = WorkerPoolManager::new(&config);
        manager.register_class(
            "file-analysis",
            ClassLimits { min: 2, max: 10, priority: 5 },
            None,
        );

        manager.scaling_tick();
        assert_eq!(manager.snapshot().classes[0].concurrency, 2);
    }

    #[test]
    fn equal_priority_ties_break_by_registration_order() {
        let mut config = PipelineConfig::default();
        // Headroom for exactly one growth step.
        config.max_global_concurrency = 3;
        let manager = WorkerPoolManager::new(&config);
        // "zeta" registers first but sorts after "alpha" alphabetically.
        manager.register_class(
            "zeta",
            ClassLimits { min: 1, max: 4, priority: 5 },
            None,
        );
        manager.register_class(
            "alpha",
            ClassLimits { min: 1, max: 4, priority: 5 },
            None,
        );

        manager.resource_tick(Some(ResourceSnapshot { cpu: 0.1, memory: 0.1 }));

        let snapshot = manager.snapshot();
        let concurrency_of = |name: &str| {
            snapshot
                .classes
                .iter()
                .find(|c| c.name == name)
                .map(|c| c.concurrency)
                .unwrap()
        };
        // The first-registered class consumed the headroom.
        assert_eq!(concurrency_of("zeta"), 2);
        assert_eq!(concurrency_of("alpha"), 1);
    }

    #[test]
    fn resource_pressure_shrinks_classes() {
        let config = PipelineConfig::default();
        let manager = WorkerPoolManager::new(&config);
        manager.register_class(
            "file-analysis",
            ClassLimits { min: 1, max: 10, priority: 5 },
            None,
        );
        // Grow first so a shrink is observable.
        manager.resource_tick(Some(ResourceSnapshot { cpu: 0.1, memory: 0.1 }));
        let grown = manager.snapshot().classes[0].concurrency;
        assert!(grown > 1);

        manager.resource_tick(Some(ResourceSnapshot { cpu: 1.0, memory: 0.9 }));
        let shrunk = manager.snapshot().classes[0].concurrency;
        assert!(shrunk < grown);
    }
}
