//! Pipeline configuration.
//!
//! Every knob the orchestration substrate exposes lives here, with defaults
//! matching production behavior. `PipelineConfig::validate` is called once at
//! pipeline construction; violations are configuration errors and halt the
//! run before any work is admitted.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::queue::QueueName;

/// Hard ceiling on global in-flight work. Enforced regardless of configuration.
pub const HARD_CONCURRENCY_CEILING: usize = 150;

/// Scaling bounds and priority for one worker class.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ClassLimits {
    /// Lower bound on target concurrency.
    pub min: usize,
    /// Upper bound on target concurrency.
    pub max: usize,
    /// Higher-priority classes scale up first and shrink last.
    pub priority: u8,
}

impl Default for ClassLimits {
    fn default() -> Self {
        Self {
            min: 1,
            max: 8,
            priority: 5,
        }
    }
}

/// Token-bucket parameters for one worker class.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Refill amount per window.
    pub requests: f64,
    /// Refill window in milliseconds.
    pub window_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests: 60.0,
            window_ms: 60_000,
        }
    }
}

/// Circuit breaker state machine parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Failures within the rolling window before the circuit opens.
    pub failure_threshold: u32,
    /// Time spent OPEN before permitting a half-open probe.
    pub reset_timeout_ms: u64,
    /// Rolling window over which failures are counted.
    pub window_ms: u64,
    /// Multiplier applied to the reset timeout on a failed probe.
    pub backoff_multiplier: f64,
    /// Cap on the backed-off reset timeout.
    pub max_reset_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_ms: 30_000,
            window_ms: 60_000,
            backoff_multiplier: 2.0,
            max_reset_timeout_ms: 300_000,
        }
    }
}

/// Retry policy for queue jobs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Delivery attempts before a job is dead-lettered.
    pub max_attempts: u32,
    /// Base delay used for exponential backoff.
    pub base_delay_ms: u64,
    /// Backoff multiplier applied per attempt.
    pub backoff_factor: f64,
    /// Jitter fraction applied symmetrically around the computed delay.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 2_000,
            backoff_factor: 2.0,
            jitter: 0.2,
        }
    }
}

/// Outbox publishing cadence.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OutboxConfig {
    /// Events reserved per tick.
    pub batch_size: usize,
    /// Stale reservations older than this are reclaimable.
    pub reservation_timeout_ms: u64,
    /// Publish attempts before an event is marked FAILED.
    pub max_attempts: u32,
    /// Sleep between publisher ticks.
    pub poll_interval_ms: u64,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            reservation_timeout_ms: 60_000,
            max_attempts: 5,
            poll_interval_ms: 100,
        }
    }
}

/// Triangulation decision thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriangulationConfig {
    /// Weighted consensus at or above this accepts the relationship.
    pub accept_threshold: f64,
    /// Weighted consensus at or below this rejects it.
    pub reject_threshold: f64,
    /// Max-minus-min vote spread above this flags a conflict.
    pub conflict_threshold: f64,
    /// Re-escalations permitted before a forced REJECT.
    pub max_escalations: u32,
    /// Per-subagent timeout.
    pub subagent_timeout_ms: u64,
    /// Consensus weight per agent type; unlisted types weigh 1.0.
    pub agent_weights: HashMap<String, f64>,
    /// Agent types spawned per session. Must name at least two.
    pub agent_types: Vec<String>,
}

impl Default for TriangulationConfig {
    fn default() -> Self {
        let mut agent_weights = HashMap::new();
        agent_weights.insert("syntactic".to_string(), 1.0);
        agent_weights.insert("semantic".to_string(), 1.2);
        agent_weights.insert("contextual".to_string(), 0.8);
        Self {
            accept_threshold: 0.65,
            reject_threshold: 0.35,
            conflict_threshold: 0.4,
            max_escalations: 1,
            subagent_timeout_ms: 30_000,
            agent_weights,
            agent_types: vec![
                "syntactic".to_string(),
                "semantic".to_string(),
                "contextual".to_string(),
            ],
        }
    }
}

/// Factor weights for the confidence scorer. Must sum to 1.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ConfidenceWeights {
    pub syntax: f64,
    pub semantic: f64,
    pub context: f64,
    pub cross_ref: f64,
}

impl ConfidenceWeights {
    pub fn sum(&self) -> f64 {
        self.syntax + self.semantic + self.context + self.cross_ref
    }
}

impl Default for ConfidenceWeights {
    fn default() -> Self {
        Self {
            syntax: 0.3,
            semantic: 0.3,
            context: 0.2,
            cross_ref: 0.2,
        }
    }
}

/// Confidence scorer parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ConfidenceConfig {
    /// Factor weights.
    pub weights: ConfidenceWeights,
    /// Final scores below this escalate to triangulation.
    pub escalation_threshold: f64,
    /// Exponent of the evidence-count uncertainty discount.
    pub alpha: f64,
}

impl Default for ConfidenceConfig {
    fn default() -> Self {
        Self {
            weights: ConfidenceWeights::default(),
            escalation_threshold: 0.5,
            alpha: 1.0,
        }
    }
}

/// Health monitoring cadence and thresholds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Global aggregation interval.
    pub global_interval_ms: u64,
    /// Worker-health derivation interval.
    pub worker_interval_ms: u64,
    /// Dependency probe interval.
    pub dependency_interval_ms: u64,
    /// Per-probe timeout.
    pub probe_timeout_ms: u64,
    /// Consecutive failed global cycles before an alert.
    pub unhealthy_threshold: u32,
    /// Consecutive healthy cycles before recovery is declared.
    pub recovery_threshold: u32,
    /// Minimum spacing between duplicate alerts.
    pub alert_cooldown_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            global_interval_ms: 30_000,
            worker_interval_ms: 60_000,
            dependency_interval_ms: 120_000,
            probe_timeout_ms: 10_000,
            unhealthy_threshold: 3,
            recovery_threshold: 2,
            alert_cooldown_ms: 300_000,
        }
    }
}

/// Producer-pause watermarks for one queue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BackpressureConfig {
    /// Depth at which producers must pause.
    pub high: usize,
    /// Depth below which producers resume.
    pub low: usize,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            high: 1_000,
            low: 200,
        }
    }
}

/// Relational store bootstrap options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Database file path; None opens an in-memory store.
    pub path: Option<PathBuf>,
    /// Write-ahead logging. Leave on outside of tests.
    pub wal_enabled: bool,
}

/// Run-level behavior switches.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RunConfig {
    /// Halt the run when a probed dependency stays down past recovery.
    pub stop_on_fatal_dependency: bool,
    /// Run the orphan/confidence normalization pass at store open.
    pub normalize_on_startup: bool,
    /// Disables adaptive and resource-driven scaling. Never lifts the
    /// hard concurrency ceiling.
    pub high_performance: bool,
    /// Adaptive scaler tick interval.
    pub adaptive_interval_ms: u64,
    /// Resource pressure probe interval.
    pub resource_interval_ms: u64,
    /// Files larger than this are truncated at the read boundary.
    pub max_file_size_bytes: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            stop_on_fatal_dependency: true,
            normalize_on_startup: true,
            high_performance: false,
            adaptive_interval_ms: 30_000,
            resource_interval_ms: 10_000,
            max_file_size_bytes: 1_048_576,
        }
    }
}

/// Top-level pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Global concurrency cap; clamped to the hard ceiling.
    pub max_global_concurrency: usize,
    /// Per-class scaling bounds, keyed by worker class name.
    pub class_limits: HashMap<String, ClassLimits>,
    /// Per-class token buckets, keyed by worker class name.
    pub rate_limits: HashMap<String, RateLimitConfig>,
    /// Circuit breaker parameters shared by all targets.
    pub circuit_breaker: CircuitBreakerConfig,
    /// Queue retry policy.
    pub retry: RetryConfig,
    /// Outbox publisher cadence.
    pub outbox: OutboxConfig,
    /// Triangulation thresholds.
    pub triangulation: TriangulationConfig,
    /// Confidence scorer parameters.
    pub confidence: ConfidenceConfig,
    /// Health monitor cadence.
    pub health: HealthConfig,
    /// Backpressure watermarks, keyed by queue; missing queues use defaults.
    pub backpressure: HashMap<String, BackpressureConfig>,
    /// Store bootstrap.
    pub store: StoreConfig,
    /// Run behavior switches.
    pub run: RunConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let mut class_limits = HashMap::new();
        for queue in QueueName::ALL {
            let limits = match queue {
                QueueName::FileAnalysis => ClassLimits {
                    min: 1,
                    max: 12,
                    priority: 8,
                },
                QueueName::RelationshipResolution => ClassLimits {
                    min: 1,
                    max: 12,
                    priority: 7,
                },
                QueueName::Validation => ClassLimits {
                    min: 1,
                    max: 8,
                    priority: 6,
                },
                QueueName::Triangulation => ClassLimits {
                    min: 1,
                    max: 4,
                    priority: 5,
                },
                QueueName::GraphIngest => ClassLimits {
                    min: 1,
                    max: 4,
                    priority: 4,
                },
                QueueName::DirectoryResolution => ClassLimits {
                    min: 1,
                    max: 4,
                    priority: 3,
                },
            };
            class_limits.insert(queue.as_str().to_string(), limits);
        }

        let mut rate_limits = HashMap::new();
        rate_limits.insert(
            QueueName::FileAnalysis.as_str().to_string(),
            RateLimitConfig {
                requests: 60.0,
                window_ms: 60_000,
            },
        );
        rate_limits.insert(
            QueueName::Triangulation.as_str().to_string(),
            RateLimitConfig {
                requests: 30.0,
                window_ms: 60_000,
            },
        );

        Self {
            max_global_concurrency: 100,
            class_limits,
            rate_limits,
            circuit_breaker: CircuitBreakerConfig::default(),
            retry: RetryConfig::default(),
            outbox: OutboxConfig::default(),
            triangulation: TriangulationConfig::default(),
            confidence: ConfidenceConfig::default(),
            health: HealthConfig::default(),
            backpressure: HashMap::new(),
            store: StoreConfig {
                path: None,
                wal_enabled: true,
            },
            run: RunConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Effective global cap after clamping to the hard ceiling.
    pub fn effective_global_cap(&self) -> usize {
        self.max_global_concurrency.min(HARD_CONCURRENCY_CEILING)
    }

    /// Scaling bounds for a class, falling back to defaults.
    pub fn limits_for(&self, class: &str) -> ClassLimits {
        self.class_limits
            .get(class)
            .copied()
            .unwrap_or_default()
    }

    /// Backpressure watermarks for a queue, falling back to defaults.
    pub fn backpressure_for(&self, queue: QueueName) -> BackpressureConfig {
        self.backpressure
            .get(queue.as_str())
            .copied()
            .unwrap_or_default()
    }

    /// Validate cross-field invariants. Violations are fatal.
    pub fn validate(&self) -> Result<()> {
        let weight_sum = self.confidence.weights.sum();
        if (weight_sum - 1.0).abs() > 1e-9 {
            return Err(Error::Config(format!(
                "confidence weights must sum to 1, got {weight_sum}"
            )));
        }
        if !(0.0..=1.0).contains(&self.confidence.escalation_threshold) {
            return Err(Error::Config(
                "escalation threshold must lie within [0,1]".to_string(),
            ));
        }
        if self.confidence.alpha <= 0.0 {
            return Err(Error::Config("alpha must be positive".to_string()));
        }
        if self.triangulation.reject_threshold >= self.triangulation.accept_threshold {
            return Err(Error::Config(
                "reject threshold must be below accept threshold".to_string(),
            ));
        }
        if self.triangulation.agent_types.len() < 2 {
            return Err(Error::Config(
                "triangulation requires at least two agent types".to_string(),
            ));
        }
        if self.max_global_concurrency == 0 {
            return Err(Error::Config(
                "max_global_concurrency must be at least 1".to_string(),
            ));
        }
        for (name, limits) in &self.class_limits {
            if limits.min == 0 || limits.min > limits.max {
                return Err(Error::Config(format!(
                    "class {name}: require 1 <= min <= max, got min={} max={}",
                    limits.min, limits.max
                )));
            }
        }
        for (name, bp) in &self.backpressure {
            if bp.low >= bp.high {
                return Err(Error::Config(format!(
                    "queue {name}: backpressure low must be below high"
                )));
            }
        }
        if self.retry.jitter < 0.0 || self.retry.jitter >= 1.0 {
            return Err(Error::Config("retry jitter must lie in [0,1)".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        PipelineConfig::default().validate().unwrap();
    }

    #[test]
    fn global_cap_is_clamped_to_hard_ceiling() {
        let mut config = PipelineConfig::default();
        config.max_global_concurrency = 10_000;
        assert_eq!(config.effective_global_cap(), HARD_CONCURRENCY_CEILING);
    }

    #[test]
    fn bad_weight_sum_is_rejected() {
        let mut config = PipelineConfig::default();
        config.confidence.weights.syntax = 0.9;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("sum to 1"));
    }

    #[test]
    fn inverted_thresholds_are_rejected() {
        let mut config = PipelineConfig::default();
        config.triangulation.reject_threshold = 0.9;
        assert!(config.validate().is_err());
    }

    #[test]
    fn inverted_class_limits_are_rejected() {
        let mut config = PipelineConfig::default();
        config
            .class_limits
            .insert("file-analysis".to_string(), ClassLimits {
                min: 9,
                max: 2,
                priority: 1,
            });
        assert!(config.validate().is_err());
    }
}
