//! Job and queue vocabulary.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::RetryConfig;

/// The six named queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueName {
    FileAnalysis,
    DirectoryResolution,
    RelationshipResolution,
    Validation,
    Triangulation,
    GraphIngest,
}

impl QueueName {
    /// All queues, in pipeline order.
    pub const ALL: [QueueName; 6] = [
        QueueName::FileAnalysis,
        QueueName::DirectoryResolution,
        QueueName::RelationshipResolution,
        QueueName::Validation,
        QueueName::Triangulation,
        QueueName::GraphIngest,
    ];

    /// Canonical queue name; doubles as the worker class name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FileAnalysis => "file-analysis",
            Self::DirectoryResolution => "directory-resolution",
            Self::RelationshipResolution => "relationship-resolution",
            Self::Validation => "validation",
            Self::Triangulation => "triangulation",
            Self::GraphIngest => "graph-ingest",
        }
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed job payloads; one variant per queue.
///
/// Unknown tags fail deserialization and the carrying job is dead-lettered,
/// never silently dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum JobPayload {
    FileAnalysis {
        file_path: String,
        run_id: String,
    },
    DirectoryResolution {
        directory: String,
        run_id: String,
    },
    RelationshipResolution {
        poi_id: i64,
        run_id: String,
    },
    Validation {
        relationship_id: i64,
        run_id: String,
    },
    Triangulation {
        relationship_id: i64,
        run_id: String,
        escalation: u32,
    },
    GraphIngest {
        relationship_ids: Vec<i64>,
        run_id: String,
    },
}

impl JobPayload {
    /// The queue this payload belongs on.
    pub fn queue(&self) -> QueueName {
        match self {
            Self::FileAnalysis { .. } => QueueName::FileAnalysis,
            Self::DirectoryResolution { .. } => QueueName::DirectoryResolution,
            Self::RelationshipResolution { .. } => QueueName::RelationshipResolution,
            Self::Validation { .. } => QueueName::Validation,
            Self::Triangulation { .. } => QueueName::Triangulation,
            Self::GraphIngest { .. } => QueueName::GraphIngest,
        }
    }

    /// The run this payload belongs to.
    pub fn run_id(&self) -> &str {
        match self {
            Self::FileAnalysis { run_id, .. }
            | Self::DirectoryResolution { run_id, .. }
            | Self::RelationshipResolution { run_id, .. }
            | Self::Validation { run_id, .. }
            | Self::Triangulation { run_id, .. }
            | Self::GraphIngest { run_id, .. } => run_id,
        }
    }
}

/// A queued unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Broker-assigned monotonic id.
    pub id: u64,
    /// Owning queue.
    pub queue: QueueName,
    /// Typed payload.
    pub payload: JobPayload,
    /// Delivery attempts so far.
    pub attempts: u32,
    /// Outbox event this job was derived from, for replay dedup.
    pub origin_event_id: Option<i64>,
    /// When the job was first enqueued.
    pub enqueued_at: DateTime<Utc>,
}

/// Exponential backoff with symmetric jitter.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Delivery attempts before dead-lettering.
    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// Backoff delay before re-delivery of the given attempt (0-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.config.backoff_factor.max(1.0).powi(attempt as i32);
        let base = self.config.base_delay_ms as f64 * factor;
        let jittered = if self.config.jitter > 0.0 {
            let spread = base * self.config.jitter;
            base + rand::thread_rng().gen_range(-spread..=spread)
        } else {
            base
        };
        Duration::from_millis(jittered.round().max(0.0) as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}
