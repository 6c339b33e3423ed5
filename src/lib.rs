//! # ctp-core
//!
//! Orchestration and reliability substrate for a cognitive triangulation
//! pipeline: an LLM-driven extractor turns a source tree into a typed
//! property graph of code entities and relationships, and this crate makes
//! that run to completion against unreliable workers, a rate-limited remote
//! LLM, and heterogeneous stores.
//!
//! ## Core Components
//!
//! - **Store**: SQLite-backed entity store with a transactional outbox
//! - **Queue**: named FIFO job queues with backoff retry and dead-lettering
//! - **Pool**: slot admission, rate limiting, circuit breaking, adaptive scaling
//! - **Outbox**: exactly-once hand-off from persisted events to queue jobs
//! - **Workers**: file analysis, relationship resolution, validation,
//!   triangulation, graph ingest
//! - **Confidence**: deterministic scoring and weighted multi-agent consensus
//! - **Health**: dependency probes, derived worker health, bounded recovery
//!
//! ## Example
//!
//! ```rust,ignore
//! use ctp_core::{Collaborators, Pipeline, PipelineConfig};
//!
//! let pipeline = Pipeline::new(PipelineConfig::default(), collaborators)?;
//! let summary = pipeline.run(target_dir, "run-1").await?;
//! std::process::exit(summary.exit.code());
//! ```

pub mod collaborators;
pub mod confidence;
pub mod config;
pub mod error;
pub mod health;
pub mod outbox;
pub mod pipeline;
pub mod pool;
pub mod queue;
pub mod store;
pub mod workers;

// Re-exports for convenience
pub use collaborators::{
    CacheClient, Collaborators, DiscoveredFile, Discoverer, ExtractedPoi, GraphEdge, GraphNode,
    GraphSink, LlmClient, LlmResponse, PoiExtractor, TokenUsage,
};
pub use confidence::{
    decide_consensus, ConfidenceLevel, ConfidenceScorer, ConsensusOutcome, ConsensusResult,
    FactorScores, ScoreBreakdown, ScoringInput, SubagentVote,
};
pub use config::{
    BackpressureConfig, CircuitBreakerConfig, ClassLimits, ConfidenceConfig, ConfidenceWeights,
    HealthConfig, OutboxConfig, PipelineConfig, RateLimitConfig, RetryConfig, RunConfig,
    StoreConfig, TriangulationConfig, HARD_CONCURRENCY_CEILING,
};
pub use error::{Error, ErrorKind, Result};
pub use health::{Alert, HealthMonitor, HealthReport, HealthState, ProbeResult};
pub use outbox::OutboxPublisher;
pub use pipeline::{ExitCode, Pipeline, RunSummary};
pub use pool::{
    CircuitBreaker, CircuitState, PoolSnapshot, RateLimiter, ResourceProbe, ResourceSnapshot,
    WorkerPoolManager,
};
pub use queue::{Job, JobPayload, QueueBroker, QueueCounts, QueueName};
pub use store::{
    EvidenceOutcome, EvidenceRecord, FileRecord, FileStatus, NormalizationReport, OutboxEvent,
    OutboxPayload, OutboxStatus, Poi, Relationship, RelationshipCandidate, RelationshipStatus,
    RunCounts, RunState, SqliteStore, TriangulationSession,
};
pub use workers::{
    FileAnalysisWorker, GraphIngestWorker, RelationshipResolutionWorker, TriangulationWorker,
    ValidationWorker, Worker,
};
