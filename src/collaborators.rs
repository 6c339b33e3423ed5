//! External collaborator traits.
//!
//! The pipeline orchestrates these but never implements them: prompt
//! construction, response parsing, file discovery heuristics, and graph
//! ingestion SQL all live behind these seams. Every call site goes through
//! the worker pool's admission layer.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Token accounting returned by the LLM provider.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Raw completion returned by the LLM provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    /// Response body; parsing is the extractor's concern.
    pub body: String,
    /// Token accounting for the call.
    pub usage: TokenUsage,
}

/// LLM provider client.
///
/// Must be safe to call concurrently up to the configured rate limit.
/// Transient transport failures, provider throttling, and timeouts surface
/// as `Error::Llm` / `Error::Timeout` and are retried by the job layer.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Send one prompt and return the raw completion.
    async fn call(&self, prompt: &str) -> Result<LlmResponse>;
}

/// A code entity extracted from one file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedPoi {
    /// Human-readable name.
    pub name: String,
    /// Opaque category tag ("function", "class", "variable", "import", "export").
    pub category: String,
    /// 1-based inclusive start line.
    pub start_line: u32,
    /// 1-based inclusive end line; must be >= start_line.
    pub end_line: u32,
    /// Whether the entity is exported from its file.
    pub is_exported: bool,
    /// Stable key across re-runs, when the extractor can produce one.
    pub semantic_id: Option<String>,
    /// Extractor's own quality estimate in [0,1].
    pub quality_score: Option<f64>,
    /// Text of the entity's span, used for reference extraction.
    pub snippet: String,
}

/// Prompt construction and response parsing for POI extraction.
///
/// Split from [`LlmClient`] so the transport and the prompt/parse logic can
/// vary independently.
pub trait PoiExtractor: Send + Sync {
    /// Build the extraction prompt for one file.
    fn build_file_prompt(&self, path: &Path, content: &str, truncated: bool) -> String;

    /// Parse the LLM body into POIs. Malformed output is a domain error.
    fn parse_pois(&self, body: &str) -> Result<Vec<ExtractedPoi>>;
}

/// One file produced by discovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredFile {
    /// Absolute path within the run's target tree.
    pub path: PathBuf,
    /// Stable hash of the file bytes.
    pub hash: String,
}

/// File discovery over the target tree.
///
/// Must respect its own ignore predicate and classify non-code files as
/// skipped; the pipeline only sees what should be analyzed.
pub trait Discoverer: Send + Sync {
    /// Walk the target tree and return the files to analyze.
    fn walk(&self, root: &Path) -> Result<Vec<DiscoveredFile>>;
}

/// A node upsert for the graph sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphNode {
    /// Store-assigned POI id; the sink's idempotency key.
    pub id: i64,
    pub semantic_id: Option<String>,
    pub name: String,
    pub category: String,
    pub file_path: String,
    pub start_line: u32,
    pub end_line: u32,
}

/// An edge upsert for the graph sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphEdge {
    pub source_id: i64,
    pub target_id: i64,
    /// Uppercase relationship type.
    pub edge_type: String,
    pub confidence: f64,
}

/// Graph database projection target.
///
/// `upsert_batch` must be idempotent on node id and on the
/// (source, target, type) edge key. Schema violations surface as
/// `Error::SinkSchema`; transport failures as `Error::Sink`.
#[async_trait]
pub trait GraphSink: Send + Sync {
    /// Upsert a batch of nodes and edges.
    async fn upsert_batch(&self, nodes: &[GraphNode], edges: &[GraphEdge]) -> Result<()>;
}

/// Optional opaque KV for run metadata hints.
///
/// No correctness guarantees: entries may be evicted at any time and the
/// pipeline must tolerate total loss.
#[async_trait]
pub trait CacheClient: Send + Sync {
    /// Best-effort write.
    async fn put(&self, key: &str, value: &str);

    /// Best-effort read.
    async fn get(&self, key: &str) -> Option<String>;
}

/// The full collaborator set handed to the pipeline.
#[derive(Clone)]
pub struct Collaborators {
    pub llm: Arc<dyn LlmClient>,
    pub extractor: Arc<dyn PoiExtractor>,
    pub discoverer: Arc<dyn Discoverer>,
    pub sink: Arc<dyn GraphSink>,
    pub cache: Option<Arc<dyn CacheClient>>,
}
