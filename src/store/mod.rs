//! Durable relational store for files, POIs, relationships, evidence,
//! triangulation sessions, the outbox, and the run-status log.

mod evidence;
mod schema;
mod store;
mod types;

pub use evidence::EvidenceOutcome;
pub use schema::{initialize_schema, NormalizationReport, SCHEMA_VERSION};
pub use store::{RelationshipCandidate, RunCounts, SqliteStore};
pub use types::{
    ConsensusRecord, EvidenceRecord, FileRecord, FileStatus, OutboxEvent, OutboxPayload,
    OutboxStatus, Poi, Relationship, RelationshipStatus, RunState, RunStatusRow, SessionStatus,
    SubagentRecord, TriangulationSession,
};
