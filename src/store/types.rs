//! Row types and status enums for the relational store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// File processing status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Pending,
    Processed,
    Failed,
    Deleted,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processed => "processed",
            Self::Failed => "failed",
            Self::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "processed" => Ok(Self::Processed),
            "failed" => Ok(Self::Failed),
            "deleted" => Ok(Self::Deleted),
            other => Err(Error::Internal(format!("unknown file status {other}"))),
        }
    }
}

/// Relationship validation status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RelationshipStatus {
    Pending,
    Validated,
    Failed,
}

impl RelationshipStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Validated => "VALIDATED",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "VALIDATED" => Ok(Self::Validated),
            "FAILED" => Ok(Self::Failed),
            other => Err(Error::Internal(format!(
                "unknown relationship status {other}"
            ))),
        }
    }
}

/// Triangulation session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SessionStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            other => Err(Error::Internal(format!("unknown session status {other}"))),
        }
    }
}

/// Outbox event status. PUBLISHED is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OutboxStatus {
    Pending,
    Reserving,
    Published,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Reserving => "RESERVING",
            Self::Published => "PUBLISHED",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "RESERVING" => Ok(Self::Reserving),
            "PUBLISHED" => Ok(Self::Published),
            "FAILED" => Ok(Self::Failed),
            other => Err(Error::Internal(format!("unknown outbox status {other}"))),
        }
    }
}

/// Run lifecycle states, appended to the run-status log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunState {
    Started,
    Processing,
    Completed,
    Failed,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "STARTED",
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "STARTED" => Ok(Self::Started),
            "PROCESSING" => Ok(Self::Processing),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            other => Err(Error::Internal(format!("unknown run state {other}"))),
        }
    }
}

/// A discovered file row.
#[derive(Debug, Clone)]
pub struct FileRecord {
    pub id: i64,
    pub file_path: String,
    pub content_hash: String,
    pub status: FileStatus,
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A point of interest: a named, line-bounded code entity.
#[derive(Debug, Clone)]
pub struct Poi {
    pub id: i64,
    pub file_id: i64,
    pub file_path: String,
    pub name: String,
    pub category: String,
    pub start_line: u32,
    pub end_line: u32,
    pub is_exported: bool,
    pub semantic_id: Option<String>,
    pub quality_score: Option<f64>,
    pub snippet: String,
    pub run_id: String,
}

/// A typed directed edge between two POIs.
#[derive(Debug, Clone)]
pub struct Relationship {
    pub id: i64,
    pub source_poi_id: i64,
    pub target_poi_id: i64,
    pub rel_type: String,
    pub confidence: f64,
    pub status: RelationshipStatus,
    pub reason: String,
    pub evidence_type: String,
    pub evidence_hash: Option<String>,
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Recorded artifact supporting a relationship.
#[derive(Debug, Clone)]
pub struct EvidenceRecord {
    pub id: i64,
    pub relationship_id: i64,
    pub payload: serde_json::Value,
    pub agent_confidence: f64,
    /// Set when this evidence derives from another relationship.
    pub source_relationship_id: Option<i64>,
}

/// One triangulated analysis session per escalated relationship.
#[derive(Debug, Clone)]
pub struct TriangulationSession {
    pub id: i64,
    pub session_key: String,
    pub relationship_id: i64,
    pub run_id: String,
    pub status: SessionStatus,
    pub final_confidence: Option<f64>,
    pub consensus_score: Option<f64>,
    pub escalation_count: u32,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One subagent's analysis within a session.
#[derive(Debug, Clone)]
pub struct SubagentRecord {
    pub id: i64,
    pub session_id: i64,
    pub agent_type: String,
    pub status: String,
    pub confidence_score: Option<f64>,
    pub processing_time_ms: u64,
}

/// The consensus decision reached for a session.
#[derive(Debug, Clone)]
pub struct ConsensusRecord {
    pub session_id: i64,
    pub final_decision: String,
    pub weighted_consensus: f64,
    pub conflict_detected: bool,
}

/// Typed outbox payloads; one variant per event kind.
///
/// Unknown tags fail deserialization; the carrying event is marked FAILED
/// with the decode error recorded, never silently dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum OutboxPayload {
    PoiCreated {
        file_path: String,
        poi_ids: Vec<i64>,
    },
    RelationshipFound {
        relationship_id: i64,
    },
    GraphIngest {
        relationship_ids: Vec<i64>,
    },
    TriangulationRequest {
        relationship_id: i64,
        escalation: u32,
    },
}

/// A durable outbox event row.
#[derive(Debug, Clone)]
pub struct OutboxEvent {
    pub id: i64,
    pub payload: OutboxPayload,
    pub run_id: String,
    pub status: OutboxStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
}

/// One entry in the append-only run-status log.
#[derive(Debug, Clone)]
pub struct RunStatusRow {
    pub id: i64,
    pub run_id: String,
    pub state: RunState,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings_round_trip() {
        for status in [
            RelationshipStatus::Pending,
            RelationshipStatus::Validated,
            RelationshipStatus::Failed,
        ] {
            assert_eq!(RelationshipStatus::parse(status.as_str()).unwrap(), status);
        }
        for status in [
            OutboxStatus::Pending,
            OutboxStatus::Reserving,
            OutboxStatus::Published,
            OutboxStatus::Failed,
        ] {
            assert_eq!(OutboxStatus::parse(status.as_str()).unwrap(), status);
        }
    }

    #[test]
    fn outbox_payload_uses_kebab_case_tags() {
        let payload = OutboxPayload::PoiCreated {
            file_path: "/a/b.js".to_string(),
            poi_ids: vec![1, 2],
        };
        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains("\"event\":\"poi-created\""));
    }

    #[test]
    fn unknown_event_tag_is_a_decode_error() {
        let json = r#"{"event":"schema-migrated","run_id":"r"}"#;
        assert!(serde_json::from_str::<OutboxPayload>(json).is_err());
    }
}
