//! Triangulation coordinator.
//!
//! Escalated relationships get a session in which several subagents, each
//! examining the tuple through a different factor emphasis, produce
//! independent confidence votes. The weighted consensus decides: accept,
//! reject, or one bounded re-escalation after which REJECT is forced.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{debug, instrument, warn};

use crate::config::TriangulationConfig;
use crate::confidence::{
    decide_consensus, ConfidenceScorer, ConsensusOutcome, FactorScores, ScoringInput, SubagentVote,
};
use crate::error::{Error, Result};
use crate::queue::{Job, JobPayload, QueueName};
use crate::store::{
    ConsensusRecord, OutboxPayload, RelationshipStatus, SqliteStore, SubagentRecord,
};
use crate::workers::Worker;

/// Factor emphasis per agent type; unknown types look at the tuple
/// unweighted.
fn emphasis_for(agent_type: &str) -> FactorScores {
    match agent_type {
        "syntactic" => FactorScores {
            syntax: 1.2,
            semantic: 0.8,
            context: 1.0,
            cross_ref: 1.0,
        },
        "semantic" => FactorScores {
            syntax: 0.8,
            semantic: 1.2,
            context: 1.0,
            cross_ref: 1.0,
        },
        "contextual" => FactorScores {
            syntax: 0.9,
            semantic: 0.9,
            context: 1.3,
            cross_ref: 1.1,
        },
        _ => FactorScores {
            syntax: 1.0,
            semantic: 1.0,
            context: 1.0,
            cross_ref: 1.0,
        },
    }
}

pub struct TriangulationWorker {
    store: Arc<SqliteStore>,
    scorer: Arc<ConfidenceScorer>,
    config: TriangulationConfig,
}

impl TriangulationWorker {
    pub fn new(
        store: Arc<SqliteStore>,
        scorer: Arc<ConfidenceScorer>,
        config: TriangulationConfig,
    ) -> Self {
        Self {
            store,
            scorer,
            config,
        }
    }

    #[instrument(skip(self))]
    async fn triangulate(
        &self,
        relationship_id: i64,
        run_id: &str,
        escalation: u32,
    ) -> Result<()> {
        let rel = self
            .store
            .relationship_by_id(relationship_id)?
            .ok_or_else(|| {
                Error::UnresolvedReference(format!("relationship {relationship_id}"))
            })?;
        if rel.status != RelationshipStatus::Pending {
            debug!(status = rel.status.as_str(), "already decided, skipping");
            return Ok(());
        }

        let session = self.store.upsert_session(relationship_id, run_id)?;
        self.store.mark_session_running(session.id, escalation)?;

        let source = self.store.poi_by_id(rel.source_poi_id)?;
        let target = self.store.poi_by_id(rel.target_poi_id)?;
        let (Some(source), Some(target)) = (source, target) else {
            self.store
                .fail_session(session.id, "POI reference did not resolve")?;
            self.store.finalize_validation(
                relationship_id,
                RelationshipStatus::Failed,
                0.0,
                "triangulation: POI reference did not resolve",
            )?;
            return Ok(());
        };
        let evidence = self.store.evidence_for(relationship_id)?;

        // Spawn all subagents concurrently, each with its own timeout.
        let subagent_timeout = Duration::from_millis(self.config.subagent_timeout_ms);
        let analyses = join_all(self.config.agent_types.iter().map(|agent_type| {
            let agent_type = agent_type.clone();
            let scorer = Arc::clone(&self.scorer);
            let input = ScoringInput {
                relationship: &rel,
                source: &source,
                target: &target,
                evidence: &evidence,
            };
            async move {
                let started = Instant::now();
                let result = tokio::time::timeout(subagent_timeout, async {
                    scorer.calculate_with_emphasis(&input, &emphasis_for(&agent_type))
                })
                .await;
                (agent_type, started.elapsed(), result)
            }
        }))
        .await;

        let mut votes = Vec::new();
        let mut records = Vec::new();
        for (agent_type, elapsed, result) in analyses {
            match result {
                Ok(breakdown) => {
                    let weight = self
                        .config
                        .agent_weights
                        .get(&agent_type)
                        .copied()
                        .unwrap_or(1.0);
                    votes.push(SubagentVote {
                        agent_type: agent_type.clone(),
                        confidence: breakdown.final_score,
                        weight,
                    });
                    records.push(SubagentRecord {
                        id: 0,
                        session_id: session.id,
                        agent_type,
                        status: "COMPLETED".to_string(),
                        confidence_score: Some(breakdown.final_score),
                        processing_time_ms: elapsed.as_millis() as u64,
                    });
                }
                Err(_) => {
                    warn!(agent_type, "subagent timed out");
                    records.push(SubagentRecord {
                        id: 0,
                        session_id: session.id,
                        agent_type,
                        status: "TIMEOUT".to_string(),
                        confidence_score: None,
                        processing_time_ms: elapsed.as_millis() as u64,
                    });
                }
            }
        }

        if votes.len() < 2 {
            self.store
                .fail_session(session.id, "fewer than two subagents completed")?;
            return Err(Error::timeout(self.config.subagent_timeout_ms));
        }

        let consensus = decide_consensus(&votes, &self.config, escalation);
        self.store.complete_session(
            session.id,
            consensus.weighted_consensus,
            &ConsensusRecord {
                session_id: session.id,
                final_decision: consensus.outcome.as_str().to_string(),
                weighted_consensus: consensus.weighted_consensus,
                conflict_detected: consensus.conflict_detected,
            },
            &records,
        )?;

        match consensus.outcome {
            ConsensusOutcome::Accept => {
                self.store.finalize_validation(
                    relationship_id,
                    RelationshipStatus::Validated,
                    consensus.weighted_consensus,
                    &format!(
                        "consensus accepted at {:.3}",
                        consensus.weighted_consensus
                    ),
                )?;
            }
            ConsensusOutcome::Reject => {
                self.store.finalize_validation(
                    relationship_id,
                    RelationshipStatus::Failed,
                    consensus.weighted_consensus.min(rel.confidence),
                    &format!(
                        "consensus rejected at {:.3}",
                        consensus.weighted_consensus
                    ),
                )?;
            }
            ConsensusOutcome::Escalate => {
                debug!(escalation = escalation + 1, "re-escalating");
                self.store.append_outbox_event(
                    run_id,
                    &OutboxPayload::TriangulationRequest {
                        relationship_id,
                        escalation: escalation + 1,
                    },
                )?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Worker for TriangulationWorker {
    fn queue(&self) -> QueueName {
        QueueName::Triangulation
    }

    async fn process(&self, job: &Job) -> Result<()> {
        let JobPayload::Triangulation {
            relationship_id,
            run_id,
            escalation,
        } = &job.payload
        else {
            return Err(Error::MalformedPayload(format!(
                "triangulation job {} carries {:?}",
                job.id, job.payload
            )));
        };
        self.triangulate(*relationship_id, run_id, *escalation).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::ExtractedPoi;
    use crate::config::ConfidenceConfig;
    use crate::store::{RelationshipCandidate, SessionStatus};

    fn extracted(name: &str, quality: f64, exported: bool) -> ExtractedPoi {
        ExtractedPoi {
            name: name.to_string(),
            category: "function".to_string(),
            start_line: 1,
            end_line: 3,
            is_exported: exported,
            semantic_id: Some(format!("s:{name}")),
            quality_score: Some(quality),
            snippet: format!("function {name}() {{}}"),
        }
    }

    /// Same-file CALLS candidate with syntactic evidence: subagent votes
    /// land well above the accept threshold.
    fn seed_strong(store: &SqliteStore) -> i64 {
        let (file, _) = store.upsert_file("run-1", "/a.js", "h1").unwrap();
        let ids = store
            .insert_pois_with_event(
                "run-1",
                &file,
                &[extracted("foo", 0.95, true), extracted("bar", 0.95, true)],
            )
            .unwrap();
        store
            .insert_candidates_with_events(
                "run-1",
                &[RelationshipCandidate {
                    source_poi_id: ids[0],
                    target_poi_id: ids[1],
                    rel_type: "CALLS".to_string(),
                    reason: "call".to_string(),
                    evidence_type: "function-call-pattern".to_string(),
                    agent_confidence: 0.9,
                    evidence_payload: serde_json::json!({"rule": "function-call-pattern"}),
                }],
            )
            .unwrap();
        store
            .relationships_by_status("run-1", RelationshipStatus::Pending)
            .unwrap()[0]
            .id
    }

    /// Cross-file REFERENCES candidate with weak non-syntactic evidence:
    /// subagent votes land between the reject and accept thresholds.
    fn seed_mid_band(store: &SqliteStore) -> i64 {
        let (file_a, _) = store.upsert_file("run-1", "/a.js", "h1").unwrap();
        let (file_b, _) = store.upsert_file("run-1", "/b.js", "h2").unwrap();
        let src = store
            .insert_pois_with_event("run-1", &file_a, &[extracted("foo", 0.45, false)])
            .unwrap()[0];
        let dst = store
            .insert_pois_with_event("run-1", &file_b, &[extracted("shared", 0.45, false)])
            .unwrap()[0];
        store
            .insert_candidates_with_events(
                "run-1",
                &[RelationshipCandidate {
                    source_poi_id: src,
                    target_poi_id: dst,
                    rel_type: "REFERENCES".to_string(),
                    reason: "identifier".to_string(),
                    evidence_type: "identifier-reference".to_string(),
                    agent_confidence: 0.35,
                    evidence_payload: serde_json::json!({"rule": "identifier-reference"}),
                }],
            )
            .unwrap();
        store
            .relationships_by_status("run-1", RelationshipStatus::Pending)
            .unwrap()[0]
            .id
    }

    fn worker(store: &Arc<SqliteStore>) -> TriangulationWorker {
        TriangulationWorker::new(
            Arc::clone(store),
            Arc::new(ConfidenceScorer::new(ConfidenceConfig::default())),
            TriangulationConfig::default(),
        )
    }

    #[tokio::test]
    async fn strong_tuple_reaches_accepting_consensus() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let rel_id = seed_strong(&store);

        worker(&store).triangulate(rel_id, "run-1", 0).await.unwrap();

        let rel = store.relationship_by_id(rel_id).unwrap().unwrap();
        assert_eq!(rel.status, RelationshipStatus::Validated);
        assert!(rel.confidence > 0.5);

        let session = store.upsert_session(rel_id, "run-1").unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert!(session.final_confidence.is_some());
        assert!(session.consensus_score.is_some());
    }

    #[tokio::test]
    async fn mid_band_tuple_escalates_once() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let rel_id = seed_mid_band(&store);

        worker(&store).triangulate(rel_id, "run-1", 0).await.unwrap();

        // Undecided, with a re-escalation request in the outbox.
        let rel = store.relationship_by_id(rel_id).unwrap().unwrap();
        assert_eq!(rel.status, RelationshipStatus::Pending);
        let events = store.reserve_outbox_batch("pub-x", 100, 60_000).unwrap();
        assert!(events.iter().any(|e| matches!(
            e.payload,
            OutboxPayload::TriangulationRequest { relationship_id, escalation: 1 }
                if relationship_id == rel_id
        )));
    }

    #[tokio::test]
    async fn exhausted_escalation_budget_forces_reject() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let rel_id = seed_mid_band(&store);

        // At the escalation cap, the coordinator must decide.
        worker(&store)
            .triangulate(rel_id, "run-1", 1)
            .await
            .unwrap();

        let rel = store.relationship_by_id(rel_id).unwrap().unwrap();
        assert_eq!(rel.status, RelationshipStatus::Failed);
        // No further triangulation request was written.
        let events = store.reserve_outbox_batch("pub-x", 100, 60_000).unwrap();
        assert!(!events.iter().any(|e| matches!(
            e.payload,
            OutboxPayload::TriangulationRequest { escalation: 2, .. }
        )));
    }

    #[tokio::test]
    async fn decided_relationship_is_skipped_on_replay() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let rel_id = seed_mid_band(&store);
        let w = worker(&store);
        w.triangulate(rel_id, "run-1", 1).await.unwrap();
        // Replay after the decision is a clean no-op.
        w.triangulate(rel_id, "run-1", 1).await.unwrap();
        let rel = store.relationship_by_id(rel_id).unwrap().unwrap();
        assert_eq!(rel.status, RelationshipStatus::Failed);
    }
}
