//! Validation worker.
//!
//! Scores one PENDING relationship against its accumulated evidence and
//! either validates it (enqueueing graph ingest through the outbox) or
//! escalates it to triangulation.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, instrument};

use crate::confidence::{ConfidenceScorer, ScoringInput};
use crate::error::{Error, Result};
use crate::queue::{Job, JobPayload, QueueName};
use crate::store::{OutboxPayload, RelationshipStatus, SqliteStore};
use crate::workers::Worker;

pub struct ValidationWorker {
    store: Arc<SqliteStore>,
    scorer: Arc<ConfidenceScorer>,
}

impl ValidationWorker {
    pub fn new(store: Arc<SqliteStore>, scorer: Arc<ConfidenceScorer>) -> Self {
        Self { store, scorer }
    }

    #[instrument(skip(self))]
    fn validate(&self, relationship_id: i64, run_id: &str) -> Result<()> {
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

        let source = self.store.poi_by_id(rel.source_poi_id)?;
        let target = self.store.poi_by_id(rel.target_poi_id)?;
        let (Some(source), Some(target)) = (source, target) else {
            self.store.finalize_validation(
                relationship_id,
                RelationshipStatus::Failed,
                0.0,
                "POI reference did not resolve",
            )?;
            return Ok(());
        };

        let evidence = self.store.evidence_for(relationship_id)?;
        let breakdown = self.scorer.calculate(&ScoringInput {
            relationship: &rel,
            source: &source,
            target: &target,
            evidence: &evidence,
        });

        if breakdown.escalate {
            debug!(score = breakdown.final_score, "below threshold, escalating");
            self.store.append_outbox_event(
                run_id,
                &OutboxPayload::TriangulationRequest {
                    relationship_id,
                    escalation: 0,
                },
            )?;
            return Ok(());
        }

        self.store.finalize_validation(
            relationship_id,
            RelationshipStatus::Validated,
            breakdown.final_score,
            &format!(
                "scored {:.3} ({:?})",
                breakdown.final_score, breakdown.level
            ),
        )?;
        Ok(())
    }
}

#[async_trait]
impl Worker for ValidationWorker {
    fn queue(&self) -> QueueName {
        QueueName::Validation
    }

    async fn process(&self, job: &Job) -> Result<()> {
        let JobPayload::Validation {
            relationship_id,
            run_id,
        } = &job.payload
        else {
            return Err(Error::MalformedPayload(format!(
                "validation job {} carries {:?}",
                job.id, job.payload
            )));
        };
        self.validate(*relationship_id, run_id)
    }
}
