//! Transactional outbox publisher.
//!
//! Single-consumer loop over the outbox table. Each tick reserves a batch of
//! PENDING events via an atomic status flip, translates each event into jobs
//! for its target queue, and marks it PUBLISHED. Stale reservations from a
//! crashed publisher are reclaimed after a timeout; job enqueueing dedupes
//! on the originating event id, so replay is safe.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::config::OutboxConfig;
use crate::confidence::{ConfidenceScorer, ScoringInput};
use crate::error::{Error, Result};
use crate::queue::{JobPayload, QueueBroker};
use crate::store::{OutboxEvent, OutboxPayload, SqliteStore};

/// Polls the outbox and materializes events into queue jobs.
pub struct OutboxPublisher {
    store: Arc<SqliteStore>,
    broker: Arc<QueueBroker>,
    scorer: Arc<ConfidenceScorer>,
    config: OutboxConfig,
    publisher_id: String,
}

/// Result of one publisher tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickStats {
    pub published: usize,
    pub skipped_backpressure: usize,
    pub failed: usize,
}

impl OutboxPublisher {
    pub fn new(
        store: Arc<SqliteStore>,
        broker: Arc<QueueBroker>,
        scorer: Arc<ConfidenceScorer>,
        config: OutboxConfig,
    ) -> Self {
        Self {
            store,
            broker,
            scorer,
            config,
            publisher_id: Uuid::new_v4().to_string(),
        }
    }

    /// Run the publish loop until the shutdown flag flips.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.tick().await {
                Ok(stats) if stats.published > 0 => {
                    debug!(
                        published = stats.published,
                        skipped = stats.skipped_backpressure,
                        "outbox tick"
                    );
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "outbox tick failed"),
            }

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(self.config.poll_interval_ms)) => {}
                _ = shutdown.changed() => {}
            }
        }
        // Final drain so nothing publishable is left behind on shutdown.
        if let Err(e) = self.tick().await {
            warn!(error = %e, "final outbox drain failed");
        }
    }

    /// One publish pass: reserve, translate, enqueue, mark. Events whose
    /// target queue is saturated are released back to PENDING and revisited
    /// next tick without blocking other event classes.
    ///
    /// Translation runs before the saturation check: a relationship-found
    /// event's destination depends on the scorer's verdict, so the gate has
    /// to be judged against the routed queue, not the event kind.
    #[instrument(skip(self), fields(publisher = %self.publisher_id))]
    pub async fn tick(&self) -> Result<TickStats> {
        let events = self.store.reserve_outbox_batch(
            &self.publisher_id,
            self.config.batch_size,
            self.config.reservation_timeout_ms,
        )?;

        let mut stats = TickStats::default();
        for event in events {
            let jobs = match self.translate_event(&event) {
                Ok(jobs) => jobs,
                Err(e) => {
                    warn!(event_id = event.id, error = %e, "event translation failed");
                    self.store.record_outbox_failure(
                        event.id,
                        &e.to_string(),
                        self.config.max_attempts,
                    )?;
                    stats.failed += 1;
                    continue;
                }
            };

            let Some(target_queue) = jobs.first().map(JobPayload::queue) else {
                // Nothing to enqueue; the event is trivially published.
                self.store.mark_outbox_published(event.id)?;
                stats.published += 1;
                continue;
            };
            if self.broker.is_saturated(target_queue).await {
                self.store.release_outbox_event(event.id)?;
                stats.skipped_backpressure += 1;
                continue;
            }

            match self.broker.enqueue_bulk(jobs, Some(event.id)).await {
                Ok(_) => {
                    self.store.mark_outbox_published(event.id)?;
                    stats.published += 1;
                }
                Err(e) => {
                    warn!(event_id = event.id, error = %e, "event publish failed");
                    self.store.record_outbox_failure(
                        event.id,
                        &e.to_string(),
                        self.config.max_attempts,
                    )?;
                    stats.failed += 1;
                }
            }
        }
        Ok(stats)
    }

    /// Translate one event into the jobs it derives. All jobs of one event
    /// share a single destination queue.
    fn translate_event(&self, event: &OutboxEvent) -> Result<Vec<JobPayload>> {
        let run_id = event.run_id.clone();
        match &event.payload {
            OutboxPayload::PoiCreated { poi_ids, .. } => Ok(poi_ids
                .iter()
                .map(|poi_id| JobPayload::RelationshipResolution {
                    poi_id: *poi_id,
                    run_id: run_id.clone(),
                })
                .collect()),
            OutboxPayload::RelationshipFound { relationship_id } => {
                // The scorer's verdict on the stored evidence picks the
                // destination: validation for plausible candidates,
                // triangulation for weak ones.
                let job = match self.route_relationship(*relationship_id, &run_id)? {
                    Route::Validate => JobPayload::Validation {
                        relationship_id: *relationship_id,
                        run_id,
                    },
                    Route::Triangulate => JobPayload::Triangulation {
                        relationship_id: *relationship_id,
                        run_id,
                        escalation: 0,
                    },
                };
                Ok(vec![job])
            }
            OutboxPayload::GraphIngest { relationship_ids } => {
                Ok(vec![JobPayload::GraphIngest {
                    relationship_ids: relationship_ids.clone(),
                    run_id,
                }])
            }
            OutboxPayload::TriangulationRequest {
                relationship_id,
                escalation,
            } => Ok(vec![JobPayload::Triangulation {
                relationship_id: *relationship_id,
                run_id,
                escalation: *escalation,
            }]),
        }
    }

    fn route_relationship(&self, relationship_id: i64, run_id: &str) -> Result<Route> {
        let rel = self
            .store
            .relationship_by_id(relationship_id)?
            .ok_or_else(|| {
                Error::UnresolvedReference(format!("relationship {relationship_id} in {run_id}"))
            })?;
        let source = self.store.poi_by_id(rel.source_poi_id)?;
        let target = self.store.poi_by_id(rel.target_poi_id)?;
        let (Some(source), Some(target)) = (source, target) else {
            // Unresolvable POIs cannot validate; let triangulation decide.
            return Ok(Route::Triangulate);
        };
        let evidence = self.store.evidence_for(relationship_id)?;

        let breakdown = self.scorer.calculate(&ScoringInput {
            relationship: &rel,
            source: &source,
            target: &target,
            evidence: &evidence,
        });
        if breakdown.escalate {
            Ok(Route::Triangulate)
        } else {
            Ok(Route::Validate)
        }
    }
}

enum Route {
    Validate,
    Triangulate,
}
