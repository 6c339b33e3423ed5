//! Relationship resolution worker.
//!
//! For one POI, enumerates candidate relationships against its file- and
//! directory-peers with the lookup maps and lands them as PENDING rows plus
//! `relationship-found` events.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, instrument};

use crate::error::{Error, Result};
use crate::queue::{Job, JobPayload, QueueName};
use crate::store::SqliteStore;
use crate::workers::lookup::{synthesize_candidates, LookupMaps};
use crate::workers::Worker;

pub struct RelationshipResolutionWorker {
    store: Arc<SqliteStore>,
}

impl RelationshipResolutionWorker {
    pub fn new(store: Arc<SqliteStore>) -> Self {
        Self { store }
    }

    #[instrument(skip(self))]
    fn resolve(&self, poi_id: i64, run_id: &str) -> Result<usize> {
        let poi = self
            .store
            .poi_by_id(poi_id)?
            .ok_or_else(|| Error::UnresolvedReference(format!("poi {poi_id}")))?;

        let file_peers = self.store.pois_by_file(run_id, &poi.file_path)?;
        let directory = Path::new(&poi.file_path)
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        let directory_peers = if directory.is_empty() {
            Vec::new()
        } else {
            self.store.pois_in_directory(run_id, &directory)?
        };

        let maps = LookupMaps::build(&file_peers, &directory_peers);
        let candidates = synthesize_candidates(&poi, &maps);
        let inserted = self
            .store
            .insert_candidates_with_events(run_id, &candidates)?;
        debug!(
            poi = poi.name,
            candidates = candidates.len(),
            inserted,
            "relationships resolved"
        );
        Ok(inserted)
    }
}

#[async_trait]
impl Worker for RelationshipResolutionWorker {
    fn queue(&self) -> QueueName {
        QueueName::RelationshipResolution
    }

    async fn process(&self, job: &Job) -> Result<()> {
        let JobPayload::RelationshipResolution { poi_id, run_id } = &job.payload else {
            return Err(Error::MalformedPayload(format!(
                "relationship-resolution job {} carries {:?}",
                job.id, job.payload
            )));
        };
        self.resolve(*poi_id, run_id)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::ExtractedPoi;
    use crate::store::RelationshipStatus;

    fn extracted(name: &str, category: &str, snippet: &str) -> ExtractedPoi {
        ExtractedPoi {
            name: name.to_string(),
            category: category.to_string(),
            start_line: 1,
            end_line: 3,
            is_exported: true,
            semantic_id: Some(format!("s:{name}")),
            quality_score: Some(0.9),
            snippet: snippet.to_string(),
        }
    }

    #[tokio::test]
    async fn resolves_call_into_pending_relationship_with_event() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let (file, _) = store.upsert_file("run-1", "/src/a.js", "h1").unwrap();
        let ids = store
            .insert_pois_with_event(
                "run-1",
                &file,
                &[
                    extracted("foo", "function", "function foo() { bar(); }"),
                    extracted("bar", "function", "function bar() {}"),
                ],
            )
            .unwrap();

        let worker = RelationshipResolutionWorker::new(Arc::clone(&store));
        let inserted = worker.resolve(ids[0], "run-1").unwrap();
        assert_eq!(inserted, 1);

        let pending = store
            .relationships_by_status("run-1", RelationshipStatus::Pending)
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].rel_type, "CALLS");
        assert_eq!(pending[0].source_poi_id, ids[0]);
        assert_eq!(pending[0].target_poi_id, ids[1]);

        // Replay converges: no duplicate rows or events.
        assert_eq!(worker.resolve(ids[0], "run-1").unwrap(), 0);
    }

    #[tokio::test]
    async fn missing_poi_is_a_domain_error() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let worker = RelationshipResolutionWorker::new(store);
        let err = worker.resolve(404, "run-1").unwrap_err();
        assert!(matches!(err, Error::UnresolvedReference(_)));
    }
}
