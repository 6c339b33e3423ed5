//! Directory aggregation worker.
//!
//! Records which files belong to a directory scope so relationship
//! resolution can enumerate directory peers without walking the tree.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{Error, Result};
use crate::queue::{Job, JobPayload, QueueName};
use crate::store::SqliteStore;
use crate::workers::Worker;

pub struct DirectoryResolutionWorker {
    store: Arc<SqliteStore>,
}

impl DirectoryResolutionWorker {
    pub fn new(store: Arc<SqliteStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Worker for DirectoryResolutionWorker {
    fn queue(&self) -> QueueName {
        QueueName::DirectoryResolution
    }

    async fn process(&self, job: &Job) -> Result<()> {
        let JobPayload::DirectoryResolution { directory, run_id } = &job.payload else {
            return Err(Error::MalformedPayload(format!(
                "directory-resolution job {} carries {:?}",
                job.id, job.payload
            )));
        };

        let files = self.store.files_with_prefix(run_id, directory)?;
        let mapped = self
            .store
            .record_directory_mappings(run_id, directory, &files)?;
        debug!(directory, files = files.len(), mapped, "directory aggregated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mapping_is_recorded_and_idempotent() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        store.upsert_file("run-1", "/src/a.js", "h1").unwrap();
        store.upsert_file("run-1", "/src/b.js", "h2").unwrap();
        store.upsert_file("run-1", "/other/c.js", "h3").unwrap();

        let worker = DirectoryResolutionWorker::new(Arc::clone(&store));
        let job = Job {
            id: 1,
            queue: QueueName::DirectoryResolution,
            payload: JobPayload::DirectoryResolution {
                directory: "/src".to_string(),
                run_id: "run-1".to_string(),
            },
            attempts: 0,
            origin_event_id: None,
            enqueued_at: chrono::Utc::now(),
        };

        worker.process(&job).await.unwrap();
        // Replay inserts nothing new.
        worker.process(&job).await.unwrap();

        let files = store.files_with_prefix("run-1", "/src").unwrap();
        assert_eq!(files, vec!["/src/a.js".to_string(), "/src/b.js".to_string()]);
    }
}
