//! File analysis worker: read, extract, persist.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::{debug, instrument, warn};

use crate::collaborators::{LlmClient, PoiExtractor};
use crate::error::{Error, Result};
use crate::queue::{Job, JobPayload, QueueName};
use crate::store::{FileStatus, SqliteStore};
use crate::workers::Worker;

/// Reads one file, extracts its POIs through the LLM, and lands them with
/// the `poi-created` outbox event in a single transaction.
///
/// Idempotent on (path, run, content hash): a file whose stored hash matches
/// and which already processed is skipped; re-processing upserts POIs on
/// their semantic ids, so replay converges to the same set.
pub struct FileAnalysisWorker {
    store: Arc<SqliteStore>,
    llm: Arc<dyn LlmClient>,
    extractor: Arc<dyn PoiExtractor>,
    max_file_size: u64,
}

impl FileAnalysisWorker {
    pub fn new(
        store: Arc<SqliteStore>,
        llm: Arc<dyn LlmClient>,
        extractor: Arc<dyn PoiExtractor>,
        max_file_size: u64,
    ) -> Self {
        Self {
            store,
            llm,
            extractor,
            max_file_size,
        }
    }

    #[instrument(skip(self), fields(file = %file_path))]
    async fn analyze(&self, file_path: &str, run_id: &str) -> Result<()> {
        let bytes = tokio::fs::read(file_path)
            .await
            .map_err(|e| Error::Io(format!("read {file_path}: {e}")))?;

        let hash = {
            let mut hasher = Sha256::new();
            hasher.update(&bytes);
            format!("{:x}", hasher.finalize())
        };

        if let Some(existing) = self.store.file_by_path(run_id, file_path)? {
            if existing.content_hash == hash && existing.status == FileStatus::Processed {
                debug!("unchanged and already processed, skipping");
                return Ok(());
            }
        }
        let (file, _) = self.store.upsert_file(run_id, file_path, &hash)?;

        // Oversize files are truncated at the read boundary and the prompt
        // is annotated so the extractor knows the view is partial.
        let mut content = String::from_utf8_lossy(&bytes).into_owned();
        let truncated = content.len() as u64 > self.max_file_size;
        if truncated {
            let mut end = self.max_file_size as usize;
            while !content.is_char_boundary(end) {
                end -= 1;
            }
            content.truncate(end);
            warn!(size = bytes.len(), limit = self.max_file_size, "file truncated for analysis");
        }

        let prompt = self
            .extractor
            .build_file_prompt(Path::new(file_path), &content, truncated);
        let response = self.llm.call(&prompt).await?;

        let pois = match self.extractor.parse_pois(&response.body) {
            Ok(pois) => pois,
            Err(e) => {
                self.store
                    .set_file_status(run_id, file_path, FileStatus::Failed)?;
                return Err(e);
            }
        };

        if !pois.is_empty() {
            self.store.insert_pois_with_event(run_id, &file, &pois)?;
        }
        self.store
            .set_file_status(run_id, file_path, FileStatus::Processed)?;
        debug!(pois = pois.len(), "file analyzed");
        Ok(())
    }
}

#[async_trait]
impl Worker for FileAnalysisWorker {
    fn queue(&self) -> QueueName {
        QueueName::FileAnalysis
    }

    async fn process(&self, job: &Job) -> Result<()> {
        let JobPayload::FileAnalysis { file_path, run_id } = &job.payload else {
            return Err(Error::MalformedPayload(format!(
                "file-analysis job {} carries {:?}",
                job.id, job.payload
            )));
        };
        self.analyze(file_path, run_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{ExtractedPoi, LlmResponse, TokenUsage};
    use std::io::Write;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ScriptedLlm {
        calls: AtomicU32,
        fail_first: u32,
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        async fn call(&self, _prompt: &str) -> Result<LlmResponse> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                return Err(Error::timeout(150_000));
            }
            Ok(LlmResponse {
                body: "ok".to_string(),
                usage: TokenUsage::default(),
            })
        }
    }

    struct FixedExtractor {
        pois: Vec<ExtractedPoi>,
    }

    impl PoiExtractor for FixedExtractor {
        fn build_file_prompt(&self, path: &Path, _content: &str, _truncated: bool) -> String {
            format!("extract {}", path.display())
        }

        fn parse_pois(&self, _body: &str) -> Result<Vec<ExtractedPoi>> {
            Ok(self.pois.clone())
        }
    }

    fn sample_poi(name: &str) -> ExtractedPoi {
        ExtractedPoi {
            name: name.to_string(),
            category: "function".to_string(),
            start_line: 1,
            end_line: 2,
            is_exported: true,
            semantic_id: Some(format!("t:{name}")),
            quality_score: Some(0.9),
            snippet: format!("function {name}() {{}}"),
        }
    }

    fn job_for(path: &str) -> Job {
        Job {
            id: 1,
            queue: QueueName::FileAnalysis,
            payload: JobPayload::FileAnalysis {
                file_path: path.to_string(),
                run_id: "run-1".to_string(),
            },
            attempts: 0,
            origin_event_id: None,
            enqueued_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn analysis_persists_pois_and_marks_file_processed() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        writeln!(tmp, "function foo() {{ bar(); }}").unwrap();
        let path = tmp.path().to_string_lossy().to_string();

        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let worker = FileAnalysisWorker::new(
            Arc::clone(&store),
            Arc::new(ScriptedLlm { calls: AtomicU32::new(0), fail_first: 0 }),
            Arc::new(FixedExtractor { pois: vec![sample_poi("foo"), sample_poi("bar")] }),
            1_048_576,
        );

        worker.process(&job_for(&path)).await.unwrap();

        let file = store.file_by_path("run-1", &path).unwrap().unwrap();
        assert_eq!(file.status, FileStatus::Processed);
        assert_eq!(store.pois_by_file("run-1", &path).unwrap().len(), 2);
        assert_eq!(store.pending_outbox_count("run-1").unwrap(), 1);
    }

    #[tokio::test]
    async fn reprocessing_same_content_is_idempotent() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        writeln!(tmp, "function foo() {{}}").unwrap();
        let path = tmp.path().to_string_lossy().to_string();

        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let llm = Arc::new(ScriptedLlm { calls: AtomicU32::new(0), fail_first: 0 });
        let worker = FileAnalysisWorker::new(
            Arc::clone(&store),
            Arc::clone(&llm) as Arc<dyn LlmClient>,
            Arc::new(FixedExtractor { pois: vec![sample_poi("foo")] }),
            1_048_576,
        );

        worker.process(&job_for(&path)).await.unwrap();
        worker.process(&job_for(&path)).await.unwrap();

        // Second pass short-circuits before the LLM.
        assert_eq!(llm.calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.pois_by_file("run-1", &path).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn llm_timeout_surfaces_as_transient() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        writeln!(tmp, "function foo() {{}}").unwrap();
        let path = tmp.path().to_string_lossy().to_string();

        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let worker = FileAnalysisWorker::new(
            store,
            Arc::new(ScriptedLlm { calls: AtomicU32::new(0), fail_first: 2 }),
            Arc::new(FixedExtractor { pois: vec![sample_poi("foo")] }),
            1_048_576,
        );

        let err = worker.process(&job_for(&path)).await.unwrap_err();
        assert!(err.is_retryable());
        let err = worker.process(&job_for(&path)).await.unwrap_err();
        assert!(err.is_retryable());
        // Third attempt succeeds.
        worker.process(&job_for(&path)).await.unwrap();
    }

    #[tokio::test]
    async fn malformed_extractor_output_fails_the_file() {
        struct BrokenExtractor;
        impl PoiExtractor for BrokenExtractor {
            fn build_file_prompt(&self, _: &Path, _: &str, _: bool) -> String {
                String::new()
            }
            fn parse_pois(&self, _: &str) -> Result<Vec<ExtractedPoi>> {
                Err(Error::MalformedPayload("not json".into()))
            }
        }

        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        writeln!(tmp, "function foo() {{}}").unwrap();
        let path = tmp.path().to_string_lossy().to_string();

        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let worker = FileAnalysisWorker::new(
            Arc::clone(&store),
            Arc::new(ScriptedLlm { calls: AtomicU32::new(0), fail_first: 0 }),
            Arc::new(BrokenExtractor),
            1_048_576,
        );

        let err = worker.process(&job_for(&path)).await.unwrap_err();
        assert!(!err.is_retryable());
        let file = store.file_by_path("run-1", &path).unwrap().unwrap();
        assert_eq!(file.status, FileStatus::Failed);
    }
}
