//! Pipeline lifecycle: wiring, discovery, worker supervision, termination
//! detection, and the run summary.
//!
//! The pipeline is a passed-in value with an explicit lifecycle, never a
//! module-level singleton; everything it owns is built in `new` and torn
//! down when `run` returns. A run is terminal when every queue is drained,
//! no unpublished outbox events remain for the run, and no worker slot is
//! active.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::collaborators::Collaborators;
use crate::config::PipelineConfig;
use crate::confidence::ConfidenceScorer;
use crate::error::{Error, Result};
use crate::health::{Alert, BrokerProbe, HealthMonitor, HealthReport, SinkProbe, StoreProbe};
use crate::outbox::OutboxPublisher;
use crate::pool::{ProcResourceProbe, ResourceProbe, WorkerPoolManager};
use crate::queue::{JobPayload, QueueBroker, QueueName, RetryPolicy};
use crate::store::{NormalizationReport, RunCounts, RunState, SqliteStore};
use crate::workers::{
    run_worker, DirectoryResolutionWorker, FileAnalysisWorker, GraphIngestWorker,
    RelationshipResolutionWorker, TriangulationWorker, ValidationWorker, Worker,
};

/// Process exit codes for the embedding binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitCode {
    /// Run completed.
    Completed,
    /// Configuration invariant violated.
    ConfigError,
    /// A dependency stayed down past recovery.
    DependencyOutage,
    /// Relational store corruption.
    Corruption,
    /// Stopped by operator.
    Stopped,
}

impl ExitCode {
    pub fn code(&self) -> i32 {
        match self {
            Self::Completed => 0,
            Self::ConfigError => 1,
            Self::DependencyOutage => 2,
            Self::Corruption => 3,
            Self::Stopped => 4,
        }
    }

    fn for_fatal(error: &Error) -> Self {
        match error {
            Error::Config(_) => Self::ConfigError,
            Error::Corruption(_) => Self::Corruption,
            Error::Stopped => Self::Stopped,
            _ => Self::DependencyOutage,
        }
    }
}

/// Machine-readable per-run summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub exit: ExitCode,
    pub counts: RunCounts,
    pub dead_lettered: usize,
    pub normalization: NormalizationReport,
    pub alerts: Vec<Alert>,
    pub health_history: Vec<HealthReport>,
}

impl RunSummary {
    /// The JSON artifact written for operators.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// The assembled pipeline.
pub struct Pipeline {
    config: PipelineConfig,
    collaborators: Collaborators,
    store: Arc<SqliteStore>,
    broker: Arc<QueueBroker>,
    pool: Arc<WorkerPoolManager>,
    scorer: Arc<ConfidenceScorer>,
    publisher: Arc<OutboxPublisher>,
    health: Arc<HealthMonitor>,
    resource_probe: Arc<dyn ResourceProbe>,
    stop_requested: Arc<AtomicBool>,
    normalization: NormalizationReport,
    fatal_tx: mpsc::Sender<Error>,
    fatal_rx: tokio::sync::Mutex<mpsc::Receiver<Error>>,
}

impl Pipeline {
    /// Build a pipeline from validated configuration and collaborators.
    pub fn new(config: PipelineConfig, collaborators: Collaborators) -> Result<Self> {
        Self::with_resource_probe(config, collaborators, Arc::new(ProcResourceProbe::new()))
    }

    /// Build with an injected resource probe (tests use a stub).
    pub fn with_resource_probe(
        config: PipelineConfig,
        collaborators: Collaborators,
        resource_probe: Arc<dyn ResourceProbe>,
    ) -> Result<Self> {
        config.validate()?;

        let store = Arc::new(match &config.store.path {
            Some(path) => SqliteStore::open(path, config.store.wal_enabled)?,
            None => SqliteStore::in_memory()?,
        });
        let normalization = if config.run.normalize_on_startup {
            store.normalize()?
        } else {
            NormalizationReport::default()
        };

        let mut backpressure = HashMap::new();
        for queue in QueueName::ALL {
            backpressure.insert(queue, config.backpressure_for(queue));
        }
        let broker = Arc::new(QueueBroker::new(
            RetryPolicy::new(config.retry),
            backpressure,
        ));

        let pool = Arc::new(WorkerPoolManager::new(&config));
        for queue in QueueName::ALL {
            let class = queue.as_str();
            pool.register_class(
                class,
                config.limits_for(class),
                config.rate_limits.get(class).copied(),
            );
        }

        let scorer = Arc::new(ConfidenceScorer::new(config.confidence));
        let publisher = Arc::new(OutboxPublisher::new(
            Arc::clone(&store),
            Arc::clone(&broker),
            Arc::clone(&scorer),
            config.outbox,
        ));

        let (fatal_tx, fatal_rx) = mpsc::channel(16);
        let health = Arc::new(HealthMonitor::new(
            vec![
                Arc::new(StoreProbe::new(Arc::clone(&store))),
                Arc::new(BrokerProbe::new(Arc::clone(&broker))),
                Arc::new(SinkProbe::new(Arc::clone(&collaborators.sink))),
            ],
            Arc::clone(&pool),
            Arc::clone(&store),
            Arc::clone(&resource_probe),
            config.health,
            config.run.stop_on_fatal_dependency,
            fatal_tx.clone(),
        ));

        Ok(Self {
            config,
            collaborators,
            store,
            broker,
            pool,
            scorer,
            publisher,
            health,
            resource_probe,
            stop_requested: Arc::new(AtomicBool::new(false)),
            normalization,
            fatal_tx,
            fatal_rx: tokio::sync::Mutex::new(fatal_rx),
        })
    }

    /// The store, for inspection after a run.
    pub fn store(&self) -> &Arc<SqliteStore> {
        &self.store
    }

    /// Request an operator stop; in-flight jobs finish or hit their own
    /// timeouts, and the run summary reports exit code 4.
    pub fn stop(&self) {
        self.stop_requested.store(true, Ordering::Release);
    }

    /// Process one target tree to completion.
    pub async fn run(&self, target_dir: &Path, run_id: &str) -> Result<RunSummary> {
        self.store
            .append_run_status(run_id, RunState::Started, None)?;
        self.cache_hint(run_id, "STARTED").await;
        info!(run_id, target = %target_dir.display(), "run started");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = JoinSet::new();

        // Workers, one polling task per unit of the class's upper bound;
        // actual parallelism is governed by slot admission.
        for worker in self.build_workers() {
            let spawn_count = self
                .config
                .limits_for(worker.queue().as_str())
                .max
                .clamp(1, 8);
            for _ in 0..spawn_count {
                tasks.spawn(run_worker(
                    Arc::clone(&worker),
                    Arc::clone(&self.broker),
                    Arc::clone(&self.pool),
                    shutdown_rx.clone(),
                    self.fatal_tx.clone(),
                ));
            }
        }

        tasks.spawn(Arc::clone(&self.publisher).run(shutdown_rx.clone()));
        tasks.spawn(Arc::clone(&self.health).run(shutdown_rx.clone()));
        tasks.spawn(scaling_loop(
            Arc::clone(&self.pool),
            Arc::clone(&self.resource_probe),
            self.config.run.adaptive_interval_ms,
            self.config.run.resource_interval_ms,
            shutdown_rx.clone(),
        ));

        // Discovery feeds the first queue, honoring backpressure.
        let discovery = self.discover_and_enqueue(target_dir, run_id).await;
        let outcome = match discovery {
            Ok(file_count) => {
                if file_count > 0 {
                    self.store
                        .append_run_status(run_id, RunState::Processing, None)?;
                    self.cache_hint(run_id, "PROCESSING").await;
                }
                self.await_termination(run_id).await
            }
            Err(e) => Err(e),
        };

        // Orderly shutdown: stop intake, drain in-flight slots, flush the
        // outbox one final time.
        let _ = shutdown_tx.send(true);
        while tokio::time::timeout(Duration::from_secs(5), tasks.join_next())
            .await
            .ok()
            .flatten()
            .is_some()
        {}
        let _ = self.publisher.tick().await;

        let (state, exit) = match &outcome {
            Ok(()) => (RunState::Completed, ExitCode::Completed),
            Err(Error::Stopped) => (RunState::Failed, ExitCode::Stopped),
            Err(e) => (RunState::Failed, ExitCode::for_fatal(e)),
        };

        let counts = self.store.run_counts(run_id)?;
        self.store.append_run_status(
            run_id,
            state,
            Some(&serde_json::json!({
                "files_processed": counts.files_processed,
                "pois": counts.pois,
                "relationships_validated": counts.relationships_validated,
            })),
        )?;
        self.cache_hint(run_id, state.as_str()).await;

        let summary = RunSummary {
            run_id: run_id.to_string(),
            exit,
            counts,
            dead_lettered: self.broker.dead_letter_total().await,
            normalization: self.normalization,
            alerts: self.health.alerts(),
            health_history: self.health.history(),
        };
        info!(run_id, exit = summary.exit.code(), "run finished");
        Ok(summary)
    }

    fn build_workers(&self) -> Vec<Arc<dyn Worker>> {
        vec![
            Arc::new(FileAnalysisWorker::new(
                Arc::clone(&self.store),
                Arc::clone(&self.collaborators.llm),
                Arc::clone(&self.collaborators.extractor),
                self.config.run.max_file_size_bytes,
            )),
            Arc::new(DirectoryResolutionWorker::new(Arc::clone(&self.store))),
            Arc::new(RelationshipResolutionWorker::new(Arc::clone(&self.store))),
            Arc::new(ValidationWorker::new(
                Arc::clone(&self.store),
                Arc::clone(&self.scorer),
            )),
            Arc::new(TriangulationWorker::new(
                Arc::clone(&self.store),
                Arc::clone(&self.scorer),
                self.config.triangulation.clone(),
            )),
            Arc::new(GraphIngestWorker::new(
                Arc::clone(&self.store),
                Arc::clone(&self.collaborators.sink),
            )),
        ]
    }

    async fn discover_and_enqueue(&self, target_dir: &Path, run_id: &str) -> Result<usize> {
        let files = self.collaborators.discoverer.walk(target_dir)?;
        let mut directories = BTreeSet::new();
        let mut enqueued = 0;

        for file in &files {
            let path = file.path.to_string_lossy().into_owned();
            if let Some(parent) = file.path.parent() {
                directories.insert(parent.to_string_lossy().into_owned());
            }

            let (_, dirty) = self.store.upsert_file(run_id, &path, &file.hash)?;
            if !dirty {
                continue;
            }

            // Producer-side backpressure: pause intake while the analysis
            // queue sits above its high watermark.
            while self.broker.is_saturated(QueueName::FileAnalysis).await {
                if self.stop_requested.load(Ordering::Acquire) {
                    return Err(Error::Stopped);
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }

            self.broker
                .enqueue(
                    JobPayload::FileAnalysis {
                        file_path: path,
                        run_id: run_id.to_string(),
                    },
                    None,
                )
                .await?;
            enqueued += 1;
        }

        for directory in directories {
            self.broker
                .enqueue(
                    JobPayload::DirectoryResolution {
                        directory,
                        run_id: run_id.to_string(),
                    },
                    None,
                )
                .await?;
        }

        info!(run_id, files = files.len(), enqueued, "discovery complete");
        Ok(enqueued)
    }

    /// Block until the run is terminal, the operator stops it, or a fatal
    /// error surfaces.
    async fn await_termination(&self, run_id: &str) -> Result<()> {
        let mut fatal_rx = self.fatal_rx.lock().await;
        loop {
            if let Ok(e) = fatal_rx.try_recv() {
                warn!(run_id, error = %e, "fatal error, terminating run");
                return Err(e);
            }
            if self.stop_requested.load(Ordering::Acquire) {
                return Err(Error::Stopped);
            }

            let drained = self.broker.drained().await;
            let pending_events = self.store.pending_outbox_count(run_id)?;
            let active = self.pool.global_active();
            if drained && pending_events == 0 && active == 0 {
                return Ok(());
            }

            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Best-effort run-status hint for the optional cache; loss-tolerant.
    async fn cache_hint(&self, run_id: &str, status: &str) {
        if let Some(cache) = &self.collaborators.cache {
            cache.put(&format!("run:{run_id}:status"), status).await;
        }
    }
}

async fn scaling_loop(
    pool: Arc<WorkerPoolManager>,
    probe: Arc<dyn ResourceProbe>,
    adaptive_interval_ms: u64,
    resource_interval_ms: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut adaptive = tokio::time::interval(Duration::from_millis(adaptive_interval_ms));
    let mut resource = tokio::time::interval(Duration::from_millis(resource_interval_ms));
    loop {
        tokio::select! {
            _ = adaptive.tick() => pool.scaling_tick(),
            _ = resource.tick() => pool.resource_tick(probe.snapshot()),
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
