//! Queue consumers.
//!
//! Every worker implements [`Worker`] and runs inside [`run_worker`], which
//! owns the reserve/process/ack cycle: slot admission and the circuit
//! breaker wrap the processing future, transient failures nack with backoff,
//! everything else dead-letters, and fatal errors additionally signal the
//! pipeline to shut down.

mod directory_resolution;
mod file_analysis;
mod graph_ingest;
mod lookup;
mod relationship_resolution;
mod triangulation;
mod validation;

pub use directory_resolution::DirectoryResolutionWorker;
pub use file_analysis::FileAnalysisWorker;
pub use graph_ingest::GraphIngestWorker;
pub use lookup::{synthesize_candidates, LookupMaps};
pub use relationship_resolution::RelationshipResolutionWorker;
pub use triangulation::TriangulationWorker;
pub use validation::ValidationWorker;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, warn};

use crate::error::{Error, ErrorKind, Result};
use crate::pool::WorkerPoolManager;
use crate::queue::{Job, QueueBroker, QueueName};

/// Sleep between empty reserve attempts.
const IDLE_POLL: Duration = Duration::from_millis(25);

/// A queue consumer.
#[async_trait]
pub trait Worker: Send + Sync {
    /// The queue this worker consumes.
    fn queue(&self) -> QueueName;

    /// Per-job processing timeout.
    fn timeout(&self) -> Duration {
        default_timeout(self.queue())
    }

    /// Process one job to completion.
    async fn process(&self, job: &Job) -> Result<()>;
}

/// Default processing timeout per queue: the LLM-bound class gets 150 s,
/// graph batches 60 s, everything else 30 s.
pub fn default_timeout(queue: QueueName) -> Duration {
    match queue {
        QueueName::FileAnalysis => Duration::from_secs(150),
        QueueName::GraphIngest => Duration::from_secs(60),
        _ => Duration::from_secs(30),
    }
}

/// Consume a queue until shutdown.
pub async fn run_worker(
    worker: Arc<dyn Worker>,
    broker: Arc<QueueBroker>,
    pool: Arc<WorkerPoolManager>,
    shutdown: watch::Receiver<bool>,
    fatal: mpsc::Sender<Error>,
) {
    let queue = worker.queue();
    let class = queue.as_str();
    let timeout = worker.timeout();
    // Visibility comfortably outlasts the processing timeout so healthy jobs
    // are never redelivered mid-flight.
    let visibility = timeout + Duration::from_secs(30);

    loop {
        if *shutdown.borrow() {
            break;
        }

        let Some(job) = broker.reserve(queue, visibility).await else {
            tokio::time::sleep(IDLE_POLL).await;
            continue;
        };

        let result = pool
            .execute_with_management(class, timeout, worker.process(&job))
            .await;

        match result {
            Ok(()) => {
                if let Err(e) = broker.ack(&job).await {
                    warn!(job_id = job.id, queue = %queue, error = %e, "ack failed");
                }
            }
            // Slot contention is not the job's fault: hand it back without
            // burning a retry attempt and back off briefly.
            Err(Error::Throttled { .. }) | Err(Error::RateLimited { .. }) => {
                let _ = broker.release(&job).await;
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Err(e) => match e.kind() {
                ErrorKind::Transient => {
                    debug!(job_id = job.id, queue = %queue, error = %e, "transient failure, retrying");
                    if let Err(nack_err) = broker.nack(&job, &e.to_string()).await {
                        warn!(job_id = job.id, error = %nack_err, "nack failed");
                    }
                }
                ErrorKind::Domain | ErrorKind::DataIntegrity => {
                    warn!(job_id = job.id, queue = %queue, error = %e, "non-retryable failure recorded");
                    let _ = broker.dead_letter(&job, &e.to_string()).await;
                }
                ErrorKind::Fatal => {
                    error!(job_id = job.id, queue = %queue, error = %e, "fatal failure, halting run");
                    let _ = broker.dead_letter(&job, &e.to_string()).await;
                    let _ = fatal.send(e).await;
                }
            },
        }
    }
}
