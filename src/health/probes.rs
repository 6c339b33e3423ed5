//! Dependency probes.
//!
//! Each probe round-trips a write-then-read where the dependency supports
//! it, and may carry a registered recovery action invoked after failures.
//! External services are never restarted from here.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::collaborators::GraphSink;
use crate::error::Result;
use crate::queue::{QueueBroker, QueueName};
use crate::store::SqliteStore;

/// Result of one probe attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeResult {
    pub name: String,
    pub healthy: bool,
    pub detail: String,
    pub latency_ms: u64,
}

impl ProbeResult {
    pub fn ok(name: &str, detail: impl Into<String>, latency_ms: u64) -> Self {
        Self {
            name: name.to_string(),
            healthy: true,
            detail: detail.into(),
            latency_ms,
        }
    }

    pub fn unhealthy(name: &str, detail: impl Into<String>, latency_ms: u64) -> Self {
        Self {
            name: name.to_string(),
            healthy: false,
            detail: detail.into(),
            latency_ms,
        }
    }
}

/// A probed dependency with an optional recovery action.
#[async_trait]
pub trait DependencyProbe: Send + Sync {
    /// Stable dependency name for alert dedup.
    fn name(&self) -> &'static str;

    /// One probe attempt.
    async fn probe(&self) -> ProbeResult;

    /// Bounded recovery action; default none.
    async fn recover(&self) -> Result<()> {
        Ok(())
    }
}

/// Relational store probe: write-then-read round trip.
pub struct StoreProbe {
    store: Arc<SqliteStore>,
}

impl StoreProbe {
    pub fn new(store: Arc<SqliteStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl DependencyProbe for StoreProbe {
    fn name(&self) -> &'static str {
        "store"
    }

    async fn probe(&self) -> ProbeResult {
        let started = Instant::now();
        match self.store.probe_roundtrip() {
            Ok(()) => ProbeResult::ok(
                self.name(),
                "write-then-read ok",
                started.elapsed().as_millis() as u64,
            ),
            Err(e) => ProbeResult::unhealthy(
                self.name(),
                e.to_string(),
                started.elapsed().as_millis() as u64,
            ),
        }
    }

    async fn recover(&self) -> Result<()> {
        // Checkpointing clears WAL growth, the usual slow-store culprit.
        self.store.checkpoint()
    }
}

/// Queue broker probe: counter round trip over every queue.
pub struct BrokerProbe {
    broker: Arc<QueueBroker>,
}

impl BrokerProbe {
    pub fn new(broker: Arc<QueueBroker>) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl DependencyProbe for BrokerProbe {
    fn name(&self) -> &'static str {
        "broker"
    }

    async fn probe(&self) -> ProbeResult {
        let started = Instant::now();
        let mut backlog = 0;
        for queue in QueueName::ALL {
            backlog += self.broker.counts(queue).await.backlog();
        }
        ProbeResult::ok(
            self.name(),
            format!("backlog {backlog}"),
            started.elapsed().as_millis() as u64,
        )
    }
}

/// Graph sink probe: an empty idempotent batch.
pub struct SinkProbe {
    sink: Arc<dyn GraphSink>,
}

impl SinkProbe {
    pub fn new(sink: Arc<dyn GraphSink>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl DependencyProbe for SinkProbe {
    fn name(&self) -> &'static str {
        "graph-sink"
    }

    async fn probe(&self) -> ProbeResult {
        let started = Instant::now();
        match self.sink.upsert_batch(&[], &[]).await {
            Ok(()) => ProbeResult::ok(
                self.name(),
                "empty batch ok",
                started.elapsed().as_millis() as u64,
            ),
            Err(e) => ProbeResult::unhealthy(
                self.name(),
                e.to_string(),
                started.elapsed().as_millis() as u64,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn store_probe_round_trips() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let result = StoreProbe::new(store).probe().await;
        assert!(result.healthy);
    }

    #[tokio::test]
    async fn broker_probe_reports_backlog() {
        let broker = Arc::new(QueueBroker::new(Default::default(), Default::default()));
        let result = BrokerProbe::new(broker).probe().await;
        assert!(result.healthy);
        assert!(result.detail.contains("backlog 0"));
    }
}
