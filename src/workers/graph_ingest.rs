//! Graph ingest worker.
//!
//! Projects VALIDATED relationships into the external graph sink with
//! batched idempotent upserts. The relationship's status in the relational
//! store is the only decision source; the sink is never read.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, instrument};

use crate::collaborators::{GraphEdge, GraphNode, GraphSink};
use crate::error::{Error, Result};
use crate::queue::{Job, JobPayload, QueueName};
use crate::store::{Poi, RelationshipStatus, SqliteStore};
use crate::workers::Worker;

pub struct GraphIngestWorker {
    store: Arc<SqliteStore>,
    sink: Arc<dyn GraphSink>,
}

impl GraphIngestWorker {
    pub fn new(store: Arc<SqliteStore>, sink: Arc<dyn GraphSink>) -> Self {
        Self { store, sink }
    }

    #[instrument(skip(self))]
    async fn ingest(&self, relationship_ids: &[i64]) -> Result<()> {
        let mut nodes: HashMap<i64, GraphNode> = HashMap::new();
        let mut edges = Vec::new();

        for &relationship_id in relationship_ids {
            let Some(rel) = self.store.relationship_by_id(relationship_id)? else {
                debug!(relationship_id, "relationship vanished, skipping");
                continue;
            };
            if rel.status != RelationshipStatus::Validated {
                debug!(relationship_id, status = rel.status.as_str(), "not validated, skipping");
                continue;
            }

            let source = self.store.poi_by_id(rel.source_poi_id)?;
            let target = self.store.poi_by_id(rel.target_poi_id)?;
            let (Some(source), Some(target)) = (source, target) else {
                return Err(Error::UnresolvedReference(format!(
                    "relationship {relationship_id} references missing POIs"
                )));
            };

            nodes.entry(source.id).or_insert_with(|| to_node(&source));
            nodes.entry(target.id).or_insert_with(|| to_node(&target));
            edges.push(GraphEdge {
                source_id: rel.source_poi_id,
                target_id: rel.target_poi_id,
                edge_type: rel.rel_type.clone(),
                confidence: rel.confidence,
            });
        }

        if nodes.is_empty() && edges.is_empty() {
            return Ok(());
        }

        let mut node_list: Vec<GraphNode> = nodes.into_values().collect();
        node_list.sort_by_key(|n| n.id);
        self.sink.upsert_batch(&node_list, &edges).await?;
        debug!(nodes = node_list.len(), edges = edges.len(), "batch projected");
        Ok(())
    }
}

fn to_node(poi: &Poi) -> GraphNode {
    GraphNode {
        id: poi.id,
        semantic_id: poi.semantic_id.clone(),
        name: poi.name.clone(),
        category: poi.category.clone(),
        file_path: poi.file_path.clone(),
        start_line: poi.start_line,
        end_line: poi.end_line,
    }
}

#[async_trait]
impl Worker for GraphIngestWorker {
    fn queue(&self) -> QueueName {
        QueueName::GraphIngest
    }

    async fn process(&self, job: &Job) -> Result<()> {
        let JobPayload::GraphIngest {
            relationship_ids, ..
        } = &job.payload
        else {
            return Err(Error::MalformedPayload(format!(
                "graph-ingest job {} carries {:?}",
                job.id, job.payload
            )));
        };
        self.ingest(relationship_ids).await
    }
}
