use std::sync::Arc;
use std::time::Duration;

use models::{GlobalSampleIndex, Progress};
use serde::de::DeserializeOwned;

use crate::process::ProcessNextSamplesParams;
use crate::{Error, Result};

/// State-op RPCs block for up to a minute: a refill behind the head's
/// iteration lock can take a while on large blocks.
const STATE_OP_TIMEOUT: Duration = Duration::from_secs(60);

/// Worker-side iteration state: a thin proxy that forwards every
/// operation to the cluster head, which owns the canonical state.
pub struct ClusterStateOps {
    iteration_id: String,
    cluster: Arc<cluster::Cluster>,
}

impl ClusterStateOps {
    pub fn new(iteration_id: &str, cluster: Arc<cluster::Cluster>) -> Self {
        ClusterStateOps {
            iteration_id: iteration_id.to_string(),
            cluster,
        }
    }

    async fn head<T: DeserializeOwned>(&self, op: &str, mut body: serde_json::Value) -> Result<T> {
        if let Some(map) = body.as_object_mut() {
            map.insert(
                "node_url".to_string(),
                serde_json::Value::String(self.cluster.node_url.clone()),
            );
        }

        let path = format!("/iterations/{}/state/{op}", self.iteration_id);
        match self
            .cluster
            .head_post::<T>(&path, body, STATE_OP_TIMEOUT)
            .await
        {
            Ok(value) => Ok(value),
            // Exhaustion crosses the wire as a 400 whose detail carries
            // the NoMoreIndices message; surface it as the typed error.
            Err(cluster::Error::Status { detail, .. })
                if detail.contains("no more indices") =>
            {
                Err(Error::NoMoreIndices)
            }
            Err(err) => Err(Error::State {
                op: op.to_string(),
                reason: err.to_string(),
            }),
        }
    }
}

#[async_trait::async_trait]
impl super::IterationStateOps for ClusterStateOps {
    async fn exists(&self) -> Result<bool> {
        self.head("exists", serde_json::json!({})).await
    }

    async fn pushback_inprogress(&self) -> Result<()> {
        self.head("pushback_inprogress", serde_json::json!({})).await
    }

    async fn complete(&self, index: usize) -> Result<()> {
        self.head("complete", serde_json::json!({"index": index})).await
    }

    async fn filtered(&self, index: usize) -> Result<()> {
        self.head("filtered", serde_json::json!({"index": index})).await
    }

    async fn failed(&self, index: usize) -> Result<()> {
        self.head("failed", serde_json::json!({"index": index})).await
    }

    async fn next_item(&self, rank: u32) -> Result<GlobalSampleIndex> {
        self.head("next_item", serde_json::json!({"rank": rank})).await
    }

    async fn get_ranks(&self) -> Result<Vec<u32>> {
        self.head("get_ranks", serde_json::json!({})).await
    }

    async fn get_progress(&self) -> Result<Progress> {
        self.head("get_progress", serde_json::json!({})).await
    }

    async fn get_next_samples(&self, rank: u32) -> Result<(String, ProcessNextSamplesParams)> {
        self.head("get_next_samples", serde_json::json!({"rank": rank}))
            .await
    }
}
