use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use models::NodeStatus;
use serde::Deserialize;

use crate::{ApiError, App};

#[derive(Deserialize)]
pub struct NodeParams {
    pub node_url: String,
}

fn head_cluster(app: &App) -> Result<Arc<cluster::Cluster>, ApiError> {
    let cluster = app
        .cluster
        .clone()
        .ok_or_else(|| ApiError::bad_request("Cluster not enabled"))?;
    if !cluster.is_head() {
        return Err(ApiError::new(
            axum::http::StatusCode::FORBIDDEN,
            "Not allowed",
        ));
    }
    Ok(cluster)
}

pub async fn register(
    State(app): State<Arc<App>>,
    Json(params): Json<NodeParams>,
) -> Result<Json<()>, ApiError> {
    let cluster = head_cluster(&app)?;
    // Registration waits for the worker's readiness probe; do it off the
    // request so the worker's own register call can return.
    tokio::spawn(async move {
        if let Err(err) = cluster.on_register(&params.node_url).await {
            tracing::error!(node_url = params.node_url, %err, "node registration failed");
        }
    });
    Ok(Json(()))
}

pub async fn deregister(
    State(app): State<Arc<App>>,
    Json(params): Json<NodeParams>,
) -> Result<Json<()>, ApiError> {
    let cluster = head_cluster(&app)?;
    cluster
        .on_deregister(&params.node_url)
        .await
        .map_err(anyhow::Error::from)?;
    Ok(Json(()))
}

pub async fn heartbeat(
    State(app): State<Arc<App>>,
    Json(params): Json<NodeParams>,
) -> Result<Json<()>, ApiError> {
    let cluster = head_cluster(&app)?;
    cluster
        .on_heartbeat(&params.node_url)
        .await
        .map_err(anyhow::Error::from)?;
    Ok(Json(()))
}

pub async fn nodes(State(app): State<Arc<App>>) -> Result<Json<Vec<NodeStatus>>, ApiError> {
    let cluster = head_cluster(&app)?;
    Ok(Json(
        cluster.node_statuses().await.map_err(anyhow::Error::from)?,
    ))
}
