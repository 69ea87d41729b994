use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::App;

/// Middleware guarding cluster-internal routes: the request must carry
/// the salted shared-secret digest in an HTTP Basic header.
pub async fn require_cluster_auth(
    State(app): State<Arc<App>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(cluster) = &app.cluster else {
        return crate::ApiError::bad_request("Cluster not enabled").into_response();
    };

    let authorized = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(cluster::decode_basic_auth)
        .map(|(salt, digest)| cluster.is_valid_auth(&salt, &digest))
        .unwrap_or(false);

    if !authorized {
        return crate::ApiError::new(StatusCode::UNAUTHORIZED, "Invalid cluster auth")
            .into_response();
    }
    next.run(request).await
}
