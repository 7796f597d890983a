//! Public listener: forwards every request to a healthy worker, retrying
//! once on transport failure, and serves the supervisor status document.

use axum::{
    Json, Router,
    body::Body,
    extract::{Request, State},
    response::Response,
    routing::get,
};
use std::sync::Arc;

use crate::error::{Error, Result};

use super::{Supervisor, SupervisorStatus};

pub fn router(supervisor: Arc<Supervisor>) -> Router {
    Router::new()
        .route("/supervisor/status", get(status_handler))
        .fallback(forward)
        .with_state(supervisor)
}

/// GET /supervisor/status
async fn status_handler(State(supervisor): State<Arc<Supervisor>>) -> Json<SupervisorStatus> {
    Json(supervisor.status().await)
}

/// Forwards one request. The chosen worker owning a transport-level failure
/// is marked unhealthy and the request is retried once on the next healthy
/// worker; an HTTP error status from the worker is a valid answer and is
/// relayed as-is.
async fn forward(State(supervisor): State<Arc<Supervisor>>, request: Request) -> Result<Response> {
    let (parts, body) = request.into_parts();
    let bytes = axum::body::to_bytes(body, supervisor.proxy_body_limit())
        .await
        .map_err(|_| Error::PayloadTooLarge("request body exceeds the proxy limit".to_string()))?;

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let mut headers = parts.headers.clone();
    headers.remove(axum::http::header::HOST);
    headers.remove(axum::http::header::CONTENT_LENGTH);

    for attempt in 0..2u8 {
        let Some(port) = supervisor.pick_healthy().await else {
            break;
        };
        let url = format!("http://127.0.0.1:{}{}", port, path_and_query);

        let outcome = supervisor
            .http_client()
            .request(parts.method.clone(), &url)
            .headers(headers.clone())
            .body(bytes.clone())
            .send()
            .await;

        match outcome {
            Ok(upstream) => {
                let status = upstream.status();
                let mut builder = Response::builder().status(status);
                for (key, value) in upstream.headers() {
                    if key == axum::http::header::TRANSFER_ENCODING
                        || key == axum::http::header::CONNECTION
                        || key == axum::http::header::CONTENT_LENGTH
                    {
                        continue;
                    }
                    builder = builder.header(key, value);
                }
                let body = upstream.bytes().await?;
                return builder
                    .body(Body::from(body))
                    .map_err(|e| Error::Internal(format!("Failed to relay response: {}", e)));
            }
            Err(e) => {
                tracing::warn!(
                    port,
                    attempt,
                    error = %e,
                    "Dispatch to worker failed at transport level"
                );
                supervisor.mark_unhealthy(port).await;
            }
        }
    }

    Err(Error::ServiceUnavailable(
        "no healthy backend workers available".to_string(),
    ))
}
