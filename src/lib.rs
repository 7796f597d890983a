pub mod client;
pub mod config;
pub mod error;
pub mod handlers;
pub mod models;
pub mod services;
pub mod state;
pub mod storage;
pub mod supervisor;
pub mod utils;

pub use config::Config;
pub use error::{Error, Result};
pub use state::AppState;

/// Load configuration from environment variables
pub fn load_config() -> Result<Config> {
    Ok(Config::load()?)
}

/// Initialize tracing subscriber with environment filter
///
/// Reads the RUST_LOG environment variable to set the log level; defaults
/// to "info" when unset.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();
}

use axum::{
    Router,
    extract::{DefaultBodyLimit, Request},
    http::HeaderName,
    middleware as axum_middleware,
    middleware::Next,
    response::Response,
    routing::{delete, get, post},
};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::compression::CompressionLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

/// Middleware to add request ID to response headers
async fn request_id_middleware(mut req: Request, next: Next) -> Response {
    let request_id = req
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| {
            let id = Uuid::now_v7().to_string();
            if let Ok(value) = id.parse() {
                req.headers_mut()
                    .insert(HeaderName::from_static("x-request-id"), value);
            }
            id
        });

    let mut response = next.run(req).await;
    if let Ok(value) = request_id.parse() {
        response
            .headers_mut()
            .insert(HeaderName::from_static("x-request-id"), value);
    }

    response
}

/// Create the API routes
///
/// Shared by the worker server and the test apps so both serve exactly the
/// same surface.
pub fn create_api_router() -> Router<AppState> {
    use crate::handlers::{
        delete_file, download_file, download_version, health_check, list_conflicts, list_files,
        list_versions, rename_file, resolve_conflict, restore_version, upload_chunk, upload_safe,
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/files", get(list_files))
        .route("/files/upload-safe", post(upload_safe))
        .route("/files/chunk", post(upload_chunk))
        .route("/files/{name}/download", get(download_file))
        .route("/files/{name}/versions", get(list_versions))
        .route("/files/{name}/versions/{version}/download", get(download_version))
        .route("/files/{name}/restore/{version}", post(restore_version))
        .route("/files/{name}/rename", post(rename_file))
        .route("/files/{name}", delete(delete_file))
        .route("/conflicts", get(list_conflicts))
        .route("/conflicts/{id}/resolve", post(resolve_conflict))
}

/// Builds the full application: routes plus the middleware stack.
pub fn build_app(state: AppState) -> Router {
    let max_upload_bytes = state.config.server.max_upload_bytes;

    create_api_router()
        .layer(
            ServiceBuilder::new()
                .layer(axum_middleware::from_fn(request_id_middleware))
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(|request: &Request<_>| {
                            let request_id = request
                                .headers()
                                .get("x-request-id")
                                .and_then(|v| v.to_str().ok())
                                .unwrap_or("unknown");

                            tracing::info_span!(
                                "http_request",
                                method = %request.method(),
                                path = %request.uri().path(),
                                request_id = %request_id,
                            )
                        })
                        .on_request(
                            tower_http::trace::DefaultOnRequest::new().level(tracing::Level::DEBUG),
                        )
                        .on_response(
                            tower_http::trace::DefaultOnResponse::new()
                                .level(tracing::Level::DEBUG),
                        ),
                )
                .layer(SetResponseHeaderLayer::if_not_present(
                    axum::http::header::X_CONTENT_TYPE_OPTIONS,
                    axum::http::HeaderValue::from_static("nosniff"),
                ))
                .layer(
                    CorsLayer::new()
                        .allow_origin(Any)
                        .allow_methods(Any)
                        .allow_headers(Any),
                )
                .layer(CompressionLayer::new())
                .layer(DefaultBodyLimit::max(max_upload_bytes)),
        )
        .with_state(state)
}

/// Start one worker server
///
/// Binds the configured address, initializes the shared storage (including
/// the one-time metadata migration) and serves until ctrl-c.
pub async fn run_server(config: Config) -> Result<()> {
    let state = AppState::new(config.clone());
    state.init_storage().await?;

    let app = build_app(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr).await?;

    tracing::info!(
        storage_root = %config.storage.shared_root,
        "Worker listening on http://{}",
        addr
    );

    let shutdown_signal = async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install CTRL+C handler");
        tracing::info!("Shutdown signal received");
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    Ok(())
}
