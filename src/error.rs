use thiserror::Error;

// Import Axum types for HTTP response conversion
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::models::requests::ConflictNotice;

/// The custom error type for the application.
#[derive(Debug, Error)]
pub enum Error {
    /// A request is missing required fields or carries malformed values.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// A not found error (file, version or conflict does not exist).
    #[error("Not found: {0}")]
    NotFound(String),

    /// The server detected a simultaneous modification of a file.
    ///
    /// Carries the structured conflict document when the sliding-window
    /// engine produced one, so the 409 body can name the winner, the losers
    /// and the conflict copy.
    #[error("Conflict: {message}")]
    Conflict {
        message: String,
        notice: Option<Box<ConflictNotice>>,
    },

    /// An upload exceeded the configured body limit.
    #[error("Payload too large: {0}")]
    PayloadTooLarge(String),

    /// No healthy backend worker is available to serve the request.
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// A chunk was empty or missing during assembly.
    #[error("Corrupt chunk: {0}")]
    Corrupt(String),

    /// A transport-level failure between supervisor and worker.
    ///
    /// Triggers one retry on the next healthy worker; only escapes the
    /// supervisor when the retry fails too.
    #[error("Transient transport failure: {0}")]
    Transient(String),

    /// An error originating from IO operations.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A JSON serialization error.
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// A configuration error.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// An error originating from the HTTP client.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// An internal server error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A type alias for `Result<T, Error>` to simplify function signatures.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Shorthand for a simple conflict without a structured document.
    pub fn conflict(message: impl Into<String>) -> Self {
        Error::Conflict {
            message: message.into(),
            notice: None,
        }
    }
}

/// Helper function to create standardized error response bodies
fn create_error_body(error: &str, message: String, action: Option<&str>) -> serde_json::Value {
    match action {
        Some(action) => serde_json::json!({ "error": error, "message": message, "action": action }),
        None => serde_json::json!({ "error": error, "message": message }),
    }
}

/// Log error at appropriate level based on error type
/// Client-facing errors (4xx) are logged as warnings, server errors (5xx) as errors
fn log_error(error: &Error, error_code: &str, status_code: u16) {
    if status_code >= 500 {
        tracing::error!(
            error_code,
            error = %error,
            status_code,
            "Error returned to client"
        );
    } else {
        tracing::warn!(
            error_code,
            error = %error,
            status_code,
            "Error returned to client"
        );
    }
}

/// Convert custom Error to HTTP response
///
/// Maps each error variant to an appropriate HTTP status code and a JSON
/// body of the form `{error, message, action?}`. Conflict responses embed
/// the full conflict document alongside the error fields.
impl IntoResponse for Error {
    fn into_response(self) -> Response {
        // Log the error before returning response using helper
        log_error(&self, self.error_code(), self.status_code().as_u16());

        let (body, status) = match self {
            Error::BadRequest(msg) => (
                create_error_body("bad_request", msg, None),
                StatusCode::BAD_REQUEST,
            ),
            Error::NotFound(msg) => (
                create_error_body("not_found", msg, None),
                StatusCode::NOT_FOUND,
            ),
            Error::Conflict { message, notice } => {
                let mut body = create_error_body("conflict", message, None);
                if let Some(notice) = notice {
                    // Flatten the conflict document into the error body so
                    // losing clients can read winner/losers/conflict_file_name
                    // without a second request.
                    if let (Some(obj), Ok(serde_json::Value::Object(doc))) =
                        (body.as_object_mut(), serde_json::to_value(*notice))
                    {
                        obj.extend(doc);
                    }
                }
                (body, StatusCode::CONFLICT)
            }
            Error::PayloadTooLarge(msg) => (
                create_error_body("payload_too_large", msg, Some("use_chunked_upload")),
                StatusCode::PAYLOAD_TOO_LARGE,
            ),
            Error::ServiceUnavailable(msg) => (
                create_error_body("service_unavailable", msg, Some("retry")),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            Error::Corrupt(msg) => (
                create_error_body("corrupt_chunk", msg, None),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            Error::Transient(msg) => (
                create_error_body("bad_gateway", msg, Some("retry")),
                StatusCode::BAD_GATEWAY,
            ),
            Error::Io(_) => (
                create_error_body("internal_error", "IO error".to_string(), None),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            Error::Json(e) => (
                create_error_body("bad_request", format!("Invalid JSON payload: {}", e), None),
                StatusCode::BAD_REQUEST,
            ),
            Error::Config(_) => (
                create_error_body("internal_error", "Configuration error".to_string(), None),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            Error::Http(e) => (
                create_error_body("bad_gateway", format!("Upstream request failed: {}", e), None),
                StatusCode::BAD_GATEWAY,
            ),
            Error::Internal(msg) => (
                create_error_body("internal_error", msg, None),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        };

        (status, Json(body)).into_response()
    }
}

impl Error {
    /// Helper method to get the HTTP status code for an error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::BadRequest(_) | Error::Json(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Conflict { .. } => StatusCode::CONFLICT,
            Error::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Error::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Transient(_) | Error::Http(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Helper method to get the error code for logging
    fn error_code(&self) -> &'static str {
        match self {
            Error::BadRequest(_) => "BAD_REQUEST",
            Error::NotFound(_) => "NOT_FOUND",
            Error::Conflict { .. } => "CONFLICT",
            Error::PayloadTooLarge(_) => "PAYLOAD_TOO_LARGE",
            Error::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            Error::Corrupt(_) => "CORRUPT_CHUNK",
            Error::Transient(_) => "TRANSIENT",
            Error::Io(_) => "INTERNAL_ERROR",
            Error::Json(_) => "JSON_ERROR",
            Error::Config(_) => "CONFIG_ERROR",
            Error::Http(_) => "HTTP_ERROR",
            Error::Internal(_) => "INTERNAL_ERROR",
        }
    }
}
