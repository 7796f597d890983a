//! Conflict inspection and resolution handlers.

use axum::{
    Json,
    extract::{Path, State},
};

use crate::{
    error::Result,
    models::{ConflictRecord, ConflictResolution, ResolveConflictRequest},
    state::AppState,
};

use super::log_handler_error;

/// GET /conflicts
///
/// Lists all conflict records, newest first.
pub async fn list_conflicts(State(state): State<AppState>) -> Result<Json<Vec<ConflictRecord>>> {
    let conflicts = state
        .metadata
        .get_conflicts()
        .await
        .inspect_err(|e| log_handler_error("list_conflicts", e))?;
    Ok(Json(conflicts))
}

/// POST /conflicts/{id}/resolve
///
/// Marks a conflict resolved, storing how and when. Resolution happens
/// exactly once; a second attempt is a 409.
pub async fn resolve_conflict(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<ResolveConflictRequest>,
) -> Result<Json<serde_json::Value>> {
    tracing::info!(
        operation = "resolve_conflict",
        conflict_id = %id,
        method = %request.method,
        "Resolving conflict",
    );

    let resolved = state
        .metadata
        .resolve_conflict(
            &id,
            ConflictResolution {
                method: request.method,
                keep_version: request.keep_version,
                client_id: request.client_id,
            },
        )
        .await
        .inspect_err(|e| log_handler_error("resolve_conflict", e))?;

    Ok(Json(serde_json::json!({
        "success": true,
        "message": format!("Conflict '{}' resolved", id),
        "conflict": resolved,
    })))
}
