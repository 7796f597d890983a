//! File management handlers
//!
//! HTTP handlers for upload, download, versioning, rename and delete.
//! Handlers follow the thin-layer pattern: they validate inputs, delegate to
//! the stores and services, and shape responses.

use axum::{
    Json,
    extract::{Multipart, Path, State, multipart::MultipartError},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::{
    error::{Error, Result},
    models::{
        ChunkResponse, FileListing, FileRecord, MessageResponse, RenameRequest, RestoreRequest,
        UploadResponse, parse_last_modified,
    },
    services::{ChunkOutcome, ChunkPart, SafeUpload, SafeUploadOutcome},
    state::AppState,
    storage::validate_file_name,
    utils::generate_id,
};

use super::log_handler_error;

fn multipart_err(e: MultipartError) -> Error {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        Error::PayloadTooLarge("upload exceeds the configured body limit".to_string())
    } else {
        Error::BadRequest(format!("invalid multipart body: {}", e))
    }
}

fn require<T>(value: Option<T>, field: &str) -> Result<T> {
    value.ok_or_else(|| Error::BadRequest(format!("multipart field '{}' is required", field)))
}

// ============================================================================
// LISTING
// ============================================================================

/// GET /files
///
/// Returns, per existing current blob, the latest version's metadata.
pub async fn list_files(State(state): State<AppState>) -> Result<Json<Vec<FileListing>>> {
    let names = state.content.list().await?;
    let records = state.metadata.get_all().await?;

    let mut by_name: HashMap<&str, Vec<&FileRecord>> = HashMap::new();
    for record in &records {
        by_name.entry(record.file_name.as_str()).or_default().push(record);
    }

    let mut listing = Vec::with_capacity(names.len());
    for name in &names {
        let Some(group) = by_name.get(name.as_str()) else {
            tracing::warn!(file_name = %name, "Blob present without metadata, skipping in listing");
            continue;
        };
        let Some(latest) = group.iter().max_by_key(|r| r.version) else {
            continue;
        };
        listing.push(FileListing {
            name: name.clone(),
            last_modified: latest.last_modified,
            size: latest.size,
            version: latest.version,
            client_id: latest.client_id.clone(),
            total_versions: group.len() as u64,
            checksum: latest.checksum.clone(),
        });
    }

    Ok(Json(listing))
}

// ============================================================================
// SAFE UPLOAD
// ============================================================================

/// POST /files/upload-safe
///
/// Whole-file upload through the sliding-window conflict engine. Multipart
/// fields: `file`, `file_name`, `client_id`, `last_modified`.
pub async fn upload_safe(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>> {
    let mut bytes: Option<Bytes> = None;
    let mut file_name: Option<String> = None;
    let mut client_id: Option<String> = None;
    let mut last_modified: Option<DateTime<Utc>> = None;

    while let Some(field) = multipart.next_field().await.map_err(multipart_err)? {
        match field.name().unwrap_or_default() {
            "file" => bytes = Some(field.bytes().await.map_err(multipart_err)?),
            "file_name" => file_name = Some(field.text().await.map_err(multipart_err)?),
            "client_id" => client_id = Some(field.text().await.map_err(multipart_err)?),
            "last_modified" => {
                last_modified = Some(parse_last_modified(
                    &field.text().await.map_err(multipart_err)?,
                )?)
            }
            _ => {}
        }
    }

    let bytes = require(bytes, "file")?;
    let file_name = require(file_name.filter(|s| !s.is_empty()), "file_name")?;
    let client_id = require(client_id.filter(|s| !s.is_empty()), "client_id")?;
    let last_modified = require(last_modified, "last_modified")?;
    validate_file_name(&file_name)?;

    tracing::info!(
        operation = "upload_safe",
        file_name = %file_name,
        client_id = %client_id,
        size = bytes.len(),
        "Processing safe upload",
    );

    let outcome = state
        .window
        .process_upload(
            &state.content,
            &state.metadata,
            SafeUpload {
                file_name: file_name.clone(),
                client_id,
                last_modified,
                bytes,
            },
        )
        .await
        .inspect_err(|e| log_handler_error("upload_safe", e))?;

    match outcome {
        SafeUploadOutcome::Created { record } => Ok(Json(UploadResponse {
            success: true,
            message: "File uploaded successfully".to_string(),
            file: record,
            conflict_id: None,
            duplicate: false,
        })),
        SafeUploadOutcome::AlreadyUpToDate { record } => Ok(Json(UploadResponse {
            success: true,
            message: "File already up-to-date, no new version created".to_string(),
            file: record,
            conflict_id: None,
            duplicate: true,
        })),
        SafeUploadOutcome::ConflictWinner { record, conflict_id } => Ok(Json(UploadResponse {
            success: true,
            message: "File uploaded; simultaneous modification was detected".to_string(),
            file: record,
            conflict_id: Some(conflict_id),
            duplicate: false,
        })),
        SafeUploadOutcome::ConflictLoser { notice } => {
            let err = Error::Conflict {
                message: format!("Simultaneous modification of '{}' detected", file_name),
                notice: Some(Box::new(notice)),
            };
            log_handler_error("upload_safe", &err);
            Err(err)
        }
    }
}

// ============================================================================
// CHUNKED UPLOAD
// ============================================================================

/// POST /files/chunk
///
/// One numbered part of a chunked upload. Multipart fields: `chunk`,
/// `file_id`, `chunk_number`, `total_chunks`, `file_name`, `client_id`,
/// `last_modified`.
pub async fn upload_chunk(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<ChunkResponse>> {
    let mut bytes: Option<Bytes> = None;
    let mut file_id: Option<String> = None;
    let mut chunk_number: Option<u64> = None;
    let mut total_chunks: Option<u64> = None;
    let mut file_name: Option<String> = None;
    let mut client_id: Option<String> = None;
    let mut last_modified: Option<DateTime<Utc>> = None;

    while let Some(field) = multipart.next_field().await.map_err(multipart_err)? {
        match field.name().unwrap_or_default() {
            "chunk" => bytes = Some(field.bytes().await.map_err(multipart_err)?),
            "file_id" => file_id = Some(field.text().await.map_err(multipart_err)?),
            "chunk_number" => {
                chunk_number = Some(parse_u64(
                    &field.text().await.map_err(multipart_err)?,
                    "chunk_number",
                )?)
            }
            "total_chunks" => {
                total_chunks = Some(parse_u64(
                    &field.text().await.map_err(multipart_err)?,
                    "total_chunks",
                )?)
            }
            "file_name" => file_name = Some(field.text().await.map_err(multipart_err)?),
            "client_id" => client_id = Some(field.text().await.map_err(multipart_err)?),
            "last_modified" => {
                last_modified = Some(parse_last_modified(
                    &field.text().await.map_err(multipart_err)?,
                )?)
            }
            _ => {}
        }
    }

    let part = ChunkPart {
        bytes: require(bytes, "chunk")?,
        file_id: require(file_id.filter(|s| !s.is_empty()), "file_id")?,
        chunk_number: require(chunk_number, "chunk_number")?,
        total_chunks: require(total_chunks, "total_chunks")?,
        file_name: require(file_name.filter(|s| !s.is_empty()), "file_name")?,
        client_id: require(client_id.filter(|s| !s.is_empty()), "client_id")?,
        last_modified: require(last_modified, "last_modified")?,
    };

    tracing::info!(
        operation = "upload_chunk",
        file_name = %part.file_name,
        file_id = %part.file_id,
        chunk = part.chunk_number,
        total = part.total_chunks,
        "Processing chunk",
    );

    let file_id = part.file_id.clone();
    let total_chunks = part.total_chunks;
    let outcome = state
        .assembler
        .accept(&state.content, &state.metadata, part)
        .await
        .inspect_err(|e| log_handler_error("upload_chunk", e))?;

    let response = match outcome {
        ChunkOutcome::Pending { received } => ChunkResponse {
            success: true,
            message: format!("Stored chunk {}/{}", received, total_chunks),
            file_id,
            chunks_received: received,
            total_chunks,
            complete: false,
            file: None,
            duplicate: false,
        },
        ChunkOutcome::Complete { record } => ChunkResponse {
            success: true,
            message: format!("File assembled as version {}", record.version),
            file_id,
            chunks_received: total_chunks,
            total_chunks,
            complete: true,
            file: Some(record),
            duplicate: false,
        },
        ChunkOutcome::Duplicate { record } => ChunkResponse {
            success: true,
            message: "File already up-to-date, no new version created".to_string(),
            file_id,
            chunks_received: total_chunks,
            total_chunks,
            complete: true,
            file: Some(record),
            duplicate: true,
        },
    };
    Ok(Json(response))
}

fn parse_u64(value: &str, field: &str) -> Result<u64> {
    value
        .parse::<u64>()
        .map_err(|_| Error::BadRequest(format!("field '{}' must be a positive integer", field)))
}

// ============================================================================
// DOWNLOAD
// ============================================================================

/// GET /files/{name}/download
pub async fn download_file(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Response> {
    let blob = state
        .content
        .get(&name, None)
        .await
        .inspect_err(|e| log_handler_error("download_file", e))?;
    Ok(blob_response(&name, blob))
}

/// GET /files/{name}/versions/{version}/download
pub async fn download_version(
    State(state): State<AppState>,
    Path((name, version)): Path<(String, u64)>,
) -> Result<Response> {
    let blob = state
        .content
        .get(&name, Some(version))
        .await
        .inspect_err(|e| log_handler_error("download_version", e))?;
    Ok(blob_response(&name, blob))
}

fn blob_response(name: &str, blob: Vec<u8>) -> Response {
    (
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", name),
            ),
        ],
        blob,
    )
        .into_response()
}

// ============================================================================
// VERSIONS
// ============================================================================

/// GET /files/{name}/versions
///
/// All version metadata for a name, latest first.
pub async fn list_versions(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Vec<FileRecord>>> {
    let records = state.metadata.get_all_versions(&name).await?;
    if records.is_empty() {
        let err = Error::NotFound(format!("File '{}' not found", name));
        log_handler_error("list_versions", &err);
        return Err(err);
    }
    Ok(Json(records))
}

/// POST /files/{name}/restore/{version}
///
/// Copies version `v`'s bytes as a new latest version; the new record
/// carries `restored_from = v`.
pub async fn restore_version(
    State(state): State<AppState>,
    Path((name, version)): Path<(String, u64)>,
    Json(request): Json<RestoreRequest>,
) -> Result<Json<UploadResponse>> {
    if request.client_id.is_empty() {
        return Err(Error::BadRequest("client_id is required".to_string()));
    }

    let source = state
        .metadata
        .get_all_versions(&name)
        .await?
        .into_iter()
        .find(|r| r.version == version)
        .ok_or_else(|| Error::NotFound(format!("Version {} of '{}' not found", version, name)))
        .inspect_err(|e| log_handler_error("restore_version", e))?;
    let blob = state.content.get(&name, Some(version)).await?;

    let record = {
        let _lock = state.metadata.lock_name(&name).await?;
        let next = state.metadata.next_version(&name).await?;
        let saved = state.content.save(&name, &blob, next).await?;
        let now = Utc::now();
        let record = FileRecord {
            file_id: generate_id(),
            file_name: name.clone(),
            version: next,
            size: saved.size,
            checksum: saved.checksum,
            client_id: request.client_id,
            last_modified: source.last_modified,
            created_at: now,
            updated_at: now,
            restored_from: Some(version),
            conflict: false,
            conflicted_with: None,
        };
        state.metadata.save(&record).await?;
        record
    };

    tracing::info!(
        operation = "restore_version",
        file_name = %name,
        restored_from = version,
        version = record.version,
        "Restored version",
    );

    Ok(Json(UploadResponse {
        success: true,
        message: format!("Version {} restored as version {}", version, record.version),
        file: record,
        conflict_id: None,
        duplicate: false,
    }))
}

// ============================================================================
// RENAME
// ============================================================================

/// POST /files/{old}/rename
///
/// Renames the current blob, every version blob and every metadata record.
pub async fn rename_file(
    State(state): State<AppState>,
    Path(old_name): Path<String>,
    Json(request): Json<RenameRequest>,
) -> Result<Json<MessageResponse>> {
    let new_name = request.new_name;
    validate_file_name(&new_name)?;

    if state.metadata.get_all_versions(&old_name).await?.is_empty() {
        let err = Error::NotFound(format!("File '{}' not found", old_name));
        log_handler_error("rename_file", &err);
        return Err(err);
    }
    if state.content.exists(&new_name) || state.metadata.get_latest(&new_name).await?.is_some() {
        let err = Error::conflict(format!("File '{}' already exists", new_name));
        log_handler_error("rename_file", &err);
        return Err(err);
    }

    state.content.rename(&old_name, &new_name).await?;
    let renamed = state.metadata.rename(&old_name, &new_name).await?;

    tracing::info!(
        operation = "rename_file",
        old_name = %old_name,
        new_name = %new_name,
        records = renamed,
        "Renamed file",
    );

    Ok(Json(MessageResponse {
        success: true,
        message: format!("Renamed '{}' to '{}'", old_name, new_name),
    }))
}

// ============================================================================
// DELETE
// ============================================================================

/// DELETE /files/{name}
///
/// Removes the current blob; the name disappears from listings. Version
/// history is kept unless the server is configured to cascade.
pub async fn delete_file(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<MessageResponse>> {
    let cascade = state.config.storage.delete_cascade;
    state
        .content
        .delete(&name, None, cascade)
        .await
        .inspect_err(|e| log_handler_error("delete_file", e))?;
    if cascade {
        state.metadata.delete_by_name(&name).await?;
    }

    tracing::info!(operation = "delete_file", file_name = %name, cascade, "Deleted file");

    Ok(Json(MessageResponse {
        success: true,
        message: format!("Deleted '{}'", name),
    }))
}
