//! HTTP transport: a typed wrapper over every server endpoint.
//!
//! The transport recovers nothing. Every non-2xx becomes a typed error for
//! the sync engine to act on; 409 carries the parsed conflict document.

use chrono::{DateTime, Utc};
use reqwest::multipart::{Form, Part};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::models::{
    ChunkResponse, ConflictNotice, ConflictRecord, FileListing, FileRecord, UploadResponse,
};
use crate::utils::generate_id;

/// Health probes answer fast or not at all.
const HEALTH_TIMEOUT: Duration = Duration::from_secs(2);
/// Per-chunk upload timeout.
const CHUNK_TIMEOUT: Duration = Duration::from_secs(30);

/// What an upload attempt produced, from the engine's point of view.
#[derive(Debug)]
pub enum UploadOutcome {
    /// 2xx: uploaded, duplicate-skipped, or won a conflict.
    Uploaded(UploadResponse),
    /// 409: this client lost a conflict; the server kept its own state.
    Conflict(ConflictNotice),
}

pub struct ApiClient {
    http: reqwest::Client,
    base: String,
}

impl ApiClient {
    pub fn new(server_url: &str) -> Result<Self> {
        // Parse once to fail fast on a bad operator-supplied URL.
        url::Url::parse(server_url)
            .map_err(|e| Error::BadRequest(format!("invalid server URL '{}': {}", server_url, e)))?;
        Ok(Self {
            http: reqwest::Client::new(),
            base: server_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    /// Probes `/health` with a short timeout. Any failure means offline.
    pub async fn health(&self) -> bool {
        match self
            .http
            .get(self.url("/health"))
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    pub async fn list_files(&self) -> Result<Vec<FileListing>> {
        let resp = self.http.get(self.url("/files")).send().await?;
        Ok(check(resp).await?.json().await?)
    }

    /// Whole-file upload through the safe path.
    pub async fn upload_safe(
        &self,
        file_name: &str,
        bytes: Vec<u8>,
        client_id: &str,
        last_modified: DateTime<Utc>,
    ) -> Result<UploadOutcome> {
        let form = Form::new()
            .part("file", Part::bytes(bytes).file_name(file_name.to_string()))
            .text("file_name", file_name.to_string())
            .text("client_id", client_id.to_string())
            .text("last_modified", last_modified.to_rfc3339());

        let resp = self
            .http
            .post(self.url("/files/upload-safe"))
            .multipart(form)
            .send()
            .await?;

        match check(resp).await {
            Ok(resp) => Ok(UploadOutcome::Uploaded(resp.json().await?)),
            Err(Error::Conflict {
                notice: Some(notice),
                ..
            }) => Ok(UploadOutcome::Conflict(*notice)),
            Err(e) => Err(e),
        }
    }

    /// Chunked upload: a fresh random file id, parts `1..=total` in order,
    /// a per-chunk timeout, early exit once the server reports a duplicate.
    pub async fn upload_chunked(
        &self,
        file_name: &str,
        bytes: &[u8],
        client_id: &str,
        last_modified: DateTime<Utc>,
        chunk_size: usize,
    ) -> Result<UploadOutcome> {
        let file_id = generate_id();
        let total_chunks = bytes.len().div_ceil(chunk_size).max(1) as u64;

        for (index, chunk) in bytes.chunks(chunk_size.max(1)).enumerate() {
            let chunk_number = index as u64 + 1;
            let form = Form::new()
                .part("chunk", Part::bytes(chunk.to_vec()).file_name(file_name.to_string()))
                .text("file_id", file_id.clone())
                .text("chunk_number", chunk_number.to_string())
                .text("total_chunks", total_chunks.to_string())
                .text("file_name", file_name.to_string())
                .text("client_id", client_id.to_string())
                .text("last_modified", last_modified.to_rfc3339());

            let resp = self
                .http
                .post(self.url("/files/chunk"))
                .multipart(form)
                .timeout(CHUNK_TIMEOUT)
                .send()
                .await?;

            let ack: ChunkResponse = match check(resp).await {
                Ok(resp) => resp.json().await?,
                Err(Error::Conflict {
                    notice: Some(notice),
                    ..
                }) => return Ok(UploadOutcome::Conflict(*notice)),
                Err(e) => return Err(e),
            };

            if ack.duplicate || ack.complete {
                let file = ack.file.ok_or_else(|| {
                    Error::Internal("server reported completion without file metadata".to_string())
                })?;
                return Ok(UploadOutcome::Uploaded(UploadResponse {
                    success: ack.success,
                    message: ack.message,
                    file,
                    conflict_id: None,
                    duplicate: ack.duplicate,
                }));
            }
        }

        Err(Error::Internal(format!(
            "all {} chunks of '{}' were accepted but assembly never completed",
            total_chunks, file_name
        )))
    }

    pub async fn download(&self, file_name: &str) -> Result<Vec<u8>> {
        let resp = self
            .http
            .get(self.url(&format!("/files/{}/download", file_name)))
            .send()
            .await?;
        Ok(check(resp).await?.bytes().await?.to_vec())
    }

    pub async fn list_versions(&self, file_name: &str) -> Result<Vec<FileRecord>> {
        let resp = self
            .http
            .get(self.url(&format!("/files/{}/versions", file_name)))
            .send()
            .await?;
        Ok(check(resp).await?.json().await?)
    }

    pub async fn download_version(&self, file_name: &str, version: u64) -> Result<Vec<u8>> {
        let resp = self
            .http
            .get(self.url(&format!("/files/{}/versions/{}/download", file_name, version)))
            .send()
            .await?;
        Ok(check(resp).await?.bytes().await?.to_vec())
    }

    pub async fn restore(
        &self,
        file_name: &str,
        version: u64,
        client_id: &str,
    ) -> Result<UploadResponse> {
        let resp = self
            .http
            .post(self.url(&format!("/files/{}/restore/{}", file_name, version)))
            .json(&serde_json::json!({ "client_id": client_id }))
            .send()
            .await?;
        Ok(check(resp).await?.json().await?)
    }

    pub async fn rename(&self, old_name: &str, new_name: &str) -> Result<()> {
        let resp = self
            .http
            .post(self.url(&format!("/files/{}/rename", old_name)))
            .json(&serde_json::json!({ "new_name": new_name }))
            .send()
            .await?;
        check(resp).await?;
        Ok(())
    }

    pub async fn delete(&self, file_name: &str) -> Result<()> {
        let resp = self
            .http
            .delete(self.url(&format!("/files/{}", file_name)))
            .send()
            .await?;
        check(resp).await?;
        Ok(())
    }

    pub async fn conflicts(&self) -> Result<Vec<ConflictRecord>> {
        let resp = self.http.get(self.url("/conflicts")).send().await?;
        Ok(check(resp).await?.json().await?)
    }

    pub async fn resolve_conflict(
        &self,
        conflict_id: &str,
        method: &str,
        keep_version: Option<u64>,
        client_id: &str,
    ) -> Result<()> {
        let resp = self
            .http
            .post(self.url(&format!("/conflicts/{}/resolve", conflict_id)))
            .json(&serde_json::json!({
                "method": method,
                "keep_version": keep_version,
                "client_id": client_id,
            }))
            .send()
            .await?;
        check(resp).await?;
        Ok(())
    }
}

/// Maps a non-2xx response onto the crate error kinds, parsing the error
/// body (and, for 409, the embedded conflict document).
async fn check(resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let body: serde_json::Value = resp.json().await.unwrap_or_default();
    let message = body
        .get("message")
        .and_then(|m| m.as_str())
        .unwrap_or("no message")
        .to_string();

    Err(match status.as_u16() {
        400 => Error::BadRequest(message),
        404 => Error::NotFound(message),
        409 => {
            let notice = serde_json::from_value::<ConflictNotice>(body).ok();
            Error::Conflict {
                message,
                notice: notice.map(Box::new),
            }
        }
        413 => Error::PayloadTooLarge(message),
        503 => Error::ServiceUnavailable(message),
        _ => Error::Internal(format!("server returned {}: {}", status, message)),
    })
}
