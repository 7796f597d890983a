use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::files::FileRecord;

/// One participant of a conflict as presented to clients in a 409 body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictParty {
    pub client_id: String,
    pub last_modified: DateTime<Utc>,
}

/// The structured document a losing client receives with its 409.
///
/// `conflict_id` is `"already-exists"` when a re-arrival duplicated an
/// already-processed `(client_id, checksum)` set and no new records were
/// created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictNotice {
    pub winner: ConflictParty,
    pub losers: Vec<ConflictParty>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict_file_name: Option<String>,
    pub conflict_id: String,
}

/// Success body for direct and safe uploads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadResponse {
    pub success: bool,
    pub message: String,
    pub file: FileRecord,
    /// Present when this upload won a detected conflict.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict_id: Option<String>,
    /// True when identical content was already the latest version and no
    /// new version was created.
    #[serde(default)]
    pub duplicate: bool,
}

/// Success body for a chunk part. `file` is set once the final part
/// completed assembly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkResponse {
    pub success: bool,
    pub message: String,
    pub file_id: String,
    pub chunks_received: u64,
    pub total_chunks: u64,
    pub complete: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<FileRecord>,
    #[serde(default)]
    pub duplicate: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RenameRequest {
    pub new_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RestoreRequest {
    pub client_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResolveConflictRequest {
    pub method: String,
    #[serde(default)]
    pub keep_version: Option<u64>,
    #[serde(default)]
    pub client_id: Option<String>,
}

/// Generic `{success, message}` body for rename/delete/resolve outcomes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub timestamp: DateTime<Utc>,
}
