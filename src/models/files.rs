use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Immutable metadata record for one stored version of a logical file.
///
/// One JSON document per record lives under `metadata/files/<file_id>.json`;
/// records are never mutated after being written (renames rewrite the whole
/// document).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    /// Opaque per-upload identifier, 16 hex chars. Distinct uploads of the
    /// same name produce distinct file ids.
    pub file_id: String,
    pub file_name: String,
    /// Positive, unique per file_name, contiguous from 1.
    pub version: u64,
    pub size: u64,
    /// SHA-256 hex digest over the full blob.
    pub checksum: String,
    pub client_id: String,
    /// The source file's modification time, supplied by the client.
    pub last_modified: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set when this version was produced by a restore operation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restored_from: Option<u64>,
    /// True for conflict copies diverted from a losing upload.
    #[serde(default)]
    pub conflict: bool,
    /// For conflict copies, the file name the losing upload targeted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflicted_with: Option<String>,
}

/// One entry of the `GET /files` listing: the latest version's metadata for
/// every name with a current blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileListing {
    pub name: String,
    pub last_modified: DateTime<Utc>,
    pub size: u64,
    pub version: u64,
    pub client_id: String,
    pub total_versions: u64,
    /// Published so clients can compare content without downloading.
    pub checksum: String,
}

/// Parses a client-supplied `last_modified` multipart field.
///
/// Clients send whatever their filesystem gives them: an RFC 3339 string or
/// epoch milliseconds.
pub fn parse_last_modified(value: &str) -> Result<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Ok(ts.with_timezone(&Utc));
    }
    if let Ok(millis) = value.parse::<i64>() {
        if let Some(ts) = Utc.timestamp_millis_opt(millis).single() {
            return Ok(ts);
        }
    }
    Err(Error::BadRequest(format!(
        "last_modified must be RFC 3339 or epoch milliseconds, got '{}'",
        value
    )))
}
