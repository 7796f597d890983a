use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use super::files::FileRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ConflictStatus {
    Unresolved,
    Resolved,
}

/// A losing upload: the version record of its conflict copy plus the name
/// the copy was stored under.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictLoser {
    #[serde(flatten)]
    pub record: FileRecord,
    pub conflict_file_name: String,
}

/// How a resolved conflict was settled, supplied by the resolving client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictResolution {
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_version: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

/// One detected simultaneous-modification event, stored as a JSON document
/// under `metadata/conflicts/<id>.json`.
///
/// Mutable only to append a resolution: `status` transitions
/// unresolved → resolved exactly once and never back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictRecord {
    /// 16-hex conflict identifier.
    pub id: String,
    /// The file name the conflicting writes targeted.
    pub file_name: String,
    pub reason: String,
    /// `concurrent_modification` (threshold fallback) or
    /// `multi_client_concurrent_modification` (sliding window).
    pub conflict_type: String,
    /// The upload promoted to the next version of `file_name`.
    pub winner: FileRecord,
    /// The uploads diverted into conflict copies, in window order.
    pub losers: Vec<ConflictLoser>,
    /// Every client involved, winner included.
    pub all_clients: Vec<String>,
    /// Detection time.
    pub timestamp: DateTime<Utc>,
    pub status: ConflictStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<ConflictResolution>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}
