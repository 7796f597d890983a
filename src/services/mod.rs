//! Server-side services over the shared stores: chunk assembly and the
//! sliding-window conflict engine.

pub mod assembler;
pub mod window;

pub use assembler::{ChunkAssembler, ChunkOutcome, ChunkPart};
pub use window::{SafeUpload, SafeUploadOutcome, UploadWindow};

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::models::{ConflictLoser, FileRecord};
use crate::storage::{ContentStore, MetadataStore};
use crate::utils::sha256_hex;

/// Derives the name a losing upload is stored under:
/// `<base>_conflicted_by_<client_id><ext>`.
pub fn conflict_copy_name(file_name: &str, client_id: &str) -> String {
    match file_name.rsplit_once('.') {
        Some((base, ext)) if !base.is_empty() => {
            format!("{base}_conflicted_by_{client_id}.{ext}")
        }
        _ => format!("{file_name}_conflicted_by_{client_id}"),
    }
}

/// Stores a losing upload's bytes as a version of its conflict copy name
/// and writes the matching metadata record (`conflict = true`,
/// `conflicted_with` pointing back at the contested name).
pub(crate) async fn save_conflict_copy(
    content: &ContentStore,
    metadata: &MetadataStore,
    origin_name: &str,
    file_id: &str,
    client_id: &str,
    blob: &[u8],
    last_modified: DateTime<Utc>,
) -> Result<ConflictLoser> {
    let copy_name = conflict_copy_name(origin_name, client_id);

    let _lock = metadata.lock_name(&copy_name).await?;
    let version = metadata.next_version(&copy_name).await?;
    let saved = content.save(&copy_name, blob, version).await?;

    let now = Utc::now();
    let record = FileRecord {
        file_id: file_id.to_string(),
        file_name: copy_name.clone(),
        version,
        size: saved.size,
        checksum: sha256_hex(blob),
        client_id: client_id.to_string(),
        last_modified,
        created_at: now,
        updated_at: now,
        restored_from: None,
        conflict: true,
        conflicted_with: Some(origin_name.to_string()),
    };
    metadata.save(&record).await?;

    Ok(ConflictLoser {
        record,
        conflict_file_name: copy_name,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_copy_name_with_extension() {
        assert_eq!(
            conflict_copy_name("note.txt", "bob"),
            "note_conflicted_by_bob.txt"
        );
    }

    #[test]
    fn test_conflict_copy_name_without_extension() {
        assert_eq!(conflict_copy_name("Makefile", "bob"), "Makefile_conflicted_by_bob");
    }

    #[test]
    fn test_conflict_copy_name_hidden_file() {
        assert_eq!(conflict_copy_name(".envrc", "bob"), ".envrc_conflicted_by_bob");
    }
}
