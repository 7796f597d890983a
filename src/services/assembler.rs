//! Chunked-upload assembly.
//!
//! Parts land in a scratch directory under a deterministic name
//! (`<file_id>_<chunk_number>`); when every numbered part is present the
//! whole blob is materialized through the content and metadata stores.
//! Per-part retries are idempotent: a re-sent part replaces its own file.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use tokio::fs;

use crate::error::{Error, Result};
use crate::models::{ConflictNotice, ConflictParty, ConflictRecord, ConflictStatus, FileRecord};
use crate::storage::{ContentStore, MetadataStore, validate_file_name};
use crate::utils::{generate_id, sha256_hex};

/// One numbered part of a chunked upload.
#[derive(Debug, Clone)]
pub struct ChunkPart {
    pub file_id: String,
    pub chunk_number: u64,
    pub total_chunks: u64,
    pub file_name: String,
    pub client_id: String,
    pub last_modified: DateTime<Utc>,
    pub bytes: Bytes,
}

/// What accepting one part produced.
#[derive(Debug)]
pub enum ChunkOutcome {
    /// Parts are still missing; `received` counts those on disk.
    Pending { received: u64 },
    /// The final part arrived and a new version was created.
    Complete { record: FileRecord },
    /// The assembled content equals the latest stored version; scratch was
    /// discarded and no version was created.
    Duplicate { record: FileRecord },
}

#[derive(Debug, Clone)]
pub struct ChunkAssembler {
    chunks_dir: PathBuf,
}

impl ChunkAssembler {
    pub fn new(chunks_dir: PathBuf) -> Self {
        Self { chunks_dir }
    }

    pub async fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.chunks_dir).await.map_err(|e| {
            Error::Internal(format!(
                "Failed to create chunks directory {:?}: {}",
                self.chunks_dir, e
            ))
        })
    }

    fn part_path(&self, file_id: &str, chunk_number: u64) -> PathBuf {
        self.chunks_dir.join(format!("{}_{}", file_id, chunk_number))
    }

    /// Accepts one part; assembles and persists the file when it was the
    /// last missing one.
    pub async fn accept(
        &self,
        content: &ContentStore,
        metadata: &MetadataStore,
        part: ChunkPart,
    ) -> Result<ChunkOutcome> {
        validate_file_name(&part.file_name)?;
        if part.file_id.is_empty() {
            return Err(Error::BadRequest("file_id is required".to_string()));
        }
        if part.total_chunks == 0 || part.chunk_number == 0 || part.chunk_number > part.total_chunks
        {
            return Err(Error::BadRequest(format!(
                "chunk_number {} out of range 1..={}",
                part.chunk_number, part.total_chunks
            )));
        }
        if part.bytes.is_empty() {
            return Err(Error::Corrupt(format!(
                "chunk {} of '{}' is empty",
                part.chunk_number, part.file_name
            )));
        }

        let path = self.part_path(&part.file_id, part.chunk_number);
        fs::write(&path, &part.bytes)
            .await
            .map_err(|e| Error::Internal(format!("Failed to write chunk {:?}: {}", path, e)))?;

        let received = self.count_parts(&part.file_id).await?;
        if received < part.total_chunks {
            tracing::debug!(
                file_id = %part.file_id,
                file_name = %part.file_name,
                received,
                total = part.total_chunks,
                "Stored chunk, waiting for remaining parts"
            );
            return Ok(ChunkOutcome::Pending { received });
        }

        let blob = self.assemble(&part.file_id, part.total_chunks, &part.file_name).await?;
        let checksum = sha256_hex(&blob);

        // Identical content re-sent in full: drop the scratch, keep the
        // existing version.
        if let Some(latest) = metadata.get_latest(&part.file_name).await? {
            if latest.checksum == checksum {
                self.scrub(&part.file_id).await;
                tracing::info!(
                    file_name = %part.file_name,
                    version = latest.version,
                    "Assembled content matches latest version, discarding"
                );
                return Ok(ChunkOutcome::Duplicate { record: latest });
            }
        }

        let now = Utc::now();
        let mut record = FileRecord {
            file_id: part.file_id.clone(),
            file_name: part.file_name.clone(),
            version: 0,
            size: blob.len() as u64,
            checksum,
            client_id: part.client_id.clone(),
            last_modified: part.last_modified,
            created_at: now,
            updated_at: now,
            restored_from: None,
            conflict: false,
            conflicted_with: None,
        };

        // Threshold fallback: this path has no sliding window, and it also
        // catches window misses when the competing upload landed on another
        // worker.
        if let Some(latest) = metadata.detect_conflict(&record).await? {
            let notice = self
                .record_fallback_conflict(content, metadata, &record, &latest, &blob)
                .await?;
            self.scrub(&part.file_id).await;
            return Err(Error::Conflict {
                message: format!(
                    "Simultaneous modification of '{}' detected; kept version {} from '{}'",
                    part.file_name, latest.version, latest.client_id
                ),
                notice: Some(Box::new(notice)),
            });
        }

        {
            let _lock = metadata.lock_name(&part.file_name).await?;
            record.version = metadata.next_version(&part.file_name).await?;
            content.save(&part.file_name, &blob, record.version).await?;
            metadata.save(&record).await?;
        }
        self.scrub(&part.file_id).await;

        tracing::info!(
            file_name = %part.file_name,
            version = record.version,
            size = record.size,
            total_chunks = part.total_chunks,
            "Assembled chunked upload into new version"
        );
        Ok(ChunkOutcome::Complete { record })
    }

    /// The incoming upload lost against the stored latest: divert it into a
    /// conflict copy and record the conflict document.
    async fn record_fallback_conflict(
        &self,
        content: &ContentStore,
        metadata: &MetadataStore,
        incoming: &FileRecord,
        latest: &FileRecord,
        blob: &[u8],
    ) -> Result<ConflictNotice> {
        let loser = super::save_conflict_copy(
            content,
            metadata,
            &incoming.file_name,
            &incoming.file_id,
            &incoming.client_id,
            blob,
            incoming.last_modified,
        )
        .await?;

        let conflict = ConflictRecord {
            id: generate_id(),
            file_name: incoming.file_name.clone(),
            reason: format!(
                "uploads from '{}' and '{}' modified within the conflict threshold",
                latest.client_id, incoming.client_id
            ),
            conflict_type: "concurrent_modification".to_string(),
            winner: latest.clone(),
            losers: vec![loser.clone()],
            all_clients: vec![latest.client_id.clone(), incoming.client_id.clone()],
            timestamp: Utc::now(),
            status: ConflictStatus::Unresolved,
            resolution: None,
            resolved_at: None,
        };
        let stored = metadata.save_conflict(&conflict).await?;

        tracing::warn!(
            file_name = %incoming.file_name,
            conflict_id = %stored.id,
            winner = %latest.client_id,
            loser = %incoming.client_id,
            "Threshold fallback detected concurrent modification"
        );

        Ok(ConflictNotice {
            winner: ConflictParty {
                client_id: latest.client_id.clone(),
                last_modified: latest.last_modified,
            },
            losers: vec![ConflictParty {
                client_id: incoming.client_id.clone(),
                last_modified: incoming.last_modified,
            }],
            conflict_file_name: Some(loser.conflict_file_name),
            conflict_id: stored.id,
        })
    }

    async fn count_parts(&self, file_id: &str) -> Result<u64> {
        let prefix = format!("{}_", file_id);
        let mut count = 0u64;
        let mut entries = fs::read_dir(&self.chunks_dir).await.map_err(|e| {
            Error::Internal(format!(
                "Failed to list chunks directory {:?}: {}",
                self.chunks_dir, e
            ))
        })?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::Internal(format!("Failed to read directory entry: {}", e)))?
        {
            if entry.file_name().to_string_lossy().starts_with(&prefix) {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Concatenates the numbered parts in order, verifying each is present
    /// and non-empty.
    async fn assemble(&self, file_id: &str, total_chunks: u64, file_name: &str) -> Result<Vec<u8>> {
        let mut blob = Vec::new();
        for n in 1..=total_chunks {
            let path = self.part_path(file_id, n);
            if !path.exists() {
                return Err(Error::Corrupt(format!(
                    "chunk {} of '{}' is missing during assembly",
                    n, file_name
                )));
            }
            let part = fs::read(&path)
                .await
                .map_err(|e| Error::Internal(format!("Failed to read chunk {:?}: {}", path, e)))?;
            if part.is_empty() {
                return Err(Error::Corrupt(format!(
                    "chunk {} of '{}' is empty during assembly",
                    n, file_name
                )));
            }
            blob.extend_from_slice(&part);
        }
        Ok(blob)
    }

    /// Removes every scratch part for `file_id`. Best-effort: a leftover
    /// part is re-scrubbed by the next upload with the same id.
    async fn scrub(&self, file_id: &str) {
        let prefix = format!("{}_", file_id);
        let Ok(mut entries) = fs::read_dir(&self.chunks_dir).await else {
            return;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            if entry.file_name().to_string_lossy().starts_with(&prefix) {
                if let Err(e) = fs::remove_file(entry.path()).await {
                    tracing::warn!(path = ?entry.path(), error = %e, "Failed to scrub chunk");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        _dir: tempfile::TempDir,
        content: ContentStore,
        metadata: MetadataStore,
        assembler: ChunkAssembler,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let content = ContentStore::new(dir.path().join("files"), dir.path().join("versions"));
        let metadata = MetadataStore::new(
            dir.path().join("metadata"),
            dir.path().join("metadata/conflicts"),
        );
        let assembler = ChunkAssembler::new(dir.path().join("chunks"));
        content.init().await.unwrap();
        metadata.init().await.unwrap();
        assembler.init().await.unwrap();
        Fixture {
            _dir: dir,
            content,
            metadata,
            assembler,
        }
    }

    fn part(file_id: &str, n: u64, total: u64, bytes: &[u8]) -> ChunkPart {
        ChunkPart {
            file_id: file_id.to_string(),
            chunk_number: n,
            total_chunks: total,
            file_name: "big.bin".to_string(),
            client_id: "alice".to_string(),
            last_modified: Utc::now(),
            bytes: Bytes::copy_from_slice(bytes),
        }
    }

    #[tokio::test]
    async fn test_parts_assemble_in_numeric_order() {
        let f = fixture().await;

        // Arrive out of order on purpose.
        for (n, bytes) in [(3u64, b"cc".as_slice()), (1, b"aa"), (2, b"bb")] {
            let outcome = f
                .assembler
                .accept(&f.content, &f.metadata, part("f1", n, 3, bytes))
                .await
                .unwrap();
            if n == 2 {
                let ChunkOutcome::Complete { record } = outcome else {
                    panic!("expected completion on final part");
                };
                assert_eq!(record.version, 1);
                assert_eq!(record.size, 6);
            }
        }

        assert_eq!(f.content.get("big.bin", None).await.unwrap(), b"aabbcc");
    }

    #[tokio::test]
    async fn test_scratch_is_scrubbed_after_assembly() {
        let f = fixture().await;

        f.assembler
            .accept(&f.content, &f.metadata, part("f1", 1, 1, b"data"))
            .await
            .unwrap();

        assert_eq!(f.assembler.count_parts("f1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_empty_chunk_is_corrupt() {
        let f = fixture().await;

        let err = f
            .assembler
            .accept(&f.content, &f.metadata, part("f1", 1, 2, b""))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Corrupt(_)));
    }

    #[tokio::test]
    async fn test_chunk_number_out_of_range() {
        let f = fixture().await;

        let err = f
            .assembler
            .accept(&f.content, &f.metadata, part("f1", 4, 3, b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_duplicate_content_creates_no_version() {
        let f = fixture().await;

        f.assembler
            .accept(&f.content, &f.metadata, part("f1", 1, 1, b"data"))
            .await
            .unwrap();
        let outcome = f
            .assembler
            .accept(&f.content, &f.metadata, part("f2", 1, 1, b"data"))
            .await
            .unwrap();

        assert!(matches!(outcome, ChunkOutcome::Duplicate { ref record } if record.version == 1));
        assert_eq!(f.metadata.get_all_versions("big.bin").await.unwrap().len(), 1);
        assert_eq!(f.assembler.count_parts("f2").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_resent_part_is_idempotent() {
        let f = fixture().await;

        f.assembler
            .accept(&f.content, &f.metadata, part("f1", 1, 2, b"aa"))
            .await
            .unwrap();
        // Retry of part 1 with the same bytes, then part 2 completes.
        f.assembler
            .accept(&f.content, &f.metadata, part("f1", 1, 2, b"aa"))
            .await
            .unwrap();
        let outcome = f
            .assembler
            .accept(&f.content, &f.metadata, part("f1", 2, 2, b"bb"))
            .await
            .unwrap();

        assert!(matches!(outcome, ChunkOutcome::Complete { .. }));
        assert_eq!(f.content.get("big.bin", None).await.unwrap(), b"aabb");
    }

    #[tokio::test]
    async fn test_threshold_fallback_diverts_loser() {
        let f = fixture().await;

        // Alice's upload is stored first.
        f.assembler
            .accept(&f.content, &f.metadata, part("f1", 1, 1, b"alice-bytes"))
            .await
            .unwrap();

        // Bob uploads different content with a near-identical mtime.
        let mut bobs = part("f2", 1, 1, b"bob-bytes");
        bobs.client_id = "bob".to_string();
        let err = f
            .assembler
            .accept(&f.content, &f.metadata, bobs)
            .await
            .unwrap_err();

        let Error::Conflict { notice: Some(notice), .. } = err else {
            panic!("expected structured conflict");
        };
        assert_eq!(notice.winner.client_id, "alice");
        assert_eq!(
            notice.conflict_file_name.as_deref(),
            Some("big_conflicted_by_bob.bin")
        );

        // The contested name kept Alice's content; Bob's landed in the copy.
        assert_eq!(f.content.get("big.bin", None).await.unwrap(), b"alice-bytes");
        assert_eq!(
            f.content.get("big_conflicted_by_bob.bin", None).await.unwrap(),
            b"bob-bytes"
        );
        assert_eq!(f.metadata.get_conflicts().await.unwrap().len(), 1);
    }
}
