//! Sliding-window conflict detection for the safe-upload path.
//!
//! The window is per-process state: it records very recent uploads keyed by
//! file name and declares a multi-client conflict when two different clients
//! push different content for one name inside the window. Uploads landing on
//! different workers evade it; the metadata threshold fallback backstops
//! that case.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::error::Result;
use crate::models::{ConflictNotice, ConflictParty, ConflictRecord, ConflictStatus, FileRecord};
use crate::storage::{ContentStore, MetadataStore};
use crate::utils::{generate_id, sha256_hex};

/// How long an upload stays in the window (and how long a processed
/// conflict key keeps answering re-arrivals).
pub const SYNC_INTERVAL: Duration = Duration::from_millis(10_000);

/// One incoming safe upload.
#[derive(Debug, Clone)]
pub struct SafeUpload {
    pub file_name: String,
    pub client_id: String,
    pub last_modified: DateTime<Utc>,
    pub bytes: Bytes,
}

/// How the engine disposed of a safe upload.
#[derive(Debug)]
pub enum SafeUploadOutcome {
    /// No conflict: a new version was created.
    Created { record: FileRecord },
    /// Identical content is already the latest version; nothing was stored.
    AlreadyUpToDate { record: FileRecord },
    /// A conflict fired and this upload won: it became the next version.
    ConflictWinner {
        record: FileRecord,
        conflict_id: String,
    },
    /// A conflict fired and this upload lost: its bytes went to a conflict
    /// copy (or, for re-arrivals, nowhere).
    ConflictLoser { notice: ConflictNotice },
}

#[derive(Clone)]
struct WindowEntry {
    client_id: String,
    checksum: String,
    last_modified: DateTime<Utc>,
    blob: Bytes,
    file_id: String,
    arrived_at: Instant,
}

/// Remembered outcome of a processed conflict key. Later arrivals whose
/// `(client_id, checksum)` set hashes to the same key receive a 409
/// referencing this conflict without creating any records.
struct ProcessedKey {
    winner: ConflictParty,
    losers: Vec<ConflictParty>,
    processed_at: Instant,
}

#[derive(Default)]
struct WindowState {
    entries: HashMap<String, Vec<WindowEntry>>,
    processed: HashMap<String, ProcessedKey>,
}

pub struct UploadWindow {
    state: Mutex<WindowState>,
}

impl Default for UploadWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl UploadWindow {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(WindowState::default()),
        }
    }

    /// Runs one safe upload through the window.
    ///
    /// The window mutex is held across the whole decision, serializing safe
    /// uploads within this worker; cross-worker races fall through to the
    /// metadata fallback.
    pub async fn process_upload(
        &self,
        content: &ContentStore,
        metadata: &MetadataStore,
        upload: SafeUpload,
    ) -> Result<SafeUploadOutcome> {
        let mut state = self.state.lock().await;
        let now = Instant::now();

        // 1. Garbage-collect expired entries and processed keys.
        for entries in state.entries.values_mut() {
            entries.retain(|e| now.duration_since(e.arrived_at) <= SYNC_INTERVAL);
        }
        state.entries.retain(|_, entries| !entries.is_empty());
        state
            .processed
            .retain(|_, p| now.duration_since(p.processed_at) <= SYNC_INTERVAL);

        // 2. Idempotent upload: identical content is already latest.
        let checksum = sha256_hex(&upload.bytes);
        let latest = metadata.get_latest(&upload.file_name).await?;
        if let Some(latest) = &latest {
            if latest.checksum == checksum {
                tracing::debug!(
                    file_name = %upload.file_name,
                    version = latest.version,
                    "Upload matches latest version, nothing to do"
                );
                return Ok(SafeUploadOutcome::AlreadyUpToDate {
                    record: latest.clone(),
                });
            }
        }

        // 3. Record the arrival, then snapshot the deduplicated window for
        // this name (entry blobs are cheap to clone).
        let entry = WindowEntry {
            client_id: upload.client_id.clone(),
            checksum: checksum.clone(),
            last_modified: upload.last_modified,
            blob: upload.bytes.clone(),
            file_id: generate_id(),
            arrived_at: now,
        };
        let candidates: Vec<WindowEntry> = {
            let entries = state.entries.entry(upload.file_name.clone()).or_default();
            entries.push(entry);

            // 4. Deduplicate by (client_id, checksum), keeping the earliest
            // arrival of each pair.
            entries.sort_by_key(|e| e.arrived_at);
            let mut seen = std::collections::HashSet::new();
            entries.retain(|e| seen.insert((e.client_id.clone(), e.checksum.clone())));
            entries.clone()
        };

        // 5. A conflict needs at least two distinct clients in the window;
        // one client revising its own file quickly is plain versioning.
        let distinct_clients = candidates
            .iter()
            .map(|e| e.client_id.as_str())
            .collect::<std::collections::HashSet<_>>()
            .len();

        if candidates.len() >= 2 && distinct_clients >= 2 {
            let key = conflict_key(&candidates);

            if let Some(processed) = state.processed.get(&key) {
                // Re-arrival of an already-processed pair set: answer from
                // memory, create nothing.
                let notice = ConflictNotice {
                    winner: processed.winner.clone(),
                    losers: processed.losers.clone(),
                    conflict_file_name: Some(super::conflict_copy_name(
                        &upload.file_name,
                        &upload.client_id,
                    )),
                    conflict_id: "already-exists".to_string(),
                };
                tracing::info!(
                    file_name = %upload.file_name,
                    client_id = %upload.client_id,
                    "Re-arrival for an already-processed conflict set"
                );
                return Ok(SafeUploadOutcome::ConflictLoser { notice });
            }

            // Sort candidates by last_modified: the earliest write wins,
            // later writers are diverted into conflict copies.
            let mut candidates = candidates;
            candidates.sort_by_key(|e| e.last_modified);
            let winner = &candidates[0];

            // 6. Winner materialization, idempotent against the same
            // checksum already being latest.
            let winner_record = match &latest {
                Some(latest) if latest.checksum == winner.checksum => latest.clone(),
                _ => {
                    let _lock = metadata.lock_name(&upload.file_name).await?;
                    let version = metadata.next_version(&upload.file_name).await?;
                    let saved = content.save(&upload.file_name, &winner.blob, version).await?;
                    let record = FileRecord {
                        file_id: winner.file_id.clone(),
                        file_name: upload.file_name.clone(),
                        version,
                        size: saved.size,
                        checksum: winner.checksum.clone(),
                        client_id: winner.client_id.clone(),
                        last_modified: winner.last_modified,
                        created_at: Utc::now(),
                        updated_at: Utc::now(),
                        restored_from: None,
                        conflict: false,
                        conflicted_with: None,
                    };
                    metadata.save(&record).await?;
                    record
                }
            };

            // 7. Divert every loser into its conflict copy.
            let mut losers = Vec::new();
            for candidate in candidates.iter().skip(1) {
                let loser = super::save_conflict_copy(
                    content,
                    metadata,
                    &upload.file_name,
                    &candidate.file_id,
                    &candidate.client_id,
                    &candidate.blob,
                    candidate.last_modified,
                )
                .await?;
                losers.push(loser);
            }

            // 8. Record the conflict document, idempotent on id.
            let mut all_clients: Vec<String> =
                candidates.iter().map(|e| e.client_id.clone()).collect();
            all_clients.sort();
            all_clients.dedup();

            let conflict = ConflictRecord {
                id: generate_id(),
                file_name: upload.file_name.clone(),
                reason: format!(
                    "{} clients modified '{}' inside the upload window",
                    distinct_clients, upload.file_name
                ),
                conflict_type: "multi_client_concurrent_modification".to_string(),
                winner: winner_record.clone(),
                losers: losers.clone(),
                all_clients,
                timestamp: Utc::now(),
                status: ConflictStatus::Unresolved,
                resolution: None,
                resolved_at: None,
            };
            let stored = metadata.save_conflict(&conflict).await?;

            let winner_party = ConflictParty {
                client_id: winner_record.client_id.clone(),
                last_modified: winner_record.last_modified,
            };
            let loser_parties: Vec<ConflictParty> = losers
                .iter()
                .map(|l| ConflictParty {
                    client_id: l.record.client_id.clone(),
                    last_modified: l.record.last_modified,
                })
                .collect();

            state.processed.insert(
                key,
                ProcessedKey {
                    winner: winner_party.clone(),
                    losers: loser_parties.clone(),
                    processed_at: now,
                },
            );

            tracing::warn!(
                file_name = %upload.file_name,
                conflict_id = %stored.id,
                winner = %winner_record.client_id,
                losers = losers.len(),
                "Upload window detected a multi-client conflict"
            );

            // 9. Answer according to this arrival's role.
            if upload.client_id == winner_record.client_id && checksum == winner_record.checksum {
                return Ok(SafeUploadOutcome::ConflictWinner {
                    record: winner_record,
                    conflict_id: stored.id,
                });
            }
            let own_copy = losers
                .iter()
                .find(|l| l.record.client_id == upload.client_id)
                .map(|l| l.conflict_file_name.clone());
            return Ok(SafeUploadOutcome::ConflictLoser {
                notice: ConflictNotice {
                    winner: winner_party,
                    losers: loser_parties,
                    conflict_file_name: own_copy,
                    conflict_id: stored.id,
                },
            });
        }

        // Single writer in the window: plain versioned save.
        let record = {
            let _lock = metadata.lock_name(&upload.file_name).await?;
            let version = metadata.next_version(&upload.file_name).await?;
            let saved = content.save(&upload.file_name, &upload.bytes, version).await?;
            let record = FileRecord {
                file_id: candidates
                    .iter()
                    .find(|e| e.client_id == upload.client_id && e.checksum == checksum)
                    .map(|e| e.file_id.clone())
                    .unwrap_or_else(generate_id),
                file_name: upload.file_name.clone(),
                version,
                size: saved.size,
                checksum,
                client_id: upload.client_id.clone(),
                last_modified: upload.last_modified,
                created_at: Utc::now(),
                updated_at: Utc::now(),
                restored_from: None,
                conflict: false,
                conflicted_with: None,
            };
            metadata.save(&record).await?;
            record
        };

        tracing::info!(
            file_name = %record.file_name,
            version = record.version,
            size = record.size,
            client_id = %record.client_id,
            "Stored new version"
        );
        Ok(SafeUploadOutcome::Created { record })
    }
}

/// Stable key for a set of `(client_id, checksum)` pairs: the pairs sorted,
/// joined and hashed. Identical sets always map to the same key.
fn conflict_key(entries: &[WindowEntry]) -> String {
    let mut pairs: Vec<String> = entries
        .iter()
        .map(|e| format!("{}:{}", e.client_id, e.checksum))
        .collect();
    pairs.sort();
    sha256_hex(pairs.join("|").as_bytes())[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    struct Fixture {
        _dir: tempfile::TempDir,
        content: ContentStore,
        metadata: MetadataStore,
        window: UploadWindow,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let content = ContentStore::new(dir.path().join("files"), dir.path().join("versions"));
        let metadata = MetadataStore::new(
            dir.path().join("metadata"),
            dir.path().join("metadata/conflicts"),
        );
        content.init().await.unwrap();
        metadata.init().await.unwrap();
        Fixture {
            _dir: dir,
            content,
            metadata,
            window: UploadWindow::new(),
        }
    }

    fn upload(name: &str, client: &str, bytes: &[u8], last_modified: DateTime<Utc>) -> SafeUpload {
        SafeUpload {
            file_name: name.to_string(),
            client_id: client.to_string(),
            last_modified,
            bytes: Bytes::copy_from_slice(bytes),
        }
    }

    #[tokio::test]
    async fn test_single_upload_creates_version_one() {
        let f = fixture().await;

        let outcome = f
            .window
            .process_upload(&f.content, &f.metadata, upload("note.txt", "alice", b"a", Utc::now()))
            .await
            .unwrap();

        let SafeUploadOutcome::Created { record } = outcome else {
            panic!("expected creation");
        };
        assert_eq!(record.version, 1);
        assert_eq!(f.content.get("note.txt", None).await.unwrap(), b"a");
    }

    #[tokio::test]
    async fn test_same_client_revisions_do_not_conflict() {
        let f = fixture().await;

        f.window
            .process_upload(&f.content, &f.metadata, upload("note.txt", "alice", b"a", Utc::now()))
            .await
            .unwrap();
        let outcome = f
            .window
            .process_upload(&f.content, &f.metadata, upload("note.txt", "alice", b"ab", Utc::now()))
            .await
            .unwrap();

        let SafeUploadOutcome::Created { record } = outcome else {
            panic!("expected a plain second version");
        };
        assert_eq!(record.version, 2);
        assert!(f.metadata.get_conflicts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_identical_reupload_is_idempotent() {
        let f = fixture().await;

        f.window
            .process_upload(&f.content, &f.metadata, upload("note.txt", "alice", b"a", Utc::now()))
            .await
            .unwrap();
        let outcome = f
            .window
            .process_upload(&f.content, &f.metadata, upload("note.txt", "alice", b"a", Utc::now()))
            .await
            .unwrap();

        let SafeUploadOutcome::AlreadyUpToDate { record } = outcome else {
            panic!("expected idempotent short-circuit");
        };
        assert_eq!(record.version, 1);
        assert_eq!(f.metadata.get_all_versions("note.txt").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_two_clients_conflict_earliest_wins() {
        let f = fixture().await;
        let t0 = Utc::now();

        // Alice's write carries the earlier mtime and arrives first.
        let outcome = f
            .window
            .process_upload(
                &f.content,
                &f.metadata,
                upload("note.txt", "alice", b"A", t0 - ChronoDuration::milliseconds(100)),
            )
            .await
            .unwrap();
        assert!(matches!(outcome, SafeUploadOutcome::Created { ref record } if record.version == 1));

        // Bob's later write lands inside the window.
        let outcome = f
            .window
            .process_upload(
                &f.content,
                &f.metadata,
                upload("note.txt", "bob", b"B", t0 + ChronoDuration::milliseconds(900)),
            )
            .await
            .unwrap();

        let SafeUploadOutcome::ConflictLoser { notice } = outcome else {
            panic!("expected bob to lose");
        };
        assert_eq!(notice.winner.client_id, "alice");
        assert_eq!(notice.losers.len(), 1);
        assert_eq!(
            notice.conflict_file_name.as_deref(),
            Some("note_conflicted_by_bob.txt")
        );
        assert_ne!(notice.conflict_id, "already-exists");

        // The contested name kept Alice's bytes; Bob's went to the copy.
        assert_eq!(f.content.get("note.txt", None).await.unwrap(), b"A");
        assert_eq!(
            f.content.get("note_conflicted_by_bob.txt", None).await.unwrap(),
            b"B"
        );

        let conflicts = f.metadata.get_conflicts().await.unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].winner.client_id, "alice");
        assert_eq!(conflicts[0].losers[0].record.client_id, "bob");
        assert_eq!(conflicts[0].status, ConflictStatus::Unresolved);
    }

    #[tokio::test]
    async fn test_rearrival_gets_already_exists_and_no_new_records() {
        let f = fixture().await;
        let t0 = Utc::now();

        f.window
            .process_upload(
                &f.content,
                &f.metadata,
                upload("note.txt", "alice", b"A", t0 - ChronoDuration::milliseconds(100)),
            )
            .await
            .unwrap();
        f.window
            .process_upload(
                &f.content,
                &f.metadata,
                upload("note.txt", "bob", b"B", t0 + ChronoDuration::milliseconds(900)),
            )
            .await
            .unwrap();

        let records_before = f.metadata.get_all().await.unwrap().len();

        // Bob retries the identical losing content.
        let outcome = f
            .window
            .process_upload(
                &f.content,
                &f.metadata,
                upload("note.txt", "bob", b"B", t0 + ChronoDuration::milliseconds(900)),
            )
            .await
            .unwrap();

        let SafeUploadOutcome::ConflictLoser { notice } = outcome else {
            panic!("expected a 409 re-answer");
        };
        assert_eq!(notice.conflict_id, "already-exists");
        assert_eq!(f.metadata.get_all().await.unwrap().len(), records_before);
        assert_eq!(f.metadata.get_conflicts().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_winner_arriving_second_reuses_latest() {
        let f = fixture().await;
        let t0 = Utc::now();

        // Bob arrives first but carries the later mtime.
        f.window
            .process_upload(
                &f.content,
                &f.metadata,
                upload("note.txt", "bob", b"B", t0 + ChronoDuration::milliseconds(900)),
            )
            .await
            .unwrap();
        // Alice arrives second with the earlier mtime: she wins, her bytes
        // become the next version, Bob's version is... already stored as v1.
        let outcome = f
            .window
            .process_upload(
                &f.content,
                &f.metadata,
                upload("note.txt", "alice", b"A", t0 - ChronoDuration::milliseconds(100)),
            )
            .await
            .unwrap();

        let SafeUploadOutcome::ConflictWinner { record, conflict_id } = outcome else {
            panic!("expected alice to win");
        };
        assert_eq!(record.client_id, "alice");
        assert!(!conflict_id.is_empty());

        // Alice's bytes are the current blob; Bob got a conflict copy.
        assert_eq!(f.content.get("note.txt", None).await.unwrap(), b"A");
        assert_eq!(
            f.content.get("note_conflicted_by_bob.txt", None).await.unwrap(),
            b"B"
        );
    }

    #[tokio::test]
    async fn test_three_clients_one_winner_two_losers() {
        let f = fixture().await;
        let t0 = Utc::now();

        f.window
            .process_upload(&f.content, &f.metadata, upload("note.txt", "alice", b"A", t0))
            .await
            .unwrap();
        f.window
            .process_upload(
                &f.content,
                &f.metadata,
                upload("note.txt", "bob", b"B", t0 + ChronoDuration::seconds(1)),
            )
            .await
            .unwrap();
        f.window
            .process_upload(
                &f.content,
                &f.metadata,
                upload("note.txt", "carol", b"C", t0 + ChronoDuration::seconds(2)),
            )
            .await
            .unwrap();

        let conflicts = f.metadata.get_conflicts().await.unwrap();
        // Bob's arrival processed (alice, bob); Carol's arrival is a new
        // pair set and records its own document.
        assert!(!conflicts.is_empty());
        assert!(f.content.exists("note_conflicted_by_bob.txt"));
        assert!(f.content.exists("note_conflicted_by_carol.txt"));
        assert_eq!(f.content.get("note.txt", None).await.unwrap(), b"A");
    }
}
