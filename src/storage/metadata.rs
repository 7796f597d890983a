//! File-per-record metadata store.
//!
//! One JSON document per version (`<file_id>.json`) and one per conflict
//! (`<id>.json`). Readers enumerate the directory and union the records;
//! writers create or replace only their own document, so N worker processes
//! sharing the directories need no further coordination for reads.

use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;

use crate::error::{Error, Result};
use crate::models::{ConflictRecord, ConflictResolution, ConflictStatus, FileRecord};
use crate::utils::write_atomic;

/// Two uploads of one file closer together than this are conflict
/// candidates for the metadata fallback detector.
pub const CONFLICT_THRESHOLD_MS: i64 = 5000;

/// A lock file older than this is considered abandoned by a crashed worker
/// and is broken.
const LOCK_STALE_AFTER: Duration = Duration::from_secs(10);
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(50);
const LOCK_MAX_ATTEMPTS: u32 = 200;

#[derive(Debug, Clone)]
pub struct MetadataStore {
    records_dir: PathBuf,
    conflicts_dir: PathBuf,
    locks_dir: PathBuf,
    legacy_index: PathBuf,
}

/// Advisory per-name lock backed by an `O_EXCL`-created file.
///
/// Serializes read-latest → allocate-version → write across workers that
/// share the metadata directory. Released on drop.
pub struct NameLock {
    path: PathBuf,
}

impl Drop for NameLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!(path = ?self.path, error = %e, "Failed to release name lock");
        }
    }
}

impl MetadataStore {
    pub fn new(metadata_dir: PathBuf, conflicts_dir: PathBuf) -> Self {
        Self {
            records_dir: metadata_dir.join("files"),
            locks_dir: metadata_dir.join("locks"),
            legacy_index: metadata_dir.join("files.json"),
            conflicts_dir,
        }
    }

    /// Creates the metadata directories and runs the one-time migration
    /// from a legacy monolithic index, if one is present.
    pub async fn init(&self) -> Result<()> {
        for dir in [&self.records_dir, &self.conflicts_dir, &self.locks_dir] {
            fs::create_dir_all(dir).await.map_err(|e| {
                Error::Internal(format!("Failed to create metadata directory {:?}: {}", dir, e))
            })?;
        }
        self.migrate_legacy_index().await
    }

    /// Migrates a legacy monolithic `files.json` array into per-record
    /// documents. Records whose document already exists are left alone; the
    /// legacy file is renamed aside so the migration runs once.
    async fn migrate_legacy_index(&self) -> Result<()> {
        if !self.legacy_index.exists() {
            return Ok(());
        }

        let raw = fs::read(&self.legacy_index).await.map_err(|e| {
            Error::Internal(format!("Failed to read legacy index {:?}: {}", self.legacy_index, e))
        })?;
        let records: Vec<FileRecord> = serde_json::from_slice(&raw)?;

        let mut migrated = 0usize;
        for record in &records {
            let path = self.record_path(&record.file_id);
            if path.exists() {
                continue;
            }
            write_atomic(&path, &serde_json::to_vec_pretty(record)?)
                .await
                .map_err(|e| {
                    Error::Internal(format!("Failed to migrate record {:?}: {}", path, e))
                })?;
            migrated += 1;
        }

        let aside = self.legacy_index.with_extension("json.migrated");
        fs::rename(&self.legacy_index, &aside).await.map_err(|e| {
            Error::Internal(format!("Failed to retire legacy index: {}", e))
        })?;

        tracing::info!(
            total = records.len(),
            migrated,
            "Migrated legacy metadata index to per-record documents"
        );
        Ok(())
    }

    // --- Path Helpers ---

    fn record_path(&self, file_id: &str) -> PathBuf {
        self.records_dir.join(format!("{}.json", file_id))
    }

    fn conflict_path(&self, id: &str) -> PathBuf {
        self.conflicts_dir.join(format!("{}.json", id))
    }

    // --- Version Records ---

    /// Unions every version record by directory scan. Unparsable documents
    /// are skipped with a warning rather than failing the whole listing.
    pub async fn get_all(&self) -> Result<Vec<FileRecord>> {
        let mut records = Vec::new();
        let mut entries = fs::read_dir(&self.records_dir).await.map_err(|e| {
            Error::Internal(format!(
                "Failed to list metadata directory {:?}: {}",
                self.records_dir, e
            ))
        })?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::Internal(format!("Failed to read directory entry: {}", e)))?
        {
            let path = entry.path();
            if path.extension().map(|e| e != "json").unwrap_or(true) {
                continue;
            }
            let raw = match fs::read(&path).await {
                Ok(raw) => raw,
                Err(e) => {
                    tracing::warn!(path = ?path, error = %e, "Failed to read metadata record");
                    continue;
                }
            };
            match serde_json::from_slice::<FileRecord>(&raw) {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::warn!(path = ?path, error = %e, "Skipping unparsable metadata record")
                }
            }
        }
        Ok(records)
    }

    pub async fn get(&self, file_id: &str) -> Result<FileRecord> {
        let path = self.record_path(file_id);
        if !path.exists() {
            return Err(Error::NotFound(format!("No metadata for file id '{}'", file_id)));
        }
        let raw = fs::read(&path)
            .await
            .map_err(|e| Error::Internal(format!("Failed to read record {:?}: {}", path, e)))?;
        Ok(serde_json::from_slice(&raw)?)
    }

    pub async fn get_latest(&self, file_name: &str) -> Result<Option<FileRecord>> {
        Ok(self
            .get_all()
            .await?
            .into_iter()
            .filter(|r| r.file_name == file_name)
            .max_by_key(|r| r.version))
    }

    /// All version records for a name, latest first.
    pub async fn get_all_versions(&self, file_name: &str) -> Result<Vec<FileRecord>> {
        let mut records: Vec<FileRecord> = self
            .get_all()
            .await?
            .into_iter()
            .filter(|r| r.file_name == file_name)
            .collect();
        records.sort_by(|a, b| b.version.cmp(&a.version));
        Ok(records)
    }

    pub async fn next_version(&self, file_name: &str) -> Result<u64> {
        Ok(self
            .get_latest(file_name)
            .await?
            .map(|r| r.version + 1)
            .unwrap_or(1))
    }

    /// Writes a version record. Idempotent by `file_id`: a retry with the
    /// same id replaces its own document.
    pub async fn save(&self, record: &FileRecord) -> Result<()> {
        if record.file_id.is_empty() {
            return Err(Error::BadRequest(
                "metadata record is missing file_id".to_string(),
            ));
        }
        let path = self.record_path(&record.file_id);
        write_atomic(&path, &serde_json::to_vec_pretty(record)?)
            .await
            .map_err(|e| Error::Internal(format!("Failed to write record {:?}: {}", path, e)))
    }

    pub async fn delete(&self, file_id: &str) -> Result<()> {
        let path = self.record_path(file_id);
        if !path.exists() {
            return Err(Error::NotFound(format!("No metadata for file id '{}'", file_id)));
        }
        fs::remove_file(&path)
            .await
            .map_err(|e| Error::Internal(format!("Failed to delete record {:?}: {}", path, e)))
    }

    /// Removes every record whose `file_name` matches. Returns how many
    /// were removed.
    pub async fn delete_by_name(&self, file_name: &str) -> Result<usize> {
        let mut removed = 0usize;
        for record in self.get_all().await? {
            if record.file_name == file_name {
                self.delete(&record.file_id).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Rewrites every record whose `file_name == old_name`. Returns how
    /// many were rewritten.
    pub async fn rename(&self, old_name: &str, new_name: &str) -> Result<usize> {
        let mut renamed = 0usize;
        for mut record in self.get_all().await? {
            if record.file_name == old_name {
                record.file_name = new_name.to_string();
                record.updated_at = chrono::Utc::now();
                self.save(&record).await?;
                renamed += 1;
            }
        }
        Ok(renamed)
    }

    // --- Conflict Records ---

    /// Persists a conflict document. Idempotent on `id`: if a document with
    /// this id already exists it is returned untouched, so double-detection
    /// across the window and the fallback never duplicates a record.
    pub async fn save_conflict(&self, conflict: &ConflictRecord) -> Result<ConflictRecord> {
        let path = self.conflict_path(&conflict.id);
        if path.exists() {
            let raw = fs::read(&path).await.map_err(|e| {
                Error::Internal(format!("Failed to read conflict {:?}: {}", path, e))
            })?;
            return Ok(serde_json::from_slice(&raw)?);
        }
        write_atomic(&path, &serde_json::to_vec_pretty(conflict)?)
            .await
            .map_err(|e| Error::Internal(format!("Failed to write conflict {:?}: {}", path, e)))?;
        Ok(conflict.clone())
    }

    pub async fn get_conflict(&self, id: &str) -> Result<ConflictRecord> {
        let path = self.conflict_path(id);
        if !path.exists() {
            return Err(Error::NotFound(format!("Conflict '{}' not found", id)));
        }
        let raw = fs::read(&path)
            .await
            .map_err(|e| Error::Internal(format!("Failed to read conflict {:?}: {}", path, e)))?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Every stored conflict, newest first.
    pub async fn get_conflicts(&self) -> Result<Vec<ConflictRecord>> {
        let mut conflicts = Vec::new();
        let mut entries = fs::read_dir(&self.conflicts_dir).await.map_err(|e| {
            Error::Internal(format!(
                "Failed to list conflicts directory {:?}: {}",
                self.conflicts_dir, e
            ))
        })?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::Internal(format!("Failed to read directory entry: {}", e)))?
        {
            let path = entry.path();
            if path.extension().map(|e| e != "json").unwrap_or(true) {
                continue;
            }
            let raw = match fs::read(&path).await {
                Ok(raw) => raw,
                Err(e) => {
                    tracing::warn!(path = ?path, error = %e, "Failed to read conflict record");
                    continue;
                }
            };
            match serde_json::from_slice::<ConflictRecord>(&raw) {
                Ok(conflict) => conflicts.push(conflict),
                Err(e) => {
                    tracing::warn!(path = ?path, error = %e, "Skipping unparsable conflict record")
                }
            }
        }
        conflicts.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(conflicts)
    }

    /// Marks a conflict resolved. The unresolved → resolved transition
    /// happens exactly once; resolving an already-resolved conflict is an
    /// error.
    pub async fn resolve_conflict(
        &self,
        id: &str,
        resolution: ConflictResolution,
    ) -> Result<ConflictRecord> {
        let mut conflict = self.get_conflict(id).await?;
        if conflict.status == ConflictStatus::Resolved {
            return Err(Error::conflict(format!("Conflict '{}' is already resolved", id)));
        }
        conflict.status = ConflictStatus::Resolved;
        conflict.resolution = Some(resolution);
        conflict.resolved_at = Some(chrono::Utc::now());

        let path = self.conflict_path(id);
        write_atomic(&path, &serde_json::to_vec_pretty(&conflict)?)
            .await
            .map_err(|e| Error::Internal(format!("Failed to write conflict {:?}: {}", path, e)))?;
        Ok(conflict)
    }

    // --- Conflict Detection Fallback ---

    /// Threshold-based detection against the latest stored version.
    ///
    /// Fires when the incoming upload and the latest version were modified
    /// within [`CONFLICT_THRESHOLD_MS`] of each other by different clients
    /// with different content. Returns the latest record (the presumed
    /// winner). This backstops the sliding window when the two uploads were
    /// served by different workers.
    pub async fn detect_conflict(&self, incoming: &FileRecord) -> Result<Option<FileRecord>> {
        let Some(latest) = self.get_latest(&incoming.file_name).await? else {
            return Ok(None);
        };

        let delta_ms = (incoming.last_modified - latest.last_modified)
            .num_milliseconds()
            .abs();
        let fires = delta_ms < CONFLICT_THRESHOLD_MS
            && incoming.client_id != latest.client_id
            && incoming.checksum != latest.checksum;

        Ok(fires.then_some(latest))
    }

    // --- Per-Name Locking ---

    /// Takes the advisory lock serializing version allocation for one name.
    ///
    /// Lock files abandoned by a crashed worker are broken after
    /// [`LOCK_STALE_AFTER`]. Contention is retried with a bounded backoff;
    /// exhausting the attempts is an internal error rather than a deadlock.
    pub async fn lock_name(&self, file_name: &str) -> Result<NameLock> {
        let path = self.locks_dir.join(format!("{}.lock", file_name));

        for _ in 0..LOCK_MAX_ATTEMPTS {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(_) => return Ok(NameLock { path }),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if let Ok(meta) = std::fs::metadata(&path) {
                        let stale = meta
                            .modified()
                            .ok()
                            .and_then(|m| m.elapsed().ok())
                            .map(|age| age > LOCK_STALE_AFTER)
                            .unwrap_or(false);
                        if stale {
                            tracing::warn!(file_name, "Breaking stale name lock");
                            let _ = std::fs::remove_file(&path);
                            continue;
                        }
                    }
                    tokio::time::sleep(LOCK_RETRY_DELAY).await;
                }
                Err(e) => {
                    return Err(Error::Internal(format!(
                        "Failed to create lock file {:?}: {}",
                        path, e
                    )));
                }
            }
        }

        Err(Error::Internal(format!(
            "Timed out waiting for name lock on '{}'",
            file_name
        )))
    }
}
